//! Kubernetes cluster store
//!
//! [`ClusterStore`] over a live API server. Conditional writes use `replace`
//! and `replace_status` so a stale resourceVersion surfaces as
//! [`Error::Conflict`]; events go through the kube-runtime recorder.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Secret};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::debug;

use crate::crd::{VolumeGroup, VolumeGroupClass, VolumeGroupContent};
use crate::domain::accessors::ObjectKey;
use crate::domain::ports::{ClusterStore, EventRecord, EventType};
use crate::error::{Error, Result};

/// Map an API failure on `key` onto the store's error vocabulary
fn classify<K: Resource<DynamicType = ()>>(key: &ObjectKey, err: kube::Error) -> Error {
    let status = match &err {
        kube::Error::Api(resp) => Some((resp.code, resp.reason.clone())),
        _ => None,
    };
    let kind = K::kind(&()).to_string();
    let name = key.to_string();
    match status {
        Some((409, reason)) if reason == "AlreadyExists" => Error::AlreadyExists { kind, name },
        Some((409, _)) => Error::Conflict { kind, name },
        Some((404, _)) => Error::NotFound { kind, name },
        _ => Error::Kube(err),
    }
}

async fn replace<K>(api: Api<K>, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let key = ObjectKey::of(obj);
    api.replace(&key.name, &PostParams::default(), obj)
        .await
        .map_err(|e| classify::<K>(&key, e))
}

async fn replace_status<K>(api: Api<K>, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let key = ObjectKey::of(obj);
    let data = serde_json::to_vec(obj)?;
    api.replace_status(&key.name, &PostParams::default(), data)
        .await
        .map_err(|e| classify::<K>(&key, e))
}

async fn delete<K>(api: Api<K>, key: ObjectKey) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    match api.delete(&key.name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(err) => match classify::<K>(&key, err) {
            Error::NotFound { .. } => Ok(()),
            other => Err(other),
        },
    }
}

// =============================================================================
// Kube Store
// =============================================================================

/// Cluster store talking to the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    reporter: Reporter,
}

impl KubeStore {
    /// Create a store whose events are reported as `controller`
    pub fn new(client: Client, controller: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn cluster<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        Api::all(self.client.clone())
    }

    fn namespace_of<K: Resource>(obj: &K) -> String {
        obj.meta().namespace.clone().unwrap_or_default()
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_group(&self, namespace: &str, name: &str) -> Result<Option<VolumeGroup>> {
        Ok(self.namespaced::<VolumeGroup>(namespace).get_opt(name).await?)
    }

    async fn list_groups(&self, namespace: Option<&str>) -> Result<Vec<VolumeGroup>> {
        let api: Api<VolumeGroup> = match namespace {
            Some(ns) => self.namespaced(ns),
            None => self.cluster(),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn update_group(&self, group: &VolumeGroup) -> Result<VolumeGroup> {
        replace(self.namespaced(&Self::namespace_of(group)), group).await
    }

    async fn update_group_status(&self, group: &VolumeGroup) -> Result<VolumeGroup> {
        replace_status(self.namespaced(&Self::namespace_of(group)), group).await
    }

    async fn get_content(&self, namespace: &str, name: &str) -> Result<Option<VolumeGroupContent>> {
        Ok(self
            .namespaced::<VolumeGroupContent>(namespace)
            .get_opt(name)
            .await?)
    }

    async fn create_content(&self, content: &VolumeGroupContent) -> Result<VolumeGroupContent> {
        let key = ObjectKey::of(content);
        self.namespaced::<VolumeGroupContent>(&key.namespace)
            .create(&PostParams::default(), content)
            .await
            .map_err(|e| classify::<VolumeGroupContent>(&key, e))
    }

    async fn update_content(&self, content: &VolumeGroupContent) -> Result<VolumeGroupContent> {
        replace(self.namespaced(&Self::namespace_of(content)), content).await
    }

    async fn update_content_status(
        &self,
        content: &VolumeGroupContent,
    ) -> Result<VolumeGroupContent> {
        replace_status(self.namespaced(&Self::namespace_of(content)), content).await
    }

    async fn delete_content(&self, namespace: &str, name: &str) -> Result<()> {
        delete(
            self.namespaced::<VolumeGroupContent>(namespace),
            ObjectKey::new(namespace, name),
        )
        .await
    }

    async fn get_class(&self, name: &str) -> Result<Option<VolumeGroupClass>> {
        Ok(self.cluster::<VolumeGroupClass>().get_opt(name).await?)
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self
            .namespaced::<PersistentVolumeClaim>(namespace)
            .get_opt(name)
            .await?)
    }

    async fn list_claims(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self
            .namespaced::<PersistentVolumeClaim>(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn update_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        replace(self.namespaced(&Self::namespace_of(claim)), claim).await
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        delete(
            self.namespaced::<PersistentVolumeClaim>(namespace),
            ObjectKey::new(namespace, name),
        )
        .await
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.cluster::<PersistentVolume>().get_opt(name).await?)
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        Ok(self.cluster::<StorageClass>().get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.namespaced::<Secret>(namespace).get_opt(name).await?)
    }

    async fn record_event(&self, event: EventRecord) -> Result<()> {
        debug!(
            "Publishing {} event {} for {:?}",
            event.event_type, event.reason, event.target.name
        );
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), event.target);
        recorder
            .publish(Event {
                type_: match event.event_type {
                    EventType::Normal => KubeEventType::Normal,
                    EventType::Warning => KubeEventType::Warning,
                },
                reason: event.reason.clone(),
                note: Some(event.message),
                action: event.reason,
                secondary: None,
            })
            .await?;
        Ok(())
    }
}
