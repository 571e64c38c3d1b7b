//! Fixtures shared by the reconciler unit tests

use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, PersistentVolumeSpec,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::context::Context;
use crate::config::OperatorConfig;
use crate::controlplane::{InMemoryGroupBackend, MemoryStore};
use crate::crd::{
    DeletionPolicy, VolumeGroup, VolumeGroupClass, VolumeGroupClassSpec, VolumeGroupContent,
    VolumeGroupContentSource, VolumeGroupContentSpec, VolumeGroupSpec,
};
use crate::domain::accessors::{derived_content_name, group_reference, GroupAccessor, StatusAccessor};
use crate::domain::ports::{ClusterStore, GroupBackend, Secrets};
use crate::metrics::Metrics;

pub const DRIVER: &str = "drv";
pub const NAMESPACE: &str = "default";
pub const CLASS: &str = "gold";
pub const STORAGE_CLASS: &str = "fast";

fn string_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub backend: Arc<InMemoryGroupBackend>,
    pub ctx: Arc<Context>,
}

impl Fixture {
    /// Single-group mode with class `gold` and StorageClass `fast` of the driver
    pub fn new() -> Self {
        Self::with_config(OperatorConfig::new(DRIVER))
    }

    pub fn multi_group() -> Self {
        let mut config = OperatorConfig::new(DRIVER);
        config.multiple_groups_per_claim = true;
        Self::with_config(config)
    }

    pub fn with_config(config: OperatorConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(InMemoryGroupBackend::new(DRIVER));
        let ctx = Arc::new(Context::new(
            store.clone(),
            backend.clone(),
            config,
            Metrics::new().unwrap(),
        ));
        let fx = Self {
            store,
            backend,
            ctx,
        };
        fx.class(CLASS, DRIVER, &[]);
        fx.storage_class(STORAGE_CLASS, DRIVER, &[]);
        fx
    }

    pub fn class(&self, name: &str, driver: &str, params: &[(&str, &str)]) -> VolumeGroupClass {
        let class = VolumeGroupClass::new(
            name,
            VolumeGroupClassSpec {
                driver: driver.into(),
                parameters: string_map(params),
                deletion_policy: None,
            },
        );
        self.store.create_class(&class).unwrap()
    }

    pub fn storage_class(&self, name: &str, provisioner: &str, params: &[(&str, &str)]) -> StorageClass {
        let mut sc = StorageClass {
            provisioner: provisioner.into(),
            parameters: Some(string_map(params)),
            ..Default::default()
        };
        sc.metadata.name = Some(name.into());
        self.store.create_storage_class(&sc).unwrap()
    }

    fn claim_with_phase(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        storage_class: &str,
        phase: &str,
    ) -> PersistentVolumeClaim {
        let pv_name = format!("pv-{}", name);
        let mut volume = PersistentVolume {
            spec: Some(PersistentVolumeSpec {
                csi: Some(CSIPersistentVolumeSource {
                    driver: DRIVER.into(),
                    volume_handle: format!("vol-{}", name),
                    ..Default::default()
                }),
                claim_ref: Some(ObjectReference {
                    name: Some(name.into()),
                    namespace: Some(NAMESPACE.into()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        volume.metadata.name = Some(pv_name.clone());
        self.store.create_volume(&volume).unwrap();

        let mut claim = PersistentVolumeClaim {
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: Some(storage_class.into()),
                volume_name: Some(pv_name),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        claim.metadata.name = Some(name.into());
        claim.metadata.namespace = Some(NAMESPACE.into());
        claim.metadata.labels = Some(string_map(labels));
        self.store.create_claim(&claim).unwrap()
    }

    /// A Bound claim with volume `pv-<name>` and CSI handle `vol-<name>`
    pub fn claim(&self, name: &str, labels: &[(&str, &str)], storage_class: &str) -> PersistentVolumeClaim {
        self.claim_with_phase(name, labels, storage_class, "Bound")
    }

    pub fn pending_claim(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        storage_class: &str,
    ) -> PersistentVolumeClaim {
        self.claim_with_phase(name, labels, storage_class, "Pending")
    }

    /// A dynamic group of class `gold`, not yet reconciled
    pub fn group(&self, name: &str, selector: &[(&str, &str)]) -> VolumeGroup {
        let mut group = VolumeGroup::new(
            name,
            VolumeGroupSpec {
                class_name: Some(CLASS.into()),
                ..Default::default()
            },
        );
        group.metadata.namespace = Some(NAMESPACE.into());
        group.spec.source.selector = Some(LabelSelector {
            match_labels: Some(string_map(selector)),
            ..Default::default()
        });
        self.store.create_group(&group).unwrap()
    }

    /// A group already bound to a ready content with a backend handle
    pub async fn ready_group(&self, name: &str, selector: &[(&str, &str)]) -> VolumeGroup {
        let group = self.group(name, selector);
        let content_name = derived_content_name(&group).unwrap();
        let info = self
            .backend
            .create_group(&content_name, &BTreeMap::new(), &Secrets::new())
            .await
            .unwrap();

        let mut content = VolumeGroupContent::new(
            &content_name,
            VolumeGroupContentSpec {
                class_name: Some(CLASS.into()),
                group_ref: Some(group_reference(&group)),
                secret_ref: None,
                deletion_policy: Some(DeletionPolicy::Delete),
                source: Some(VolumeGroupContentSource {
                    driver: DRIVER.into(),
                    group_handle: info.group_id,
                    attributes: BTreeMap::new(),
                }),
            },
        );
        content.metadata.namespace = Some(NAMESPACE.into());
        let mut content = self.store.create_content(&content).await.unwrap();
        content.update_ready(true);
        self.store.update_content_status(&content).await.unwrap();

        let mut group = group;
        group.update_bound_content_name(&content_name);
        group.update_ready(true);
        self.store.update_group_status(&group).await.unwrap()
    }

    /// Overwrite a group's recorded members
    pub async fn set_members(&self, group: &str, claims: &[&str]) {
        let mut group = self.group_state(group).await;
        let mut members = Vec::new();
        for name in claims {
            members.push(self.claim_state(name).await);
        }
        group.update_member_claims(members);
        self.store.update_group_status(&group).await.unwrap();
    }

    pub async fn group_state(&self, name: &str) -> VolumeGroup {
        self.store.get_group(NAMESPACE, name).await.unwrap().unwrap()
    }

    pub async fn claim_state(&self, name: &str) -> PersistentVolumeClaim {
        self.store.get_claim(NAMESPACE, name).await.unwrap().unwrap()
    }

    pub async fn content_of(&self, group: &VolumeGroup) -> VolumeGroupContent {
        let name = group.bound_content_name().unwrap();
        self.store.get_content(NAMESPACE, name).await.unwrap().unwrap()
    }
}
