//! Shared reconciler context
//!
//! Everything a reconcile pass needs besides the object itself: the cluster
//! store, the backend, operator configuration and metrics. Backend calls go
//! through the context so every call is timed and counted.

use dashmap::DashMap;
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::runtime::controller::Action;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::reason;
use super::status::{record_error, Persisted};
use crate::config::OperatorConfig;
use crate::crd::VolumeGroupClass;
use crate::domain::accessors::{is_bound, is_deleting, storage_class_name, ObjectKey, StatusAccessor};
use crate::domain::parameters::{is_statically_grouped, secret_data, secret_reference};
use crate::domain::ports::{
    BackendOperation, ClusterStoreRef, EventRecord, EventType, GroupBackendRef, GroupInfo, Secrets,
};
use crate::error::{Error, ErrorAction, Result};
use crate::metrics::Metrics;

/// Smallest requeue delay after a failed reconcile
pub const MIN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Largest requeue delay after repeated failures
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Reconciler context
pub struct Context {
    pub store: ClusterStoreRef,
    pub backend: GroupBackendRef,
    pub config: OperatorConfig,
    pub metrics: Metrics,
    /// Consecutive failures per object, for requeue backoff
    failures: DashMap<String, u32>,
}

impl Context {
    pub fn new(
        store: ClusterStoreRef,
        backend: GroupBackendRef,
        config: OperatorConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            backend,
            config,
            metrics,
            failures: DashMap::new(),
        }
    }

    /// True when `driver` is the driver this operator serves
    pub fn owns_driver(&self, driver: &str) -> bool {
        driver == self.config.driver_name
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Resolve a class by name; a missing class is a configuration error
    pub async fn class_for(&self, name: Option<&str>) -> Result<VolumeGroupClass> {
        let name = name.ok_or_else(|| Error::Configuration("no VolumeGroupClass name set".into()))?;
        self.store
            .get_class(name)
            .await?
            .ok_or_else(|| Error::Configuration(format!("VolumeGroupClass {} not found", name)))
    }

    /// Secrets named by a class's reserved parameters, empty when none are set
    pub async fn secrets_for(&self, parameters: &BTreeMap<String, String>) -> Result<Secrets> {
        let Some(reference) = secret_reference(parameters) else {
            return Ok(Secrets::new());
        };
        let namespace = reference.namespace.unwrap_or_default();
        let name = reference.name.unwrap_or_default();
        let secret = self
            .store
            .get_secret(&namespace, &name)
            .await?
            .ok_or_else(|| {
                Error::Configuration(format!("secret {}/{} not found", namespace, name))
            })?;
        Ok(secret_data(&secret))
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Publish an event; failures are logged and otherwise ignored
    pub async fn emit(
        &self,
        target: ObjectReference,
        event_type: EventType,
        reason: &str,
        message: impl Into<String>,
    ) {
        let event = EventRecord {
            target,
            event_type,
            reason: reason.to_string(),
            message: message.into(),
        };
        if let Err(e) = self.store.record_event(event).await {
            warn!("Failed to publish {} event: {}", reason, e);
        }
    }

    // =========================================================================
    // Backend Calls
    // =========================================================================

    pub async fn create_group(
        &self,
        name: &str,
        parameters: &BTreeMap<String, String>,
        secrets: &Secrets,
    ) -> Result<GroupInfo> {
        let result = self.backend.create_group(name, parameters, secrets).await;
        self.metrics
            .record_backend_call(BackendOperation::CreateGroup, result.is_ok());
        result
    }

    pub async fn delete_group(&self, group_id: &str, secrets: &Secrets) -> Result<()> {
        let result = self.backend.delete_group(group_id, secrets).await;
        self.metrics
            .record_backend_call(BackendOperation::DeleteGroup, result.is_ok());
        result
    }

    pub async fn modify_membership(
        &self,
        group_id: &str,
        volume_ids: &[String],
        secrets: &Secrets,
    ) -> Result<()> {
        let result = self
            .backend
            .modify_group_membership(group_id, volume_ids, secrets)
            .await;
        self.metrics
            .record_backend_call(BackendOperation::ModifyGroupMembership, result.is_ok());
        result
    }

    // =========================================================================
    // Reconcile Outcomes
    // =========================================================================

    /// Record a failed reconcile on the object's status and hand the error back
    pub async fn fail<K, T>(&self, obj: &K, err: Error) -> Result<T>
    where
        K: Persisted + StatusAccessor,
    {
        let key = ObjectKey::of(obj);
        warn!("Reconcile of {} {} failed: {}", K::kind(&()), key, err);

        let message = err.to_string();
        if obj.error_message() != Some(message.as_str()) {
            match record_error(self.store.as_ref(), obj, Some(message.clone())).await {
                Ok(_) if !err.is_transient() => {
                    self.emit(
                        obj.object_ref(&()),
                        EventType::Warning,
                        reason::CONFIGURATION_ERROR,
                        message,
                    )
                    .await;
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to record error on {} {}: {}", K::kind(&()), key, e),
            }
        }
        Err(err)
    }

    /// Account for a finished reconcile
    pub fn finish(&self, controller: &str, key: &ObjectKey, started: Instant, success: bool) {
        self.metrics
            .record_reconcile(controller, success, started.elapsed());
        if success {
            self.reset_failures(&failure_key(controller, key));
        }
    }

    /// Requeue decision after a failed reconcile
    ///
    /// A permanent error ends any streak of transient failures, so the next
    /// transient failure starts from the minimum delay again.
    pub fn error_action(&self, controller: &str, key: &ObjectKey, err: &Error) -> Action {
        let failure_key = failure_key(controller, key);
        if !err.is_retryable() {
            debug!("{} {} waits for a change: {}", controller, key, err);
            self.reset_failures(&failure_key);
        }
        match err.action() {
            ErrorAction::RequeueWithBackoff => {
                Action::requeue(self.failure_backoff(&failure_key))
            }
            ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
            ErrorAction::NoRequeue => Action::requeue(self.config.resync_interval),
        }
    }

    // =========================================================================
    // Requeue Backoff
    // =========================================================================

    /// Record a failure for `key` and return the delay before the next attempt
    pub fn failure_backoff(&self, key: &str) -> Duration {
        let mut count = self.failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        let exponent = (*count - 1).min(16);
        MIN_RETRY_DELAY
            .saturating_mul(1u32 << exponent)
            .min(MAX_RETRY_DELAY)
    }

    /// Forget failures for `key` after a successful reconcile
    pub fn reset_failures(&self, key: &str) {
        self.failures.remove(key);
    }
}

fn failure_key(controller: &str, key: &ObjectKey) -> String {
    format!("{}:{}", controller, key)
}

// =============================================================================
// Claim Eligibility
// =============================================================================

/// Whether a claim may join groups of this driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimEligibility {
    Eligible,
    Deleting,
    NotBound,
    /// The claim's StorageClass belongs to another driver
    ForeignDriver,
    /// The claim's StorageClass already groups it on the driver side
    StaticallyGrouped { storage_class: String },
}

/// Classifies claims, caching StorageClass lookups for one reconcile pass
pub struct ClaimClassifier<'a> {
    ctx: &'a Context,
    storage_classes: BTreeMap<String, Option<StorageClass>>,
}

impl<'a> ClaimClassifier<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            storage_classes: BTreeMap::new(),
        }
    }

    pub async fn classify(&mut self, claim: &PersistentVolumeClaim) -> Result<ClaimEligibility> {
        if is_deleting(&claim.metadata) {
            return Ok(ClaimEligibility::Deleting);
        }
        if !is_bound(claim) {
            return Ok(ClaimEligibility::NotBound);
        }
        let Some(sc_name) = storage_class_name(claim) else {
            return Ok(ClaimEligibility::ForeignDriver);
        };

        if !self.storage_classes.contains_key(sc_name) {
            let fetched = self.ctx.store.get_storage_class(sc_name).await?;
            self.storage_classes.insert(sc_name.to_string(), fetched);
        }
        let Some(Some(storage_class)) = self.storage_classes.get(sc_name) else {
            debug!(
                "StorageClass {} of claim {} not found",
                sc_name,
                ObjectKey::of(claim)
            );
            return Ok(ClaimEligibility::ForeignDriver);
        };

        if !self.ctx.owns_driver(&storage_class.provisioner) {
            return Ok(ClaimEligibility::ForeignDriver);
        }
        if is_statically_grouped(storage_class) {
            return Ok(ClaimEligibility::StaticallyGrouped {
                storage_class: sc_name.to_string(),
            });
        }
        Ok(ClaimEligibility::Eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::{InMemoryGroupBackend, MemoryStore};
    use crate::crd::VolumeGroupClassSpec;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, Secret};
    use std::sync::Arc;

    fn context(store: Arc<MemoryStore>) -> Context {
        Context::new(
            store,
            Arc::new(InMemoryGroupBackend::default()),
            OperatorConfig::new("drv"),
            Metrics::new().unwrap(),
        )
    }

    fn storage_class(name: &str, provisioner: &str, params: &[(&str, &str)]) -> StorageClass {
        let mut sc = StorageClass {
            provisioner: provisioner.into(),
            ..Default::default()
        };
        sc.metadata.name = Some(name.into());
        if !params.is_empty() {
            sc.parameters = Some(
                params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );
        }
        sc
    }

    fn claim(sc: &str, phase: &str) -> PersistentVolumeClaim {
        let mut claim = PersistentVolumeClaim {
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: Some(sc.into()),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        claim.metadata.name = Some("data".into());
        claim.metadata.namespace = Some("default".into());
        claim
    }

    #[tokio::test]
    async fn test_classify_claims() {
        let store = Arc::new(MemoryStore::new());
        store.create_storage_class(&storage_class("fast", "drv", &[])).unwrap();
        store.create_storage_class(&storage_class("other", "nfs", &[])).unwrap();
        store
            .create_storage_class(&storage_class("grouped", "drv", &[("volume_group", "g")]))
            .unwrap();
        let ctx = context(store);
        let mut classifier = ClaimClassifier::new(&ctx);

        assert_eq!(
            classifier.classify(&claim("fast", "Bound")).await.unwrap(),
            ClaimEligibility::Eligible
        );
        assert_eq!(
            classifier.classify(&claim("fast", "Pending")).await.unwrap(),
            ClaimEligibility::NotBound
        );
        assert_eq!(
            classifier.classify(&claim("other", "Bound")).await.unwrap(),
            ClaimEligibility::ForeignDriver
        );
        assert_eq!(
            classifier.classify(&claim("missing", "Bound")).await.unwrap(),
            ClaimEligibility::ForeignDriver
        );
        assert_eq!(
            classifier.classify(&claim("grouped", "Bound")).await.unwrap(),
            ClaimEligibility::StaticallyGrouped {
                storage_class: "grouped".into()
            }
        );
    }

    #[tokio::test]
    async fn test_class_and_secret_lookup() {
        let store = Arc::new(MemoryStore::new());
        let class = VolumeGroupClass::new(
            "gold",
            VolumeGroupClassSpec {
                driver: "drv".into(),
                ..Default::default()
            },
        );
        store.create_class(&class).unwrap();
        let mut secret = Secret {
            string_data: Some(BTreeMap::from([("user".to_string(), "admin".to_string())])),
            ..Default::default()
        };
        secret.metadata.name = Some("creds".into());
        secret.metadata.namespace = Some("ops".into());
        store.create_secret(&secret).unwrap();
        let ctx = context(store);

        assert_eq!(ctx.class_for(Some("gold")).await.unwrap().driver(), "drv");
        assert_matches!(ctx.class_for(Some("silver")).await, Err(Error::Configuration(_)));
        assert_matches!(ctx.class_for(None).await, Err(Error::Configuration(_)));

        let mut params = BTreeMap::new();
        assert!(ctx.secrets_for(&params).await.unwrap().is_empty());
        params.insert(
            "volumegroup.storage.openshift.io/secret-name".to_string(),
            "creds".to_string(),
        );
        params.insert(
            "volumegroup.storage.openshift.io/secret-namespace".to_string(),
            "ops".to_string(),
        );
        let secrets = ctx.secrets_for(&params).await.unwrap();
        assert_eq!(secrets.get("user").map(String::as_str), Some("admin"));

        params.insert(
            "volumegroup.storage.openshift.io/secret-name".to_string(),
            "absent".to_string(),
        );
        assert_matches!(ctx.secrets_for(&params).await, Err(Error::Configuration(_)));
    }

    #[test]
    fn test_failure_backoff_grows_and_resets() {
        let ctx = context(Arc::new(MemoryStore::new()));
        assert_eq!(ctx.failure_backoff("vg/a"), Duration::from_secs(5));
        assert_eq!(ctx.failure_backoff("vg/a"), Duration::from_secs(10));
        assert_eq!(ctx.failure_backoff("vg/a"), Duration::from_secs(20));
        for _ in 0..10 {
            ctx.failure_backoff("vg/a");
        }
        assert_eq!(ctx.failure_backoff("vg/a"), MAX_RETRY_DELAY);

        ctx.reset_failures("vg/a");
        assert_eq!(ctx.failure_backoff("vg/a"), Duration::from_secs(5));
    }

    #[test]
    fn test_error_action() {
        let ctx = context(Arc::new(MemoryStore::new()));
        let key = ObjectKey::new("default", "vg");

        let transient = Error::backend(BackendOperation::CreateGroup, "down");
        assert_eq!(
            ctx.error_action("volumegroup", &key, &transient),
            Action::requeue(Duration::from_secs(5))
        );
        assert_eq!(
            ctx.error_action("volumegroup", &key, &transient),
            Action::requeue(Duration::from_secs(10))
        );
        ctx.finish("volumegroup", &key, Instant::now(), true);
        assert_eq!(
            ctx.error_action("volumegroup", &key, &transient),
            Action::requeue(Duration::from_secs(5))
        );

        let config = Error::Configuration("no class".into());
        assert_eq!(
            ctx.error_action("volumegroup", &key, &config),
            Action::requeue(ctx.config.resync_interval)
        );
        assert_eq!(ctx.metrics.reconcile_count("volumegroup", true), 1);
    }

    #[test]
    fn test_permanent_error_resets_backoff() {
        let ctx = context(Arc::new(MemoryStore::new()));
        let key = ObjectKey::new("default", "vg");
        let transient = Error::backend(BackendOperation::CreateGroup, "down");
        let conflict = Error::GroupConflict {
            claim: "default/data".into(),
            group: "vg-a".into(),
        };
        assert!(!conflict.is_retryable());

        ctx.error_action("volumegroup", &key, &transient);
        assert_eq!(
            ctx.error_action("volumegroup", &key, &transient),
            Action::requeue(Duration::from_secs(10))
        );
        assert_eq!(
            ctx.error_action("volumegroup", &key, &conflict),
            Action::requeue(ctx.config.resync_interval)
        );
        assert_eq!(
            ctx.error_action("volumegroup", &key, &transient),
            Action::requeue(Duration::from_secs(5))
        );
    }
}
