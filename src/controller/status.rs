//! Conflict-safe writes
//!
//! Every persisted change goes through [`mutate`]: the change is applied to a
//! copy, written only when something actually changed, and on a
//! resourceVersion conflict the object is re-read and the change re-applied.

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use std::time::Duration;
use tracing::debug;

use crate::crd::{VolumeGroup, VolumeGroupContent};
use crate::domain::accessors::{ObjectKey, StatusAccessor};
use crate::domain::ports::ClusterStore;
use crate::error::{Error, Result};

/// Attempts made before a conflicting write is given up
pub const MAX_CONFLICT_ATTEMPTS: u32 = 5;

/// Which part of an object a write replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    Object,
    Status,
}

/// Objects the reconcilers read and write through the cluster store
#[async_trait]
pub trait Persisted: Resource<DynamicType = ()> + Clone + Send + Sync + Sized {
    async fn fetch(store: &dyn ClusterStore, key: &ObjectKey) -> Result<Option<Self>>;
    async fn write(store: &dyn ClusterStore, obj: &Self) -> Result<Self>;

    async fn write_status(store: &dyn ClusterStore, obj: &Self) -> Result<Self> {
        Self::write(store, obj).await
    }
}

#[async_trait]
impl Persisted for VolumeGroup {
    async fn fetch(store: &dyn ClusterStore, key: &ObjectKey) -> Result<Option<Self>> {
        store.get_group(&key.namespace, &key.name).await
    }

    async fn write(store: &dyn ClusterStore, obj: &Self) -> Result<Self> {
        store.update_group(obj).await
    }

    async fn write_status(store: &dyn ClusterStore, obj: &Self) -> Result<Self> {
        store.update_group_status(obj).await
    }
}

#[async_trait]
impl Persisted for VolumeGroupContent {
    async fn fetch(store: &dyn ClusterStore, key: &ObjectKey) -> Result<Option<Self>> {
        store.get_content(&key.namespace, &key.name).await
    }

    async fn write(store: &dyn ClusterStore, obj: &Self) -> Result<Self> {
        store.update_content(obj).await
    }

    async fn write_status(store: &dyn ClusterStore, obj: &Self) -> Result<Self> {
        store.update_content_status(obj).await
    }
}

#[async_trait]
impl Persisted for PersistentVolumeClaim {
    async fn fetch(store: &dyn ClusterStore, key: &ObjectKey) -> Result<Option<Self>> {
        store.get_claim(&key.namespace, &key.name).await
    }

    async fn write(store: &dyn ClusterStore, obj: &Self) -> Result<Self> {
        store.update_claim(obj).await
    }
}

fn conflict_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(10))
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None)
        .build()
}

/// Apply `change` to `obj` and persist it.
///
/// `change` returns whether it modified the object; nothing is written when
/// it did not. On a conflict the latest version is fetched and `change` runs
/// again, up to [`MAX_CONFLICT_ATTEMPTS`] times. Returns the stored object.
pub async fn mutate<K, F>(
    store: &dyn ClusterStore,
    obj: &K,
    target: WriteTarget,
    mut change: F,
) -> Result<K>
where
    K: Persisted,
    F: FnMut(&mut K) -> bool + Send,
{
    let key = ObjectKey::of(obj);
    let mut backoff = conflict_backoff();
    let mut current = obj.clone();
    let mut attempt = 1;

    loop {
        let mut next = current.clone();
        if !change(&mut next) {
            return Ok(current);
        }

        let written = match target {
            WriteTarget::Object => K::write(store, &next).await,
            WriteTarget::Status => K::write_status(store, &next).await,
        };
        match written {
            Ok(stored) => return Ok(stored),
            Err(e) if e.is_conflict() && attempt < MAX_CONFLICT_ATTEMPTS => {
                attempt += 1;
                debug!("Conflict writing {} {}, retrying", K::kind(&()), key);
                if let Some(delay) = backoff.next_backoff() {
                    tokio::time::sleep(delay).await;
                }
                current = K::fetch(store, &key).await?.ok_or_else(|| Error::NotFound {
                    kind: K::kind(&()).to_string(),
                    name: key.to_string(),
                })?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Set or clear the error on an object's status, writing only on change
pub async fn record_error<K>(store: &dyn ClusterStore, obj: &K, message: Option<String>) -> Result<K>
where
    K: Persisted + StatusAccessor,
{
    mutate(store, obj, WriteTarget::Status, |o| {
        if o.error_message() == message.as_deref() {
            return false;
        }
        o.update_error(message.clone());
        true
    })
    .await
}

// =============================================================================
// Finalizers
// =============================================================================

pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .map_or(false, |f| f.iter().any(|x| x == finalizer))
}

/// True when anything other than `finalizer` still blocks deletion
pub fn has_other_finalizers(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .map_or(false, |f| f.iter().any(|x| x != finalizer))
}

/// Returns whether the finalizer was added
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if has_finalizer(meta, finalizer) {
        return false;
    }
    meta.finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Returns whether the finalizer was removed
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(finalizers) = meta.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    before != finalizers.len()
}

pub async fn ensure_finalizer<K: Persisted>(
    store: &dyn ClusterStore,
    obj: &K,
    finalizer: &str,
) -> Result<K> {
    mutate(store, obj, WriteTarget::Object, |o| {
        add_finalizer(o.meta_mut(), finalizer)
    })
    .await
}

pub async fn release_finalizer<K: Persisted>(
    store: &dyn ClusterStore,
    obj: &K,
    finalizer: &str,
) -> Result<K> {
    mutate(store, obj, WriteTarget::Object, |o| {
        remove_finalizer(o.meta_mut(), finalizer)
    })
    .await
}
