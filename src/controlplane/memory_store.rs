//! In-memory cluster store
//!
//! A [`ClusterStore`] backed by process memory that follows the API server's
//! write rules closely enough for reconcilers to be exercised without a
//! cluster: resourceVersion conflicts, the status subresource, UID
//! assignment and finalizer-deferred deletion.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Secret};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

use crate::crd::{VolumeGroup, VolumeGroupClass, VolumeGroupContent};
use crate::domain::accessors::{is_deleting, ObjectKey};
use crate::domain::ports::{ClusterStore, EventRecord};
use crate::error::{Error, Result};

// =============================================================================
// Stored Objects
// =============================================================================

/// Objects the store can hold
trait Stored: Resource<DynamicType = ()> + Clone + Send + Sync {
    /// Copy the status subresource from `other`
    fn take_status_from(&mut self, other: &Self);
}

impl Stored for VolumeGroup {
    fn take_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

impl Stored for VolumeGroupContent {
    fn take_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

impl Stored for PersistentVolumeClaim {
    fn take_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

impl Stored for PersistentVolume {
    fn take_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

impl Stored for VolumeGroupClass {
    fn take_status_from(&mut self, _other: &Self) {}
}

impl Stored for StorageClass {
    fn take_status_from(&mut self, _other: &Self) {}
}

impl Stored for Secret {
    fn take_status_from(&mut self, _other: &Self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Object,
    Status,
}

#[derive(Debug, Default)]
struct Clock {
    resource_version: u64,
    uid: u64,
    writes: u64,
    injected_conflicts: u32,
}

impl Clock {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn next_uid(&mut self) -> String {
        self.uid += 1;
        format!("{:08x}-0000-4000-8000-{:012x}", self.uid, self.uid)
    }
}

type Objects<K> = BTreeMap<ObjectKey, K>;

fn kind_of<K: Stored>() -> String {
    K::kind(&()).to_string()
}

fn create<K: Stored>(objects: &mut Objects<K>, clock: &mut Clock, obj: &K) -> Result<K> {
    let key = ObjectKey::of(obj);
    if objects.contains_key(&key) {
        return Err(Error::AlreadyExists {
            kind: kind_of::<K>(),
            name: key.to_string(),
        });
    }

    let mut stored = obj.clone();
    let uid = clock.next_uid();
    let version = clock.next_version();
    let meta = stored.meta_mut();
    if meta.uid.is_none() {
        meta.uid = Some(uid);
    }
    meta.creation_timestamp = Some(Time(Utc::now()));
    meta.deletion_timestamp = None;
    meta.resource_version = Some(version);
    clock.writes += 1;

    objects.insert(key, stored.clone());
    Ok(stored)
}

fn replace<K: Stored>(
    objects: &mut Objects<K>,
    clock: &mut Clock,
    incoming: &K,
    mode: WriteMode,
) -> Result<K> {
    let key = ObjectKey::of(incoming);
    if clock.injected_conflicts > 0 {
        clock.injected_conflicts -= 1;
        return Err(Error::Conflict {
            kind: kind_of::<K>(),
            name: key.to_string(),
        });
    }

    let current = objects.get(&key).ok_or_else(|| Error::NotFound {
        kind: kind_of::<K>(),
        name: key.to_string(),
    })?;
    if incoming.meta().resource_version != current.meta().resource_version {
        return Err(Error::Conflict {
            kind: kind_of::<K>(),
            name: key.to_string(),
        });
    }

    let mut next = match mode {
        WriteMode::Object => {
            let mut next = incoming.clone();
            next.take_status_from(current);
            let meta = next.meta_mut();
            meta.uid = current.meta().uid.clone();
            meta.creation_timestamp = current.meta().creation_timestamp.clone();
            meta.deletion_timestamp = current.meta().deletion_timestamp.clone();
            next
        }
        WriteMode::Status => {
            let mut next = current.clone();
            next.take_status_from(incoming);
            next
        }
    };
    next.meta_mut().resource_version = Some(clock.next_version());
    clock.writes += 1;

    let released = is_deleting(next.meta())
        && next.meta().finalizers.as_ref().map_or(true, Vec::is_empty);
    if released {
        debug!("Last finalizer removed, deleting {} {}", kind_of::<K>(), key);
        objects.remove(&key);
    } else {
        objects.insert(key, next.clone());
    }
    Ok(next)
}

fn delete<K: Stored>(objects: &mut Objects<K>, clock: &mut Clock, key: &ObjectKey) {
    let has_finalizers = match objects.get(key) {
        Some(obj) => obj.meta().finalizers.as_ref().map_or(false, |f| !f.is_empty()),
        None => return,
    };
    clock.writes += 1;

    if !has_finalizers {
        objects.remove(key);
        return;
    }
    let version = clock.next_version();
    if let Some(obj) = objects.get_mut(key) {
        let meta = obj.meta_mut();
        if meta.deletion_timestamp.is_none() {
            meta.deletion_timestamp = Some(Time(Utc::now()));
            meta.resource_version = Some(version);
        }
    }
}

// =============================================================================
// Memory Store
// =============================================================================

#[derive(Debug, Default)]
struct State {
    groups: Objects<VolumeGroup>,
    contents: Objects<VolumeGroupContent>,
    classes: Objects<VolumeGroupClass>,
    claims: Objects<PersistentVolumeClaim>,
    volumes: Objects<PersistentVolume>,
    storage_classes: Objects<StorageClass>,
    secrets: Objects<Secret>,
    events: Vec<EventRecord>,
    clock: Clock,
}

/// In-process [`ClusterStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Object creation on behalf of users and other controllers
    // -------------------------------------------------------------------------

    pub fn create_class(&self, class: &VolumeGroupClass) -> Result<VolumeGroupClass> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        create(&mut state.classes, &mut state.clock, class)
    }

    pub fn create_group(&self, group: &VolumeGroup) -> Result<VolumeGroup> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        create(&mut state.groups, &mut state.clock, group)
    }

    pub fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        create(&mut state.claims, &mut state.clock, claim)
    }

    pub fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        create(&mut state.volumes, &mut state.clock, volume)
    }

    pub fn create_storage_class(&self, storage_class: &StorageClass) -> Result<StorageClass> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        create(&mut state.storage_classes, &mut state.clock, storage_class)
    }

    pub fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        create(&mut state.secrets, &mut state.clock, secret)
    }

    /// User-initiated delete of a VolumeGroup
    pub fn delete_group(&self, namespace: &str, name: &str) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        delete(&mut state.groups, &mut state.clock, &ObjectKey::new(namespace, name));
    }

    /// Status write for a claim, as the claim binder would do it
    pub fn update_claim_status(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        replace(&mut state.claims, &mut state.clock, claim, WriteMode::Status)
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn group_keys(&self) -> Vec<ObjectKey> {
        self.state.read().groups.keys().cloned().collect()
    }

    pub fn content_keys(&self) -> Vec<ObjectKey> {
        self.state.read().contents.keys().cloned().collect()
    }

    pub fn claim_keys(&self) -> Vec<ObjectKey> {
        self.state.read().claims.keys().cloned().collect()
    }

    /// Every event recorded so far, oldest first
    pub fn events(&self) -> Vec<EventRecord> {
        self.state.read().events.clone()
    }

    /// Number of successful creates, updates and deletes
    pub fn write_count(&self) -> u64 {
        self.state.read().clock.writes
    }

    /// Fail the next `count` updates with a conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.state.write().clock.injected_conflicts = count;
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get_group(&self, namespace: &str, name: &str) -> Result<Option<VolumeGroup>> {
        Ok(self
            .state
            .read()
            .groups
            .get(&ObjectKey::new(namespace, name))
            .cloned())
    }

    async fn list_groups(&self, namespace: Option<&str>) -> Result<Vec<VolumeGroup>> {
        Ok(self
            .state
            .read()
            .groups
            .iter()
            .filter(|(key, _)| namespace.map_or(true, |ns| key.namespace == ns))
            .map(|(_, group)| group.clone())
            .collect())
    }

    async fn update_group(&self, group: &VolumeGroup) -> Result<VolumeGroup> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        replace(&mut state.groups, &mut state.clock, group, WriteMode::Object)
    }

    async fn update_group_status(&self, group: &VolumeGroup) -> Result<VolumeGroup> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        replace(&mut state.groups, &mut state.clock, group, WriteMode::Status)
    }

    async fn get_content(&self, namespace: &str, name: &str) -> Result<Option<VolumeGroupContent>> {
        Ok(self
            .state
            .read()
            .contents
            .get(&ObjectKey::new(namespace, name))
            .cloned())
    }

    async fn create_content(&self, content: &VolumeGroupContent) -> Result<VolumeGroupContent> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        create(&mut state.contents, &mut state.clock, content)
    }

    async fn update_content(&self, content: &VolumeGroupContent) -> Result<VolumeGroupContent> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        replace(&mut state.contents, &mut state.clock, content, WriteMode::Object)
    }

    async fn update_content_status(
        &self,
        content: &VolumeGroupContent,
    ) -> Result<VolumeGroupContent> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        replace(&mut state.contents, &mut state.clock, content, WriteMode::Status)
    }

    async fn delete_content(&self, namespace: &str, name: &str) -> Result<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        delete(&mut state.contents, &mut state.clock, &ObjectKey::new(namespace, name));
        Ok(())
    }

    async fn get_class(&self, name: &str) -> Result<Option<VolumeGroupClass>> {
        Ok(self.state.read().classes.get(&ObjectKey::new("", name)).cloned())
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self
            .state
            .read()
            .claims
            .get(&ObjectKey::new(namespace, name))
            .cloned())
    }

    async fn list_claims(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self
            .state
            .read()
            .claims
            .iter()
            .filter(|(key, _)| key.namespace == namespace)
            .map(|(_, claim)| claim.clone())
            .collect())
    }

    async fn update_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        replace(&mut state.claims, &mut state.clock, claim, WriteMode::Object)
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        delete(&mut state.claims, &mut state.clock, &ObjectKey::new(namespace, name));
        Ok(())
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.state.read().volumes.get(&ObjectKey::new("", name)).cloned())
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        Ok(self
            .state
            .read()
            .storage_classes
            .get(&ObjectKey::new("", name))
            .cloned())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self
            .state
            .read()
            .secrets
            .get(&ObjectKey::new(namespace, name))
            .cloned())
    }

    async fn record_event(&self, event: EventRecord) -> Result<()> {
        debug!(
            "Event {} {} on {:?}: {}",
            event.event_type, event.reason, event.target.name, event.message
        );
        self.state.write().events.push(event);
        Ok(())
    }
}
