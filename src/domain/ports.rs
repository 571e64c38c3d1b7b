//! Domain Ports - Core trait definitions for the VolumeGroup operator
//!
//! These traits define the boundaries between the reconcilers and external
//! systems. Adapters implement these traits to provide concrete functionality:
//! the Kubernetes API (or an in-memory object store) and the group backend.

use crate::crd::{VolumeGroup, VolumeGroupClass, VolumeGroupContent};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, Secret,
};
use k8s_openapi::api::storage::v1::StorageClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Credentials forwarded with every backend call
pub type Secrets = BTreeMap<String, String>;

// =============================================================================
// Group Backend Port
// =============================================================================

/// Backend operations, used for logging and metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendOperation {
    CreateGroup,
    DeleteGroup,
    ModifyGroupMembership,
}

impl std::fmt::Display for BackendOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendOperation::CreateGroup => write!(f, "CreateGroup"),
            BackendOperation::DeleteGroup => write!(f, "DeleteGroup"),
            BackendOperation::ModifyGroupMembership => write!(f, "ModifyGroupMembership"),
        }
    }
}

/// Backend group returned by a successful create
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    /// Backend identifier of the group
    pub group_id: String,
    /// Opaque attributes stored on the content
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Port for the remote storage backend's group primitive
#[async_trait]
pub trait GroupBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Create a group; creating an existing name returns the same group
    async fn create_group(
        &self,
        name: &str,
        parameters: &BTreeMap<String, String>,
        secrets: &Secrets,
    ) -> Result<GroupInfo>;

    /// Delete a group
    async fn delete_group(&self, group_id: &str, secrets: &Secrets) -> Result<()>;

    /// Replace the group's membership with exactly `volume_ids`
    async fn modify_group_membership(
        &self,
        group_id: &str,
        volume_ids: &[String],
        secrets: &Secrets,
    ) -> Result<()>;
}

// =============================================================================
// Cluster Store Port
// =============================================================================

/// Kubernetes event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

/// An event to publish against an object
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub target: ObjectReference,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Port for typed access to the cluster object store.
///
/// Reads return `Ok(None)` for missing objects. Writes carry the object's
/// resourceVersion and fail with `Error::Conflict` when it is stale.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    // VolumeGroup
    async fn get_group(&self, namespace: &str, name: &str) -> Result<Option<VolumeGroup>>;
    async fn list_groups(&self, namespace: Option<&str>) -> Result<Vec<VolumeGroup>>;
    async fn update_group(&self, group: &VolumeGroup) -> Result<VolumeGroup>;
    async fn update_group_status(&self, group: &VolumeGroup) -> Result<VolumeGroup>;

    // VolumeGroupContent
    async fn get_content(&self, namespace: &str, name: &str) -> Result<Option<VolumeGroupContent>>;
    async fn create_content(&self, content: &VolumeGroupContent) -> Result<VolumeGroupContent>;
    async fn update_content(&self, content: &VolumeGroupContent) -> Result<VolumeGroupContent>;
    async fn update_content_status(
        &self,
        content: &VolumeGroupContent,
    ) -> Result<VolumeGroupContent>;
    async fn delete_content(&self, namespace: &str, name: &str) -> Result<()>;

    // VolumeGroupClass
    async fn get_class(&self, name: &str) -> Result<Option<VolumeGroupClass>>;

    // Core resources
    async fn get_claim(&self, namespace: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>>;
    async fn list_claims(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>>;
    async fn update_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()>;
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    // Events
    async fn record_event(&self, event: EventRecord) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type GroupBackendRef = Arc<dyn GroupBackend>;
pub type ClusterStoreRef = Arc<dyn ClusterStore>;
