//! Types shared by the VolumeGroup custom resources

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of every VolumeGroup resource
pub const API_GROUP: &str = "volumegroup.storage.openshift.io";

/// API version of every VolumeGroup resource
pub const API_VERSION: &str = "v1";

/// Finalizer held by a VolumeGroup until its content is released
pub const VOLUME_GROUP_FINALIZER: &str = "volumegroup.storage.openshift.io/volumegroup.finalizer";

/// Finalizer held by a VolumeGroupContent until the backend group is released
pub const VOLUME_GROUP_CONTENT_FINALIZER: &str =
    "volumegroup.storage.openshift.io/volumegroupcontent.finalizer";

/// Finalizer held by a claim while it is a member of any group
pub const CLAIM_FINALIZER: &str = "volumegroup.storage.openshift.io/pvc.finalizer";

// =============================================================================
// Deletion Policy
// =============================================================================

/// What happens to the backend group when its content object is deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DeletionPolicy {
    /// Delete the backend group together with the content
    #[default]
    Delete,
    /// Keep the backend group and the content object
    Retain,
}

impl std::fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeletionPolicy::Delete => write!(f, "Delete"),
            DeletionPolicy::Retain => write!(f, "Retain"),
        }
    }
}

// =============================================================================
// Status Error
// =============================================================================

/// Last error observed while reconciling a group or content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeGroupError {
    /// Human readable message
    pub message: String,

    /// When the error was recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub time: Option<DateTime<Utc>>,
}

impl VolumeGroupError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            time: Some(Utc::now()),
        }
    }
}
