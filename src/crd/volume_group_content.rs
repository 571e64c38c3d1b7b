//! VolumeGroupContent CRD
//!
//! The backend-facing half of a group. Its name is derived from the owning
//! VolumeGroup's UID for dynamically provisioned groups.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume, SecretReference};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::common::{DeletionPolicy, VolumeGroupError};

// =============================================================================
// VolumeGroupContent CRD
// =============================================================================

/// VolumeGroupContent mirrors one backend group.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "volumegroup.storage.openshift.io",
    version = "v1",
    kind = "VolumeGroupContent",
    plural = "volumegroupcontents",
    shortname = "vgc",
    status = "VolumeGroupContentStatus",
    printcolumn = r#"{"name": "Class", "type": "string", "jsonPath": ".spec.className"}"#,
    printcolumn = r#"{"name": "Handle", "type": "string", "jsonPath": ".spec.source.groupHandle"}"#,
    printcolumn = r#"{"name": "Ready", "type": "boolean", "jsonPath": ".status.ready"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeGroupContentSpec {
    /// VolumeGroupClass; absent for contents not managed by any driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    /// The VolumeGroup bound to this content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_ref: Option<ObjectReference>,

    /// Secret passed to the backend on every call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,

    /// Backend coordinates, filled in once the backend group exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<VolumeGroupContentSource>,
}

/// Identity of the backend group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeGroupContentSource {
    /// Driver owning the backend group
    pub driver: String,

    /// Backend group identifier, empty until created
    #[serde(default)]
    pub group_handle: String,

    /// Opaque attributes returned by the backend
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of a VolumeGroupContent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeGroupContentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub group_creation_timestamp: Option<DateTime<Utc>>,

    /// Volumes backing the owning group's member claims
    #[serde(default)]
    pub member_volumes: Vec<PersistentVolume>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VolumeGroupError>,
}
