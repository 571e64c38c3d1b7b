//! VolumeGroup CRD
//!
//! The user-facing group: either a label selector choosing claims in the
//! namespace (dynamic provisioning) or the name of a pre-existing content
//! (static provisioning).

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::VolumeGroupError;

// =============================================================================
// VolumeGroup CRD
// =============================================================================

/// VolumeGroup aggregates the claims matching its selector into one backend group.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "volumegroup.storage.openshift.io",
    version = "v1",
    kind = "VolumeGroup",
    plural = "volumegroups",
    shortname = "vg",
    status = "VolumeGroupStatus",
    printcolumn = r#"{"name": "Class", "type": "string", "jsonPath": ".spec.className"}"#,
    printcolumn = r#"{"name": "Content", "type": "string", "jsonPath": ".status.boundContentName"}"#,
    printcolumn = r#"{"name": "Ready", "type": "boolean", "jsonPath": ".status.ready"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeGroupSpec {
    /// VolumeGroupClass this group belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    /// Where the members come from
    #[serde(default)]
    pub source: VolumeGroupSource,
}

/// Source of a VolumeGroup: a selector, or a pre-provisioned content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeGroupSource {
    /// Claims whose labels match join the group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Name of an existing VolumeGroupContent to bind to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_name: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of a VolumeGroup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeGroupStatus {
    /// True once the bound content is ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,

    /// Name of the VolumeGroupContent this group is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_content_name: Option<String>,

    /// When the backend group was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub group_creation_timestamp: Option<DateTime<Utc>>,

    /// Last reconcile error, cleared once the group converges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VolumeGroupError>,

    /// Claims currently pushed to the backend group
    #[serde(default)]
    pub member_claims: Vec<PersistentVolumeClaim>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_spec_serializes_camel_case() {
        let spec = VolumeGroupSpec {
            class_name: Some("gold".into()),
            source: VolumeGroupSource {
                selector: None,
                content_name: Some("static-content".into()),
            },
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["className"], "gold");
        assert_eq!(json["source"]["contentName"], "static-content");
    }

    #[test]
    fn test_status_tolerates_missing_fields() {
        let status: VolumeGroupStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status, VolumeGroupStatus::default());
        assert!(status.member_claims.is_empty());
    }

    #[test]
    fn test_group_crd_is_namespaced() {
        let crd = VolumeGroup::crd();
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.group, "volumegroup.storage.openshift.io");
    }
}
