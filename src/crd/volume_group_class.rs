//! VolumeGroupClass CRD
//!
//! Cluster-scoped configuration naming the driver that owns groups of this
//! class, the parameters handed to it, and the default deletion policy.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::common::DeletionPolicy;

// =============================================================================
// VolumeGroupClass CRD
// =============================================================================

/// VolumeGroupClass describes how groups of a given class are provisioned.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "volumegroup.storage.openshift.io",
    version = "v1",
    kind = "VolumeGroupClass",
    plural = "volumegroupclasses",
    shortname = "vgclass",
    printcolumn = r#"{"name": "Driver", "type": "string", "jsonPath": ".spec.driver"}"#,
    printcolumn = r#"{"name": "DeletionPolicy", "type": "string", "jsonPath": ".spec.deletionPolicy"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeGroupClassSpec {
    /// Name of the driver that manages groups of this class
    pub driver: String,

    /// Driver parameters; keys under the reserved prefix configure secrets
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Deletion policy applied to new contents, `Delete` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
}

impl VolumeGroupClass {
    /// Effective deletion policy of the class
    pub fn deletion_policy(&self) -> DeletionPolicy {
        self.spec.deletion_policy.unwrap_or_default()
    }

    pub fn driver(&self) -> &str {
        &self.spec.driver
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.spec.parameters
    }
}
