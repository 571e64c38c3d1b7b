//! Custom Resource Definitions for the VolumeGroup operator
//!
//! This module contains all CRD types:
//! - VolumeGroupClass: driver and parameters shared by a family of groups
//! - VolumeGroup: user-facing group of claims
//! - VolumeGroupContent: backend-facing mirror of a group

pub mod common;
pub mod volume_group;
pub mod volume_group_class;
pub mod volume_group_content;

pub use common::*;
pub use volume_group::*;
pub use volume_group_class::*;
pub use volume_group_content::*;

use kube::CustomResourceExt;

use crate::error::Result;

/// Render every CRD as a multi-document YAML stream
pub fn crds_yaml() -> Result<String> {
    let docs = [
        serde_yaml::to_string(&VolumeGroupClass::crd())?,
        serde_yaml::to_string(&VolumeGroup::crd())?,
        serde_yaml::to_string(&VolumeGroupContent::crd())?,
    ];
    Ok(docs
        .iter()
        .map(|doc| format!("---\n{}", doc))
        .collect::<Vec<_>>()
        .join(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crds_yaml_contains_all_kinds() {
        let yaml = crds_yaml().unwrap();
        assert_eq!(yaml.matches("---\n").count(), 3);
        assert!(yaml.contains("kind: VolumeGroupClass"));
        assert!(yaml.contains("kind: VolumeGroupContent"));
        assert!(yaml.contains("volumegroups.volumegroup.storage.openshift.io"));
    }
}
