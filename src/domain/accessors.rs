//! Entity accessors
//!
//! Uniform getters and in-memory setters over the group resources and the
//! core claim/volume types. Accessors never perform I/O; persisting a change
//! is the job of the status mutators in [`crate::controller::status`].
//! Absent sub-objects read as empty values.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, SecretReference,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};

use crate::crd::{
    DeletionPolicy, VolumeGroup, VolumeGroupContent, VolumeGroupContentSource, VolumeGroupError,
};
use crate::error::{Error, Result};

/// Prefix of every dynamically provisioned content name
pub const CONTENT_NAME_PREFIX: &str = "volumegroup-";

// =============================================================================
// Object Identity
// =============================================================================

/// Namespace/name identity used for membership comparisons
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of any Kubernetes object; cluster-scoped objects get an empty namespace
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self::new(
            obj.meta().namespace.clone().unwrap_or_default(),
            obj.meta().name.clone().unwrap_or_default(),
        )
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

// =============================================================================
// Accessor Traits
// =============================================================================

/// Status fields shared by groups and contents
pub trait StatusAccessor {
    fn is_ready(&self) -> bool;
    fn update_ready(&mut self, ready: bool);
    fn error_message(&self) -> Option<&str>;
    fn update_error(&mut self, message: Option<String>);
    fn group_creation_timestamp(&self) -> Option<DateTime<Utc>>;
    fn update_group_creation_timestamp(&mut self, at: DateTime<Utc>);
}

/// Read/update surface of a VolumeGroup
pub trait GroupAccessor: StatusAccessor {
    fn class_name(&self) -> Option<&str>;
    fn selector(&self) -> Option<&LabelSelector>;
    /// Content named by `spec.source.contentName` for statically provisioned groups
    fn source_content_name(&self) -> Option<&str>;
    fn bound_content_name(&self) -> Option<&str>;
    fn update_bound_content_name(&mut self, name: &str);
    fn member_claims(&self) -> &[PersistentVolumeClaim];
    fn update_member_claims(&mut self, claims: Vec<PersistentVolumeClaim>);

    fn member_keys(&self) -> BTreeSet<ObjectKey> {
        self.member_claims().iter().map(ObjectKey::of).collect()
    }

    fn has_member(&self, key: &ObjectKey) -> bool {
        self.member_claims().iter().any(|c| &ObjectKey::of(c) == key)
    }
}

/// Read/update surface of a VolumeGroupContent
pub trait ContentAccessor: StatusAccessor {
    fn class_name(&self) -> Option<&str>;
    fn group_ref(&self) -> Option<&ObjectReference>;
    fn secret_ref(&self) -> Option<&SecretReference>;
    fn driver(&self) -> Option<&str>;
    /// Backend group handle, `None` until the backend group exists
    fn handle(&self) -> Option<&str>;
    fn update_handle(&mut self, driver: &str, handle: &str, attributes: BTreeMap<String, String>);
    fn member_volumes(&self) -> &[PersistentVolume];
    fn update_member_volumes(&mut self, volumes: Vec<PersistentVolume>);
    fn deletion_policy(&self) -> Option<DeletionPolicy>;
    fn update_deletion_policy(&mut self, policy: DeletionPolicy);

    fn member_volume_names(&self) -> BTreeSet<String> {
        self.member_volumes().iter().map(|v| v.name_any()).collect()
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}

// =============================================================================
// VolumeGroup
// =============================================================================

impl StatusAccessor for VolumeGroup {
    fn is_ready(&self) -> bool {
        self.status.as_ref().and_then(|s| s.ready).unwrap_or(false)
    }

    fn update_ready(&mut self, ready: bool) {
        self.status.get_or_insert_with(Default::default).ready = Some(ready);
    }

    fn error_message(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.error.as_ref())
            .map(|e| e.message.as_str())
    }

    fn update_error(&mut self, message: Option<String>) {
        self.status.get_or_insert_with(Default::default).error = message.map(VolumeGroupError::new);
    }

    fn group_creation_timestamp(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.group_creation_timestamp)
    }

    fn update_group_creation_timestamp(&mut self, at: DateTime<Utc>) {
        self.status
            .get_or_insert_with(Default::default)
            .group_creation_timestamp = Some(at);
    }
}

impl GroupAccessor for VolumeGroup {
    fn class_name(&self) -> Option<&str> {
        non_empty(self.spec.class_name.as_ref())
    }

    fn selector(&self) -> Option<&LabelSelector> {
        self.spec.source.selector.as_ref()
    }

    fn source_content_name(&self) -> Option<&str> {
        non_empty(self.spec.source.content_name.as_ref())
    }

    fn bound_content_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| non_empty(s.bound_content_name.as_ref()))
    }

    fn update_bound_content_name(&mut self, name: &str) {
        self.status.get_or_insert_with(Default::default).bound_content_name = Some(name.to_string());
    }

    fn member_claims(&self) -> &[PersistentVolumeClaim] {
        self.status
            .as_ref()
            .map(|s| s.member_claims.as_slice())
            .unwrap_or(&[])
    }

    fn update_member_claims(&mut self, claims: Vec<PersistentVolumeClaim>) {
        self.status.get_or_insert_with(Default::default).member_claims = claims;
    }
}

// =============================================================================
// VolumeGroupContent
// =============================================================================

impl StatusAccessor for VolumeGroupContent {
    fn is_ready(&self) -> bool {
        self.status.as_ref().and_then(|s| s.ready).unwrap_or(false)
    }

    fn update_ready(&mut self, ready: bool) {
        self.status.get_or_insert_with(Default::default).ready = Some(ready);
    }

    fn error_message(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.error.as_ref())
            .map(|e| e.message.as_str())
    }

    fn update_error(&mut self, message: Option<String>) {
        self.status.get_or_insert_with(Default::default).error = message.map(VolumeGroupError::new);
    }

    fn group_creation_timestamp(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.group_creation_timestamp)
    }

    fn update_group_creation_timestamp(&mut self, at: DateTime<Utc>) {
        self.status
            .get_or_insert_with(Default::default)
            .group_creation_timestamp = Some(at);
    }
}

impl ContentAccessor for VolumeGroupContent {
    fn class_name(&self) -> Option<&str> {
        non_empty(self.spec.class_name.as_ref())
    }

    fn group_ref(&self) -> Option<&ObjectReference> {
        self.spec.group_ref.as_ref()
    }

    fn secret_ref(&self) -> Option<&SecretReference> {
        self.spec.secret_ref.as_ref()
    }

    fn driver(&self) -> Option<&str> {
        self.spec
            .source
            .as_ref()
            .map(|s| s.driver.as_str())
            .filter(|d| !d.is_empty())
    }

    fn handle(&self) -> Option<&str> {
        self.spec
            .source
            .as_ref()
            .map(|s| s.group_handle.as_str())
            .filter(|h| !h.is_empty())
    }

    fn update_handle(&mut self, driver: &str, handle: &str, attributes: BTreeMap<String, String>) {
        self.spec.source = Some(VolumeGroupContentSource {
            driver: driver.to_string(),
            group_handle: handle.to_string(),
            attributes,
        });
    }

    fn member_volumes(&self) -> &[PersistentVolume] {
        self.status
            .as_ref()
            .map(|s| s.member_volumes.as_slice())
            .unwrap_or(&[])
    }

    fn update_member_volumes(&mut self, volumes: Vec<PersistentVolume>) {
        self.status.get_or_insert_with(Default::default).member_volumes = volumes;
    }

    fn deletion_policy(&self) -> Option<DeletionPolicy> {
        self.spec.deletion_policy
    }

    fn update_deletion_policy(&mut self, policy: DeletionPolicy) {
        self.spec.deletion_policy = Some(policy);
    }
}

// =============================================================================
// Claims and Volumes
// =============================================================================

const CLAIM_PHASE_BOUND: &str = "Bound";

pub fn is_bound(claim: &PersistentVolumeClaim) -> bool {
    claim
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map_or(false, |phase| phase == CLAIM_PHASE_BOUND)
}

pub fn storage_class_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|s| non_empty(s.storage_class_name.as_ref()))
}

/// Name of the PersistentVolume bound to the claim
pub fn volume_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|s| non_empty(s.volume_name.as_ref()))
}

/// Backend volume id of a CSI PersistentVolume
pub fn volume_handle(volume: &PersistentVolume) -> Option<&str> {
    volume
        .spec
        .as_ref()
        .and_then(|s| s.csi.as_ref())
        .map(|csi| csi.volume_handle.as_str())
        .filter(|h| !h.is_empty())
}

/// Claim a PersistentVolume is bound to, if any
pub fn bound_claim(volume: &PersistentVolume) -> Option<ObjectKey> {
    let claim_ref = volume.spec.as_ref()?.claim_ref.as_ref()?;
    Some(ObjectKey::new(
        claim_ref.namespace.clone().unwrap_or_default(),
        claim_ref.name.clone()?,
    ))
}

pub fn is_deleting(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

/// Copy of a claim suitable for embedding in group status
pub fn member_snapshot(claim: &PersistentVolumeClaim) -> PersistentVolumeClaim {
    let mut snapshot = claim.clone();
    snapshot.metadata.managed_fields = None;
    snapshot
}

/// Copy of a volume suitable for embedding in content status
pub fn volume_snapshot(volume: &PersistentVolume) -> PersistentVolume {
    let mut snapshot = volume.clone();
    snapshot.metadata.managed_fields = None;
    snapshot
}

// =============================================================================
// Group/Content Linkage
// =============================================================================

/// Deterministic content name of a dynamically provisioned group
pub fn derived_content_name(group: &VolumeGroup) -> Result<String> {
    match group.metadata.uid.as_deref() {
        Some(uid) if !uid.is_empty() => Ok(format!("{}{}", CONTENT_NAME_PREFIX, uid)),
        _ => Err(Error::MissingField(format!(
            "metadata.uid of VolumeGroup {}",
            ObjectKey::of(group)
        ))),
    }
}

/// Content a group is, or will be, bound to
pub fn content_name_of(group: &VolumeGroup) -> Result<String> {
    if let Some(name) = group.source_content_name() {
        return Ok(name.to_string());
    }
    if let Some(name) = group.bound_content_name() {
        return Ok(name.to_string());
    }
    derived_content_name(group)
}

/// Back-reference stored in `spec.groupRef` of a content
pub fn group_reference(group: &VolumeGroup) -> ObjectReference {
    ObjectReference {
        api_version: Some(VolumeGroup::api_version(&()).to_string()),
        kind: Some(VolumeGroup::kind(&()).to_string()),
        name: group.metadata.name.clone(),
        namespace: group.metadata.namespace.clone(),
        uid: group.metadata.uid.clone(),
        ..Default::default()
    }
}
