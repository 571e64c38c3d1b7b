//! Reconcilers
//!
//! Three independent reconcilers converge VolumeGroups, VolumeGroupContents
//! and PersistentVolumeClaims. They share no locks; every cross-object write
//! goes through [`status::mutate`] and is safe to repeat.

pub mod claim;
pub mod context;
pub mod membership;
pub mod runtime;
pub mod status;
pub mod volume_group;
pub mod volume_group_content;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{ClaimClassifier, ClaimEligibility, Context};
pub use runtime::{run_controllers, wait_for_crds};

/// Kubernetes event reasons
pub mod reason {
    pub const VOLUME_GROUP_READY: &str = "VolumeGroupReady";
    pub const CONTENT_CREATED: &str = "VolumeGroupContentCreated";
    pub const MEMBERSHIP_UPDATED: &str = "MembershipUpdated";
    pub const MEMBERSHIP_FAILED: &str = "MembershipFailed";
    pub const CLAIM_STATICALLY_GROUPED: &str = "ClaimStaticallyGrouped";
    pub const GROUP_CONFLICT: &str = "GroupConflict";
    pub const CONFIGURATION_ERROR: &str = "ConfigurationError";
}
