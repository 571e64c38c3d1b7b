//! Operator configuration
//!
//! Values consumed by every reconciler, built once from the command line and
//! shared through the controller context.

use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for the VolumeGroup operator
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Driver name; must equal a class's `driver` for its groups to be managed
    pub driver_name: String,
    /// Timeout applied to every backend call
    pub rpc_timeout: Duration,
    /// Allow a claim to be a member of more than one group
    pub multiple_groups_per_claim: bool,
    /// Keep member claims when their content is deleted
    pub disable_claim_deletion: bool,
    /// Requeue interval after a successful reconcile
    pub resync_interval: Duration,
    /// Base URL of the group backend, or `memory://` for an in-process backend
    pub backend_endpoint: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            driver_name: String::new(),
            rpc_timeout: Duration::from_secs(60),
            multiple_groups_per_claim: false,
            disable_claim_deletion: false,
            resync_interval: Duration::from_secs(300),
            backend_endpoint: "http://127.0.0.1:9808".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Default configuration for `driver_name`
    pub fn new(driver_name: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
            ..Default::default()
        }
    }

    /// True when a claim may belong to at most one group
    pub fn single_group_mode(&self) -> bool {
        !self.multiple_groups_per_claim
    }

    pub fn validate(&self) -> Result<()> {
        if self.driver_name.trim().is_empty() {
            return Err(Error::Configuration("driver name must not be empty".into()));
        }
        if self.rpc_timeout.is_zero() {
            return Err(Error::Configuration("RPC timeout must be positive".into()));
        }
        if self.resync_interval.is_zero() {
            return Err(Error::Configuration("resync interval must be positive".into()));
        }
        let supported = ["http://", "https://", "memory://"];
        if !supported
            .iter()
            .any(|scheme| self.backend_endpoint.starts_with(scheme))
        {
            return Err(Error::Configuration(format!(
                "backend endpoint {} is not an http(s) or memory URL",
                self.backend_endpoint
            )));
        }
        Ok(())
    }
}
