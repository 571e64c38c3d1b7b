//! Error types for the VolumeGroup operator
//!
//! One error enum covers cluster-store outcomes, configuration problems
//! surfaced on resource status, backend RPC failures and lifecycle guards.
//! [`Error::action`] maps each variant onto a requeue decision.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Missing field: {0}")]
    MissingField(String),

    // =========================================================================
    // Cluster Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    AlreadyExists { kind: String, name: String },

    #[error("Write conflict on {kind}/{name}")]
    Conflict { kind: String, name: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Invalid parameter {key}: {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("Invalid label selector: {0}")]
    InvalidSelector(String),

    #[error("Claim {claim} is already grouped by StorageClass {storage_class}")]
    ClaimStaticallyGrouped { claim: String, storage_class: String },

    #[error("Claim {claim} already belongs to volume group {group}")]
    GroupConflict { claim: String, group: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("VolumeGroupContent {content} is still referenced by VolumeGroup {group}")]
    StillReferenced { content: String, group: String },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend operation {operation} failed: {reason}")]
    Backend { operation: String, reason: String },

    #[error("Backend transport error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes or the periodic resync
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Http(_)
            | Error::Backend { .. }
            | Error::Conflict { .. }
            | Error::NotFound { .. }
            | Error::AlreadyExists { .. } => ErrorAction::RequeueWithBackoff,

            // Waiting on the owning group to disappear
            Error::StillReferenced { .. } => ErrorAction::RequeueAfter(Duration::from_secs(10)),

            // Configuration/validation errors - surfaced on status, don't retry
            Error::Configuration(_)
            | Error::MissingField(_)
            | Error::InvalidParameter { .. }
            | Error::InvalidSelector(_)
            | Error::ClaimStaticallyGrouped { .. }
            | Error::GroupConflict { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Http(_) | Error::Backend { .. } | Error::Conflict { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// Build a backend failure for `operation`
    pub fn backend(operation: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Error::Backend {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
