//! VolumeGroup Operator
//!
//! A Kubernetes operator that groups PersistentVolumeClaims by label
//! selector and keeps a matching volume group on the storage backend in
//! step with them.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          Reconcilers                              │
//! │  ┌───────────────┐  ┌──────────────────────┐  ┌────────────────┐  │
//! │  │  VolumeGroup  │  │  VolumeGroupContent  │  │     Claim      │  │
//! │  └───────┬───────┘  └──────────┬───────────┘  └───────┬────────┘  │
//! │          └─────────────────────┼──────────────────────┘           │
//! │                    ┌───────────┴───────────┐                      │
//! │                    │ Membership / Status   │                      │
//! │                    └───────────┬───────────┘                      │
//! ├────────────────────────────────┼──────────────────────────────────┤
//! │  ┌─────────────────────────────┴─┐  ┌──────────────────────────┐  │
//! │  │ ClusterStore (kube / memory)  │  │ GroupBackend (http/mem)  │  │
//! │  └───────────────────────────────┘  └──────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`crd`]: VolumeGroupClass, VolumeGroup and VolumeGroupContent resources
//! - [`domain`]: accessors, selector matching, parameters and ports
//! - [`controller`]: the reconcilers and their runtime
//! - [`controlplane`]: cluster store and backend adapters
//! - [`config`], [`metrics`], [`error`]: operator plumbing

pub mod config;
pub mod controller;
pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;

pub use config::OperatorConfig;

pub use controller::{run_controllers, wait_for_crds, Context};

pub use controlplane::{
    BackendFactory, HttpGroupBackend, InMemoryGroupBackend, KubeStore, MemoryStore,
};

pub use crd::{
    crds_yaml, DeletionPolicy, VolumeGroup, VolumeGroupClass, VolumeGroupClassSpec,
    VolumeGroupContent, VolumeGroupContentSpec, VolumeGroupSpec,
};

pub use domain::ports::{
    BackendOperation, ClusterStore, EventRecord, EventType, GroupBackend, GroupInfo, Secrets,
};

pub use error::{Error, ErrorAction, Result};

pub use metrics::Metrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
