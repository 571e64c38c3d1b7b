//! Control Plane Adapters
//!
//! Concrete implementations of the domain ports: cluster stores backed by
//! the Kubernetes API or process memory, and group backends.

pub mod backends;
pub mod kube_store;
pub mod memory_store;

pub use backends::*;
pub use kube_store::KubeStore;
pub use memory_store::MemoryStore;
