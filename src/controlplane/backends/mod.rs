//! Group Backend Adapters
//!
//! Provides adapters for the backend's group primitive:
//! - HTTP: JSON over HTTP to the storage backend's group service
//! - Memory: in-process groups, used for tests and local runs

pub mod http;
pub mod memory;

pub use http::*;
pub use memory::*;

use crate::config::OperatorConfig;
use crate::domain::ports::GroupBackendRef;
use crate::error::{Error, Result};
use std::sync::Arc;

/// Endpoint scheme selecting the in-memory backend
pub const MEMORY_ENDPOINT: &str = "memory://";

/// Factory for creating group backend adapters
pub struct BackendFactory;

impl BackendFactory {
    /// Create the backend named by the configured endpoint
    pub fn create(config: &OperatorConfig) -> Result<GroupBackendRef> {
        let endpoint = config.backend_endpoint.as_str();
        if endpoint.starts_with(MEMORY_ENDPOINT) {
            return Ok(Arc::new(InMemoryGroupBackend::new(config.driver_name.clone())));
        }
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Ok(Arc::new(HttpGroupBackend::new(endpoint, config.rpc_timeout)?));
        }
        Err(Error::Configuration(format!(
            "unsupported backend endpoint: {}",
            endpoint
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_selects_backend() {
        let mut config = OperatorConfig::new("drv");
        config.backend_endpoint = "memory://".into();
        assert_eq!(BackendFactory::create(&config).unwrap().name(), "drv");

        config.backend_endpoint = "http://backend:9808".into();
        assert_eq!(
            BackendFactory::create(&config).unwrap().name(),
            "http://backend:9808"
        );

        config.backend_endpoint = "grpc://backend".into();
        assert!(BackendFactory::create(&config).is_err());
    }
}
