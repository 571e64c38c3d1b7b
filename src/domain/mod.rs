//! Domain layer - Core business logic and port definitions
//!
//! This module defines the core traits (ports) that adapters implement,
//! following hexagonal architecture principles, plus the pure logic the
//! reconcilers share: accessors, selector matching and parameter handling.

pub mod accessors;
pub mod parameters;
pub mod ports;
pub mod selector;

pub use accessors::{ContentAccessor, GroupAccessor, ObjectKey, StatusAccessor};
pub use ports::*;
pub use selector::Selector;
