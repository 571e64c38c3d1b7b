//! In-Memory Group Backend
//!
//! Keeps groups in process memory. Creation is idempotent by name, every
//! call is counted, and failures can be injected per operation.

use crate::domain::ports::{BackendOperation, GroupBackend, GroupInfo, Secrets};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, info};

// =============================================================================
// Backend State
// =============================================================================

/// A group as the backend sees it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendGroup {
    pub id: String,
    pub name: String,
    pub parameters: BTreeMap<String, String>,
    pub volume_ids: Vec<String>,
}

/// Number of calls made per operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCalls {
    pub create: u32,
    pub delete: u32,
    pub modify: u32,
}

impl BackendCalls {
    pub fn total(&self) -> u32 {
        self.create + self.delete + self.modify
    }
}

#[derive(Debug, Default)]
struct BackendState {
    groups: BTreeMap<String, BackendGroup>,
    next_id: u64,
    calls: BackendCalls,
    failures: BTreeMap<BackendOperation, u32>,
    last_secrets: Secrets,
}

impl BackendState {
    fn take_failure(&mut self, op: BackendOperation) -> Result<()> {
        match self.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(Error::backend(op, "injected failure"))
            }
            _ => Ok(()),
        }
    }
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// Group backend living in process memory
#[derive(Debug)]
pub struct InMemoryGroupBackend {
    name: String,
    state: RwLock<BackendState>,
}

impl Default for InMemoryGroupBackend {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl InMemoryGroupBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(BackendState::default()),
        }
    }

    /// Fail the next `times` calls of `op`
    pub fn fail_next(&self, op: BackendOperation, times: u32) {
        self.state.write().failures.insert(op, times);
    }

    pub fn calls(&self) -> BackendCalls {
        self.state.read().calls
    }

    pub fn group(&self, group_id: &str) -> Option<BackendGroup> {
        self.state.read().groups.get(group_id).cloned()
    }

    pub fn group_by_name(&self, name: &str) -> Option<BackendGroup> {
        self.state
            .read()
            .groups
            .values()
            .find(|g| g.name == name)
            .cloned()
    }

    pub fn group_count(&self) -> usize {
        self.state.read().groups.len()
    }

    /// Secrets passed with the most recent call
    pub fn last_secrets(&self) -> Secrets {
        self.state.read().last_secrets.clone()
    }
}

#[async_trait]
impl GroupBackend for InMemoryGroupBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_group(
        &self,
        name: &str,
        parameters: &BTreeMap<String, String>,
        secrets: &Secrets,
    ) -> Result<GroupInfo> {
        let mut state = self.state.write();
        state.calls.create += 1;
        state.last_secrets = secrets.clone();
        state.take_failure(BackendOperation::CreateGroup)?;

        if let Some(existing) = state.groups.values().find(|g| g.name == name) {
            debug!("Group {} already exists as {}", name, existing.id);
            return Ok(GroupInfo {
                group_id: existing.id.clone(),
                attributes: existing.parameters.clone(),
            });
        }

        state.next_id += 1;
        let id = format!("grp-{:04}", state.next_id);
        info!("Creating backend group: {} ({})", name, id);
        state.groups.insert(
            id.clone(),
            BackendGroup {
                id: id.clone(),
                name: name.to_string(),
                parameters: parameters.clone(),
                volume_ids: Vec::new(),
            },
        );
        Ok(GroupInfo {
            group_id: id,
            attributes: parameters.clone(),
        })
    }

    async fn delete_group(&self, group_id: &str, secrets: &Secrets) -> Result<()> {
        let mut state = self.state.write();
        state.calls.delete += 1;
        state.last_secrets = secrets.clone();
        state.take_failure(BackendOperation::DeleteGroup)?;

        info!("Deleting backend group: {}", group_id);
        // Deleting a missing group succeeds so retries converge
        state.groups.remove(group_id);
        Ok(())
    }

    async fn modify_group_membership(
        &self,
        group_id: &str,
        volume_ids: &[String],
        secrets: &Secrets,
    ) -> Result<()> {
        let mut state = self.state.write();
        state.calls.modify += 1;
        state.last_secrets = secrets.clone();
        state.take_failure(BackendOperation::ModifyGroupMembership)?;

        let group = state.groups.get_mut(group_id).ok_or_else(|| {
            Error::backend(
                BackendOperation::ModifyGroupMembership,
                format!("group {} not found", group_id),
            )
        })?;
        debug!("Group {} membership -> {:?}", group_id, volume_ids);
        group.volume_ids = volume_ids.to_vec();
        Ok(())
    }
}
