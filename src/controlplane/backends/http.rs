//! HTTP Group Backend Adapter
//!
//! Speaks a small JSON protocol to the storage backend's group service:
//!
//! - `POST   {endpoint}/v1/groups`
//! - `DELETE {endpoint}/v1/groups/{id}`
//! - `PUT    {endpoint}/v1/groups/{id}/volumes`

use crate::domain::ports::{BackendOperation, GroupBackend, GroupInfo, Secrets};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateGroupRequest<'a> {
    name: &'a str,
    parameters: &'a BTreeMap<String, String>,
    secrets: &'a Secrets,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteGroupRequest<'a> {
    secrets: &'a Secrets,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyMembershipRequest<'a> {
    volume_ids: &'a [String],
    secrets: &'a Secrets,
}

// =============================================================================
// HTTP Adapter
// =============================================================================

/// Group backend reached over HTTP
pub struct HttpGroupBackend {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpGroupBackend {
    /// Create an adapter; `timeout` bounds every request
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn groups_url(&self) -> String {
        format!("{}/v1/groups", self.endpoint)
    }

    fn group_url(&self, group_id: &str) -> String {
        format!("{}/{}", self.groups_url(), urlencoding::encode(group_id))
    }

    fn volumes_url(&self, group_id: &str) -> String {
        format!("{}/volumes", self.group_url(group_id))
    }

    /// Turn a non-2xx response into a backend error
    async fn check(op: BackendOperation, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::backend(op, format!("HTTP {}: {}", status, body.trim())))
    }
}

#[async_trait]
impl GroupBackend for HttpGroupBackend {
    fn name(&self) -> &str {
        &self.endpoint
    }

    async fn create_group(
        &self,
        name: &str,
        parameters: &BTreeMap<String, String>,
        secrets: &Secrets,
    ) -> Result<GroupInfo> {
        info!("Creating backend group: {}", name);
        let response = self
            .client
            .post(self.groups_url())
            .json(&CreateGroupRequest {
                name,
                parameters,
                secrets,
            })
            .send()
            .await?;
        let info: GroupInfo = Self::check(BackendOperation::CreateGroup, response)
            .await?
            .json()
            .await?;
        if info.group_id.is_empty() {
            return Err(Error::backend(
                BackendOperation::CreateGroup,
                "response carried an empty group id",
            ));
        }
        debug!("Backend group {} created as {}", name, info.group_id);
        Ok(info)
    }

    async fn delete_group(&self, group_id: &str, secrets: &Secrets) -> Result<()> {
        info!("Deleting backend group: {}", group_id);
        let response = self
            .client
            .delete(self.group_url(group_id))
            .json(&DeleteGroupRequest { secrets })
            .send()
            .await?;
        Self::check(BackendOperation::DeleteGroup, response).await?;
        Ok(())
    }

    async fn modify_group_membership(
        &self,
        group_id: &str,
        volume_ids: &[String],
        secrets: &Secrets,
    ) -> Result<()> {
        debug!("Setting membership of {} to {:?}", group_id, volume_ids);
        let response = self
            .client
            .put(self.volumes_url(group_id))
            .json(&ModifyMembershipRequest { volume_ids, secrets })
            .send()
            .await?;
        Self::check(BackendOperation::ModifyGroupMembership, response).await?;
        Ok(())
    }
}
