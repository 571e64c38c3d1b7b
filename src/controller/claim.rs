//! PersistentVolumeClaim reconciler
//!
//! Keeps a single claim's group memberships in line with the selectors of
//! the ready VolumeGroups in its namespace, and detaches it from every group
//! before a deleted claim is allowed to go.

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use super::context::{ClaimClassifier, ClaimEligibility, Context};
use super::membership::{add_claim, driver_groups, remove_claim, resolve_member};
use super::reason;
use super::status::{has_finalizer, release_finalizer};
use crate::crd::{VolumeGroup, CLAIM_FINALIZER};
use crate::domain::accessors::{is_deleting, GroupAccessor, ObjectKey, StatusAccessor};
use crate::domain::ports::EventType;
use crate::domain::selector::Selector;
use crate::error::{Error, Result};

pub const CONTROLLER: &str = "persistentvolumeclaim";

/// Requeue while a bound claim's volume has no CSI handle yet
const VOLUME_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[instrument(skip(claim, ctx), fields(name = %claim.name_any(), namespace = %claim.namespace().unwrap_or_default()))]
pub async fn reconcile(claim: Arc<PersistentVolumeClaim>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let key = ObjectKey::of(claim.as_ref());
    let result = reconcile_claim(&ctx, &key).await;
    ctx.finish(CONTROLLER, &key, started, result.is_ok());
    result
}

pub fn error_policy(claim: Arc<PersistentVolumeClaim>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = ObjectKey::of(claim.as_ref());
    warn!("Claim {} reconcile error: {}", key, err);
    ctx.error_action(CONTROLLER, &key, err)
}

async fn reconcile_claim(ctx: &Context, key: &ObjectKey) -> Result<Action> {
    let Some(claim) = ctx.store.get_claim(&key.namespace, &key.name).await? else {
        return Ok(Action::await_change());
    };

    if is_deleting(&claim.metadata) {
        return detach(ctx, &claim).await;
    }

    match ClaimClassifier::new(ctx).classify(&claim).await? {
        ClaimEligibility::Eligible => {}
        ClaimEligibility::StaticallyGrouped { storage_class } => {
            let err = Error::ClaimStaticallyGrouped {
                claim: key.to_string(),
                storage_class,
            };
            ctx.emit(
                claim.object_ref(&()),
                EventType::Warning,
                reason::CLAIM_STATICALLY_GROUPED,
                err.to_string(),
            )
            .await;
            return Ok(Action::await_change());
        }
        other => {
            debug!("Claim {} is not eligible: {:?}", key, other);
            return Ok(Action::await_change());
        }
    }

    let Some(member) = resolve_member(ctx, &claim).await? else {
        debug!("Claim {} has no CSI volume yet", key);
        return Ok(Action::requeue(VOLUME_POLL_INTERVAL));
    };

    let groups = driver_groups(ctx, Some(&key.namespace)).await?;
    let mut held_by: BTreeSet<String> = groups
        .iter()
        .filter(|g| g.has_member(key))
        .map(|g| g.name_any())
        .collect();
    let mut first_error = None;

    for group in groups
        .iter()
        .filter(|g| g.is_ready() && !is_deleting(&g.metadata))
    {
        let name = group.name_any();
        let matches = selects(group, &claim);

        if group.has_member(key) {
            if matches {
                continue;
            }
            match remove_claim(ctx, group, key).await {
                Ok(_) => {
                    held_by.remove(&name);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
            continue;
        }
        if !matches {
            continue;
        }

        if ctx.config.single_group_mode() {
            if let Some(holder) = held_by.iter().next() {
                let conflict = Error::GroupConflict {
                    claim: key.to_string(),
                    group: holder.clone(),
                };
                ctx.emit(
                    claim.object_ref(&()),
                    EventType::Warning,
                    reason::GROUP_CONFLICT,
                    conflict.to_string(),
                )
                .await;
                continue;
            }
        }

        match add_claim(ctx, group, &member).await {
            Ok(_) => {
                held_by.insert(name);
            }
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(Action::requeue(ctx.config.resync_interval)),
    }
}

/// Whether a group's selector picks the claim; unparsable selectors pick nothing
fn selects(group: &VolumeGroup, claim: &PersistentVolumeClaim) -> bool {
    group
        .selector()
        .and_then(|s| Selector::parse(s).ok())
        .map(|s| s.matches(claim.labels()))
        .unwrap_or(false)
}

/// Remove a deleted claim from every group, then let it go
async fn detach(ctx: &Context, claim: &PersistentVolumeClaim) -> Result<Action> {
    if !has_finalizer(&claim.metadata, CLAIM_FINALIZER) {
        return Ok(Action::await_change());
    }
    let key = ObjectKey::of(claim);
    let mut first_error = None;

    for group in ctx.store.list_groups(Some(&key.namespace)).await? {
        if !group.has_member(&key) {
            continue;
        }
        if let Err(e) = remove_claim(ctx, &group, &key).await {
            first_error.get_or_insert(e);
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    if let Some(claim) = ctx.store.get_claim(&key.namespace, &key.name).await? {
        if has_finalizer(&claim.metadata, CLAIM_FINALIZER) {
            release_finalizer(ctx.store.as_ref(), &claim, CLAIM_FINALIZER).await?;
        }
    }
    Ok(Action::await_change())
}
