//! Membership synchronizer
//!
//! Brings a group's member claims, its content's member volumes and the
//! backend group into agreement. The batch path ([`sync_group`]) replaces the
//! whole membership in one backend call; the single-claim path
//! ([`add_claim`], [`remove_claim`]) serves the claim reconciler. In both,
//! cluster state is written only after the backend call succeeds.

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use super::context::{ClaimClassifier, ClaimEligibility, Context};
use super::reason;
use super::status::{ensure_finalizer, has_finalizer, mutate, record_error, release_finalizer, WriteTarget};
use crate::crd::{VolumeGroup, VolumeGroupContent, CLAIM_FINALIZER};
use crate::domain::accessors::{
    bound_claim, is_deleting, member_snapshot, volume_handle, volume_name, volume_snapshot,
    ContentAccessor, GroupAccessor, ObjectKey, StatusAccessor,
};
use crate::domain::ports::{EventType, Secrets};
use crate::domain::selector::Selector;
use crate::error::{Error, Result};

// =============================================================================
// Members
// =============================================================================

/// A claim together with the CSI volume it is bound to
#[derive(Debug, Clone)]
pub struct Member {
    pub claim: PersistentVolumeClaim,
    pub volume: PersistentVolume,
}

impl Member {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::of(&self.claim)
    }

    pub fn volume_id(&self) -> &str {
        volume_handle(&self.volume).unwrap_or_default()
    }
}

/// Look up the volume behind a claim; `None` until it has a CSI handle
pub async fn resolve_member(ctx: &Context, claim: &PersistentVolumeClaim) -> Result<Option<Member>> {
    let Some(pv_name) = volume_name(claim) else {
        return Ok(None);
    };
    let Some(volume) = ctx.store.get_volume(pv_name).await? else {
        return Ok(None);
    };
    if volume_handle(&volume).is_none() {
        return Ok(None);
    }
    Ok(Some(Member {
        claim: claim.clone(),
        volume,
    }))
}

fn sorted_volume_ids(volumes: &[PersistentVolume]) -> Vec<String> {
    let ids: BTreeSet<String> = volumes
        .iter()
        .filter_map(volume_handle)
        .map(String::from)
        .collect();
    ids.into_iter().collect()
}

/// Groups whose class belongs to this operator's driver, sorted by key
pub async fn driver_groups(ctx: &Context, namespace: Option<&str>) -> Result<Vec<VolumeGroup>> {
    let mut owned: BTreeMap<String, bool> = BTreeMap::new();
    let mut groups = Vec::new();

    for group in ctx.store.list_groups(namespace).await? {
        let Some(class_name) = group.class_name() else {
            continue;
        };
        if !owned.contains_key(class_name) {
            let ours = match ctx.store.get_class(class_name).await? {
                Some(class) => ctx.owns_driver(class.driver()),
                None => false,
            };
            owned.insert(class_name.to_string(), ours);
        }
        if owned.get(class_name).copied().unwrap_or(false) {
            groups.push(group);
        }
    }

    groups.sort_by_key(|g| ObjectKey::of(g));
    Ok(groups)
}

// =============================================================================
// Planning
// =============================================================================

/// Desired membership of one group
#[derive(Debug, Default)]
pub struct MembershipPlan {
    pub members: Vec<Member>,
    /// Claims the selector picked but which cannot join, as user-facing messages
    pub rejections: Vec<String>,
}

impl MembershipPlan {
    pub fn keys(&self) -> BTreeSet<ObjectKey> {
        self.members.iter().map(Member::key).collect()
    }

    pub fn volume_ids(&self) -> Vec<String> {
        let ids: BTreeSet<String> = self
            .members
            .iter()
            .map(|m| m.volume_id().to_string())
            .collect();
        ids.into_iter().collect()
    }

    pub fn volume_names(&self) -> BTreeSet<String> {
        self.members.iter().map(|m| m.volume.name_any()).collect()
    }

    pub fn error_message(&self) -> Option<String> {
        if self.rejections.is_empty() {
            None
        } else {
            Some(self.rejections.join("; "))
        }
    }
}

/// Compute which claims `group` should contain.
///
/// A claim qualifies when it is Bound on a StorageClass of this driver,
/// matches the group's selector and, in single-group mode, is held by no
/// other group. When no group holds it yet and several ready groups match,
/// the group with the lexicographically smallest name takes it.
pub async fn plan_membership(ctx: &Context, group: &VolumeGroup) -> Result<MembershipPlan> {
    let selector = group
        .selector()
        .map(Selector::parse)
        .transpose()?
        .unwrap_or_default();
    let group_key = ObjectKey::of(group);
    let group_name = group.name_any();

    let others: Vec<VolumeGroup> = driver_groups(ctx, Some(&group_key.namespace))
        .await?
        .into_iter()
        .filter(|g| ObjectKey::of(g) != group_key)
        .collect();
    let competitors: Vec<(String, Selector)> = others
        .iter()
        .filter(|g| g.is_ready() && !is_deleting(&g.metadata))
        .filter_map(|g| Some((g.name_any(), Selector::parse(g.selector()?).ok()?)))
        .collect();

    let mut claims = ctx.store.list_claims(&group_key.namespace).await?;
    claims.sort_by_key(|c| ObjectKey::of(c));

    let mut classifier = ClaimClassifier::new(ctx);
    let mut plan = MembershipPlan::default();

    for claim in &claims {
        if !selector.matches(claim.labels()) {
            continue;
        }
        let key = ObjectKey::of(claim);
        match classifier.classify(claim).await? {
            ClaimEligibility::Eligible => {}
            ClaimEligibility::StaticallyGrouped { storage_class } => {
                plan.rejections.push(
                    Error::ClaimStaticallyGrouped {
                        claim: key.to_string(),
                        storage_class,
                    }
                    .to_string(),
                );
                continue;
            }
            _ => continue,
        }

        if ctx.config.single_group_mode() {
            let holder = others
                .iter()
                .filter(|g| g.has_member(&key))
                .map(|g| g.name_any())
                .min();
            if let Some(holder) = holder {
                let keeps = group.has_member(&key) && group_name < holder;
                if !keeps {
                    plan.rejections.push(
                        Error::GroupConflict {
                            claim: key.to_string(),
                            group: holder,
                        }
                        .to_string(),
                    );
                    continue;
                }
            } else if !group.has_member(&key)
                && competitors
                    .iter()
                    .any(|(name, s)| name < &group_name && s.matches(claim.labels()))
            {
                debug!("Claim {} left to an earlier matching group", key);
                continue;
            }
        }

        match resolve_member(ctx, claim).await? {
            Some(member) => plan.members.push(member),
            None => debug!("Claim {} has no CSI volume yet", key),
        }
    }

    Ok(plan)
}

// =============================================================================
// Shared Steps
// =============================================================================

fn content_handle(content: &VolumeGroupContent) -> Result<&str> {
    content.handle().ok_or_else(|| {
        Error::MissingField(format!(
            "spec.source.groupHandle of VolumeGroupContent {}",
            ObjectKey::of(content)
        ))
    })
}

/// Record a failed backend membership change on the group
async fn membership_failed(ctx: &Context, group: &VolumeGroup, err: &Error) -> Result<()> {
    warn!(
        "Membership change for VolumeGroup {} failed: {}",
        ObjectKey::of(group),
        err
    );
    record_error(ctx.store.as_ref(), group, Some(err.to_string())).await?;
    ctx.emit(
        group.object_ref(&()),
        EventType::Warning,
        reason::MEMBERSHIP_FAILED,
        err.to_string(),
    )
    .await;
    Ok(())
}

/// Drop the claim finalizer unless a group other than `except` still holds the claim
pub async fn release_claim_if_unheld(ctx: &Context, key: &ObjectKey, except: &ObjectKey) -> Result<()> {
    let groups = ctx.store.list_groups(Some(&key.namespace)).await?;
    if let Some(holder) = groups
        .iter()
        .find(|g| &ObjectKey::of(*g) != except && g.has_member(key))
    {
        debug!(
            "Claim {} still held by VolumeGroup {}",
            key,
            ObjectKey::of(holder)
        );
        return Ok(());
    }

    let Some(claim) = ctx.store.get_claim(&key.namespace, &key.name).await? else {
        return Ok(());
    };
    if has_finalizer(&claim.metadata, CLAIM_FINALIZER) {
        release_finalizer(ctx.store.as_ref(), &claim, CLAIM_FINALIZER).await?;
    }
    Ok(())
}

/// Set the group's error to the planning outcome
async fn settle_error(ctx: &Context, group: VolumeGroup, message: Option<String>) -> Result<VolumeGroup> {
    if group.error_message() == message.as_deref() {
        return Ok(group);
    }
    let updated = record_error(ctx.store.as_ref(), &group, message.clone()).await?;
    if let Some(message) = message {
        ctx.emit(
            group.object_ref(&()),
            EventType::Warning,
            reason::CONFIGURATION_ERROR,
            message,
        )
        .await;
    }
    Ok(updated)
}

// =============================================================================
// Batch Path
// =============================================================================

/// Converge a group's membership with its desired member set.
///
/// When the member set differs, one backend call carries the complete
/// target volume list and the group status is only rewritten after it
/// succeeds. Content volumes and claim finalizers are repaired either way.
pub async fn sync_group(
    ctx: &Context,
    group: &VolumeGroup,
    content: &VolumeGroupContent,
    secrets: &Secrets,
) -> Result<VolumeGroup> {
    let store = ctx.store.as_ref();
    let group_key = ObjectKey::of(group);
    let plan = plan_membership(ctx, group).await?;
    let desired = plan.keys();
    let current = group.member_keys();
    let mut group = group.clone();

    if desired != current {
        let handle = content_handle(content)?;
        if let Err(e) = ctx
            .modify_membership(handle, &plan.volume_ids(), secrets)
            .await
        {
            membership_failed(ctx, &group, &e).await?;
            return Err(e);
        }

        let claims: Vec<PersistentVolumeClaim> =
            plan.members.iter().map(|m| member_snapshot(&m.claim)).collect();
        group = mutate(store, &group, WriteTarget::Status, |g| {
            if g.member_keys() == desired {
                return false;
            }
            g.update_member_claims(claims.clone());
            true
        })
        .await?;

        let added = desired.difference(&current).count();
        let removed: Vec<&ObjectKey> = current.difference(&desired).collect();
        info!(
            "VolumeGroup {} membership updated: {} added, {} removed",
            group_key,
            added,
            removed.len()
        );
        ctx.emit(
            group.object_ref(&()),
            EventType::Normal,
            reason::MEMBERSHIP_UPDATED,
            format!("Added {} and removed {} claims", added, removed.len()),
        )
        .await;

        for key in removed {
            release_claim_if_unheld(ctx, key, &group_key).await?;
        }
    }

    let volumes: Vec<PersistentVolume> =
        plan.members.iter().map(|m| volume_snapshot(&m.volume)).collect();
    let names = plan.volume_names();
    mutate(store, content, WriteTarget::Status, |c| {
        if c.member_volume_names() == names {
            return false;
        }
        c.update_member_volumes(volumes.clone());
        true
    })
    .await?;

    for member in &plan.members {
        ensure_finalizer(store, &member.claim, CLAIM_FINALIZER).await?;
    }

    settle_error(ctx, group, plan.error_message()).await
}

// =============================================================================
// Single-Claim Path
// =============================================================================

/// Bound content and backend secrets of a ready group
async fn backend_target(ctx: &Context, group: &VolumeGroup) -> Result<(VolumeGroupContent, Secrets)> {
    let key = ObjectKey::of(group);
    let name = group.bound_content_name().ok_or_else(|| {
        Error::MissingField(format!("status.boundContentName of VolumeGroup {}", key))
    })?;
    let content = ctx
        .store
        .get_content(&key.namespace, name)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: VolumeGroupContent::kind(&()).to_string(),
            name: ObjectKey::new(key.namespace.as_str(), name).to_string(),
        })?;
    let class = ctx.class_for(group.class_name()).await?;
    let secrets = ctx.secrets_for(class.parameters()).await?;
    Ok((content, secrets))
}

/// Add one claim to a group
pub async fn add_claim(ctx: &Context, group: &VolumeGroup, member: &Member) -> Result<VolumeGroup> {
    let key = member.key();
    if group.has_member(&key) {
        return Ok(group.clone());
    }
    let store = ctx.store.as_ref();
    let (content, secrets) = backend_target(ctx, group).await?;
    let volume = volume_snapshot(&member.volume);
    let pv_name = volume.name_any();

    // Tentative volume list; discarded if the backend refuses it
    let mut tentative = content.member_volumes().to_vec();
    tentative.retain(|v| v.name_any() != pv_name);
    tentative.push(volume.clone());

    if let Err(e) = ctx
        .modify_membership(content_handle(&content)?, &sorted_volume_ids(&tentative), &secrets)
        .await
    {
        membership_failed(ctx, group, &e).await?;
        return Err(e);
    }

    let claim = member_snapshot(&member.claim);
    let group = mutate(store, group, WriteTarget::Status, |g| {
        if g.has_member(&key) {
            return false;
        }
        let mut claims = g.member_claims().to_vec();
        claims.push(claim.clone());
        g.update_member_claims(claims);
        true
    })
    .await?;
    mutate(store, &content, WriteTarget::Status, |c| {
        if c.member_volume_names().contains(&pv_name) {
            return false;
        }
        let mut volumes = c.member_volumes().to_vec();
        volumes.push(volume.clone());
        c.update_member_volumes(volumes);
        true
    })
    .await?;
    ensure_finalizer(store, &member.claim, CLAIM_FINALIZER).await?;

    info!("Added claim {} to VolumeGroup {}", key, ObjectKey::of(&group));
    ctx.emit(
        group.object_ref(&()),
        EventType::Normal,
        reason::MEMBERSHIP_UPDATED,
        format!("Added claim {}", key),
    )
    .await;
    Ok(group)
}

/// Remove one claim from a group
pub async fn remove_claim(ctx: &Context, group: &VolumeGroup, key: &ObjectKey) -> Result<VolumeGroup> {
    let Some(recorded) = group
        .member_claims()
        .iter()
        .find(|c| &ObjectKey::of(*c) == key)
    else {
        return Ok(group.clone());
    };
    let store = ctx.store.as_ref();
    let group_key = ObjectKey::of(group);
    let (content, secrets) = backend_target(ctx, group).await?;

    let pv_name = volume_name(recorded).map(String::from);
    let belongs = |v: &PersistentVolume| {
        pv_name.as_deref() == Some(v.name_any().as_str()) || bound_claim(v).as_ref() == Some(key)
    };
    let tentative: Vec<PersistentVolume> = content
        .member_volumes()
        .iter()
        .filter(|v| !belongs(*v))
        .cloned()
        .collect();

    if let Err(e) = ctx
        .modify_membership(content_handle(&content)?, &sorted_volume_ids(&tentative), &secrets)
        .await
    {
        membership_failed(ctx, group, &e).await?;
        return Err(e);
    }

    let group = mutate(store, group, WriteTarget::Status, |g| {
        if !g.has_member(key) {
            return false;
        }
        let claims = g
            .member_claims()
            .iter()
            .filter(|c| &ObjectKey::of(*c) != key)
            .cloned()
            .collect();
        g.update_member_claims(claims);
        true
    })
    .await?;
    mutate(store, &content, WriteTarget::Status, |c| {
        if !c.member_volumes().iter().any(|v| belongs(v)) {
            return false;
        }
        let volumes = c
            .member_volumes()
            .iter()
            .filter(|v| !belongs(*v))
            .cloned()
            .collect();
        c.update_member_volumes(volumes);
        true
    })
    .await?;
    release_claim_if_unheld(ctx, key, &group_key).await?;

    info!("Removed claim {} from VolumeGroup {}", key, group_key);
    ctx.emit(
        group.object_ref(&()),
        EventType::Normal,
        reason::MEMBERSHIP_UPDATED,
        format!("Removed claim {}", key),
    )
    .await;
    Ok(group)
}
