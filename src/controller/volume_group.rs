//! VolumeGroup reconciler
//!
//! Binds a group to its content (creating it for selector-based groups),
//! waits for the content to become ready and then keeps the membership in
//! sync. Deletion removes the bound content when the policy says so.

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use super::context::Context;
use super::membership::{release_claim_if_unheld, sync_group};
use super::reason;
use super::status::{
    ensure_finalizer, has_finalizer, has_other_finalizers, mutate, release_finalizer, WriteTarget,
};
use crate::crd::{
    DeletionPolicy, VolumeGroup, VolumeGroupClass, VolumeGroupContent, VolumeGroupContentSpec,
    VOLUME_GROUP_FINALIZER,
};
use crate::domain::accessors::{
    content_name_of, derived_content_name, group_reference, is_deleting, ContentAccessor,
    GroupAccessor, ObjectKey, StatusAccessor,
};
use crate::domain::parameters::{secret_reference, validate_prefixed_parameters};
use crate::domain::ports::EventType;
use crate::error::{Error, Result};

pub const CONTROLLER: &str = "volumegroup";

/// How often a group waiting on its content is requeued
pub const CONTENT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[instrument(skip(group, ctx), fields(name = %group.name_any(), namespace = %group.namespace().unwrap_or_default()))]
pub async fn reconcile(group: Arc<VolumeGroup>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let key = ObjectKey::of(group.as_ref());
    let result = reconcile_group(&ctx, &key).await;
    ctx.finish(CONTROLLER, &key, started, result.is_ok());
    result
}

pub fn error_policy(group: Arc<VolumeGroup>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = ObjectKey::of(group.as_ref());
    warn!("VolumeGroup {} reconcile error: {}", key, err);
    ctx.error_action(CONTROLLER, &key, err)
}

async fn reconcile_group(ctx: &Context, key: &ObjectKey) -> Result<Action> {
    let Some(group) = ctx.store.get_group(&key.namespace, &key.name).await? else {
        debug!("VolumeGroup {} is gone", key);
        return Ok(Action::await_change());
    };

    let class = ctx.class_for(group.class_name()).await;
    let owner = match &class {
        Ok(class) => Some(class.driver().to_string()),
        Err(_) => bound_content_driver(ctx, &group).await?,
    };
    match owner {
        Some(driver) if !ctx.owns_driver(&driver) => {
            debug!("VolumeGroup {} belongs to driver {}", key, driver);
            return Ok(Action::await_change());
        }
        Some(_) => {}
        None => {
            return match class {
                Ok(_) => Ok(Action::await_change()),
                Err(e) => ctx.fail(&group, e).await,
            };
        }
    }

    if is_deleting(&group.metadata) {
        return match finalize(ctx, &group, class.ok().as_ref()).await {
            Ok(action) => Ok(action),
            Err(e) => ctx.fail(&group, e).await,
        };
    }

    let class = match class.and_then(|c| {
        validate_prefixed_parameters(c.parameters())?;
        Ok(c)
    }) {
        Ok(class) => class,
        Err(e) => return ctx.fail(&group, e).await,
    };

    match converge(ctx, &group, &class).await {
        Ok(action) => Ok(action),
        Err(e) => ctx.fail(&group, e).await,
    }
}

/// Driver recorded on the group's content, used when the class is gone
async fn bound_content_driver(ctx: &Context, group: &VolumeGroup) -> Result<Option<String>> {
    let Ok(name) = content_name_of(group) else {
        return Ok(None);
    };
    let namespace = group.namespace().unwrap_or_default();
    Ok(ctx
        .store
        .get_content(&namespace, &name)
        .await?
        .and_then(|c| c.driver().map(String::from)))
}

async fn converge(ctx: &Context, group: &VolumeGroup, class: &VolumeGroupClass) -> Result<Action> {
    let store = ctx.store.as_ref();
    let key = ObjectKey::of(group);
    let secrets = ctx.secrets_for(class.parameters()).await?;
    let group = ensure_finalizer(store, group, VOLUME_GROUP_FINALIZER).await?;

    let content = match group.source_content_name() {
        Some(name) => match bind_static_content(ctx, &group, class, name).await? {
            Some(content) => content,
            None => {
                info!("VolumeGroup {} waiting for VolumeGroupContent {}", key, name);
                return Ok(Action::requeue(CONTENT_POLL_INTERVAL));
            }
        },
        None => ensure_dynamic_content(ctx, &group, class).await?,
    };

    if !content.is_ready() {
        debug!(
            "VolumeGroupContent {} of VolumeGroup {} is not ready yet",
            content.name_any(),
            key
        );
        return Ok(Action::requeue(CONTENT_POLL_INTERVAL));
    }

    let was_ready = group.is_ready();
    let content_name = content.name_any();
    let created = content.group_creation_timestamp();
    let group = mutate(store, &group, WriteTarget::Status, |g| {
        let mut changed = false;
        if g.bound_content_name() != Some(content_name.as_str()) {
            g.update_bound_content_name(&content_name);
            changed = true;
        }
        if !g.is_ready() {
            g.update_ready(true);
            changed = true;
        }
        if let Some(at) = created {
            if g.group_creation_timestamp() != Some(at) {
                g.update_group_creation_timestamp(at);
                changed = true;
            }
        }
        changed
    })
    .await?;

    let group = sync_group(ctx, &group, &content, &secrets).await?;

    if !was_ready {
        info!("VolumeGroup {} is ready", key);
        ctx.emit(
            group.object_ref(&()),
            EventType::Normal,
            reason::VOLUME_GROUP_READY,
            format!("Bound to VolumeGroupContent {}", content_name),
        )
        .await;
    }
    Ok(Action::requeue(ctx.config.resync_interval))
}

/// Bind a statically provisioned group to the named content.
///
/// Returns `None` while the content does not exist yet.
async fn bind_static_content(
    ctx: &Context,
    group: &VolumeGroup,
    class: &VolumeGroupClass,
    name: &str,
) -> Result<Option<VolumeGroupContent>> {
    let key = ObjectKey::of(group);
    let Some(content) = ctx.store.get_content(&key.namespace, name).await? else {
        return Ok(None);
    };

    if let Some(bound) = content.group_ref() {
        let other = bound.name.as_deref() != Some(key.name.as_str())
            || bound.namespace.as_deref().map_or(false, |ns| ns != key.namespace);
        if other {
            return Err(Error::Configuration(format!(
                "VolumeGroupContent {} is bound to another VolumeGroup {}",
                name,
                bound.name.as_deref().unwrap_or_default()
            )));
        }
    }

    let reference = group_reference(group);
    let class_name = class.name_any();
    let secret_ref = secret_reference(class.parameters());
    let policy = content
        .deletion_policy()
        .unwrap_or_else(|| class.deletion_policy());

    let content = mutate(ctx.store.as_ref(), &content, WriteTarget::Object, |c| {
        let mut changed = false;
        if ContentAccessor::class_name(c) != Some(class_name.as_str()) {
            c.spec.class_name = Some(class_name.clone());
            changed = true;
        }
        if c.group_ref() != Some(&reference) {
            c.spec.group_ref = Some(reference.clone());
            changed = true;
        }
        if c.secret_ref().is_none() && secret_ref.is_some() {
            c.spec.secret_ref = secret_ref.clone();
            changed = true;
        }
        if c.deletion_policy() != Some(policy) {
            c.update_deletion_policy(policy);
            changed = true;
        }
        changed
    })
    .await?;
    Ok(Some(content))
}

/// Get or create the content of a selector-based group
async fn ensure_dynamic_content(
    ctx: &Context,
    group: &VolumeGroup,
    class: &VolumeGroupClass,
) -> Result<VolumeGroupContent> {
    let key = ObjectKey::of(group);
    let name = derived_content_name(group)?;
    if let Some(content) = ctx.store.get_content(&key.namespace, &name).await? {
        return Ok(content);
    }

    let mut content = VolumeGroupContent::new(
        &name,
        VolumeGroupContentSpec {
            class_name: Some(class.name_any()),
            group_ref: Some(group_reference(group)),
            secret_ref: secret_reference(class.parameters()),
            deletion_policy: Some(class.deletion_policy()),
            source: None,
        },
    );
    content.metadata.namespace = Some(key.namespace.clone());

    match ctx.store.create_content(&content).await {
        Ok(created) => {
            info!("Created VolumeGroupContent {} for VolumeGroup {}", name, key);
            Ok(created)
        }
        Err(e) if e.is_already_exists() => ctx
            .store
            .get_content(&key.namespace, &name)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: VolumeGroupContent::kind(&()).to_string(),
                name: ObjectKey::new(key.namespace.as_str(), name.as_str()).to_string(),
            }),
        Err(e) => Err(e),
    }
}

/// Release claims, delete the content if its policy says so, then drop the finalizer
async fn finalize(
    ctx: &Context,
    group: &VolumeGroup,
    class: Option<&VolumeGroupClass>,
) -> Result<Action> {
    let store = ctx.store.as_ref();
    let key = ObjectKey::of(group);
    if !has_finalizer(&group.metadata, VOLUME_GROUP_FINALIZER) {
        return Ok(Action::await_change());
    }
    if has_other_finalizers(&group.metadata, VOLUME_GROUP_FINALIZER) {
        debug!("VolumeGroup {} waits for other finalizers", key);
        return Ok(Action::await_change());
    }

    for member in group.member_keys() {
        release_claim_if_unheld(ctx, &member, &key).await?;
    }

    let content_name = content_name_of(group)?;
    if let Some(content) = store.get_content(&key.namespace, &content_name).await? {
        let policy = content
            .deletion_policy()
            .or_else(|| class.map(VolumeGroupClass::deletion_policy))
            .unwrap_or_default();
        if policy == DeletionPolicy::Delete && !is_deleting(&content.metadata) {
            info!(
                "Deleting VolumeGroupContent {} of VolumeGroup {}",
                content_name, key
            );
            store.delete_content(&key.namespace, &content_name).await?;
        }
    }

    release_finalizer(store, group, VOLUME_GROUP_FINALIZER).await?;
    info!("VolumeGroup {} finalized", key);
    Ok(Action::await_change())
}
