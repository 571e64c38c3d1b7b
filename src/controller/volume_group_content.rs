//! VolumeGroupContent reconciler
//!
//! Creates the backend group for a content, or adopts a pre-provisioned
//! handle, and marks the content ready. On deletion it waits for the owning
//! VolumeGroup to disappear, cascades to member claims and deletes the
//! backend group when the policy is `Delete`.

use chrono::Utc;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::context::Context;
use super::reason;
use super::status::{
    ensure_finalizer, has_finalizer, has_other_finalizers, mutate, release_finalizer, WriteTarget,
};
use crate::crd::{
    DeletionPolicy, VolumeGroupClass, VolumeGroupContent, CLAIM_FINALIZER,
    VOLUME_GROUP_CONTENT_FINALIZER,
};
use crate::domain::accessors::{
    bound_claim, is_deleting, volume_name, ContentAccessor, ObjectKey, StatusAccessor,
};
use crate::domain::parameters::{
    filter_prefixed_parameters, secret_reference, validate_prefixed_parameters,
};
use crate::domain::ports::{EventType, Secrets};
use crate::error::{Error, Result};

pub const CONTROLLER: &str = "volumegroupcontent";

#[instrument(skip(content, ctx), fields(name = %content.name_any(), namespace = %content.namespace().unwrap_or_default()))]
pub async fn reconcile(content: Arc<VolumeGroupContent>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let key = ObjectKey::of(content.as_ref());
    let result = reconcile_content(&ctx, &key).await;
    ctx.finish(CONTROLLER, &key, started, result.is_ok());
    result
}

pub fn error_policy(content: Arc<VolumeGroupContent>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = ObjectKey::of(content.as_ref());
    warn!("VolumeGroupContent {} reconcile error: {}", key, err);
    ctx.error_action(CONTROLLER, &key, err)
}

async fn reconcile_content(ctx: &Context, key: &ObjectKey) -> Result<Action> {
    let Some(content) = ctx.store.get_content(&key.namespace, &key.name).await? else {
        debug!("VolumeGroupContent {} is gone", key);
        return Ok(Action::await_change());
    };

    let Some(class_name) = ContentAccessor::class_name(&content).map(String::from) else {
        return settle_unmanaged(ctx, &content).await;
    };

    // Without its class, only a recorded source driver proves ownership
    let class = ctx.class_for(Some(&class_name)).await;
    let owner = match &class {
        Ok(class) => Some(class.driver()),
        Err(_) => content.driver(),
    };
    match owner {
        Some(driver) if !ctx.owns_driver(driver) => {
            debug!("VolumeGroupContent {} belongs to driver {}", key, driver);
            return Ok(Action::await_change());
        }
        Some(_) => {}
        None => {
            return match class {
                Ok(_) => Ok(Action::await_change()),
                Err(e) => ctx.fail(&content, e).await,
            };
        }
    }

    let outcome = if is_deleting(&content.metadata) {
        finalize(ctx, &content, class.ok().as_ref()).await
    } else {
        match class.and_then(|c| {
            validate_prefixed_parameters(c.parameters())?;
            Ok(c)
        }) {
            Ok(class) => converge(ctx, &content, &class).await,
            Err(e) => Err(e),
        }
    };

    match outcome {
        Ok(action) => Ok(action),
        Err(e) => ctx.fail(&content, e).await,
    }
}

/// A content without class is not managed by any driver: not ready, retained
async fn settle_unmanaged(ctx: &Context, content: &VolumeGroupContent) -> Result<Action> {
    let store = ctx.store.as_ref();
    let content = mutate(store, content, WriteTarget::Object, |c| {
        if c.deletion_policy().is_some() {
            return false;
        }
        c.update_deletion_policy(DeletionPolicy::Retain);
        true
    })
    .await?;
    mutate(store, &content, WriteTarget::Status, |c| {
        if c.status.as_ref().and_then(|s| s.ready) == Some(false) {
            return false;
        }
        c.update_ready(false);
        true
    })
    .await?;
    Ok(Action::await_change())
}

async fn converge(
    ctx: &Context,
    content: &VolumeGroupContent,
    class: &VolumeGroupClass,
) -> Result<Action> {
    let store = ctx.store.as_ref();
    let key = ObjectKey::of(content);
    let secrets = ctx.secrets_for(class.parameters()).await?;
    let content = ensure_finalizer(store, content, VOLUME_GROUP_CONTENT_FINALIZER).await?;
    let secret_ref = secret_reference(class.parameters());
    let policy = class.deletion_policy();

    if content.handle().is_some() {
        // Pre-provisioned, or created by an earlier pass
        let content = mutate(store, &content, WriteTarget::Object, |c| {
            let mut changed = false;
            if c.secret_ref().is_none() && secret_ref.is_some() {
                c.spec.secret_ref = secret_ref.clone();
                changed = true;
            }
            if c.deletion_policy().is_none() {
                c.update_deletion_policy(policy);
                changed = true;
            }
            changed
        })
        .await?;
        mark_ready(ctx, &content).await?;
        return Ok(Action::requeue(ctx.config.resync_interval));
    }

    let name = content.name_any();
    let parameters = filter_prefixed_parameters(class.parameters());
    let created = ctx.create_group(&name, &parameters, &secrets).await?;
    let driver = class.driver().to_string();

    let content = mutate(store, &content, WriteTarget::Object, |c| {
        if c.handle() == Some(created.group_id.as_str()) {
            return false;
        }
        c.update_handle(&driver, &created.group_id, created.attributes.clone());
        if c.deletion_policy().is_none() {
            c.update_deletion_policy(policy);
        }
        if c.secret_ref().is_none() {
            c.spec.secret_ref = secret_ref.clone();
        }
        true
    })
    .await?;
    mark_ready(ctx, &content).await?;

    info!(
        "Created backend group {} for VolumeGroupContent {}",
        created.group_id, key
    );
    ctx.emit(
        content.object_ref(&()),
        EventType::Normal,
        reason::CONTENT_CREATED,
        format!("Created backend group {}", created.group_id),
    )
    .await;
    Ok(Action::requeue(ctx.config.resync_interval))
}

async fn mark_ready(ctx: &Context, content: &VolumeGroupContent) -> Result<VolumeGroupContent> {
    mutate(ctx.store.as_ref(), content, WriteTarget::Status, |c| {
        let mut changed = false;
        if !c.is_ready() {
            c.update_ready(true);
            changed = true;
        }
        if c.group_creation_timestamp().is_none() {
            c.update_group_creation_timestamp(Utc::now());
            changed = true;
        }
        if c.error_message().is_some() {
            c.update_error(None);
            changed = true;
        }
        changed
    })
    .await
}

/// Fail while the owning VolumeGroup still exists
async fn ensure_unreferenced(ctx: &Context, content: &VolumeGroupContent) -> Result<()> {
    let Some(group_ref) = content.group_ref() else {
        return Ok(());
    };
    let Some(name) = group_ref.name.as_deref() else {
        return Ok(());
    };
    let namespace = group_ref
        .namespace
        .clone()
        .or_else(|| content.namespace())
        .unwrap_or_default();

    if let Some(group) = ctx.store.get_group(&namespace, name).await? {
        let same = group_ref.uid.is_none() || group.metadata.uid == group_ref.uid;
        if same {
            return Err(Error::StillReferenced {
                content: ObjectKey::of(content).to_string(),
                group: ObjectKey::of(&group).to_string(),
            });
        }
    }
    Ok(())
}

/// Claim bound to a member volume, looked up by claimRef or volumeName
async fn claim_of_volume(
    ctx: &Context,
    content: &VolumeGroupContent,
    volume: &PersistentVolume,
) -> Result<Option<ObjectKey>> {
    if let Some(mut key) = bound_claim(volume) {
        if key.namespace.is_empty() {
            key.namespace = content.namespace().unwrap_or_default();
        }
        return Ok(Some(key));
    }
    let pv_name = volume.name_any();
    let namespace = content.namespace().unwrap_or_default();
    Ok(ctx
        .store
        .list_claims(&namespace)
        .await?
        .iter()
        .find(|c| volume_name(c) == Some(pv_name.as_str()))
        .map(ObjectKey::of))
}

/// Delete every claim still recorded as a member
async fn delete_member_claims(ctx: &Context, content: &VolumeGroupContent) -> Result<()> {
    let store = ctx.store.as_ref();
    for volume in content.member_volumes() {
        let Some(key) = claim_of_volume(ctx, content, volume).await? else {
            continue;
        };
        let Some(claim) = store.get_claim(&key.namespace, &key.name).await? else {
            continue;
        };
        if has_finalizer(&claim.metadata, CLAIM_FINALIZER) {
            release_finalizer(store, &claim, CLAIM_FINALIZER).await?;
        }
        info!(
            "Deleting claim {} of VolumeGroupContent {}",
            key,
            ObjectKey::of(content)
        );
        store.delete_claim(&key.namespace, &key.name).await?;
    }
    Ok(())
}

async fn finalize(
    ctx: &Context,
    content: &VolumeGroupContent,
    class: Option<&VolumeGroupClass>,
) -> Result<Action> {
    ensure_unreferenced(ctx, content).await?;

    let key = ObjectKey::of(content);
    if !has_finalizer(&content.metadata, VOLUME_GROUP_CONTENT_FINALIZER) {
        return Ok(Action::await_change());
    }
    if has_other_finalizers(&content.metadata, VOLUME_GROUP_CONTENT_FINALIZER) {
        debug!("VolumeGroupContent {} waits for other finalizers", key);
        return Ok(Action::await_change());
    }

    if !ctx.config.disable_claim_deletion {
        delete_member_claims(ctx, content).await?;
    }

    let policy = content
        .deletion_policy()
        .or_else(|| class.map(VolumeGroupClass::deletion_policy))
        .unwrap_or_default();
    if policy == DeletionPolicy::Delete {
        if let Some(handle) = content.handle() {
            let secrets = match class {
                Some(class) => ctx.secrets_for(class.parameters()).await?,
                None => Secrets::new(),
            };
            ctx.delete_group(handle, &secrets).await?;
            info!("Deleted backend group {} of VolumeGroupContent {}", handle, key);
        }
    }

    release_finalizer(ctx.store.as_ref(), content, VOLUME_GROUP_CONTENT_FINALIZER).await?;
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{Fixture, CLASS, DRIVER, NAMESPACE};
    use crate::crd::{VolumeGroupContentSource, VolumeGroupContentSpec};
    use crate::domain::ports::{BackendOperation, ClusterStore, GroupBackend};
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    async fn stored_content(fx: &Fixture, name: &str, spec: VolumeGroupContentSpec) -> VolumeGroupContent {
        let mut content = VolumeGroupContent::new(name, spec);
        content.metadata.namespace = Some(NAMESPACE.into());
        fx.store.create_content(&content).await.unwrap()
    }

    async fn run(fx: &Fixture, name: &str) -> Result<Action> {
        let content = fx
            .store
            .get_content(NAMESPACE, name)
            .await
            .unwrap()
            .unwrap();
        reconcile(Arc::new(content), fx.ctx.clone()).await
    }

    async fn state(fx: &Fixture, name: &str) -> Option<VolumeGroupContent> {
        fx.store.get_content(NAMESPACE, name).await.unwrap()
    }

    fn managed_spec() -> VolumeGroupContentSpec {
        VolumeGroupContentSpec {
            class_name: Some(CLASS.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unmanaged_content_is_retained() {
        let fx = Fixture::new();
        stored_content(&fx, "thin", VolumeGroupContentSpec::default()).await;

        assert_eq!(run(&fx, "thin").await.unwrap(), Action::await_change());
        let content = state(&fx, "thin").await.unwrap();
        assert_eq!(content.deletion_policy(), Some(DeletionPolicy::Retain));
        assert_eq!(content.status.and_then(|s| s.ready), Some(false));
        assert_eq!(fx.backend.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_dynamic_content_creates_backend_group() {
        let fx = Fixture::new();
        stored_content(&fx, "volumegroup-1", managed_spec()).await;

        run(&fx, "volumegroup-1").await.unwrap();
        let content = state(&fx, "volumegroup-1").await.unwrap();
        assert!(content.is_ready());
        assert!(content.group_creation_timestamp().is_some());
        assert_eq!(content.driver(), Some(DRIVER));
        assert_eq!(content.deletion_policy(), Some(DeletionPolicy::Delete));
        assert!(has_finalizer(&content.metadata, VOLUME_GROUP_CONTENT_FINALIZER));

        let group = fx.backend.group(content.handle().unwrap()).unwrap();
        assert_eq!(group.name, "volumegroup-1");
        assert!(fx
            .store
            .events()
            .iter()
            .any(|e| e.reason == reason::CONTENT_CREATED));

        // A second pass neither writes nor calls the backend
        let writes = fx.store.write_count();
        run(&fx, "volumegroup-1").await.unwrap();
        assert_eq!(fx.store.write_count(), writes);
        assert_eq!(fx.backend.calls().create, 1);
    }

    #[tokio::test]
    async fn test_backend_failure_is_recorded() {
        let fx = Fixture::new();
        stored_content(&fx, "volumegroup-1", managed_spec()).await;
        fx.backend.fail_next(BackendOperation::CreateGroup, 1);

        assert_matches!(run(&fx, "volumegroup-1").await, Err(Error::Backend { .. }));
        let content = state(&fx, "volumegroup-1").await.unwrap();
        assert!(!content.is_ready());
        assert!(content.error_message().is_some());

        run(&fx, "volumegroup-1").await.unwrap();
        let content = state(&fx, "volumegroup-1").await.unwrap();
        assert!(content.is_ready());
        assert!(content.error_message().is_none());
    }

    #[tokio::test]
    async fn test_prefixed_parameters_are_filtered_and_secrets_passed() {
        let fx = Fixture::new();
        fx.class(
            "secured",
            DRIVER,
            &[
                ("pool", "fast"),
                ("volumegroup.storage.openshift.io/secret-name", "creds"),
                ("volumegroup.storage.openshift.io/secret-namespace", NAMESPACE),
            ],
        );
        let mut secret = k8s_openapi::api::core::v1::Secret {
            string_data: Some(BTreeMap::from([("token".to_string(), "t0k".to_string())])),
            ..Default::default()
        };
        secret.metadata.name = Some("creds".into());
        secret.metadata.namespace = Some(NAMESPACE.into());
        fx.store.create_secret(&secret).unwrap();
        stored_content(
            &fx,
            "volumegroup-1",
            VolumeGroupContentSpec {
                class_name: Some("secured".into()),
                ..Default::default()
            },
        )
        .await;

        run(&fx, "volumegroup-1").await.unwrap();
        let content = state(&fx, "volumegroup-1").await.unwrap();
        let group = fx.backend.group(content.handle().unwrap()).unwrap();
        assert_eq!(
            group.parameters,
            BTreeMap::from([("pool".to_string(), "fast".to_string())])
        );
        assert_eq!(fx.backend.last_secrets().get("token").map(String::as_str), Some("t0k"));
        assert_eq!(
            content.secret_ref().and_then(|r| r.name.as_deref()),
            Some("creds")
        );
    }

    #[tokio::test]
    async fn test_pre_provisioned_handle_skips_backend() {
        let fx = Fixture::new();
        stored_content(
            &fx,
            "static",
            VolumeGroupContentSpec {
                class_name: Some(CLASS.into()),
                source: Some(VolumeGroupContentSource {
                    driver: DRIVER.into(),
                    group_handle: "existing-1".into(),
                    attributes: BTreeMap::new(),
                }),
                ..Default::default()
            },
        )
        .await;

        run(&fx, "static").await.unwrap();
        let content = state(&fx, "static").await.unwrap();
        assert!(content.is_ready());
        assert_eq!(content.handle(), Some("existing-1"));
        assert_eq!(fx.backend.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_deletion_waits_for_owning_group() {
        let fx = Fixture::new();
        let group = fx.ready_group("vg", &[("app", "db")]).await;
        let content = fx.content_of(&group).await;
        ensure_finalizer(fx.store.as_ref(), &content, VOLUME_GROUP_CONTENT_FINALIZER)
            .await
            .unwrap();
        fx.store
            .delete_content(NAMESPACE, &content.name_any())
            .await
            .unwrap();

        assert_matches!(
            run(&fx, &content.name_any()).await,
            Err(Error::StillReferenced { .. })
        );
        assert_eq!(fx.backend.calls().delete, 0);
        assert!(state(&fx, &content.name_any()).await.is_some());
    }

    #[tokio::test]
    async fn test_deletion_cascades_claims_and_backend_group() {
        let fx = Fixture::new();
        fx.claim("a", &[("app", "db")], "fast");
        let group = fx.ready_group("vg", &[("app", "db")]).await;
        let group = crate::controller::membership::sync_group(
            &fx.ctx,
            &group,
            &fx.content_of(&group).await,
            &Secrets::new(),
        )
        .await
        .unwrap();
        let content = fx.content_of(&group).await;
        let handle = content.handle().unwrap().to_string();
        ensure_finalizer(fx.store.as_ref(), &content, VOLUME_GROUP_CONTENT_FINALIZER)
            .await
            .unwrap();

        // Remove the group without its finalizer, then delete the content
        let mut gone = fx.group_state("vg").await;
        gone.metadata.finalizers = None;
        fx.store.update_group(&gone).await.unwrap();
        fx.store.delete_group(NAMESPACE, "vg");
        fx.store
            .delete_content(NAMESPACE, &content.name_any())
            .await
            .unwrap();

        run(&fx, &content.name_any()).await.unwrap();
        assert!(state(&fx, &content.name_any()).await.is_none());
        assert!(fx.backend.group(&handle).is_none());
        assert!(fx.store.claim_keys().is_empty());
    }

    #[tokio::test]
    async fn test_deletion_keeps_claims_when_disabled() {
        let mut config = crate::config::OperatorConfig::new(DRIVER);
        config.disable_claim_deletion = true;
        let fx = Fixture::with_config(config);
        fx.claim("a", &[("app", "db")], "fast");
        let group = fx.ready_group("vg", &[("app", "db")]).await;
        let content = fx.content_of(&group).await;
        crate::controller::membership::sync_group(&fx.ctx, &group, &content, &Secrets::new())
            .await
            .unwrap();
        let content = fx.content_of(&group).await;
        ensure_finalizer(fx.store.as_ref(), &content, VOLUME_GROUP_CONTENT_FINALIZER)
            .await
            .unwrap();
        fx.store.delete_group(NAMESPACE, "vg");
        fx.store
            .delete_content(NAMESPACE, &content.name_any())
            .await
            .unwrap();

        run(&fx, &content.name_any()).await.unwrap();
        assert_eq!(fx.store.claim_keys().len(), 1);
    }

    /// A deleted content whose class is gone, holding claim `a` and a backend group
    async fn classless_content(fx: &Fixture, driver: &str) -> String {
        fx.claim("a", &[("app", "db")], "fast");
        let handle = fx
            .backend
            .create_group("orphan", &BTreeMap::new(), &Secrets::new())
            .await
            .unwrap()
            .group_id;
        let mut content = stored_content(
            fx,
            "orphan",
            VolumeGroupContentSpec {
                class_name: Some("vanished".into()),
                deletion_policy: Some(DeletionPolicy::Delete),
                source: Some(VolumeGroupContentSource {
                    driver: driver.into(),
                    group_handle: handle.clone(),
                    attributes: BTreeMap::new(),
                }),
                ..Default::default()
            },
        )
        .await;
        let volume = fx.store.get_volume("pv-a").await.unwrap().unwrap();
        content.update_member_volumes(vec![volume]);
        let content = fx.store.update_content_status(&content).await.unwrap();
        ensure_finalizer(fx.store.as_ref(), &content, VOLUME_GROUP_CONTENT_FINALIZER)
            .await
            .unwrap();
        fx.store.delete_content(NAMESPACE, "orphan").await.unwrap();
        handle
    }

    #[tokio::test]
    async fn test_deleted_foreign_content_without_class_is_left_alone() {
        let fx = Fixture::new();
        let handle = classless_content(&fx, "other.driver").await;

        assert_eq!(run(&fx, "orphan").await.unwrap(), Action::await_change());
        assert!(state(&fx, "orphan").await.is_some());
        assert_eq!(fx.store.claim_keys().len(), 1);
        assert!(fx.backend.group(&handle).is_some());
        assert_eq!(fx.backend.calls().delete, 0);
    }

    #[tokio::test]
    async fn test_deleted_content_without_class_finalizes_by_source_driver() {
        let fx = Fixture::new();
        let handle = classless_content(&fx, DRIVER).await;

        assert_eq!(run(&fx, "orphan").await.unwrap(), Action::await_change());
        assert!(state(&fx, "orphan").await.is_none());
        assert!(fx.store.claim_keys().is_empty());
        assert!(fx.backend.group(&handle).is_none());
    }

    #[tokio::test]
    async fn test_content_of_unknown_owner_is_kept() {
        let fx = Fixture::new();
        let content = stored_content(
            &fx,
            "orphan",
            VolumeGroupContentSpec {
                class_name: Some("vanished".into()),
                ..Default::default()
            },
        )
        .await;
        ensure_finalizer(fx.store.as_ref(), &content, VOLUME_GROUP_CONTENT_FINALIZER)
            .await
            .unwrap();
        fx.store.delete_content(NAMESPACE, "orphan").await.unwrap();

        assert_matches!(run(&fx, "orphan").await, Err(Error::Configuration(_)));
        let content = state(&fx, "orphan").await.unwrap();
        assert!(has_finalizer(&content.metadata, VOLUME_GROUP_CONTENT_FINALIZER));
        assert!(content.error_message().unwrap().contains("vanished"));
    }
}
