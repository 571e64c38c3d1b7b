//! Controller wiring
//!
//! Runs the three reconcilers as kube-rs controllers over cluster-wide
//! watches until the shutdown token fires. Primary watches are filtered so
//! a reconciler's own status and finalizer writes do not wake it again.

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::runtime::controller::{Action, Controller, Error as ControllerError};
use kube::runtime::reflector::{self, ObjectRef};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, CustomResourceExt, Resource, ResourceExt};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::Context;
use super::{claim, volume_group, volume_group_content};
use crate::crd::{VolumeGroup, VolumeGroupClass, VolumeGroupContent};
use crate::domain::accessors::{storage_class_name, volume_name, ContentAccessor};
use crate::error::{Error, Result};

/// Give up waiting for the CRDs after this long
const CRD_WAIT_LIMIT: Duration = Duration::from_secs(300);

fn crd_names() -> [String; 3] {
    [
        VolumeGroupClass::crd_name().to_string(),
        VolumeGroup::crd_name().to_string(),
        VolumeGroupContent::crd_name().to_string(),
    ]
}

/// Block until the API server serves every operator CRD
pub async fn wait_for_crds(client: &Client) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let api = &api;
    let policy = backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_max_interval(Duration::from_secs(30))
        .with_max_elapsed_time(Some(CRD_WAIT_LIMIT))
        .build();

    backoff::future::retry(policy, move || async move {
        for name in crd_names() {
            match api.get_opt(&name).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    info!("Waiting for CRD {}", name);
                    return Err(backoff::Error::transient(Error::NotFound {
                        kind: "CustomResourceDefinition".into(),
                        name,
                    }));
                }
                Err(e) => {
                    warn!("Failed to look up CRD {}: {}", name, e);
                    return Err(backoff::Error::transient(Error::Kube(e)));
                }
            }
        }
        Ok(())
    })
    .await?;

    info!("All VolumeGroup CRDs are served");
    Ok(())
}

/// VolumeGroups to revisit when a claim in their namespace changes
pub fn groups_for_claim(
    groups: &[Arc<VolumeGroup>],
    claim: &PersistentVolumeClaim,
) -> Vec<ObjectRef<VolumeGroup>> {
    let Some(namespace) = claim.namespace() else {
        return Vec::new();
    };
    groups
        .iter()
        .filter(|g| g.namespace().as_deref() == Some(namespace.as_str()))
        .map(|g| ObjectRef::from_obj(g.as_ref()))
        .collect()
}

/// The VolumeGroup a content points back to through `spec.groupRef`
pub fn group_for_content(content: &VolumeGroupContent) -> Option<ObjectRef<VolumeGroup>> {
    let reference = content.group_ref()?;
    let name = reference.name.as_deref()?;
    let namespace = reference.namespace.clone().or_else(|| content.namespace())?;
    Some(ObjectRef::new(name).within(&namespace))
}

// =============================================================================
// Event Filters
// =============================================================================

/// Hash of what a group or content reconcile reacts to: the spec generation,
/// deletion and the finalizer list. Status writes leave it unchanged.
pub fn spec_fingerprint<K: Resource>(obj: &K) -> Option<u64> {
    let meta = obj.meta();
    let mut hasher = DefaultHasher::new();
    meta.generation.hash(&mut hasher);
    meta.deletion_timestamp.is_some().hash(&mut hasher);
    meta.finalizers.hash(&mut hasher);
    Some(hasher.finish())
}

/// Hash of the claim fields membership depends on.
///
/// Finalizer writes made while joining or leaving a group are left out.
pub fn claim_fingerprint(claim: &PersistentVolumeClaim) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    claim.metadata.labels.hash(&mut hasher);
    claim.metadata.deletion_timestamp.is_some().hash(&mut hasher);
    storage_class_name(claim).hash(&mut hasher);
    volume_name(claim).hash(&mut hasher);
    claim
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .hash(&mut hasher);
    Some(hasher.finish())
}

fn claim_events(
    api: Api<PersistentVolumeClaim>,
    watch_config: WatcherConfig,
) -> impl Stream<Item = std::result::Result<PersistentVolumeClaim, watcher::Error>> + Send + 'static {
    watcher::watcher(api, watch_config)
        .default_backoff()
        .applied_objects()
        .predicate_filter(claim_fingerprint)
}

type ControllerResult<K> =
    std::result::Result<(ObjectRef<K>, Action), ControllerError<Error, watcher::Error>>;

fn log_result<K: Resource>(controller: &str, result: ControllerResult<K>) {
    match result {
        Ok((obj, _)) => debug!("{} reconciled {}", controller, obj.name),
        Err(ControllerError::ReconcilerFailed(err, obj)) if err.is_not_found() => {
            debug!("{} object {} no longer exists", controller, obj.name);
        }
        Err(e) => error!("{} reconcile error: {}", controller, e),
    }
}

/// Run the VolumeGroup, VolumeGroupContent and claim controllers until shutdown
pub async fn run_controllers(client: Client, ctx: Arc<Context>, shutdown: CancellationToken) {
    let watch_config = WatcherConfig::default().any_semantic();
    let groups: Api<VolumeGroup> = Api::all(client.clone());
    let contents: Api<VolumeGroupContent> = Api::all(client.clone());
    let claims: Api<PersistentVolumeClaim> = Api::all(client.clone());

    info!(
        "Starting controllers for driver {}",
        ctx.config.driver_name
    );

    let (group_reader, group_writer) = reflector::store();
    let group_events = watcher::watcher(groups, watch_config.clone())
        .default_backoff()
        .reflect(group_writer)
        .applied_objects()
        .predicate_filter(spec_fingerprint::<VolumeGroup>);
    let known_groups = group_reader.clone();
    let group_controller = Controller::for_stream(group_events, group_reader)
        .watches_stream(claim_events(claims.clone(), watch_config.clone()), move |claim| {
            groups_for_claim(&known_groups.state(), &claim)
        })
        // Content readiness lives in its status, so this watch is unfiltered
        .watches(contents.clone(), watch_config.clone(), |content| {
            group_for_content(&content)
        })
        .graceful_shutdown_on(shutdown.clone().cancelled_owned())
        .run(volume_group::reconcile, volume_group::error_policy, ctx.clone())
        .for_each(|result| async move { log_result("volumegroup", result) });

    let (content_reader, content_writer) = reflector::store();
    let content_events = watcher::watcher(contents, watch_config.clone())
        .default_backoff()
        .reflect(content_writer)
        .applied_objects()
        .predicate_filter(spec_fingerprint::<VolumeGroupContent>);
    let content_controller = Controller::for_stream(content_events, content_reader)
        .graceful_shutdown_on(shutdown.clone().cancelled_owned())
        .run(
            volume_group_content::reconcile,
            volume_group_content::error_policy,
            ctx.clone(),
        )
        .for_each(|result| async move { log_result("volumegroupcontent", result) });

    let (claim_reader, claim_writer) = reflector::store();
    let claim_stream = watcher::watcher(claims, watch_config)
        .default_backoff()
        .reflect(claim_writer)
        .applied_objects()
        .predicate_filter(claim_fingerprint);
    let claim_controller = Controller::for_stream(claim_stream, claim_reader)
        .graceful_shutdown_on(shutdown.clone().cancelled_owned())
        .run(claim::reconcile, claim::error_policy, ctx)
        .for_each(|result| async move { log_result("persistentvolumeclaim", result) });

    tokio::join!(group_controller, content_controller, claim_controller);
    info!("Controllers stopped");
}
