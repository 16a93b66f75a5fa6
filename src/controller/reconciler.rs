//! Service reconciliation
//!
//! The informers in [`super::cache`] keep the local stores current and turn
//! relevant changes into Service triggers. A [`kube::runtime::Controller`]
//! consumes those triggers, guarantees one in-flight reconcile per Service,
//! and applies the retry policy from [`error_policy`].

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{EndpointSubset, ObjectReference, Service};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::{client::Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{parse_network_status, NETWORKS_ANNOTATION, NETWORKS_STATUS_ANNOTATION};
use crate::error::{Error, Result};

use super::cache::{self, object_key, service_selector, split_key, Cache};
use super::client::{KubeClusterApi, EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING};
use super::context::{Context, ControllerConfig};
use super::endpoints::{owner_reference, pod_subset, repack_subsets};
use super::handlers::{
    EndpointsHandler, NetworkAttachmentDefinitionHandler, PodHandler, ServiceHandler,
};
use super::metrics;
use super::selections::parse_network_selections;

/// Event reason for a successful Endpoints update
pub const REASON_UPDATE_SUCCESSFUL: &str = "Endpoints update successful";

/// Event reason for an aborted Endpoints update
pub const REASON_UPDATE_ABORTED: &str = "Endpoints update aborted";

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub config: ControllerConfig,
    context: std::sync::OnceLock<Arc<Context>>,
}

impl ControllerState {
    pub fn new(client: Client, config: ControllerConfig) -> Self {
        Self {
            client,
            config,
            context: std::sync::OnceLock::new(),
        }
    }

    /// Whether the caches finished their initial sync
    pub fn is_ready(&self) -> bool {
        self.context.get().map(|ctx| ctx.is_synced()).unwrap_or(false)
    }
}

/// Main entry point to start the controller.
///
/// Starts one informer per watched kind, waits for every cache to sync,
/// then reconciles triggered Services until `shutdown` is cancelled. In-flight
/// reconciles are allowed to finish before this returns.
pub async fn run_controller(
    state: Arc<ControllerState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let client = state.client.clone();
    let config = state.config.clone();

    info!("Starting network controller with {} worker(s)", config.workers);

    let (cache, writers) = Cache::new();
    let (ctx, triggers) = Context::new(
        Arc::new(KubeClusterApi::new(client.clone())),
        cache.clone(),
        config.clone(),
    );
    let ctx = Arc::new(ctx);
    let _ = state.context.set(ctx.clone());

    let informers = cache::spawn_informers(
        &client,
        &cache,
        writers,
        (
            ServiceHandler::new(ctx.clone()),
            PodHandler::new(ctx.clone()),
            EndpointsHandler::new(ctx.clone()),
            NetworkAttachmentDefinitionHandler::new(ctx.clone()),
        ),
        &shutdown,
    );

    let synced = tokio::select! {
        _ = shutdown.cancelled() => None,
        res = cache.wait_until_synced(config.cache_sync_timeout) => Some(res),
    };
    match synced {
        Some(Ok(())) => {
            ctx.mark_synced();
            info!("Caches synced");
        }
        Some(Err(e)) => {
            error!("Failed waiting for caches to sync: {}", e);
            shutdown.cancel();
            return Err(e);
        }
        None => return Ok(()),
    }

    // The controller's shutdown future must be Sync, which a token waiter is not.
    let (stop_tx, stop_rx) = futures::channel::oneshot::channel::<()>();
    let token = shutdown.clone();
    tokio::spawn(async move {
        token.cancelled().await;
        let _ = stop_tx.send(());
    });

    let concurrency = u16::try_from(config.workers.max(1)).unwrap_or(u16::MAX);

    // Triggers come from the event handlers; the Service store is the one the
    // informers maintain, so the controller opens no watch of its own.
    Controller::for_stream(
        futures::stream::empty::<std::result::Result<Service, watcher::Error>>(),
        cache.services.clone(),
    )
    .reconcile_on(triggers)
    .with_config(controller::Config::default().concurrency(concurrency))
    .graceful_shutdown_on(async move {
        let _ = stop_rx.await;
    })
    .run(reconcile, error_policy, ctx)
    .for_each(|res| async move {
        match res {
            Ok((svc, _)) => debug!("Reconciled {}", svc),
            Err(controller::Error::ObjectNotFound(svc)) => {
                debug!("Service {} no longer exists, dropping trigger", svc)
            }
            Err(controller::Error::ReconcilerFailed(_, svc)) => {
                debug!("Reconcile of {} failed", svc)
            }
            Err(e) => warn!("Controller error: {}", e),
        }
    })
    .await;

    info!("Shutting down network controller");
    shutdown.cancel();
    for informer in informers {
        let _ = informer.await;
    }

    Ok(())
}

/// Reconcile one triggered Service
pub async fn reconcile(svc: Arc<Service>, ctx: Arc<Context>) -> Result<Action> {
    let key = object_key(svc.as_ref());
    sync(&ctx, &key).await?;
    ctx.backoff.forget(&key);
    metrics::record_sync("success");
    Ok(Action::await_change())
}

/// Retry API failures with per-Service exponential backoff until the retry
/// budget is spent; every other failure waits for the next change.
pub fn error_policy(svc: Arc<Service>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(svc.as_ref());

    if error.is_retriable() && ctx.backoff.retries(&key) < ctx.config.max_retries {
        let delay = ctx.backoff.next_delay(&key);
        metrics::record_sync("retry");
        warn!("Sync of {} failed, retrying in {:?}: {}", key, delay, error);
        return Action::requeue(delay);
    }

    ctx.backoff.forget(&key);
    if error.is_not_found() || matches!(error, Error::MissingNetworkAnnotation { .. }) {
        metrics::record_sync("skipped");
        debug!("Sync of {} aborted: {}", key, error);
    } else {
        metrics::record_sync("error");
        warn!("Sync of {} failed: {}", key, error);
    }
    Action::await_change()
}

/// Recompute the secondary-network endpoints of one Service
#[instrument(skip(ctx))]
pub async fn sync(ctx: &Context, key: &str) -> Result<()> {
    let (namespace, name) = split_key(key)?;

    let Some(svc) = ctx.cache.get_service(namespace, name) else {
        debug!("Service {} no longer exists, dropping key", key);
        return Ok(());
    };

    let annotation = svc
        .annotations()
        .get(NETWORKS_ANNOTATION)
        .cloned()
        .unwrap_or_default();
    if annotation.is_empty() {
        return Err(Error::MissingNetworkAnnotation {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }
    debug!("Service network annotation found: {}", annotation);

    // An empty list selects nothing; the Endpoints end up without addresses.
    let networks = parse_network_selections(&annotation, namespace)?;
    if networks.len() > 1 {
        let err = Error::MultipleNetworkSelections {
            namespace: namespace.to_string(),
            name: name.to_string(),
            count: networks.len(),
        };
        warn!("{}", err);
        publish(
            ctx,
            &svc.object_ref(&()),
            EVENT_TYPE_WARNING,
            REASON_UPDATE_ABORTED,
            "multiple network selections in the service spec are not supported",
        )
        .await;
        return Err(err);
    }

    let selector = service_selector(&svc).ok_or_else(|| Error::MissingSelector {
        namespace: namespace.to_string(),
        name: name.to_string(),
    })?;
    let pods = ctx.cache.list_pods(namespace, selector);

    let Some(cached) = ctx.cache.get_endpoints(namespace, name) else {
        return Err(Error::not_found("Endpoints", namespace, name));
    };

    let service_ports = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.clone())
        .unwrap_or_default();

    let mut subsets: Vec<EndpointSubset> = Vec::with_capacity(pods.len());
    for pod in &pods {
        let raw_status = pod
            .annotations()
            .get(NETWORKS_STATUS_ANNOTATION)
            .map(String::as_str)
            .unwrap_or_default();
        let statuses = match parse_network_status(raw_status) {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!(
                    "Error reading networks status of pod {}/{}: {}",
                    namespace,
                    pod.name_any(),
                    e
                );
                continue;
            }
        };
        subsets.push(pod_subset(pod, &statuses, &networks, &service_ports));
    }

    let mut endpoints = (*cached).clone();
    endpoints.metadata.owner_references = Some(vec![owner_reference(&svc)]);
    endpoints.subsets = Some(repack_subsets(&subsets));

    if let Err(e) = ctx.api.update_endpoints(&endpoints).await {
        error!("Error updating endpoints {}: {}", key, e);
        return Err(e);
    }
    info!("Endpoints {} updated successfully", key);

    let message = format!("Updated to use network {}", annotation);
    publish(
        ctx,
        &endpoints.object_ref(&()),
        EVENT_TYPE_NORMAL,
        REASON_UPDATE_SUCCESSFUL,
        &message,
    )
    .await;
    publish(
        ctx,
        &svc.object_ref(&()),
        EVENT_TYPE_NORMAL,
        REASON_UPDATE_SUCCESSFUL,
        &message,
    )
    .await;

    Ok(())
}

/// Helper to emit a Kubernetes Event; failures are only logged
async fn publish(
    ctx: &Context,
    object: &ObjectReference,
    event_type: &str,
    reason: &str,
    message: &str,
) {
    if let Err(e) = ctx.api.publish_event(object, event_type, reason, message).await {
        warn!(
            "Failed to record {} event on {:?}: {}",
            event_type, object.name, e
        );
    }
}
