//! Shared controller context
//!
//! Built once at startup and handed to every handler, the reconciler and the
//! error policy. Event handlers turn watch notifications into Service
//! triggers, which the controller runtime consumes after the caches synced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector::ObjectRef;
use tracing::debug;

use super::backoff::RetryBackoff;
use super::cache::Cache;
use super::client::ClusterApi;

/// Runtime settings for the reconciliation engine
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of Services reconciled concurrently
    pub workers: usize,
    /// Retry budget for retriable sync failures
    pub max_retries: u32,
    /// Upper bound on the initial cache sync
    pub cache_sync_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            max_retries: 5,
            cache_sync_timeout: Duration::from_secs(120),
        }
    }
}

/// Stream of Services to reconcile, fed by the event handlers
pub type ServiceTriggers = UnboundedReceiver<ObjectRef<Service>>;

pub struct Context {
    pub api: Arc<dyn ClusterApi>,
    pub cache: Cache,
    pub config: ControllerConfig,
    pub backoff: RetryBackoff,
    triggers: UnboundedSender<ObjectRef<Service>>,
    synced: AtomicBool,
}

impl Context {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        cache: Cache,
        config: ControllerConfig,
    ) -> (Self, ServiceTriggers) {
        let (triggers, rx) = mpsc::unbounded();
        let ctx = Self {
            api,
            cache,
            config,
            backoff: RetryBackoff::default(),
            triggers,
            synced: AtomicBool::new(false),
        };
        (ctx, rx)
    }

    /// Ask the controller to reconcile `service`
    pub fn enqueue(&self, service: ObjectRef<Service>) {
        if let Err(e) = self.triggers.unbounded_send(service) {
            debug!("Controller stopped, dropping trigger for {}", e.into_inner());
        }
    }

    /// Whether every cache has completed its initial list
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub(crate) fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }
}
