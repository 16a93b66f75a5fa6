//! Controller module for secondary-network Service endpoints
//!
//! This module contains the informer caches, the Service reconciler that
//! rewrites Endpoints, and the recovery of NetworkAttachmentDefinitions
//! deleted while pods still use them.

pub mod backoff;
pub mod cache;
pub mod client;
mod context;
mod endpoints;
mod handlers;
pub mod metrics;
mod reconciler;
mod recovery;
pub mod selections;

pub use client::{ClusterApi, KubeClusterApi};
pub use backoff::{calculate_backoff, RetryBackoff};
pub use context::{Context, ControllerConfig, ServiceTriggers};
pub use endpoints::{find_port, owner_reference, pod_subset, repack_subsets};
pub use handlers::{
    EndpointsHandler, NetworkAttachmentDefinitionHandler, PodHandler, ServiceHandler,
};
pub use reconciler::{
    error_policy, reconcile, run_controller, sync, ControllerState, REASON_UPDATE_ABORTED,
    REASON_UPDATE_SUCCESSFUL,
};
pub use recovery::{recover_network_attachment_definition, RecoveryOutcome};
pub use selections::parse_network_selections;
