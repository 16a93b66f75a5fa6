//! Event filters and dispatch
//!
//! Every watched kind gets a [`ResourceEventHandler`]. Services, Pods and
//! Endpoints are translated into Service triggers for the controller runtime;
//! deletions of NetworkAttachmentDefinitions run the recovery workflow inline.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use tracing::debug;

use super::cache::ResourceEventHandler;
use super::context::Context;
use super::recovery::recover_network_attachment_definition;
use crate::crd::{NetworkAttachmentDefinition, NETWORKS_ANNOTATION, NETWORKS_STATUS_ANNOTATION};

fn annotation<'a, K: Resource>(obj: &'a K, key: &str) -> Option<&'a str> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

pub fn resource_version_changed<K: Resource>(old: &K, new: &K) -> bool {
    old.meta().resource_version != new.meta().resource_version
}

/// Raw string comparison of the network selection annotation
pub fn network_annotation_changed<K: Resource>(old: &K, new: &K) -> bool {
    annotation(old, NETWORKS_ANNOTATION).unwrap_or_default()
        != annotation(new, NETWORKS_ANNOTATION).unwrap_or_default()
}

/// Whether the CNI-reported network status of a pod changed
pub fn network_status_changed(old: &Pod, new: &Pod) -> bool {
    annotation(old, NETWORKS_STATUS_ANNOTATION) != annotation(new, NETWORKS_STATUS_ANNOTATION)
}

pub fn labels_changed(old: &Pod, new: &Pod) -> bool {
    old.labels() != new.labels()
}

/// Whether a pod update can affect secondary endpoints
pub fn pod_network_changed(old: &Pod, new: &Pod) -> bool {
    network_status_changed(old, new)
        || network_annotation_changed(old, new)
        || labels_changed(old, new)
}

pub struct ServiceHandler {
    ctx: Arc<Context>,
}

impl ServiceHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    fn enqueue(&self, svc: &Service) {
        self.ctx.enqueue(ObjectRef::from_obj(svc));
    }
}

#[async_trait]
impl ResourceEventHandler<Service> for ServiceHandler {
    async fn on_add(&self, svc: &Service) {
        self.enqueue(svc);
    }

    async fn on_update(&self, old: &Service, new: &Service) {
        if resource_version_changed(old, new) || network_annotation_changed(old, new) {
            self.enqueue(new);
        }
    }

    async fn on_delete(&self, svc: &Service) {
        self.enqueue(svc);
    }
}

pub struct PodHandler {
    ctx: Arc<Context>,
}

impl PodHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Enqueue every Service selecting `pod`, if the pod requests networks
    fn dispatch(&self, pod: &Pod) {
        if annotation(pod, NETWORKS_ANNOTATION).is_none() {
            debug!(
                "Skipping pod {}/{} event: network annotations missing",
                pod.namespace().unwrap_or_default(),
                pod.name_any()
            );
            return;
        }
        for svc in self.ctx.cache.pod_services(pod) {
            self.ctx.enqueue(ObjectRef::from_obj(svc.as_ref()));
        }
    }
}

#[async_trait]
impl ResourceEventHandler<Pod> for PodHandler {
    async fn on_add(&self, pod: &Pod) {
        self.dispatch(pod);
    }

    async fn on_update(&self, old: &Pod, new: &Pod) {
        if !resource_version_changed(old, new) || !pod_network_changed(old, new) {
            return;
        }
        self.dispatch(new);
        // Services that selected the pod before a relabel must drop it.
        if labels_changed(old, new) {
            self.dispatch(old);
        }
    }

    async fn on_delete(&self, pod: &Pod) {
        self.dispatch(pod);
    }
}

pub struct EndpointsHandler {
    ctx: Arc<Context>,
}

impl EndpointsHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    fn dispatch(&self, endpoints: &Endpoints) {
        let namespace = endpoints.namespace().unwrap_or_default();
        // Service-less endpoints (leader election objects and the like) are dropped.
        if let Some(svc) = self.ctx.cache.get_service(&namespace, &endpoints.name_any()) {
            self.ctx.enqueue(ObjectRef::from_obj(svc.as_ref()));
        }
    }
}

#[async_trait]
impl ResourceEventHandler<Endpoints> for EndpointsHandler {
    async fn on_add(&self, endpoints: &Endpoints) {
        self.dispatch(endpoints);
    }

    async fn on_update(&self, old: &Endpoints, new: &Endpoints) {
        if resource_version_changed(old, new) {
            self.dispatch(new);
        }
    }

    async fn on_delete(&self, endpoints: &Endpoints) {
        self.dispatch(endpoints);
    }
}

pub struct NetworkAttachmentDefinitionHandler {
    ctx: Arc<Context>,
}

impl NetworkAttachmentDefinitionHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ResourceEventHandler<NetworkAttachmentDefinition> for NetworkAttachmentDefinitionHandler {
    async fn on_delete(&self, nad: &NetworkAttachmentDefinition) {
        recover_network_attachment_definition(&self.ctx, nad).await;
    }
}
