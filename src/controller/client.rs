//! Live Kubernetes API surface used by the controller
//!
//! Reads go through the reflector caches; only writes and the deletion
//! recovery recheck reach the API server. Keeping those calls behind a trait
//! lets tests count and inspect them without a cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Event, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::NetworkAttachmentDefinition;
use crate::error::{Error, Result};

/// Component name reported as the source of emitted events
pub const CONTROLLER_NAME: &str = "k8s-net-attach-def-controller";

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

/// Trait abstracting the live API calls made by the controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Replace an Endpoints object; the object's resource version guards
    /// against lost updates.
    async fn update_endpoints(&self, endpoints: &Endpoints) -> Result<Endpoints>;

    /// Read a NetworkAttachmentDefinition straight from the API server,
    /// bypassing the cache. `Ok(None)` means it does not exist.
    async fn get_network_attachment_definition(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkAttachmentDefinition>>;

    /// Create a NetworkAttachmentDefinition
    async fn create_network_attachment_definition(
        &self,
        nad: &NetworkAttachmentDefinition,
    ) -> Result<NetworkAttachmentDefinition>;

    /// Record a Kubernetes Event against `object`
    async fn publish_event(
        &self,
        object: &ObjectReference,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn update_endpoints(&self, endpoints: &Endpoints) -> Result<Endpoints> {
        let namespace = endpoints
            .namespace()
            .unwrap_or_else(|| "default".to_string());
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &namespace);
        let updated = api
            .replace(&endpoints.name_any(), &PostParams::default(), endpoints)
            .await?;
        Ok(updated)
    }

    async fn get_network_attachment_definition(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkAttachmentDefinition>> {
        let api: Api<NetworkAttachmentDefinition> =
            Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(nad) => Ok(Some(nad)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn create_network_attachment_definition(
        &self,
        nad: &NetworkAttachmentDefinition,
    ) -> Result<NetworkAttachmentDefinition> {
        let namespace = nad.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<NetworkAttachmentDefinition> =
            Api::namespaced(self.client.clone(), &namespace);
        let created = api.create(&PostParams::default(), nad).await?;
        Ok(created)
    }

    async fn publish_event(
        &self,
        object: &ObjectReference,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let namespace = object
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        let name = object.name.clone().unwrap_or_default();

        let time = Time(chrono::Utc::now());
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", name)),
                namespace: Some(namespace),
                ..Default::default()
            },
            type_: Some(event_type.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: object.clone(),
            source: Some(k8s_openapi::api::core::v1::EventSource {
                component: Some(CONTROLLER_NAME.to_string()),
                host: None,
            }),
            reporting_component: Some(CONTROLLER_NAME.to_string()),
            first_timestamp: Some(time.clone()),
            last_timestamp: Some(time),
            count: Some(1),
            ..Default::default()
        };

        events.create(&PostParams::default(), &event).await?;
        debug!("Recorded {} event {:?} on {}", event_type, reason, name);
        Ok(())
    }
}
