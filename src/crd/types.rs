//! Annotation payload types
//!
//! These are never persisted by the controller; they are decoded from pod and
//! service annotations on every use.

use serde::{Deserialize, Serialize};

/// Annotation requesting secondary networks (Pods and Services)
pub const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

/// Annotation reporting attached networks, written by the CNI layer (Pods only)
pub const NETWORKS_STATUS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks-status";

/// One requested secondary network attachment.
///
/// After parsing, `namespace` is always non-empty.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct NetworkSelectionElement {
    /// Name of the referenced NetworkAttachmentDefinition
    #[serde(default)]
    pub name: String,

    /// Namespace of the referenced NetworkAttachmentDefinition
    #[serde(default)]
    pub namespace: String,

    /// Requested interface name inside the pod
    #[serde(default, rename = "interface", skip_serializing_if = "String::is_empty")]
    pub interface_request: String,
}

impl NetworkSelectionElement {
    /// Whether this element references the NetworkAttachmentDefinition `namespace/name`
    pub fn references(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }
}

impl std::fmt::Display for NetworkSelectionElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)?;
        if !self.interface_request.is_empty() {
            write!(f, "@{}", self.interface_request)?;
        }
        Ok(())
    }
}

/// Network actually attached to a pod, as reported by the CNI layer
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NetworkStatus {
    pub name: String,

    #[serde(default)]
    pub interface: String,

    #[serde(default)]
    pub ips: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    #[serde(default)]
    pub default: bool,
}

impl NetworkStatus {
    /// Whether this status entry reports the selected network.
    ///
    /// The CNI layer reports either the bare network name or `namespace/name`.
    pub fn is_for(&self, selection: &NetworkSelectionElement) -> bool {
        if self.name == selection.name {
            return true;
        }
        match self.name.split_once('/') {
            Some((namespace, name)) => selection.references(namespace, name),
            None => false,
        }
    }
}

/// Decode a pod's network-status annotation value
pub fn parse_network_status(raw: &str) -> serde_json::Result<Vec<NetworkStatus>> {
    serde_json::from_str(raw)
}
