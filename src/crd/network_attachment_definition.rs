//! NetworkAttachmentDefinition Custom Resource Definition
//!
//! The schema is owned by the Network Plumbing Working Group. This controller
//! only needs the object's identity, and the full object when it has to be
//! recreated after an accidental deletion.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A named secondary-network configuration template.
///
/// # Example
///
/// ```yaml
/// apiVersion: k8s.cni.cncf.io/v1
/// kind: NetworkAttachmentDefinition
/// metadata:
///   name: macvlan-conf
///   namespace: default
/// spec:
///   config: '{"cniVersion":"0.3.1","type":"macvlan","master":"eth0"}'
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "k8s.cni.cncf.io",
    version = "v1",
    kind = "NetworkAttachmentDefinition",
    plural = "network-attachment-definitions",
    namespaced,
    shortname = "net-attach-def"
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachmentDefinitionSpec {
    /// CNI configuration as a JSON string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

impl NetworkAttachmentDefinition {
    /// Copy of this object suitable for a create call.
    ///
    /// Server-assigned metadata is cleared; name, namespace, labels,
    /// annotations and spec are kept.
    pub fn recreatable(&self) -> Self {
        let mut recovered = self.clone();
        let meta = &mut recovered.metadata;
        meta.resource_version = None;
        meta.uid = None;
        meta.creation_timestamp = None;
        meta.deletion_timestamp = None;
        meta.deletion_grace_period_seconds = None;
        meta.managed_fields = None;
        meta.generation = None;
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use kube::ResourceExt;

    #[test]
    fn recreatable_clears_server_fields() {
        let mut nad = NetworkAttachmentDefinition::new(
            "macvlan-conf",
            NetworkAttachmentDefinitionSpec {
                config: Some(r#"{"type":"macvlan"}"#.to_string()),
            },
        );
        nad.metadata = ObjectMeta {
            name: Some("macvlan-conf".to_string()),
            namespace: Some("net".to_string()),
            resource_version: Some("42".to_string()),
            uid: Some("abc".to_string()),
            generation: Some(3),
            ..Default::default()
        };

        let recovered = nad.recreatable();
        assert_eq!(recovered.resource_version(), None);
        assert_eq!(recovered.uid(), None);
        assert_eq!(recovered.metadata.generation, None);
        assert_eq!(recovered.name_any(), "macvlan-conf");
        assert_eq!(recovered.namespace().as_deref(), Some("net"));
        assert_eq!(recovered.spec, nad.spec);
    }
}
