//! Recovery of NetworkAttachmentDefinitions deleted while still in use
//!
//! Runs inline on the delete notification. Pods are scanned from the cache;
//! on the first pod that still references the deleted object its existence
//! is rechecked against the API server, and if it is really gone the last
//! known copy is created again.

use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use super::context::Context;
use super::metrics;
use super::selections::parse_network_selections;
use crate::crd::{NetworkAttachmentDefinition, NETWORKS_ANNOTATION};

/// What a recovery attempt ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No cached pod references the deleted object
    Unreferenced,
    /// The object exists again on the API server
    AlreadyPresent,
    /// The object was recreated
    Recreated,
    /// The recheck or the create call failed
    Failed,
}

impl RecoveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryOutcome::Unreferenced => "unreferenced",
            RecoveryOutcome::AlreadyPresent => "already_present",
            RecoveryOutcome::Recreated => "recreated",
            RecoveryOutcome::Failed => "failed",
        }
    }
}

/// Recreate `deleted` if a cached pod still selects it
#[instrument(skip(ctx, deleted), fields(name = %deleted.name_any(), namespace = deleted.namespace()))]
pub async fn recover_network_attachment_definition(
    ctx: &Context,
    deleted: &NetworkAttachmentDefinition,
) -> RecoveryOutcome {
    let namespace = deleted.namespace().unwrap_or_default();
    let name = deleted.name_any();
    info!("Handling deletion of net-attach-def {}/{}", namespace, name);

    let user = ctx.cache.list_all_pods().into_iter().find(|pod| {
        let Some(raw) = pod.annotations().get(NETWORKS_ANNOTATION) else {
            return false;
        };
        let pod_namespace = pod.namespace().unwrap_or_default();
        match parse_network_selections(raw, &pod_namespace) {
            Ok(selections) => selections.iter().any(|s| s.references(&namespace, &name)),
            Err(e) => {
                debug!(
                    "Skipping pod {}/{} with unparsable selection: {}",
                    pod_namespace,
                    pod.name_any(),
                    e
                );
                false
            }
        }
    });

    let outcome = match user {
        Some(pod) => {
            info!(
                "Pod {}/{} uses net-attach-def {}/{} which needs to be recreated",
                pod.namespace().unwrap_or_default(),
                pod.name_any(),
                namespace,
                name
            );
            recheck_and_recreate(ctx, deleted, &namespace, &name).await
        }
        None => {
            debug!("net-attach-def {}/{} is not referenced by any pod", namespace, name);
            RecoveryOutcome::Unreferenced
        }
    };

    metrics::record_recovery(outcome.as_str());
    outcome
}

async fn recheck_and_recreate(
    ctx: &Context,
    deleted: &NetworkAttachmentDefinition,
    namespace: &str,
    name: &str,
) -> RecoveryOutcome {
    match ctx.api.get_network_attachment_definition(namespace, name).await {
        Ok(Some(_)) => {
            info!(
                "net-attach-def {}/{} already exists, nothing to recover",
                namespace, name
            );
            RecoveryOutcome::AlreadyPresent
        }
        Ok(None) => {
            let recovered = deleted.recreatable();
            match ctx.api.create_network_attachment_definition(&recovered).await {
                Ok(_) => {
                    info!("net-attach-def {}/{} recovered", namespace, name);
                    RecoveryOutcome::Recreated
                }
                Err(e) => {
                    error!(
                        "Error recreating net-attach-def {}/{}: {}",
                        namespace, name, e
                    );
                    RecoveryOutcome::Failed
                }
            }
        }
        Err(e) => {
            error!(
                "Could not confirm deletion of net-attach-def {}/{}: {}",
                namespace, name, e
            );
            RecoveryOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::controller::cache::{testing, Cache};
    use crate::controller::client::MockClusterApi;
    use crate::controller::context::ControllerConfig;
    use crate::crd::NetworkAttachmentDefinitionSpec;
    use crate::error::Error;

    fn nad(namespace: &str, name: &str) -> NetworkAttachmentDefinition {
        let mut nad = NetworkAttachmentDefinition::new(
            name,
            NetworkAttachmentDefinitionSpec {
                config: Some(r#"{"cniVersion":"0.3.1","type":"macvlan"}"#.to_string()),
            },
        );
        nad.metadata.namespace = Some(namespace.to_string());
        nad.metadata.resource_version = Some("1234".to_string());
        nad.metadata.uid = Some("nad-uid".to_string());
        nad
    }

    fn pod(namespace: &str, name: &str, networks: Option<&str>) -> Pod {
        let annotations = networks.map(|n| {
            let mut a = BTreeMap::new();
            a.insert(NETWORKS_ANNOTATION.to_string(), n.to_string());
            a
        });
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                annotations,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn context(api: MockClusterApi, pods: Vec<Pod>) -> Context {
        let (cache, mut writers) = Cache::new();
        for p in pods {
            testing::apply(&mut writers.pods, p);
        }
        let (ctx, _triggers) = Context::new(Arc::new(api), cache, ControllerConfig::default());
        ctx
    }

    #[tokio::test]
    async fn recreates_referenced_definition_when_absent() {
        let mut api = MockClusterApi::new();
        api.expect_get_network_attachment_definition()
            .withf(|ns, name| ns == "net" && name == "macvlan")
            .times(1)
            .returning(|_, _| Ok(None));
        api.expect_create_network_attachment_definition()
            .withf(|nad| {
                nad.metadata.resource_version.is_none()
                    && nad.name_any() == "macvlan"
                    && nad.namespace().as_deref() == Some("net")
                    && nad.spec.config.as_deref()
                        == Some(r#"{"cniVersion":"0.3.1","type":"macvlan"}"#)
            })
            .times(1)
            .returning(|nad| Ok(nad.clone()));

        let ctx = context(api, vec![pod("apps", "web-1", Some("net/macvlan@net1"))]);
        let outcome = recover_network_attachment_definition(&ctx, &nad("net", "macvlan")).await;
        assert_eq!(outcome, RecoveryOutcome::Recreated);
    }

    #[tokio::test]
    async fn default_namespace_comes_from_the_pod() {
        let mut api = MockClusterApi::new();
        api.expect_get_network_attachment_definition()
            .times(1)
            .returning(|_, _| Ok(None));
        api.expect_create_network_attachment_definition()
            .times(1)
            .returning(|nad| Ok(nad.clone()));

        let ctx = context(api, vec![pod("apps", "web-1", Some("macvlan"))]);
        let outcome = recover_network_attachment_definition(&ctx, &nad("apps", "macvlan")).await;
        assert_eq!(outcome, RecoveryOutcome::Recreated);
    }

    #[tokio::test]
    async fn present_on_recheck_means_no_create() {
        let mut api = MockClusterApi::new();
        api.expect_get_network_attachment_definition()
            .times(1)
            .returning(|ns, name| Ok(Some(nad(ns, name))));
        api.expect_create_network_attachment_definition().times(0);

        let ctx = context(api, vec![pod("net", "web-1", Some("macvlan"))]);
        let outcome = recover_network_attachment_definition(&ctx, &nad("net", "macvlan")).await;
        assert_eq!(outcome, RecoveryOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn unreferenced_definition_is_left_deleted() {
        let mut api = MockClusterApi::new();
        api.expect_get_network_attachment_definition().times(0);
        api.expect_create_network_attachment_definition().times(0);

        let ctx = context(
            api,
            vec![
                pod("net", "no-annotation", None),
                pod("net", "other-net", Some("sriov")),
                pod("other", "same-name-other-ns", Some("macvlan")),
            ],
        );
        let outcome = recover_network_attachment_definition(&ctx, &nad("net", "macvlan")).await;
        assert_eq!(outcome, RecoveryOutcome::Unreferenced);
    }

    #[tokio::test]
    async fn unparsable_pods_are_skipped() {
        let mut api = MockClusterApi::new();
        api.expect_get_network_attachment_definition()
            .times(1)
            .returning(|_, _| Ok(None));
        api.expect_create_network_attachment_definition()
            .times(1)
            .returning(|nad| Ok(nad.clone()));

        let ctx = context(
            api,
            vec![
                pod("net", "broken", Some("a/b/c")),
                pod("net", "user", Some("[{\"name\":\"macvlan\"}]")),
            ],
        );
        let outcome = recover_network_attachment_definition(&ctx, &nad("net", "macvlan")).await;
        assert_eq!(outcome, RecoveryOutcome::Recreated);
    }

    #[tokio::test]
    async fn first_match_wins_across_many_users() {
        let mut api = MockClusterApi::new();
        api.expect_get_network_attachment_definition()
            .times(1)
            .returning(|_, _| Ok(None));
        api.expect_create_network_attachment_definition()
            .times(1)
            .returning(|nad| Ok(nad.clone()));

        let ctx = context(
            api,
            (0..5)
                .map(|i| pod("net", &format!("user-{}", i), Some("macvlan")))
                .collect(),
        );
        let outcome = recover_network_attachment_definition(&ctx, &nad("net", "macvlan")).await;
        assert_eq!(outcome, RecoveryOutcome::Recreated);
    }

    #[tokio::test]
    async fn recheck_failure_does_not_create() {
        let mut api = MockClusterApi::new();
        api.expect_get_network_attachment_definition()
            .times(1)
            .returning(|_, _| Err(Error::ConfigError("connection refused".to_string())));
        api.expect_create_network_attachment_definition().times(0);

        let ctx = context(api, vec![pod("net", "web-1", Some("macvlan"))]);
        let outcome = recover_network_attachment_definition(&ctx, &nad("net", "macvlan")).await;
        assert_eq!(outcome, RecoveryOutcome::Failed);
    }

    #[tokio::test]
    async fn create_failure_is_reported() {
        let mut api = MockClusterApi::new();
        api.expect_get_network_attachment_definition()
            .times(1)
            .returning(|_, _| Ok(None));
        api.expect_create_network_attachment_definition()
            .times(1)
            .returning(|_| Err(Error::ConfigError("forbidden".to_string())));

        let ctx = context(api, vec![pod("net", "web-1", Some("macvlan"))]);
        let outcome = recover_network_attachment_definition(&ctx, &nad("net", "macvlan")).await;
        assert_eq!(outcome, RecoveryOutcome::Failed);
    }
}
