//! Endpoint subset construction
//!
//! Builds one subset per pod from its reported secondary network addresses,
//! resolves the Service's ports against the pod's containers, and repacks
//! the per-pod subsets into the canonical Endpoints form.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, ObjectReference, Pod, Service, ServicePort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::debug;

use crate::crd::{NetworkSelectionElement, NetworkStatus};

const DEFAULT_PROTOCOL: &str = "TCP";

/// Build the subset contributed by a single pod.
///
/// `statuses` is the pod's decoded network-status annotation. Addresses come
/// from every status entry of a selected network; ports are the Service
/// ports that resolve on this pod.
pub fn pod_subset(
    pod: &Pod,
    statuses: &[NetworkStatus],
    networks: &[NetworkSelectionElement],
    service_ports: &[ServicePort],
) -> EndpointSubset {
    let addresses: Vec<EndpointAddress> = statuses
        .iter()
        .filter(|status| networks.iter().any(|network| status.is_for(network)))
        .flat_map(|status| {
            debug!(
                "Pod {}/{}: network {} on interface {} has addresses {:?}",
                pod.namespace().unwrap_or_default(),
                pod.name_any(),
                status.name,
                status.interface,
                status.ips
            );
            status.ips.iter().map(|ip| endpoint_address(pod, ip))
        })
        .collect();

    let ports: Vec<EndpointPort> = service_ports
        .iter()
        .filter_map(|svc_port| match find_port(pod, svc_port) {
            Some(port) => Some(EndpointPort {
                name: svc_port.name.clone(),
                port,
                protocol: svc_port.protocol.clone(),
                app_protocol: svc_port.app_protocol.clone(),
            }),
            None => {
                debug!(
                    "Could not find port {:?} on pod {}/{}, skipping",
                    svc_port.target_port,
                    pod.namespace().unwrap_or_default(),
                    pod.name_any()
                );
                None
            }
        })
        .collect();

    EndpointSubset {
        addresses: Some(addresses),
        ports: Some(ports),
        not_ready_addresses: None,
    }
}

fn endpoint_address(pod: &Pod, ip: &str) -> EndpointAddress {
    EndpointAddress {
        ip: ip.to_string(),
        hostname: None,
        node_name: pod.spec.as_ref().and_then(|spec| spec.node_name.clone()),
        target_ref: Some(ObjectReference {
            kind: Some("Pod".to_string()),
            name: Some(pod.name_any()),
            namespace: pod.namespace(),
            resource_version: pod.resource_version(),
            uid: pod.uid(),
            ..Default::default()
        }),
    }
}

/// Resolve a Service port to a container port number on `pod`.
///
/// Numeric target ports (and an unset target port, which defaults to the
/// Service port) resolve directly. Named target ports must match a container
/// port with the same name and protocol.
pub fn find_port(pod: &Pod, svc_port: &ServicePort) -> Option<i32> {
    match &svc_port.target_port {
        None => Some(svc_port.port),
        Some(IntOrString::Int(port)) => Some(*port),
        Some(IntOrString::String(name)) => {
            if let Ok(port) = name.parse::<i32>() {
                return Some(port);
            }
            let protocol = svc_port.protocol.as_deref().unwrap_or(DEFAULT_PROTOCOL);
            pod.spec
                .as_ref()?
                .containers
                .iter()
                .flat_map(|c| c.ports.iter().flatten())
                .find(|p| {
                    p.name.as_deref() == Some(name.as_str())
                        && p.protocol.as_deref().unwrap_or(DEFAULT_PROTOCOL) == protocol
                })
                .map(|p| p.container_port)
        }
    }
}

/// Controller reference making the Service own its Endpoints
pub fn owner_reference(svc: &Service) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "Service".to_string(),
        name: svc.name_any(),
        uid: svc.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

type PortKey = (Option<String>, i32, Option<String>, Option<String>);
type AddressKey = (String, Option<String>);

fn port_key(port: &EndpointPort) -> PortKey {
    (
        port.name.clone(),
        port.port,
        port.protocol.clone(),
        port.app_protocol.clone(),
    )
}

fn address_key(address: &EndpointAddress) -> AddressKey {
    (
        address.ip.clone(),
        address.target_ref.as_ref().and_then(|r| r.uid.clone()),
    )
}

/// Merge subsets into the canonical minimal form.
///
/// Addresses are grouped by the exact set of ports they serve, so subsets
/// with identical port sets collapse into one while differing port sets stay
/// apart. Subsets without addresses disappear. Addresses, ports and subsets
/// are sorted, which makes the result independent of input order and
/// repacking an already repacked list a no-op.
pub fn repack_subsets(subsets: &[EndpointSubset]) -> Vec<EndpointSubset> {
    let mut addresses: BTreeMap<AddressKey, EndpointAddress> = BTreeMap::new();
    let mut address_ports: BTreeMap<AddressKey, BTreeSet<PortKey>> = BTreeMap::new();
    let mut ports: BTreeMap<PortKey, EndpointPort> = BTreeMap::new();

    for subset in subsets {
        let subset_ports = subset.ports.as_deref().unwrap_or_default();
        for address in subset.addresses.iter().flatten() {
            let key = address_key(address);
            addresses.entry(key.clone()).or_insert_with(|| address.clone());
            let served = address_ports.entry(key).or_default();
            for port in subset_ports {
                served.insert(port_key(port));
                ports.entry(port_key(port)).or_insert_with(|| port.clone());
            }
        }
    }

    let mut groups: BTreeMap<BTreeSet<PortKey>, Vec<EndpointAddress>> = BTreeMap::new();
    for (key, served) in address_ports {
        if let Some(address) = addresses.remove(&key) {
            groups.entry(served).or_default().push(address);
        }
    }

    groups
        .into_iter()
        .map(|(port_keys, group)| EndpointSubset {
            addresses: Some(group),
            not_ready_addresses: None,
            ports: if port_keys.is_empty() {
                None
            } else {
                Some(
                    port_keys
                        .iter()
                        .filter_map(|key| ports.get(key).cloned())
                        .collect(),
                )
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec};
    use kube::api::ObjectMeta;

    use super::*;

    fn pod(name: &str, container_ports: &[(&str, i32, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("{}-uid", name)),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-a".to_string()),
                containers: vec![Container {
                    name: "app".to_string(),
                    ports: Some(
                        container_ports
                            .iter()
                            .map(|(name, port, protocol)| ContainerPort {
                                name: Some(name.to_string()),
                                container_port: *port,
                                protocol: Some(protocol.to_string()),
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn svc_port(name: &str, port: i32, target: Option<IntOrString>) -> ServicePort {
        ServicePort {
            name: Some(name.to_string()),
            port,
            protocol: Some("TCP".to_string()),
            target_port: target,
            ..Default::default()
        }
    }

    fn selection(name: &str) -> NetworkSelectionElement {
        NetworkSelectionElement {
            namespace: "default".to_string(),
            name: name.to_string(),
            interface_request: String::new(),
        }
    }

    fn status(name: &str, ips: &[&str]) -> NetworkStatus {
        NetworkStatus {
            name: name.to_string(),
            interface: "net1".to_string(),
            ips: ips.iter().map(|ip| ip.to_string()).collect(),
            ..Default::default()
        }
    }

    fn subset(ips: &[(&str, &str)], ports: &[(&str, i32)]) -> EndpointSubset {
        EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|(ip, uid)| EndpointAddress {
                        ip: ip.to_string(),
                        target_ref: Some(ObjectReference {
                            uid: Some(uid.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(
                ports
                    .iter()
                    .map(|(name, port)| EndpointPort {
                        name: Some(name.to_string()),
                        port: *port,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            not_ready_addresses: None,
        }
    }

    fn ips(subset: &EndpointSubset) -> Vec<&str> {
        subset
            .addresses
            .iter()
            .flatten()
            .map(|a| a.ip.as_str())
            .collect()
    }

    #[test]
    fn find_port_resolves_numbers_and_names() {
        let p = pod("web-1", &[("http", 8080, "TCP"), ("dns", 53, "UDP")]);
        assert_eq!(find_port(&p, &svc_port("a", 80, None)), Some(80));
        assert_eq!(
            find_port(&p, &svc_port("b", 80, Some(IntOrString::Int(9090)))),
            Some(9090)
        );
        assert_eq!(
            find_port(&p, &svc_port("c", 80, Some(IntOrString::String("http".into())))),
            Some(8080)
        );
        // Name matches but protocol differs.
        assert_eq!(
            find_port(&p, &svc_port("d", 53, Some(IntOrString::String("dns".into())))),
            None
        );
        assert_eq!(
            find_port(&p, &svc_port("e", 80, Some(IntOrString::String("metrics".into())))),
            None
        );
    }

    #[test]
    fn pod_subset_uses_only_selected_network() {
        let p = pod("web-1", &[("http", 8080, "TCP")]);
        let statuses = vec![
            status("cbr0", &["10.244.0.5"]),
            status("macvlan", &["192.168.1.10", "192.168.1.11"]),
        ];
        let ports = vec![
            svc_port("http", 80, Some(IntOrString::String("http".into()))),
            svc_port("metrics", 9100, Some(IntOrString::String("metrics".into()))),
        ];

        let subset = pod_subset(&p, &statuses, &[selection("macvlan")], &ports);
        assert_eq!(ips(&subset), vec!["192.168.1.10", "192.168.1.11"]);

        let address = &subset.addresses.as_ref().unwrap()[0];
        assert_eq!(address.node_name.as_deref(), Some("node-a"));
        let target = address.target_ref.as_ref().unwrap();
        assert_eq!(target.kind.as_deref(), Some("Pod"));
        assert_eq!(target.name.as_deref(), Some("web-1"));
        assert_eq!(target.namespace.as_deref(), Some("default"));
        assert_eq!(target.resource_version.as_deref(), Some("7"));
        assert_eq!(target.uid.as_deref(), Some("web-1-uid"));

        let ports = subset.ports.unwrap();
        assert_eq!(ports.len(), 1, "unresolvable port is omitted");
        assert_eq!(ports[0].port, 8080);
        assert_eq!(ports[0].name.as_deref(), Some("http"));
    }

    #[test]
    fn pod_without_selected_network_yields_empty_addresses() {
        let p = pod("web-1", &[]);
        let subset = pod_subset(&p, &[status("cbr0", &["10.0.0.1"])], &[selection("macvlan")], &[]);
        assert!(subset.addresses.unwrap().is_empty());
    }

    #[test]
    fn repack_merges_identical_port_sets() {
        let repacked = repack_subsets(&[
            subset(&[("10.0.0.2", "b")], &[("http", 80)]),
            subset(&[("10.0.0.1", "a")], &[("http", 80)]),
        ]);
        assert_eq!(repacked.len(), 1);
        assert_eq!(ips(&repacked[0]), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn repack_keeps_different_port_sets_apart() {
        let repacked = repack_subsets(&[
            subset(&[("10.0.0.1", "a")], &[("http", 80)]),
            subset(&[("10.0.0.2", "b")], &[("http", 80), ("https", 443)]),
        ]);
        assert_eq!(repacked.len(), 2);
        let mut groups: Vec<_> = repacked.iter().map(ips).collect();
        groups.sort();
        assert_eq!(groups, vec![vec!["10.0.0.1"], vec!["10.0.0.2"]]);
    }

    #[test]
    fn repack_drops_empty_subsets() {
        let repacked = repack_subsets(&[
            subset(&[], &[("http", 80)]),
            subset(&[("10.0.0.1", "a")], &[]),
        ]);
        assert_eq!(repacked.len(), 1);
        assert_eq!(ips(&repacked[0]), vec!["10.0.0.1"]);
        assert_eq!(repacked[0].ports, None);
        assert!(repack_subsets(&[]).is_empty());
    }

    #[test]
    fn repack_is_idempotent_and_order_independent() {
        let input = vec![
            subset(&[("10.0.0.3", "c")], &[("https", 443), ("http", 80)]),
            subset(&[("10.0.0.1", "a")], &[("http", 80)]),
            subset(&[("10.0.0.2", "b")], &[("http", 80), ("https", 443)]),
        ];
        let once = repack_subsets(&input);
        let twice = repack_subsets(&once);
        assert_eq!(once, twice);

        let mut reversed = input.clone();
        reversed.reverse();
        assert_eq!(repack_subsets(&reversed), once);
    }

    #[test]
    fn owner_reference_points_at_service() {
        let svc = Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                uid: Some("svc-uid".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let owner = owner_reference(&svc);
        assert_eq!(owner.kind, "Service");
        assert_eq!(owner.api_version, "v1");
        assert_eq!(owner.name, "web");
        assert_eq!(owner.uid, "svc-uid");
        assert_eq!(owner.controller, Some(true));
    }
}
