//! Seed discovery services
//!
//! Two headless services replace the host-specific seed lists: a selector
//! service matching seed-labeled pods, and a selectorless one whose Endpoints
//! we manage by hand so nodes not yet migrated stay reachable as seeds.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointSubset, Endpoints, Service, ServiceSpec,
};
use kube::core::ObjectMeta;

use crate::resources::common::{CLUSTER_LABEL, SEED_NODE_LABEL, cleanup_for_kubernetes};

/// Headless ClusterIP service publishing not-ready addresses, the shape
/// cass-operator uses for every discovery service.
pub fn headless_service(name: &str, namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The label-selected seed service: routes to every pod carrying the
/// seed-node label of this cluster.
pub fn seed_service(name: &str, namespace: &str, cluster: &str) -> Service {
    let mut svc = headless_service(name, namespace);
    let selector = BTreeMap::from([
        (CLUSTER_LABEL.to_string(), cleanup_for_kubernetes(cluster)),
        (SEED_NODE_LABEL.to_string(), "true".to_string()),
    ]);
    if let Some(spec) = svc.spec.as_mut() {
        spec.selector = Some(selector);
    }
    svc
}

/// Endpoints of the additional-seed service, listing the given seed
/// addresses. Entries that are not valid IP addresses are skipped; loopback
/// was already filtered during seed extraction.
pub fn additional_seed_endpoints(name: &str, namespace: &str, seeds: &[String]) -> Endpoints {
    let addresses: Vec<EndpointAddress> = seeds
        .iter()
        .filter(|seed| seed.parse::<IpAddr>().is_ok())
        .map(|seed| EndpointAddress {
            ip: seed.clone(),
            ..Default::default()
        })
        .collect();

    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(addresses),
            ..Default::default()
        }]),
    }
}
