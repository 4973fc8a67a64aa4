//! Synthesis of the migrated node's pod
//!
//! The pod must be indistinguishable from one cass-operator would have built
//! for this datacenter: same labels, same container trio, same config-builder
//! contract. Get this wrong and the reconciler provisions a duplicate node
//! instead of adopting this one.

use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, HTTPGetAction,
    NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, ObjectFieldSelector,
    PersistentVolumeClaimVolumeSource, Pod, PodAffinityTerm, PodAntiAffinity, PodSecurityContext,
    PodSpec, Probe, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;

use crate::error::{Error, Result};
use crate::resources::common::{
    CASSANDRA_CONTAINER, CLUSTER_LABEL, DATACENTER_LABEL, NodeIdentity, RACK_LABEL,
    SERVER_CONFIG_INIT_CONTAINER, SERVER_DATA, SYSTEM_LOGGER_CONTAINER,
};

const CONFIG_BUILDER_IMAGE: &str = "datastax/cass-config-builder:1.0-ubi8";
const SYSTEM_LOGGER_IMAGE: &str = "k8ssandra/system-logger:v1.22.4";

/// Everything the pod builder needs, resolved by the node migration phases.
#[derive(Debug, Clone)]
pub struct NodePodSpec {
    pub identity: NodeIdentity,
    pub namespace: String,
    pub kube_node: String,
    pub server_type: String,
    pub server_version: String,
    pub is_seed: bool,
    /// Filesystem group id shared by the node's data directories.
    pub fs_group: i64,
    /// Mount names of the bound data volumes (`server-data`, additional dirs).
    pub data_mounts: Vec<String>,
    /// The JSON document handed to the config-builder init container.
    pub config_file_data: String,
}

/// Server image for the migrated node, per server type.
pub fn server_image(server_type: &str, server_version: &str) -> Result<String> {
    match server_type {
        "cassandra" => Ok(format!("k8ssandra/cass-management-api:{server_version}")),
        "dse" => Ok(format!("datastax/dse-mgmtapi-6_8:{server_version}")),
        other => Err(Error::UnsupportedServerType(other.to_string())),
    }
}

pub fn build_pod(params: &NodePodSpec) -> Result<Pod> {
    let pod_name = params.identity.pod_name();

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.clone()),
            namespace: Some(params.namespace.clone()),
            labels: Some(params.identity.pod_labels(params.is_seed)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            host_network: Some(true),
            dns_policy: Some("ClusterFirstWithHostNet".to_string()),
            enable_service_links: Some(true),
            hostname: Some(pod_name),
            subdomain: Some(params.identity.all_pods_service_name()),
            node_name: Some(params.kube_node.clone()),
            affinity: Some(pod_affinity(&params.kube_node)),
            init_containers: Some(vec![config_init_container(params)]),
            containers: vec![cassandra_container(params)?, logger_container()],
            // Mimics the uid/gid of a package-installed Cassandra; fsGroup
            // comes from the actual data directory ownership
            security_context: Some(PodSecurityContext {
                run_as_user: Some(999),
                run_as_group: Some(999),
                fs_group: Some(params.fs_group),
                ..Default::default()
            }),
            volumes: Some(build_volumes(params)),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Pin to the resolved node; refuse to share a host with any other pod of any
/// datacenter (one database process per machine, like the source topology).
fn pod_affinity(kube_node: &str) -> Affinity {
    let exists = |key: &str| LabelSelectorRequirement {
        key: key.to_string(),
        operator: "Exists".to_string(),
        values: None,
    };

    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: "kubernetes.io/hostname".to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![kube_node.to_string()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_expressions: Some(vec![
                        exists(CLUSTER_LABEL),
                        exists(DATACENTER_LABEL),
                        exists(RACK_LABEL),
                    ]),
                    ..Default::default()
                }),
                topology_key: "kubernetes.io/hostname".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn field_ref(field_path: &str) -> EnvVarSource {
    EnvVarSource {
        field_ref: Some(ObjectFieldSelector {
            field_path: field_path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// The config-builder init container. `CONFIG_FILE_DATA` carries the merged
/// model + configuration bundle JSON; its shape is the cass-config-builder
/// input contract.
fn config_init_container(params: &NodePodSpec) -> Container {
    Container {
        name: SERVER_CONFIG_INIT_CONTAINER.to_string(),
        image: Some(CONFIG_BUILDER_IMAGE.to_string()),
        volume_mounts: Some(vec![VolumeMount {
            name: "server-config".to_string(),
            mount_path: "/config".to_string(),
            ..Default::default()
        }]),
        env: Some(vec![
            EnvVar {
                name: "POD_IP".to_string(),
                value_from: Some(field_ref("status.podIP")),
                ..Default::default()
            },
            EnvVar {
                name: "HOST_IP".to_string(),
                value_from: Some(field_ref("status.hostIP")),
                ..Default::default()
            },
            env("USE_HOST_IP_FOR_BROADCAST", "true"),
            env("RACK_NAME", &params.identity.rack),
            env("PRODUCT_VERSION", &params.server_version),
            env("PRODUCT_NAME", &params.server_type),
            env("CONFIG_FILE_DATA", &params.config_file_data),
        ]),
        ..Default::default()
    }
}

fn probe(port: i32, path: &str, initial_delay: i32, period: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            port: IntOrString::Int(port),
            path: Some(path.to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        ..Default::default()
    }
}

fn named_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..Default::default()
    }
}

/// Port names must stay within the 15 character limit.
fn container_ports() -> Vec<ContainerPort> {
    vec![
        named_port("native", 9042),
        named_port("tls-native", 9142),
        named_port("internode", 7000),
        named_port("tls-internode", 7001),
        named_port("jmx", 7199),
        named_port("mgmt-api-http", 8080),
        named_port("prometheus", 9103),
        named_port("thrift", 9160),
    ]
}

fn cassandra_container(params: &NodePodSpec) -> Result<Container> {
    Ok(Container {
        name: CASSANDRA_CONTAINER.to_string(),
        image: Some(server_image(&params.server_type, &params.server_version)?),
        liveness_probe: Some(probe(8080, "/api/v0/probes/liveness", 15, 15)),
        readiness_probe: Some(probe(8080, "/api/v0/probes/readiness", 20, 10)),
        env: Some(vec![
            env("DS_LICENSE", "accept"),
            env("DSE_AUTO_CONF_OFF", "all"),
            env("USE_MGMT_API", "true"),
            // The server must wait for our explicit lifecycle start call
            env("MGMT_API_EXPLICIT_START", "true"),
        ]),
        ports: Some(container_ports()),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "server-config".to_string(),
                mount_path: "/config".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "server-logs".to_string(),
                mount_path: "/var/log/cassandra".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: SERVER_DATA.to_string(),
                mount_path: "/var/lib/cassandra".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    })
}

fn logger_container() -> Container {
    Container {
        name: SYSTEM_LOGGER_CONTAINER.to_string(),
        image: Some(SYSTEM_LOGGER_IMAGE.to_string()),
        volume_mounts: Some(vec![VolumeMount {
            name: "server-logs".to_string(),
            mount_path: "/var/log/cassandra".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// One claim-backed volume per bound data mount plus the transient
/// server-config and server-logs directories.
fn build_volumes(params: &NodePodSpec) -> Vec<Volume> {
    let mut volumes: Vec<Volume> = params
        .data_mounts
        .iter()
        .map(|mount| Volume {
            name: mount.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: params.identity.pvc_name(mount),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    for name in ["server-config", "server-logs"] {
        volumes.push(Volume {
            name: name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
    }

    volumes
}
