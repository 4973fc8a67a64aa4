//! Shared naming and labeling for migration-created resources
//!
//! Names derived from (cluster, datacenter, rack, ordinal) must be unique and
//! deterministic: re-running a migration step targets the same objects, and
//! cass-operator later computes the same names when it adopts the pods.

use std::collections::BTreeMap;

/// Label keys used by cass-operator to recognize its datacenter pods.
pub const CLUSTER_LABEL: &str = "cassandra.datastax.com/cluster";
pub const DATACENTER_LABEL: &str = "cassandra.datastax.com/datacenter";
pub const RACK_LABEL: &str = "cassandra.datastax.com/rack";
pub const SEED_NODE_LABEL: &str = "cassandra.datastax.com/seed-node";
pub const NODE_STATE_LABEL: &str = "cassandra.datastax.com/node-state";

/// Container names inside the synthesized pod.
pub const CASSANDRA_CONTAINER: &str = "cassandra";
pub const SERVER_CONFIG_INIT_CONTAINER: &str = "server-config-init";
pub const SYSTEM_LOGGER_CONTAINER: &str = "server-system-logger";

/// Mount name of the primary data volume.
pub const SERVER_DATA: &str = "server-data";

/// Storage class shared by the migration volumes and the final datacenter.
pub const STORAGE_CLASS: &str = "local-path";
pub const STORAGE_PROVISIONER: &str = "rancher.io/local-path";

/// Sanitize a user-provided name (cluster names may contain spaces or upper
/// case) into a DNS-1123 compatible form, the same way cass-operator does.
pub fn cleanup_for_kubernetes(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.trim_matches('-').to_string()
}

/// Identity of one migrated node; the source of every derived resource name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub cluster: String,
    pub datacenter: String,
    pub rack: String,
    pub ordinal: i32,
}

impl NodeIdentity {
    /// StatefulSet-style pod name: `<cluster>-<dc>-<rack>-sts-<ordinal>`.
    pub fn pod_name(&self) -> String {
        format!(
            "{}-{}-{}-sts-{}",
            cleanup_for_kubernetes(&self.cluster),
            self.datacenter,
            self.rack,
            self.ordinal
        )
    }

    pub fn pvc_name(&self, mount_name: &str) -> String {
        format!("{}-{}", mount_name, self.pod_name())
    }

    pub fn pv_name(&self, mount_name: &str) -> String {
        format!("pvc-{}", self.pvc_name(mount_name))
    }

    pub fn all_pods_service_name(&self) -> String {
        format!(
            "{}-{}-all-pods-service",
            cleanup_for_kubernetes(&self.cluster),
            self.datacenter
        )
    }

    pub fn pod_labels(&self, is_seed: bool) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "statefulset.kubernetes.io/pod-name".to_string(),
                self.pod_name(),
            ),
            (SEED_NODE_LABEL.to_string(), is_seed.to_string()),
            (RACK_LABEL.to_string(), self.rack.clone()),
            (
                CLUSTER_LABEL.to_string(),
                cleanup_for_kubernetes(&self.cluster),
            ),
            (DATACENTER_LABEL.to_string(), self.datacenter.clone()),
        ])
    }
}

pub fn seed_service_name(cluster: &str) -> String {
    format!("{}-seed-service", cleanup_for_kubernetes(cluster))
}

pub fn additional_seed_service_name(cluster: &str, datacenter: &str) -> String {
    format!(
        "{}-{}-additional-seed-service",
        cleanup_for_kubernetes(cluster),
        datacenter
    )
}

/// Topology snapshot ConfigMap: `<cleaned-dc>-migrate-config`.
pub fn topology_config_map_name(datacenter: &str) -> String {
    format!("{}-migrate-config", cleanup_for_kubernetes(datacenter))
}

/// Configuration bundle ConfigMap: `<dc>-cass-config`.
pub fn config_bundle_name(datacenter: &str) -> String {
    format!("{datacenter}-cass-config")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> NodeIdentity {
        NodeIdentity {
            cluster: "Test Cluster".to_string(),
            datacenter: "dc1".to_string(),
            rack: "rack1".to_string(),
            ordinal: 2,
        }
    }

    #[test]
    fn test_cleanup_for_kubernetes() {
        assert_eq!(cleanup_for_kubernetes("Test Cluster"), "test-cluster");
        assert_eq!(cleanup_for_kubernetes("dc1"), "dc1");
        assert_eq!(cleanup_for_kubernetes("_Weird_Name_"), "weird-name");
    }

    #[test]
    fn test_deterministic_names() {
        let id = identity();
        assert_eq!(id.pod_name(), "test-cluster-dc1-rack1-sts-2");
        assert_eq!(
            id.pvc_name("server-data"),
            "server-data-test-cluster-dc1-rack1-sts-2"
        );
        assert_eq!(
            id.pv_name("server-data"),
            "pvc-server-data-test-cluster-dc1-rack1-sts-2"
        );
        assert_eq!(id.all_pods_service_name(), "test-cluster-dc1-all-pods-service");
        // Re-deriving from the same identity yields the same names
        assert_eq!(id.pod_name(), identity().pod_name());
    }

    #[test]
    fn test_service_names() {
        assert_eq!(seed_service_name("Test Cluster"), "test-cluster-seed-service");
        assert_eq!(
            additional_seed_service_name("Test Cluster", "dc1"),
            "test-cluster-dc1-additional-seed-service"
        );
        assert_eq!(topology_config_map_name("DC One"), "dc-one-migrate-config");
        assert_eq!(config_bundle_name("dc1"), "dc1-cass-config");
    }

    #[test]
    fn test_pod_labels() {
        let labels = identity().pod_labels(true);
        assert_eq!(
            labels.get(CLUSTER_LABEL).map(String::as_str),
            Some("test-cluster")
        );
        assert_eq!(labels.get(SEED_NODE_LABEL).map(String::as_str), Some("true"));
        assert_eq!(
            labels.get("statefulset.kubernetes.io/pod-name").map(String::as_str),
            Some("test-cluster-dc1-rack1-sts-2")
        );
    }
}
