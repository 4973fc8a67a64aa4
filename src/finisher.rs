//! Migration commit: hand the migrated pods over to cass-operator
//!
//! Builds and creates the CassandraDatacenter matching the pods the node
//! passes produced, then waits until the operator reports the datacenter
//! ready. From that point on the cluster is fully managed.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, ListParams};
use kube::Client;
use kube::core::ObjectMeta;
use serde_yaml::Value;
use tracing::{info, warn};

use crate::cluster::{ClusterTopology, create_if_absent, topology_from_config_map};
use crate::config::CASSANDRA_YAML_KEY;
use crate::crd::{
    CassandraDatacenter, CassandraDatacenterSpec, ContainerOverride, InsecureAuth,
    ManagementApiAuth, NetworkingSpec, PodSpecOverride, PodTemplateSpecOverride, Rack,
    StorageConfig, VolumeClaimResources, VolumeClaimSpec,
};
use crate::error::{Error, Result};
use crate::resources::common::{
    CASSANDRA_CONTAINER, CLUSTER_LABEL, DATACENTER_LABEL, STORAGE_CLASS, cleanup_for_kubernetes,
    config_bundle_name, topology_config_map_name,
};
use crate::resources::volume::VOLUME_SIZE;
use crate::retry::poll_until;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const POLL_TIMEOUT: Duration = Duration::from_secs(600);

/// Commits the migration by creating the datacenter resource.
pub struct MigrationFinisher {
    client: Client,
    namespace: String,
}

impl MigrationFinisher {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    /// The whole commit pass for `datacenter`.
    pub async fn finish(&self, datacenter: &str) -> Result<()> {
        let topology = self.load_topology(datacenter).await?;
        let size = self.target_size(&topology).await?;
        let config = self.datacenter_config(datacenter).await?;

        let dc = build_datacenter(&self.namespace, &topology, size, config);
        let name = dc.metadata.name.clone().unwrap_or_default();

        let datacenters: Api<CassandraDatacenter> =
            Api::namespaced(self.client.clone(), &self.namespace);
        if create_if_absent(&datacenters, &dc).await? {
            info!(%name, size, "created CassandraDatacenter");
        } else {
            info!(%name, "CassandraDatacenter already exists, waiting for it to become ready");
        }

        let api = datacenters.clone();
        poll_until(POLL_INTERVAL, POLL_TIMEOUT, "datacenter readiness", || {
            let api = api.clone();
            let name = name.clone();
            async move {
                let dc = api.get(&name).await?;
                Ok(dc.status.as_ref().is_some_and(|s| s.is_ready()))
            }
        })
        .await?;

        info!(%name, "cluster is fully managed now");
        Ok(())
    }

    /// The topology snapshot is the precondition for committing; without it
    /// no node pass has ever run.
    async fn load_topology(&self, datacenter: &str) -> Result<ClusterTopology> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let cm = config_maps
            .get(&topology_config_map_name(datacenter))
            .await
            .map_err(|err| {
                if crate::error::is_not_found_err(&err) {
                    Error::MissingResource("topology snapshot".to_string())
                } else {
                    err.into()
                }
            })?;
        topology_from_config_map(&cm)
    }

    /// Count the migrated pods that are actually running and reconcile the
    /// count against the snapshot. The larger value wins so the datacenter
    /// never scales below either observation.
    async fn target_size(&self, topology: &ClusterTopology) -> Result<i32> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let selector = format!(
            "{}={},{}={}",
            CLUSTER_LABEL,
            cleanup_for_kubernetes(&topology.cluster),
            DATACENTER_LABEL,
            topology.datacenter
        );
        let running = pods
            .list(&ListParams::default().labels(&selector))
            .await?
            .items
            .iter()
            .filter(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .is_some_and(|phase| phase == "Running")
            })
            .count() as i32;

        let snapshot_size = topology.node_infos.len() as i32;
        if running != snapshot_size {
            warn!(
                running,
                snapshot_size, "running pod count disagrees with the topology snapshot"
            );
        }

        Ok(running.max(snapshot_size))
    }

    /// The stored cassandra-yaml document, re-encoded as the JSON config
    /// payload of the datacenter spec.
    async fn datacenter_config(&self, datacenter: &str) -> Result<Option<serde_json::Value>> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let cm = config_maps.get(&config_bundle_name(datacenter)).await?;

        let Some(text) = cm.data.as_ref().and_then(|d| d.get(CASSANDRA_YAML_KEY)) else {
            return Ok(None);
        };
        let doc: Value = serde_yaml::from_str(text)?;
        Ok(Some(serde_json::json!({
            CASSANDRA_YAML_KEY: serde_json::to_value(&doc)?
        })))
    }
}

/// The CassandraDatacenter the operator adopts: rack layout from the
/// snapshot, storage matching the migration volumes and a placeholder pod
/// template naming only the main container.
pub fn build_datacenter(
    namespace: &str,
    topology: &ClusterTopology,
    size: i32,
    config: Option<serde_json::Value>,
) -> CassandraDatacenter {
    let racks = topology
        .rack_names()
        .into_iter()
        .map(|name| Rack { name })
        .collect();

    let spec = CassandraDatacenterSpec {
        cluster_name: topology.cluster.clone(),
        server_type: topology.server_type.clone(),
        server_version: topology.server_version.clone(),
        size,
        racks,
        storage_config: StorageConfig {
            cassandra_data_volume_claim_spec: VolumeClaimSpec {
                storage_class_name: Some(STORAGE_CLASS.to_string()),
                access_modes: vec!["ReadWriteOnce".to_string()],
                resources: VolumeClaimResources {
                    requests: BTreeMap::from([("storage".to_string(), VOLUME_SIZE.to_string())]),
                },
            },
        },
        networking: Some(NetworkingSpec { host_network: true }),
        management_api_auth: Some(ManagementApiAuth {
            insecure: Some(InsecureAuth {}),
        }),
        config,
        pod_template_spec: Some(PodTemplateSpecOverride {
            spec: PodSpecOverride {
                containers: vec![ContainerOverride {
                    name: CASSANDRA_CONTAINER.to_string(),
                }],
            },
        }),
    };

    CassandraDatacenter {
        metadata: ObjectMeta {
            name: Some(topology.datacenter.clone()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodetool::NodeInfo;

    fn topology() -> ClusterTopology {
        let node = |host_id: &str, rack: &str, ordinal: i32| NodeInfo {
            status: "up".to_string(),
            state: "normal".to_string(),
            address: "10.0.0.5".to_string(),
            host_id: host_id.to_string(),
            rack: rack.to_string(),
            ordinal,
        };
        ClusterTopology {
            cluster: "Test Cluster".to_string(),
            server_type: "cassandra".to_string(),
            server_version: "4.1.3".to_string(),
            datacenter: "dc1".to_string(),
            node_infos: vec![node("a", "rack1", 0), node("b", "rack1", 1), node("c", "rack2", 0)],
        }
    }

    #[test]
    fn test_datacenter_shape() {
        let dc = build_datacenter("migrate", &topology(), 3, None);

        assert_eq!(dc.metadata.name.as_deref(), Some("dc1"));
        assert_eq!(dc.spec.cluster_name, "Test Cluster");
        assert_eq!(dc.spec.size, 3);
        assert_eq!(
            dc.spec.racks,
            vec![
                Rack {
                    name: "rack1".to_string()
                },
                Rack {
                    name: "rack2".to_string()
                }
            ]
        );
        assert!(dc.spec.networking.as_ref().is_some_and(|n| n.host_network));
        assert!(
            dc.spec
                .management_api_auth
                .as_ref()
                .is_some_and(|a| a.insecure.is_some())
        );
        let storage = &dc.spec.storage_config.cassandra_data_volume_claim_spec;
        assert_eq!(storage.storage_class_name.as_deref(), Some("local-path"));
    }

    #[test]
    fn test_datacenter_config_payload_shape() {
        let config = serde_json::json!({ "cassandra-yaml": { "num_tokens": 256 } });
        let dc = build_datacenter("migrate", &topology(), 3, Some(config));
        assert_eq!(
            dc.spec.config.unwrap()["cassandra-yaml"]["num_tokens"],
            256
        );
    }

    #[test]
    fn test_placeholder_pod_template() {
        let dc = build_datacenter("migrate", &topology(), 3, None);
        let containers = &dc.spec.pod_template_spec.unwrap().spec.containers;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "cassandra");
    }
}
