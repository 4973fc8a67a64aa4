//! Cluster-level migration: identity discovery, topology snapshot, shared
//! configuration, seed services
//!
//! Runs once per cluster, before any node is migrated. Every write here is
//! idempotent; re-running `init` against a half-initialized namespace only
//! fills in what is missing.

use std::collections::BTreeMap;
use std::path::PathBuf;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Namespace, Service};
use kube::api::{Api, PostParams, Resource};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ConfigBundle, ConfigParser, detect_config_dirs, extract_seeds};
use crate::error::{Error, Result, is_already_exists_err, is_not_found_err};
use crate::nodetool::{self, NodeInfo, Nodetool};
use crate::resources::common::{
    additional_seed_service_name, config_bundle_name, seed_service_name, topology_config_map_name,
};
use crate::resources::service::{additional_seed_endpoints, headless_service, seed_service};

/// Key of the snapshot document inside the topology ConfigMap.
const CLUSTER_INFO_KEY: &str = "clusterInfo";

/// Identity of the cluster as reported by the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterIdentity {
    pub cluster: String,
    pub datacenter: String,
    pub rack: String,
    pub server_type: String,
    pub server_version: String,
}

/// The immutable topology snapshot: cluster identity plus the per-node
/// inventory captured before any node was migrated. Serialized field names
/// are part of the stored format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    pub cluster: String,
    pub server_type: String,
    pub server_version: String,
    pub datacenter: String,
    #[serde(rename = "nodeinfos")]
    pub node_infos: Vec<NodeInfo>,
}

impl ClusterTopology {
    pub fn node_by_host_id(&self, host_id: &str) -> Option<&NodeInfo> {
        self.node_infos.iter().find(|n| n.host_id == host_id)
    }

    /// Distinct rack names in first-appearance order.
    pub fn rack_names(&self) -> Vec<String> {
        let mut racks = Vec::new();
        for node in &self.node_infos {
            if !racks.contains(&node.rack) {
                racks.push(node.rack.clone());
            }
        }
        racks
    }
}

/// Create `obj`, treating an already-exists answer as success. The shared
/// idempotency primitive for every one-time resource.
pub(crate) async fn create_if_absent<K>(api: &Api<K>, obj: &K) -> Result<bool>
where
    K: Resource + Clone + std::fmt::Debug + Serialize + DeserializeOwned,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(true),
        Err(err) if is_already_exists_err(&err) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Create the target namespace when it does not exist yet.
pub async fn ensure_namespace(client: Client, namespace: &str) -> Result<()> {
    let namespaces: Api<Namespace> = Api::all(client);
    let ns = Namespace {
        metadata: kube::core::ObjectMeta {
            name: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    if create_if_absent(&namespaces, &ns).await? {
        info!(namespace, "created namespace");
    }
    Ok(())
}

/// Union of the already-published endpoint addresses and the newly discovered
/// seeds, sorted and deduplicated.
fn merged_seed_addresses(existing: &Endpoints, discovered: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = existing
        .subsets
        .iter()
        .flatten()
        .filter_map(|s| s.addresses.as_ref())
        .flatten()
        .map(|a| a.ip.clone())
        .collect();
    merged.extend(discovered.iter().cloned());
    merged.sort();
    merged.dedup();
    merged
}

/// Drives the cluster-level migration pass.
pub struct ClusterMigrator {
    client: Client,
    namespace: String,
    nodetool: Nodetool,
    cass_conf_override: Option<PathBuf>,
    dse_conf_override: Option<PathBuf>,
    cassandra_home: Option<PathBuf>,
}

impl ClusterMigrator {
    pub fn new(
        client: Client,
        namespace: &str,
        nodetool: Nodetool,
        cass_conf_override: Option<PathBuf>,
        dse_conf_override: Option<PathBuf>,
        cassandra_home: Option<PathBuf>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            nodetool,
            cass_conf_override,
            dse_conf_override,
            cassandra_home,
        }
    }

    /// The full `init` pass: identity, topology snapshot, configuration
    /// bundle, seed services.
    pub async fn init_cluster(&self) -> Result<()> {
        info!("fetching cluster details from the local node");
        let identity = self.discover_identity().await?;
        info!(
            cluster = %identity.cluster,
            datacenter = %identity.datacenter,
            server = %format!("{} {}", identity.server_type, identity.server_version),
            "discovered cluster identity"
        );

        let topology = self.capture_topology(&identity).await?;
        info!(nodes = topology.node_infos.len(), "topology snapshot stored");

        let (_, seeds) = self.parse_and_store_configs(&identity).await?;
        info!(count = seeds.len(), "parsed and stored configuration");

        self.ensure_seed_services(&identity, seeds).await?;
        info!("seed services ready; review the configuration before migrating nodes");

        Ok(())
    }

    /// Identity of the cluster through the local node's gossip state and
    /// the cluster description.
    pub async fn discover_identity(&self) -> Result<ClusterIdentity> {
        let gossip_output = self.nodetool.exec("gossipinfo").await?;
        let gossip = nodetool::parse_gossip_info(&gossip_output)?;

        let describe_output = self.nodetool.exec("describecluster").await?;
        let cluster = nodetool::parse_cluster_name(&describe_output)?;

        Ok(ClusterIdentity {
            cluster,
            datacenter: gossip.datacenter,
            rack: gossip.rack,
            server_type: gossip.server_type,
            server_version: gossip.server_version,
        })
    }

    /// Persist the topology snapshot, or load the existing one. The snapshot
    /// is immutable once written: a re-run never overwrites it, so nodes that
    /// already resolved their ordinals keep them.
    pub async fn capture_topology(&self, identity: &ClusterIdentity) -> Result<ClusterTopology> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = topology_config_map_name(&identity.datacenter);

        match config_maps.get(&name).await {
            Ok(existing) => {
                debug!(%name, "topology snapshot already exists, leaving it untouched");
                return topology_from_config_map(&existing);
            }
            Err(err) if is_not_found_err(&err) => {}
            Err(err) => return Err(err.into()),
        }

        let status_output = self.nodetool.exec("status").await?;
        let node_infos = nodetool::parse_node_status(&status_output)?;

        let topology = ClusterTopology {
            cluster: identity.cluster.clone(),
            server_type: identity.server_type.clone(),
            server_version: identity.server_version.clone(),
            datacenter: identity.datacenter.clone(),
            node_infos,
        };

        let cm = ConfigMap {
            metadata: kube::core::ObjectMeta {
                name: Some(name),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            binary_data: Some(BTreeMap::from([(
                CLUSTER_INFO_KEY.to_string(),
                ByteString(serde_json::to_vec(&topology)?),
            )])),
            ..Default::default()
        };
        create_if_absent(&config_maps, &cm).await?;

        Ok(topology)
    }

    /// Parse the local configuration, strip host-specific keys and store the
    /// bundle. Returns the bundle plus the extracted seed addresses.
    pub async fn parse_and_store_configs(
        &self,
        identity: &ClusterIdentity,
    ) -> Result<(ConfigBundle, Vec<String>)> {
        let dirs = detect_config_dirs(
            self.cass_conf_override.as_deref(),
            self.dse_conf_override.as_deref(),
            self.cassandra_home.as_deref(),
        )?;
        if dirs.is_none() {
            warn!("no configuration directories detected, storing an empty bundle");
        }

        let mut bundle = ConfigParser::new(dirs).parse()?;
        let seeds = extract_seeds(&mut bundle)?;

        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = config_bundle_name(&identity.datacenter);

        let mut cm = match config_maps.get(&name).await {
            Ok(existing) => existing,
            Err(err) if is_not_found_err(&err) => {
                let empty = ConfigMap {
                    metadata: kube::core::ObjectMeta {
                        name: Some(name.clone()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                config_maps.create(&PostParams::default(), &empty).await?
            }
            Err(err) => return Err(err.into()),
        };

        let mut data = cm.data.take().unwrap_or_default();
        for (key, text) in bundle.to_yaml_strings()? {
            data.insert(key, text);
        }
        cm.data = Some(data);
        config_maps.replace(&name, &PostParams::default(), &cm).await?;

        Ok((bundle, seeds))
    }

    /// Ensure both seed services exist and reconcile the additional-seed
    /// endpoints with any newly discovered addresses. When the configuration
    /// carried no usable seeds, fall back to `nodetool getseeds`.
    pub async fn ensure_seed_services(
        &self,
        identity: &ClusterIdentity,
        mut seeds: Vec<String>,
    ) -> Result<()> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);

        let additional_name = additional_seed_service_name(&identity.cluster, &identity.datacenter);
        create_if_absent(
            &services,
            &headless_service(&additional_name, &self.namespace),
        )
        .await?;

        let seed_name = seed_service_name(&identity.cluster);
        create_if_absent(
            &services,
            &seed_service(&seed_name, &self.namespace, &identity.cluster),
        )
        .await?;

        if seeds.is_empty() {
            // getseeds reports the other nodes' view, excluding this node
            let output = self.nodetool.exec("getseeds").await?;
            seeds = nodetool::parse_seeds(&output);
            debug!(count = seeds.len(), "seeds recovered via nodetool getseeds");
        }

        if seeds.is_empty() {
            return Ok(());
        }

        let endpoints_api: Api<Endpoints> = Api::namespaced(self.client.clone(), &self.namespace);
        match endpoints_api.get(&additional_name).await {
            Ok(existing) => {
                let merged = merged_seed_addresses(&existing, &seeds);
                let mut updated =
                    additional_seed_endpoints(&additional_name, &self.namespace, &merged);
                updated.metadata.resource_version = existing.metadata.resource_version.clone();
                endpoints_api
                    .replace(&additional_name, &PostParams::default(), &updated)
                    .await?;
            }
            Err(err) if is_not_found_err(&err) => {
                let endpoints =
                    additional_seed_endpoints(&additional_name, &self.namespace, &seeds);
                create_if_absent(&endpoints_api, &endpoints).await?;
            }
            Err(err) => return Err(err.into()),
        }

        Ok(())
    }
}

/// Decode a topology snapshot from its ConfigMap representation.
pub fn topology_from_config_map(cm: &ConfigMap) -> Result<ClusterTopology> {
    let bytes = cm
        .binary_data
        .as_ref()
        .and_then(|d| d.get(CLUSTER_INFO_KEY))
        .ok_or_else(|| Error::MissingResource(format!("{CLUSTER_INFO_KEY} snapshot data")))?;
    Ok(serde_json::from_slice(&bytes.0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset};

    fn node(host_id: &str, rack: &str, ordinal: i32) -> NodeInfo {
        NodeInfo {
            status: "up".to_string(),
            state: "normal".to_string(),
            address: "10.0.0.5".to_string(),
            host_id: host_id.to_string(),
            rack: rack.to_string(),
            ordinal,
        }
    }

    fn topology() -> ClusterTopology {
        ClusterTopology {
            cluster: "Test Cluster".to_string(),
            server_type: "cassandra".to_string(),
            server_version: "4.1.3".to_string(),
            datacenter: "dc1".to_string(),
            node_infos: vec![node("a", "rack1", 0), node("b", "rack2", 0), node("c", "rack1", 1)],
        }
    }

    #[test]
    fn test_snapshot_stored_format() {
        let json = serde_json::to_value(topology()).unwrap();
        assert_eq!(json["cluster"], "Test Cluster");
        assert_eq!(json["serverType"], "cassandra");
        assert_eq!(json["serverVersion"], "4.1.3");
        assert_eq!(json["nodeinfos"][0]["hostId"], "a");
        assert_eq!(json["nodeinfos"][0]["ordinal"], 0);
    }

    #[test]
    fn test_topology_config_map_roundtrip() {
        let topology = topology();
        let cm = ConfigMap {
            binary_data: Some(BTreeMap::from([(
                CLUSTER_INFO_KEY.to_string(),
                ByteString(serde_json::to_vec(&topology).unwrap()),
            )])),
            ..Default::default()
        };
        assert_eq!(topology_from_config_map(&cm).unwrap(), topology);
    }

    #[test]
    fn test_topology_lookup_and_racks() {
        let topology = topology();
        assert_eq!(topology.node_by_host_id("c").unwrap().ordinal, 1);
        assert!(topology.node_by_host_id("zzz").is_none());
        assert_eq!(topology.rack_names(), vec!["rack1", "rack2"]);
    }

    #[test]
    fn test_merged_seed_addresses() {
        let existing = Endpoints {
            metadata: Default::default(),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.9".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        };
        let merged = merged_seed_addresses(
            &existing,
            &["10.0.0.5".to_string(), "10.0.0.9".to_string()],
        );
        assert_eq!(merged, vec!["10.0.0.5", "10.0.0.9"]);
    }
}
