//! Per-node migration: drain the running process, hand its data directories
//! to Kubernetes and start the same node as a pod
//!
//! Phases run strictly in order and each failure aborts the run. No phase is
//! rolled back; a half-migrated node is surfaced to the operator instead of
//! being silently resumed.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::{
    ConfigMap, ContainerStatus, Node, PersistentVolume, PersistentVolumeClaim, Pod,
};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::cluster::topology_from_config_map;
use crate::config::{ConfigBundle, ConfigParser, detect_config_dirs};
use crate::error::{Error, Result};
use crate::mgmt::ManagementClient;
use crate::nodetool::{self, Nodetool};
use crate::resources::common::{
    NODE_STATE_LABEL, NodeIdentity, SERVER_DATA, additional_seed_service_name, config_bundle_name,
    seed_service_name, topology_config_map_name,
};
use crate::resources::pod::{NodePodSpec, build_pod};
use crate::resources::volume::{persistent_volume, persistent_volume_claim};
use crate::retry::poll_until;

/// Group read and write permission bits.
const GROUP_RW: u32 = 0o060;

/// Local-path volumes have no binding feedback to poll, so binding gets a
/// fixed settle delay instead.
const VOLUME_SETTLE: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const POLL_TIMEOUT: Duration = Duration::from_secs(600);

/// Minimum main-container uptime before the management API is trusted to
/// answer.
const MGMT_API_GRACE_SECONDS: i64 = 10;

/// Everything gathered about the local node before any destructive step runs.
#[derive(Debug, Clone)]
pub struct MigrationTarget {
    pub identity: NodeIdentity,
    pub host_id: String,
    pub kube_node: String,
    pub server_type: String,
    pub server_version: String,
}

/// Drives the migration of the node this process runs on.
pub struct NodeMigrator {
    client: Client,
    namespace: String,
    nodetool: Nodetool,
    cass_conf_override: Option<PathBuf>,
    dse_conf_override: Option<PathBuf>,
    cassandra_home: Option<PathBuf>,
}

impl NodeMigrator {
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

    pub async fn migrate_node(&self) -> Result<()> {
        let dirs = detect_config_dirs(
            self.cass_conf_override.as_deref(),
            self.dse_conf_override.as_deref(),
            self.cassandra_home.as_deref(),
        )?;
        let bundle = ConfigParser::new(dirs).parse()?;

        let target = self.gather_info(&bundle).await?;
        info!(
            pod = %target.identity.pod_name(),
            kube_node = %target.kube_node,
            "gathered information from the local node"
        );

        self.drain_and_stop().await?;
        info!("local node drained and shut down");

        let fs_group = validate_storage(&bundle)?;
        let data_mounts = self.bind_volumes(&target, &bundle).await?;
        info!(mounts = data_mounts.len(), "data directories bound to volumes");

        self.create_pod(&target, fs_group, data_mounts).await?;
        info!("pod created");

        self.start_node(&target).await?;
        info!(pod = %target.identity.pod_name(), "node is running in Kubernetes");

        Ok(())
    }

    /// Identify the local node and look it up in the topology snapshot. A
    /// host id missing from the snapshot means the cluster pass never saw
    /// this node.
    pub async fn gather_info(&self, bundle: &ConfigBundle) -> Result<MigrationTarget> {
        let output = self.nodetool.exec("info").await?;
        let local = nodetool::parse_node_info(&output)?;

        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let cm = config_maps
            .get(&topology_config_map_name(&local.datacenter))
            .await?;
        let topology = topology_from_config_map(&cm)?;

        let ordinal = topology
            .node_by_host_id(&local.host_id)
            .map(|n| n.ordinal)
            .ok_or(Error::NotPartOfInit)?;

        let kube_node = self.resolve_kube_node(bundle).await?;

        Ok(MigrationTarget {
            identity: NodeIdentity {
                cluster: topology.cluster.clone(),
                datacenter: local.datacenter,
                rack: local.rack,
                ordinal,
            },
            host_id: local.host_id,
            kube_node,
            server_type: topology.server_type,
            server_version: topology.server_version,
        })
    }

    /// Match the node's listen address against the internal IPs of the
    /// Kubernetes nodes. When only an interface name is configured, the first
    /// address on that interface is used.
    async fn resolve_kube_node(&self, bundle: &ConfigBundle) -> Result<String> {
        let mut target_ip = bundle
            .listen_address()
            .filter(|addr| !addr.is_empty() && addr != "0.0.0.0");

        if let Some(iface) = bundle.listen_interface() {
            target_ip = if_addrs::get_if_addrs()?
                .into_iter()
                .find(|i| i.name == iface)
                .map(|i| i.ip().to_string())
                .or(target_ip);
        }

        let Some(target_ip) = target_ip else {
            return Err(Error::KubeNodeNotFound);
        };
        debug!(%target_ip, "resolving Kubernetes node by internal IP");

        let nodes: Api<Node> = Api::all(self.client.clone());
        for node in nodes.list(&ListParams::default()).await? {
            let internal_ip = node
                .status
                .as_ref()
                .and_then(|s| s.addresses.as_ref())
                .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"));
            if internal_ip.is_some_and(|a| a.address == target_ip) {
                return Ok(node.name_any());
            }
        }

        Err(Error::KubeNodeNotFound)
    }

    /// Flush all memtables to disk, then stop the daemon. Fire-and-forget:
    /// drain completion is not polled, stopdaemon only returns once the
    /// process is gone.
    pub async fn drain_and_stop(&self) -> Result<()> {
        self.nodetool.exec("drain").await?;
        self.nodetool.exec("stopdaemon").await?;
        Ok(())
    }

    /// Create a hostPath PersistentVolume and a pre-bound claim for every
    /// data directory. Returns the mount names in creation order.
    pub async fn bind_volumes(
        &self,
        target: &MigrationTarget,
        bundle: &ConfigBundle,
    ) -> Result<Vec<String>> {
        let data_dirs = bundle.data_file_directories()?;
        if data_dirs.is_empty() {
            return Err(Error::NoDataDirectories);
        }

        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        let pvcs: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &self.namespace);

        let mut mounts = Vec::new();
        let mut bind = |mount_name: String, path: String| {
            mounts.push((mount_name, path));
        };

        for (i, dir) in data_dirs.iter().enumerate() {
            let mount_name = if i == 0 {
                SERVER_DATA.to_string()
            } else {
                format!("{SERVER_DATA}-{i}")
            };
            bind(mount_name, dir.clone());
        }
        for (mount_name, path) in bundle.additional_directories()? {
            bind(mount_name, path);
        }

        for (mount_name, path) in &mounts {
            let pv = persistent_volume(
                &target.identity.pv_name(mount_name),
                path,
                &target.kube_node,
            );
            pvs.create(&PostParams::default(), &pv).await?;

            let pvc = persistent_volume_claim(
                &target.identity.pvc_name(mount_name),
                &self.namespace,
                &target.identity.pv_name(mount_name),
                &target.kube_node,
            );
            pvcs.create(&PostParams::default(), &pvc).await?;
            debug!(mount = %mount_name, %path, "volume bound");
        }

        tokio::time::sleep(VOLUME_SETTLE).await;

        Ok(mounts.into_iter().map(|(name, _)| name).collect())
    }

    /// Load the stored configuration bundle and merge it into the
    /// config-builder model document.
    async fn config_file_data(&self, target: &MigrationTarget) -> Result<String> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let cm = config_maps
            .get(&config_bundle_name(&target.identity.datacenter))
            .await?;
        let data = cm.data.unwrap_or_default();
        let bundle = ConfigBundle::from_yaml_strings(data.iter())?;
        build_config_file_data(&bundle, &target.identity)
    }

    pub async fn create_pod(
        &self,
        target: &MigrationTarget,
        fs_group: i64,
        data_mounts: Vec<String>,
    ) -> Result<()> {
        let config_file_data = self.config_file_data(target).await?;

        let pod = build_pod(&NodePodSpec {
            identity: target.identity.clone(),
            namespace: self.namespace.clone(),
            kube_node: target.kube_node.clone(),
            server_type: target.server_type.clone(),
            server_version: target.server_version.clone(),
            // Existing nodes stay seeds until the operator reshuffles them
            is_seed: true,
            fs_group,
            data_mounts,
            config_file_data,
        })?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        pods.create(&PostParams::default(), &pod).await?;
        Ok(())
    }

    /// Wait for the management API, ask it to start the server, wait for
    /// readiness and record the migration on the pod.
    pub async fn start_node(&self, target: &MigrationTarget) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let pod_name = target.identity.pod_name();

        let api = pods.clone();
        let name = pod_name.clone();
        poll_until(POLL_INTERVAL, POLL_TIMEOUT, "management API startup", || {
            let api = api.clone();
            let name = name.clone();
            async move { Ok(is_mgmt_api_running(&api.get(&name).await?)) }
        })
        .await?;

        // The API answers probes before its routes are all registered
        tokio::time::sleep(Duration::from_secs(5)).await;
        info!("management API has started");

        let pod = pods.get(&pod_name).await?;
        ManagementClient::new()?.call_lifecycle_start(&pod).await?;

        let api = pods.clone();
        let name = pod_name.clone();
        poll_until(POLL_INTERVAL, POLL_TIMEOUT, "server readiness", || {
            let api = api.clone();
            let name = name.clone();
            async move { Ok(is_server_ready(&api.get(&name).await?)) }
        })
        .await?;

        let patch = json!({
            "metadata": { "labels": { NODE_STATE_LABEL: "Started" } }
        });
        pods.patch(&pod_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }
}

/// The CONFIG_FILE_DATA document: cass-config-builder model values with the
/// stored configuration documents merged in under their file-identity keys.
pub fn build_config_file_data(bundle: &ConfigBundle, identity: &NodeIdentity) -> Result<String> {
    let seeds = format!(
        "{},{}",
        seed_service_name(&identity.cluster),
        additional_seed_service_name(&identity.cluster, &identity.datacenter)
    );

    let mut model = serde_json::Map::new();
    model.insert(
        "cluster-info".to_string(),
        json!({ "name": identity.cluster, "seeds": seeds }),
    );
    model.insert(
        "datacenter-info".to_string(),
        json!({
            "name": identity.datacenter,
            "graph-enabled": 0,
            "solr-enabled": 0,
            "spark-enabled": 0,
        }),
    );
    for (key, doc) in bundle.docs() {
        model.insert(key.clone(), serde_json::to_value(doc)?);
    }

    Ok(serde_json::to_string(&serde_json::Value::Object(model))?)
}

/// Verify the data directories exist, agree on one filesystem group and are
/// group read-writable, repairing permission bits where needed. Returns the
/// shared group id for the pod's fsGroup.
pub fn validate_storage(bundle: &ConfigBundle) -> Result<i64> {
    let data_dirs = bundle.data_file_directories()?;
    if data_dirs.is_empty() {
        return Err(Error::NoDataDirectories);
    }

    let additional: Vec<String> = bundle.additional_directories()?.into_values().collect();
    let mut all_dirs: Vec<&str> = data_dirs.iter().map(String::as_str).collect();
    all_dirs.extend(additional.iter().map(String::as_str));

    let gid = ensure_single_gid(&all_dirs)?;

    for dir in &all_dirs {
        fix_directory_rights(Path::new(dir))?;
    }

    Ok(i64::from(gid))
}

/// The single group id owning every file under `paths`. Differing ids
/// anywhere are a fatal precondition failure.
pub fn ensure_single_gid(paths: &[&str]) -> Result<u32> {
    let mut target: Option<u32> = None;
    for path in paths {
        for entry in WalkDir::new(path) {
            let entry = entry.map_err(std::io::Error::from)?;
            let gid = entry.metadata().map_err(std::io::Error::from)?.gid();
            match target {
                None => target = Some(gid),
                Some(t) if t != gid => return Err(Error::MismatchedGroupIds),
                Some(_) => {}
            }
        }
    }
    target.ok_or(Error::NoDataDirectories)
}

/// Add group read/write to anything under `path` that lacks it. Only those
/// two bits are touched.
pub fn fix_directory_rights(path: &Path) -> Result<()> {
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(std::io::Error::from)?;
        let metadata = entry.metadata().map_err(std::io::Error::from)?;
        let mode = metadata.permissions().mode();
        if mode & GROUP_RW != GROUP_RW {
            fs::set_permissions(
                entry.path(),
                fs::Permissions::from_mode(mode | GROUP_RW),
            )?;
        }
    }
    Ok(())
}

/// Whether the main container has been running long enough for the
/// management API to answer.
fn is_mgmt_api_running(pod: &Pod) -> bool {
    container_status(pod).is_some_and(|status| {
        status
            .state
            .as_ref()
            .and_then(|s| s.running.as_ref())
            .and_then(|r| r.started_at.as_ref())
            .is_some_and(|started| {
                Utc::now().signed_duration_since(started.0).num_seconds() >= MGMT_API_GRACE_SECONDS
            })
    })
}

fn is_server_ready(pod: &Pod) -> bool {
    container_status(pod).is_some_and(|status| status.ready)
}

fn container_status(pod: &Pod) -> Option<&ContainerStatus> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| {
            statuses
                .iter()
                .find(|s| s.name == crate::resources::common::CASSANDRA_CONTAINER)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateRunning, ContainerStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap as Map;

    fn pod_with_status(running_for_seconds: i64, ready: bool) -> Pod {
        Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "cassandra".to_string(),
                    ready,
                    state: Some(ContainerState {
                        running: Some(ContainerStateRunning {
                            started_at: Some(Time(
                                Utc::now() - chrono::Duration::seconds(running_for_seconds),
                            )),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn bundle_from(cassandra_yaml: &str) -> ConfigBundle {
        let key = "cassandra-yaml".to_string();
        let text = cassandra_yaml.to_string();
        let entries = Map::from([(key, text)]);
        ConfigBundle::from_yaml_strings(entries.iter()).unwrap()
    }

    #[test]
    fn test_mgmt_api_grace_window() {
        assert!(!is_mgmt_api_running(&pod_with_status(2, false)));
        assert!(is_mgmt_api_running(&pod_with_status(30, false)));
        assert!(!is_mgmt_api_running(&Pod::default()));
    }

    #[test]
    fn test_server_readiness() {
        assert!(is_server_ready(&pod_with_status(30, true)));
        assert!(!is_server_ready(&pod_with_status(30, false)));
    }

    #[test]
    fn test_config_file_data_merges_model_and_bundle() {
        let bundle = bundle_from("num_tokens: 256\n");
        let identity = NodeIdentity {
            cluster: "Test Cluster".to_string(),
            datacenter: "dc1".to_string(),
            rack: "rack1".to_string(),
            ordinal: 0,
        };

        let data = build_config_file_data(&bundle, &identity).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&data).unwrap();

        assert_eq!(parsed["cluster-info"]["name"], "Test Cluster");
        assert_eq!(
            parsed["cluster-info"]["seeds"],
            "test-cluster-seed-service,test-cluster-dc1-additional-seed-service"
        );
        assert_eq!(parsed["datacenter-info"]["name"], "dc1");
        assert_eq!(parsed["cassandra-yaml"]["num_tokens"], 256);
    }

    #[test]
    fn test_single_gid_over_temp_dirs() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        fs::write(a.path().join("data.db"), b"x").unwrap();

        let paths = [a.path().to_str().unwrap(), b.path().to_str().unwrap()];
        // Everything created by this test process shares one group
        assert!(ensure_single_gid(&paths).is_ok());
    }

    #[test]
    fn test_fix_directory_rights_adds_group_bits() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("restricted");
        fs::write(&file, b"x").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();

        fix_directory_rights(dir.path()).unwrap();

        let mode = fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);
    }

    #[test]
    fn test_fix_directory_rights_keeps_compliant_modes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("shared");
        fs::write(&file, b"x").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o770)).unwrap();

        fix_directory_rights(dir.path()).unwrap();

        // Group rw already present; no other bits change
        let mode = fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o770);
    }

    #[test]
    fn test_validate_storage_requires_data_dirs() {
        let bundle = bundle_from("num_tokens: 256\n");
        assert!(matches!(
            validate_storage(&bundle),
            Err(Error::NoDataDirectories)
        ));
    }
}
