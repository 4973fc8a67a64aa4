//! CassandraDatacenter custom resource
//!
//! The terminal artifact of the migration. Only the fields the finisher sets
//! are modeled; the full schema belongs to cass-operator, which owns the
//! resource's lifecycle after creation.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// CassandraDatacenter is the resource cass-operator reconciles. Creating it
/// over already-labeled pods makes the operator adopt them as a managed
/// datacenter.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "cassandra.datastax.com",
    version = "v1beta1",
    kind = "CassandraDatacenter",
    plural = "cassandradatacenters",
    shortname = "cassdc",
    namespaced,
    status = "CassandraDatacenterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CassandraDatacenterSpec {
    /// Cluster this datacenter belongs to (the original cluster name,
    /// before Kubernetes name cleanup).
    pub cluster_name: String,

    /// `cassandra` or `dse`.
    pub server_type: String,

    pub server_version: String,

    /// Total node count across all racks.
    pub size: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub racks: Vec<Rack>,

    pub storage_config: StorageConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking: Option<NetworkingSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_api_auth: Option<ManagementApiAuth>,

    /// Raw cass-config-builder payload (the stored cassandra-yaml document).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,

    /// Placeholder template; the operator fills in the remainder on adoption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template_spec: Option<PodTemplateSpecOverride>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Rack {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    pub cassandra_data_volume_claim_spec: VolumeClaimSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,

    pub resources: VolumeClaimResources,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimResources {
    pub requests: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingSpec {
    #[serde(default)]
    pub host_network: bool,
}

/// Management API security mode. Only the insecure provider is supported;
/// authenticated management calls are out of scope for the migration.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ManagementApiAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<InsecureAuth>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
pub struct InsecureAuth {}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpecOverride {
    pub spec: PodSpecOverride,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodSpecOverride {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerOverride>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOverride {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CassandraDatacenterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<DatacenterCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// `"True"`, `"False"` or `"Unknown"`, following the Kubernetes
    /// condition convention.
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CassandraDatacenterStatus {
    pub fn is_ready(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True")
    }
}
