//! Migration of a self-managed Cassandra/DSE cluster into Kubernetes
//!
//! Runs in three passes driven by the `cass-migrate` binary:
//! - `init` (once per cluster): discover identity and topology, persist the
//!   configuration bundle, publish seed services.
//! - `add` (once per node, on the node): drain the running process, hand its
//!   data directories to Kubernetes and start the node as a pod.
//! - `commit` (once per cluster): create the CassandraDatacenter and wait for
//!   cass-operator to adopt the migrated pods.

pub mod cluster;
pub mod config;
pub mod crd;
pub mod error;
pub mod finisher;
pub mod lock;
pub mod mgmt;
pub mod node;
pub mod nodetool;
pub mod resources;
pub mod retry;

pub use cluster::{ClusterIdentity, ClusterMigrator, ClusterTopology, ensure_namespace};
pub use crd::CassandraDatacenter;
pub use error::{Error, Result};
pub use finisher::MigrationFinisher;
pub use lock::LeadershipLock;
pub use node::NodeMigrator;
pub use nodetool::Nodetool;
