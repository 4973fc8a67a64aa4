//! Kubernetes object synthesis for migrated Cassandra nodes
//!
//! Everything created here must match what cass-operator builds for a managed
//! datacenter, so that the reconciler adopts the migrated pods instead of
//! provisioning replacements.

pub mod common;
pub mod pod;
pub mod service;
pub mod volume;
