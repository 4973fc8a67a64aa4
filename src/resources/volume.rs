//! Manually bound volumes for pre-existing data directories
//!
//! The node's on-disk data must survive the migration, so dynamic
//! provisioning is bypassed entirely: a hostPath PersistentVolume pins each
//! existing directory to its Kubernetes node, and the matching claim binds to
//! it by explicit volume name.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeSpec,
    VolumeNodeAffinity, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::core::ObjectMeta;

use crate::resources::common::{STORAGE_CLASS, STORAGE_PROVISIONER};

/// Capacity is nominal: the volume is a hostPath onto an existing filesystem,
/// so the quantity is never enforced.
pub const VOLUME_SIZE: &str = "5Gi";

fn hostname_node_selector(kube_node: &str) -> NodeSelector {
    NodeSelector {
        node_selector_terms: vec![NodeSelectorTerm {
            match_expressions: Some(vec![NodeSelectorRequirement {
                key: "kubernetes.io/hostname".to_string(),
                operator: "In".to_string(),
                values: Some(vec![kube_node.to_string()]),
            }]),
            ..Default::default()
        }],
    }
}

/// A hostPath PersistentVolume over `path`, schedulable only on `kube_node`.
pub fn persistent_volume(name: &str, path: &str, kube_node: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations: Some(BTreeMap::from([(
                "pv.kubernetes.io/provisioned-by".to_string(),
                STORAGE_PROVISIONER.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(VOLUME_SIZE.to_string()),
            )])),
            storage_class_name: Some(STORAGE_CLASS.to_string()),
            host_path: Some(HostPathVolumeSource {
                path: path.to_string(),
                type_: Some("Directory".to_string()),
            }),
            // Never reclaim the node's data
            persistent_volume_reclaim_policy: Some("Retain".to_string()),
            volume_mode: Some("Filesystem".to_string()),
            node_affinity: Some(VolumeNodeAffinity {
                required: Some(hostname_node_selector(kube_node)),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A claim pre-bound to `volume_name`, sidestepping the provisioner.
pub fn persistent_volume_claim(
    name: &str,
    namespace: &str,
    volume_name: &str,
    kube_node: &str,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([
                (
                    "volume.beta.kubernetes.io/storage-provisioner".to_string(),
                    STORAGE_PROVISIONER.to_string(),
                ),
                (
                    "volume.kubernetes.io/selected-node".to_string(),
                    kube_node.to_string(),
                ),
            ])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(VOLUME_SIZE.to_string()),
                )])),
                ..Default::default()
            }),
            storage_class_name: Some(STORAGE_CLASS.to_string()),
            volume_mode: Some("Filesystem".to_string()),
            volume_name: Some(volume_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistent_volume_pins_host_and_path() {
        let pv = persistent_volume("pvc-server-data-x", "/var/lib/cassandra/data", "worker-1");
        let spec = pv.spec.unwrap();

        assert_eq!(spec.host_path.as_ref().unwrap().path, "/var/lib/cassandra/data");
        assert_eq!(
            spec.host_path.unwrap().type_.as_deref(),
            Some("Directory")
        );
        assert_eq!(
            spec.persistent_volume_reclaim_policy.as_deref(),
            Some("Retain")
        );

        let term = &spec.node_affinity.unwrap().required.unwrap().node_selector_terms[0];
        let req = &term.match_expressions.as_ref().unwrap()[0];
        assert_eq!(req.key, "kubernetes.io/hostname");
        assert_eq!(req.values, Some(vec!["worker-1".to_string()]));
    }

    #[test]
    fn test_claim_binds_by_volume_name() {
        let pvc = persistent_volume_claim("server-data-x", "migrate", "pvc-server-data-x", "worker-1");
        let spec = pvc.spec.unwrap();

        assert_eq!(spec.volume_name.as_deref(), Some("pvc-server-data-x"));
        assert_eq!(spec.storage_class_name.as_deref(), Some(STORAGE_CLASS));
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));

        let annotations = pvc.metadata.annotations.unwrap();
        assert_eq!(
            annotations
                .get("volume.kubernetes.io/selected-node")
                .map(String::as_str),
            Some("worker-1")
        );
    }
}
