//! End-to-end exercises of the offline migration pipeline: configuration
//! parsing through datacenter synthesis, without a Kubernetes cluster.

use std::fs;

use cassandra_migrator::cluster::ClusterTopology;
use cassandra_migrator::config::{ConfigParser, detect_config_dirs, extract_seeds};
use cassandra_migrator::finisher::build_datacenter;
use cassandra_migrator::node::build_config_file_data;
use cassandra_migrator::nodetool::parse_node_status;
use cassandra_migrator::resources::common::NodeIdentity;

const CASSANDRA_YAML: &str = r#"
cluster_name: "Prod Cluster"
num_tokens: 256
listen_address: 10.0.0.5
data_file_directories:
  - /var/lib/cassandra/data
saved_caches_directory: /var/lib/cassandra/saved_caches
seed_provider:
  - class_name: org.apache.cassandra.locator.SimpleSeedProvider
    parameters:
      - seeds: "127.0.0.1:7000,10.0.0.5:7000,10.0.0.6:7000"
"#;

const DSE_YAML: &str = r#"
authentication_options:
  enabled: false
"#;

const NODETOOL_STATUS: &str = r#"Datacenter: dc1
===============
Status=Up/Down
|/ State=Normal/Leaving/Joining/Moving
--  Address   Load       Tokens  Owns    Host ID                               Rack
UN  10.0.0.5  103 KiB    256     100.0%  c0b4bfd1-2b52-4530-9b78-aefefb0a5d32  rack1
UN  10.0.0.6  102 KiB    256     100.0%  117698a7-7dd5-4b6f-b276-73a916ca6b18  rack1
UN  10.0.0.7  101 KiB    256     100.0%  2f4a9803-1e5b-4225-9ec2-c8295e1a73a4  rack2
"#;

/// Build a config directory pair on disk and parse it the way `init` does.
fn parsed_bundle() -> (cassandra_migrator::config::ConfigBundle, Vec<String>) {
    let dir = tempfile::tempdir().unwrap();
    let cass_conf = dir.path().join("cassandra");
    let dse_conf = dir.path().join("dse");
    fs::create_dir_all(&cass_conf).unwrap();
    fs::create_dir_all(&dse_conf).unwrap();
    fs::write(cass_conf.join("cassandra.yaml"), CASSANDRA_YAML).unwrap();
    fs::write(dse_conf.join("dse.yaml"), DSE_YAML).unwrap();

    let dirs = detect_config_dirs(Some(&cass_conf), Some(&dse_conf), None).unwrap();
    assert!(dirs.is_some(), "override pair should be detected");

    let mut bundle = ConfigParser::new(dirs).parse().unwrap();
    let seeds = extract_seeds(&mut bundle).unwrap();
    (bundle, seeds)
}

#[test]
fn parse_strip_and_store_configuration() {
    let (bundle, seeds) = parsed_bundle();

    // Loopback excluded, ports stripped, sorted
    assert_eq!(seeds, vec!["10.0.0.5", "10.0.0.6"]);

    // Host-specific keys are gone, everything else survives
    let yaml = bundle.cassandra_yaml().unwrap();
    assert!(!yaml.contains_key("seed_provider"));
    assert!(!yaml.contains_key("listen_address"));
    assert_eq!(yaml.get("num_tokens").and_then(|v| v.as_u64()), Some(256));

    // The stored form roundtrips
    let stored = bundle.to_yaml_strings().unwrap();
    let reloaded =
        cassandra_migrator::config::ConfigBundle::from_yaml_strings(stored.iter()).unwrap();
    assert_eq!(
        reloaded.data_file_directories().unwrap(),
        vec!["/var/lib/cassandra/data"]
    );
    assert_eq!(
        reloaded.additional_directories().unwrap()["saved-caches-directory"],
        "/var/lib/cassandra/saved_caches"
    );
}

#[test]
fn config_builder_document_carries_the_bundle() {
    let (bundle, _) = parsed_bundle();
    let identity = NodeIdentity {
        cluster: "Prod Cluster".to_string(),
        datacenter: "dc1".to_string(),
        rack: "rack1".to_string(),
        ordinal: 0,
    };

    let data = build_config_file_data(&bundle, &identity).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&data).unwrap();

    assert_eq!(doc["cluster-info"]["name"], "Prod Cluster");
    assert_eq!(
        doc["cluster-info"]["seeds"],
        "prod-cluster-seed-service,prod-cluster-dc1-additional-seed-service"
    );
    assert_eq!(doc["cassandra-yaml"]["num_tokens"], 256);
    assert!(doc["cassandra-yaml"].get("seed_provider").is_none());
}

#[test]
fn status_snapshot_drives_the_datacenter_shape() {
    let node_infos = parse_node_status(NODETOOL_STATUS).unwrap();
    assert_eq!(node_infos.len(), 3);

    // Ordinals restart per rack
    assert_eq!(node_infos[0].ordinal, 0);
    assert_eq!(node_infos[1].ordinal, 1);
    assert_eq!(node_infos[2].ordinal, 0);

    let topology = ClusterTopology {
        cluster: "Prod Cluster".to_string(),
        server_type: "cassandra".to_string(),
        server_version: "4.1.3".to_string(),
        datacenter: "dc1".to_string(),
        node_infos,
    };

    let size = topology.node_infos.len() as i32;
    let dc = build_datacenter("migrate", &topology, size, None);

    assert_eq!(dc.metadata.name.as_deref(), Some("dc1"));
    assert_eq!(dc.spec.size, 3);
    let racks: Vec<&str> = dc.spec.racks.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(racks, vec!["rack1", "rack2"]);
    assert_eq!(dc.spec.server_type, "cassandra");
    assert!(dc.spec.networking.as_ref().is_some_and(|n| n.host_network));
}
