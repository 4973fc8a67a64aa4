//! Nodetool invocation and free-text output parsing
//!
//! The migration reads live cluster state through the `nodetool` CLI of the
//! running installation. Execution and parsing are kept separate: the parsers
//! are pure functions over captured output so they can be tested against
//! fixture text without a Cassandra process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Identity fields reported by `nodetool gossipinfo` for the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipInfo {
    pub datacenter: String,
    pub rack: String,
    pub server_type: String,
    pub server_version: String,
}

/// Identity fields reported by `nodetool info` for the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNodeInfo {
    pub host_id: String,
    pub rack: String,
    pub datacenter: String,
}

/// One row of the `nodetool status` table. Persisted verbatim inside the
/// topology snapshot, so the serialized field names are part of the stored
/// format and cannot change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub status: String,
    pub state: String,
    pub address: String,
    pub host_id: String,
    pub rack: String,
    /// Rack-scoped ordinal, restarting at zero for each distinct rack.
    pub ordinal: i32,
}

/// Locates and runs the local `nodetool` executable.
#[derive(Debug, Clone)]
pub struct Nodetool {
    path: PathBuf,
}

impl Nodetool {
    /// Resolve the executable: explicit path override wins, otherwise
    /// `<cassandra-home>/bin/nodetool`.
    pub fn new(nodetool_path: Option<&Path>, cassandra_home: &Path) -> Self {
        let path = match nodetool_path {
            Some(p) => p.join("nodetool"),
            None => cassandra_home.join("bin").join("nodetool"),
        };
        Self { path }
    }

    pub async fn exec(&self, subcommand: &str) -> Result<String> {
        debug!(nodetool = %self.path.display(), subcommand, "executing nodetool");
        let output = Command::new(&self.path).arg(subcommand).output().await?;

        if !output.status.success() {
            // Exit code 1 is nodetool's "could not connect to localhost"
            if output.status.code() == Some(1) {
                return Err(Error::NodetoolLocalhost);
            }
            return Err(Error::CommandFailed {
                command: format!("nodetool {subcommand}"),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Resolve the Cassandra/DSE installation root: explicit override, then the
/// `CASSANDRA_HOME`/`DSE_HOME` environment of the running installation.
pub fn detect_installation(cassandra_home: Option<&Path>) -> Result<PathBuf> {
    if let Some(home) = cassandra_home {
        return Ok(home.to_path_buf());
    }
    for var in ["CASSANDRA_HOME", "DSE_HOME"] {
        if let Ok(home) = std::env::var(var) {
            if !home.is_empty() {
                return Ok(PathBuf::from(home));
            }
        }
    }
    Err(Error::InstallNotFound)
}

/// Parse `nodetool gossipinfo`, reading only the first node's section (the
/// local node). The `X_11_PADDING` field carries a JSON document on DSE and
/// its presence decides the server type.
pub fn parse_gossip_info(output: &str) -> Result<GossipInfo> {
    let mut datacenter = String::new();
    let mut rack = String::new();
    let mut server_type = String::new();
    let mut server_version = String::new();

    let mut details_started = false;
    for line in output.lines() {
        if let Some(data) = line.strip_prefix("  ") {
            if !details_started {
                continue;
            }
            // Field format is NAME:<generation>:<value>; the value itself may
            // contain colons (the DSE JSON padding), so split at most twice.
            let mut columns = data.splitn(3, ':');
            let field_name = columns.next().unwrap_or_default();
            let _generation = columns.next();
            let Some(field_value) = columns.next() else {
                continue;
            };
            match field_name {
                "DC" => datacenter = field_value.to_string(),
                "RACK" => rack = field_value.to_string(),
                "RELEASE_VERSION" => {
                    if server_type.is_empty() {
                        // No DSE information seen yet, so this is Cassandra
                        server_type = "cassandra".to_string();
                        server_version = field_value.to_string();
                    }
                }
                "X_11_PADDING" => {
                    let dse_info: HashMap<String, String> = serde_json::from_str(field_value)?;
                    server_type = "dse".to_string();
                    server_version = dse_info.get("dse_version").cloned().unwrap_or_default();
                }
                _ => {}
            }
        } else if line.starts_with('/') {
            if details_started {
                // Fields of the local node are done, the next node starts here
                break;
            }
            details_started = true;
        } else {
            details_started = true;
        }
    }

    if datacenter.is_empty() || server_version.is_empty() {
        return Err(Error::UnexpectedOutput {
            command: "nodetool gossipinfo".to_string(),
            reason: "no datacenter or version information found".to_string(),
        });
    }

    Ok(GossipInfo {
        datacenter,
        rack,
        server_type,
        server_version,
    })
}

/// Parse the cluster name from `nodetool describecluster`. The name is on the
/// second line, after the `Name:` label.
pub fn parse_cluster_name(output: &str) -> Result<String> {
    let name = output
        .lines()
        .nth(1)
        .and_then(|line| line.split_once(':'))
        .map(|(_, value)| value.trim().to_string())
        .filter(|name| !name.is_empty());

    name.ok_or_else(|| Error::UnexpectedOutput {
        command: "nodetool describecluster".to_string(),
        reason: "cluster name not found on line 2".to_string(),
    })
}

/// Parse `nodetool info` output for the local host id, rack and datacenter.
pub fn parse_node_info(output: &str) -> Result<LocalNodeInfo> {
    let mut host_id = String::new();
    let mut rack = String::new();
    let mut datacenter = String::new();

    for line in output.lines() {
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            match name.trim() {
                "ID" => host_id = value.to_string(),
                "Rack" => rack = value.to_string(),
                "Data Center" => datacenter = value.to_string(),
                _ => {}
            }
        }
    }

    if host_id.is_empty() {
        return Err(Error::UnexpectedOutput {
            command: "nodetool info".to_string(),
            reason: "no ID field found".to_string(),
        });
    }

    Ok(LocalNodeInfo {
        host_id,
        rack,
        datacenter,
    })
}

fn status_code_name(code: char) -> String {
    match code {
        'U' => "up",
        'D' => "down",
        'N' => "normal",
        'L' => "leaving",
        'J' => "joining",
        'M' => "moving",
        'S' => "stopped",
        // Unrecognized codes pass through verbatim
        other => return other.to_string(),
    }
    .to_string()
}

/// Parse the `nodetool status` node table. Rows are located by their host-UUID
/// token rather than position, since the surrounding banner text varies by
/// version. Ordinals are assigned per rack in row order, restarting at zero
/// for each distinct rack.
pub fn parse_node_status(output: &str) -> Result<Vec<NodeInfo>> {
    let row_re = Regex::new(r"(?m)^.*(([0-9a-fA-F]+-){4}([0-9a-fA-F]+)).*$").expect("static regex");
    let whitespace = Regex::new(r"[[:space:]]+").expect("static regex");

    let mut ordinals: HashMap<String, i32> = HashMap::new();
    let mut nodes = Vec::new();

    for row in row_re.find_iter(output) {
        let comps: Vec<&str> = whitespace.split(row.as_str().trim()).collect();
        if comps.len() < 3 {
            continue;
        }

        let mut code_chars = comps[0].chars();
        let (Some(status_code), Some(state_code)) = (code_chars.next(), code_chars.next()) else {
            continue;
        };

        let rack = comps[comps.len() - 1].to_string();
        let ordinal = ordinals
            .entry(rack.clone())
            .and_modify(|o| *o += 1)
            .or_insert(0);

        nodes.push(NodeInfo {
            status: status_code_name(status_code),
            state: status_code_name(state_code),
            address: comps[1].to_string(),
            host_id: comps[comps.len() - 2].to_string(),
            rack: rack.clone(),
            ordinal: *ordinal,
        });
    }

    Ok(nodes)
}

/// Parse `nodetool getseeds` output: every IPv4 address in the text, sorted.
/// Used as a fallback when cassandra.yaml carries no usable seed list.
pub fn parse_seeds(output: &str) -> Vec<String> {
    let ip_re = Regex::new(r"[0-9]+[.][0-9]+[.][0-9]+[.][0-9]+").expect("static regex");
    let mut seeds: Vec<String> = ip_re
        .find_iter(output)
        .map(|m| m.as_str().to_string())
        .collect();
    seeds.sort();
    seeds.dedup();
    seeds
}
