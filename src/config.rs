//! Local Cassandra/DSE configuration parsing
//!
//! Reads the on-disk configuration of the running installation into an
//! untyped, host-agnostic bundle that is later stored in Kubernetes and fed
//! to the config-builder init container. Unknown keys are carried through
//! untouched; only the small set of host-specific keys is stripped.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::{Error, Result};

pub const CASSANDRA_YAML_KEY: &str = "cassandra-yaml";
const CASSANDRA_YAML_FILENAME: &str = "cassandra.yaml";
const DSE_YAML_FILENAME: &str = "dse.yaml";

/// Datastax installer default location.
const INSTALLER_DEFAULT: &str = "/usr/share/dse";

/// The external jvm-options metadata matcher. Recognized `-X`/`-D` flags are
/// turned into structured config keys; everything else stays a raw option
/// line. The real matcher ships with the definitions parser and is wired in
/// by the caller; [`PassthroughMatcher`] recognizes nothing.
pub trait OptionMatcher {
    /// Returns `Some((key, value, default))` when the flag is recognized.
    fn parse(&self, line: &str) -> Option<(String, Value, Value)>;
}

/// Matcher that treats every flag as an additional raw jvm option.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughMatcher;

impl OptionMatcher for PassthroughMatcher {
    fn parse(&self, _line: &str) -> Option<(String, Value, Value)> {
        None
    }
}

/// The parsed, host-agnostic configuration documents of one datacenter,
/// keyed by file identity (`cassandra-yaml`, `jvm11-server-options`, ...).
#[derive(Debug, Clone, Default)]
pub struct ConfigBundle {
    docs: BTreeMap<String, Value>,
}

impl ConfigBundle {
    pub fn docs(&self) -> &BTreeMap<String, Value> {
        &self.docs
    }

    pub fn cassandra_yaml(&self) -> Option<&Mapping> {
        self.docs.get(CASSANDRA_YAML_KEY).and_then(Value::as_mapping)
    }

    /// Rebuild a bundle from the YAML strings stored in the config ConfigMap.
    pub fn from_yaml_strings<'a>(
        entries: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<Self> {
        let mut docs = BTreeMap::new();
        for (key, text) in entries {
            docs.insert(key.clone(), serde_yaml::from_str(text)?);
        }
        Ok(Self { docs })
    }

    /// Serialize every document back to YAML text for ConfigMap storage.
    pub fn to_yaml_strings(&self) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for (key, doc) in &self.docs {
            out.insert(key.clone(), serde_yaml::to_string(doc)?);
        }
        Ok(out)
    }

    /// The `data_file_directories` sequence from cassandra.yaml.
    pub fn data_file_directories(&self) -> Result<Vec<String>> {
        let Some(yaml) = self.cassandra_yaml() else {
            return Ok(Vec::new());
        };
        let mut dirs = Vec::new();
        for (key, val) in yaml {
            if key.as_str().is_some_and(|k| k.ends_with("_directories")) {
                let seq = val.as_sequence().ok_or(Error::InvalidConfigType {
                    key: "data_file_directories",
                    expected: "sequence of strings",
                })?;
                for dir in seq {
                    dirs.push(
                        dir.as_str()
                            .ok_or(Error::InvalidConfigType {
                                key: "data_file_directories",
                                expected: "sequence of strings",
                            })?
                            .to_string(),
                    );
                }
            }
        }
        Ok(dirs)
    }

    /// Every singular `*_directory` key from cassandra.yaml, mapped to its path.
    pub fn additional_directories(&self) -> Result<BTreeMap<String, String>> {
        let Some(yaml) = self.cassandra_yaml() else {
            return Ok(BTreeMap::new());
        };
        let mut dirs = BTreeMap::new();
        for (key, val) in yaml {
            let Some(key) = key.as_str() else { continue };
            if key.ends_with("_directory") {
                let path = val.as_str().ok_or(Error::InvalidConfigType {
                    key: "*_directory",
                    expected: "string",
                })?;
                dirs.insert(key.replace('_', "-"), path.to_string());
            }
        }
        Ok(dirs)
    }

    fn cassandra_yaml_str(&self, key: &str) -> Option<String> {
        self.cassandra_yaml()?
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn listen_address(&self) -> Option<String> {
        self.cassandra_yaml_str("listen_address")
    }

    pub fn listen_interface(&self) -> Option<String> {
        self.cassandra_yaml_str("listen_interface")
    }
}

/// Configuration directories selected for parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDirs {
    pub cassandra_conf: PathBuf,
    pub dse_conf: PathBuf,
}

/// Search the known configuration locations in precedence order: explicit
/// override pair, the installation home, the package install paths, the
/// installer default. A candidate is selected when both cassandra.yaml and
/// dse.yaml exist under it.
pub fn detect_config_dirs(
    cass_conf_override: Option<&Path>,
    dse_conf_override: Option<&Path>,
    cassandra_home: Option<&Path>,
) -> Result<Option<ConfigDirs>> {
    let verify = |cass: &Path, dse: &Path| -> Option<ConfigDirs> {
        let found_cass = cass.join(CASSANDRA_YAML_FILENAME).is_file();
        let found_dse = dse.join(DSE_YAML_FILENAME).is_file();
        (found_cass && found_dse).then(|| ConfigDirs {
            cassandra_conf: cass.to_path_buf(),
            dse_conf: dse.to_path_buf(),
        })
    };
    let verify_install = |home: &Path| {
        verify(
            &home.join("resources").join("cassandra").join("conf"),
            &home.join("resources").join("dse").join("conf"),
        )
    };

    // User-provided overrides disable all detection
    if let (Some(cass), Some(dse)) = (cass_conf_override, dse_conf_override) {
        return Ok(verify(cass, dse));
    }

    if let Some(home) = cassandra_home {
        if let Some(dirs) = verify_install(home) {
            return Ok(Some(dirs));
        }
    }

    if let Some(dirs) = verify(Path::new("/etc/dse/cassandra"), Path::new("/etc/dse")) {
        return Ok(Some(dirs));
    }

    Ok(verify_install(Path::new(INSTALLER_DEFAULT)))
}

/// Parses the selected configuration directories into a [`ConfigBundle`].
pub struct ConfigParser<M = PassthroughMatcher> {
    dirs: Option<ConfigDirs>,
    matcher: M,
}

impl ConfigParser<PassthroughMatcher> {
    pub fn new(dirs: Option<ConfigDirs>) -> Self {
        Self {
            dirs,
            matcher: PassthroughMatcher,
        }
    }
}

impl<M: OptionMatcher> ConfigParser<M> {
    pub fn with_matcher(dirs: Option<ConfigDirs>, matcher: M) -> Self {
        Self { dirs, matcher }
    }

    /// Parse every known configuration file. A missing directory yields an
    /// empty bundle; detection has already decided whether one exists.
    pub fn parse(&self) -> Result<ConfigBundle> {
        let mut docs = BTreeMap::new();
        let Some(dirs) = &self.dirs else {
            return Ok(ConfigBundle { docs });
        };

        parse_yaml_file(&dirs.cassandra_conf, CASSANDRA_YAML_FILENAME, &mut docs)?;
        parse_yaml_file(&dirs.dse_conf, DSE_YAML_FILENAME, &mut docs)?;
        self.parse_jvm_options(&dirs.cassandra_conf, &mut docs)?;

        Ok(ConfigBundle { docs })
    }

    /// Parse every `jvm*-server.options` file in the configuration directory.
    /// Comment lines are dropped; `-X`/`-D` flags run through the matcher.
    fn parse_jvm_options(&self, conf_dir: &Path, docs: &mut BTreeMap<String, Value>) -> Result<()> {
        let name_re = Regex::new(r"^jvm.*-server\.options$").expect("static regex");

        // Subdirectories are not processed
        let entries = match fs::read_dir(conf_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !entry.file_type()?.is_file() || !name_re.is_match(&file_name) {
                continue;
            }

            debug!(file = %file_name, "parsing jvm server options");
            let contents = fs::read_to_string(entry.path())?;
            let mut parsed = Mapping::new();
            let mut additional_options = Vec::new();

            for line in contents.lines() {
                if line.starts_with('#') || !(line.starts_with("-X") || line.starts_with("-D")) {
                    continue;
                }
                match self.matcher.parse(line) {
                    Some((key, value, default)) => {
                        if value != default {
                            parsed.insert(Value::String(key), value);
                        }
                    }
                    None => additional_options.push(Value::String(line.to_string())),
                }
            }

            if !additional_options.is_empty() {
                parsed.insert(
                    Value::String("additional-jvm-options".to_string()),
                    Value::Sequence(additional_options),
                );
            }

            docs.insert(file_name.replace('.', "-"), Value::Mapping(parsed));
        }

        Ok(())
    }
}

fn parse_yaml_file(dir: &Path, name: &str, docs: &mut BTreeMap<String, Value>) -> Result<()> {
    let path = dir.join(name);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    let doc: Value = serde_yaml::from_str(&contents)?;
    docs.insert(name.replace('.', "-"), doc);
    Ok(())
}

/// Extract the seed addresses from the cassandra.yaml `seed_provider` block
/// and strip the host-specific keys from the stored document. Returns the
/// deduplicated, sorted non-loopback seed addresses.
pub fn extract_seeds(bundle: &mut ConfigBundle) -> Result<Vec<String>> {
    let mut seeds = Vec::new();

    if let Some(doc) = bundle.docs.get_mut(CASSANDRA_YAML_KEY) {
        if let Some(yaml) = doc.as_mapping_mut() {
            if let Some(providers) = yaml.get("seed_provider").and_then(Value::as_sequence) {
                for provider in providers {
                    let params = provider
                        .get("parameters")
                        .and_then(Value::as_sequence)
                        .map(|s| s.as_slice())
                        .unwrap_or_default();
                    for param in params {
                        let Some(seed_list) = param.get("seeds") else {
                            continue;
                        };
                        let seed_list = seed_list.as_str().ok_or(Error::InvalidConfigType {
                            key: "seeds",
                            expected: "comma-delimited string",
                        })?;
                        for seed in seed_list.split(',') {
                            let addr = seed.split(':').next().unwrap_or_default().trim();
                            // Loopback is not a valid endpoint address in Kubernetes
                            if !addr.is_empty() && addr != "127.0.0.1" {
                                seeds.push(addr.to_string());
                            }
                        }
                    }
                }
            }

            // Host-specific keys, unusable cluster-wide
            for key in ["seed_provider", "listen_address", "listen_interface"] {
                yaml.remove(key);
            }
        }
    }

    seeds.sort();
    seeds.dedup();
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const CASSANDRA_YAML: &str = r#"cluster_name: 'Test Cluster'
num_tokens: 16
listen_address: 10.0.0.5
data_file_directories:
  - /var/lib/cassandra/data
commitlog_directory: /var/lib/cassandra/commitlog
saved_caches_directory: /var/lib/cassandra/saved_caches
seed_provider:
  - class_name: org.apache.cassandra.locator.SimpleSeedProvider
    parameters:
      - seeds: "127.0.0.1:7000,10.0.0.5:7000,10.0.0.6:7000"
"#;

    const DSE_YAML: &str = "authentication_options:\n  enabled: false\n";

    const JVM11_OPTIONS: &str = r#"# jvm11-server.options
# Comment line with -Xmx inside
-Xms4G
-Xmx4G
-Djdk.nio.maxCachedBufferSize=1048576
not-a-flag
"#;

    fn fixture_dirs() -> (TempDir, ConfigDirs) {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("cassandra.yaml"), CASSANDRA_YAML).unwrap();
        fs::write(tmp.path().join("dse.yaml"), DSE_YAML).unwrap();
        fs::write(tmp.path().join("jvm11-server.options"), JVM11_OPTIONS).unwrap();
        let dirs = ConfigDirs {
            cassandra_conf: tmp.path().to_path_buf(),
            dse_conf: tmp.path().to_path_buf(),
        };
        (tmp, dirs)
    }

    #[test]
    fn test_directory_detection_override() {
        let (_tmp, dirs) = fixture_dirs();
        let detected = detect_config_dirs(
            Some(&dirs.cassandra_conf),
            Some(&dirs.dse_conf),
            Some(Path::new("/nonexistent")),
        )
        .unwrap();
        assert_eq!(detected, Some(dirs));
    }

    #[test]
    fn test_directory_detection_missing() {
        let tmp = TempDir::new().unwrap();
        let detected = detect_config_dirs(Some(tmp.path()), Some(tmp.path()), None).unwrap();
        assert_eq!(detected, None);
    }

    #[test]
    fn test_parse_produces_all_documents() {
        let (_tmp, dirs) = fixture_dirs();
        let bundle = ConfigParser::new(Some(dirs)).parse().unwrap();

        assert_eq!(bundle.docs().len(), 3);
        assert!(bundle.docs().contains_key("cassandra-yaml"));
        assert!(bundle.docs().contains_key("dse-yaml"));
        assert!(bundle.docs().contains_key("jvm11-server-options"));
    }

    #[test]
    fn test_jvm_options_passthrough() {
        let (_tmp, dirs) = fixture_dirs();
        let bundle = ConfigParser::new(Some(dirs)).parse().unwrap();

        let jvm = bundle.docs()["jvm11-server-options"].as_mapping().unwrap();
        assert_eq!(jvm.len(), 1);
        let additional = jvm
            .get("additional-jvm-options")
            .and_then(Value::as_sequence)
            .unwrap();
        // Comments and non-flag lines are dropped
        assert_eq!(additional.len(), 3);
        assert_eq!(additional[0].as_str(), Some("-Xms4G"));
    }

    struct HeapMatcher;

    impl OptionMatcher for HeapMatcher {
        fn parse(&self, line: &str) -> Option<(String, Value, Value)> {
            line.strip_prefix("-Xmx").map(|v| {
                (
                    "max_heap_size".to_string(),
                    Value::String(v.to_string()),
                    Value::String("2G".to_string()),
                )
            })
        }
    }

    #[test]
    fn test_jvm_options_matched_flags() {
        let (_tmp, dirs) = fixture_dirs();
        let bundle = ConfigParser::with_matcher(Some(dirs), HeapMatcher)
            .parse()
            .unwrap();

        let jvm = bundle.docs()["jvm11-server-options"].as_mapping().unwrap();
        assert_eq!(jvm.get("max_heap_size").and_then(Value::as_str), Some("4G"));
        let additional = jvm
            .get("additional-jvm-options")
            .and_then(Value::as_sequence)
            .unwrap();
        assert_eq!(additional.len(), 2);
    }

    #[test]
    fn test_seed_extraction_and_stripping() {
        let (_tmp, dirs) = fixture_dirs();
        let mut bundle = ConfigParser::new(Some(dirs)).parse().unwrap();

        let seeds = extract_seeds(&mut bundle).unwrap();
        assert_eq!(seeds, vec!["10.0.0.5", "10.0.0.6"]);

        let yaml = bundle.cassandra_yaml().unwrap();
        assert!(!yaml.contains_key("seed_provider"));
        assert!(!yaml.contains_key("listen_address"));
        assert!(!yaml.contains_key("listen_interface"));
        // Unknown fields survive untouched
        assert_eq!(
            yaml.get("num_tokens").and_then(Value::as_u64),
            Some(16)
        );
    }

    #[test]
    fn test_seed_extraction_type_error() {
        let mut bundle = ConfigBundle::default();
        bundle.docs.insert(
            CASSANDRA_YAML_KEY.to_string(),
            serde_yaml::from_str("seed_provider:\n  - parameters:\n      - seeds: [10.0.0.5]\n")
                .unwrap(),
        );
        let err = extract_seeds(&mut bundle).unwrap_err();
        assert!(matches!(err, Error::InvalidConfigType { key: "seeds", .. }));
    }

    #[test]
    fn test_data_directory_accessors() {
        let (_tmp, dirs) = fixture_dirs();
        let bundle = ConfigParser::new(Some(dirs)).parse().unwrap();

        assert_eq!(
            bundle.data_file_directories().unwrap(),
            vec!["/var/lib/cassandra/data"]
        );
        let additional = bundle.additional_directories().unwrap();
        assert_eq!(additional.len(), 2);
        assert_eq!(
            additional.get("commitlog-directory").map(String::as_str),
            Some("/var/lib/cassandra/commitlog")
        );
        assert_eq!(bundle.listen_address().as_deref(), Some("10.0.0.5"));
        assert_eq!(bundle.listen_interface(), None);
    }

    #[test]
    fn test_missing_directory_is_empty_parse() {
        let bundle = ConfigParser::new(None).parse().unwrap();
        assert!(bundle.docs().is_empty());
        assert_eq!(bundle.data_file_directories().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_yaml_roundtrip_strings() {
        let (_tmp, dirs) = fixture_dirs();
        let mut bundle = ConfigParser::new(Some(dirs)).parse().unwrap();
        extract_seeds(&mut bundle).unwrap();

        let stored = bundle.to_yaml_strings().unwrap();
        let reloaded = ConfigBundle::from_yaml_strings(stored.iter()).unwrap();
        assert_eq!(
            reloaded.data_file_directories().unwrap(),
            vec!["/var/lib/cassandra/data"]
        );
        assert!(reloaded.cassandra_yaml().unwrap().get("seed_provider").is_none());
    }
}
