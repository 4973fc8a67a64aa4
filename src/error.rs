//! Error types shared across the migration workflow

use thiserror::Error;

/// Error variants are grouped by origin: Kubernetes API, local process
/// execution, configuration parsing, and migration preconditions.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Nodetool exits with code 1 when it cannot reach the local JMX port.
    #[error("unable to execute nodetool against localhost")]
    NodetoolLocalhost,

    #[error("command {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("unexpected {command} output: {reason}")]
    UnexpectedOutput { command: String, reason: String },

    #[error("this node was not part of the init process")]
    NotPartOfInit,

    #[error("no data_file_directories found")]
    NoDataDirectories,

    #[error("found multiple group ids in target directories")]
    MismatchedGroupIds,

    #[error("failed to find local Kubernetes node")]
    KubeNodeNotFound,

    #[error("invalid configuration value for {key}: expected {expected}")]
    InvalidConfigType {
        key: &'static str,
        expected: &'static str,
    },

    #[error("cassandra-home was not detected")]
    InstallNotFound,

    #[error("missing {0} in the cluster")]
    MissingResource(String),

    #[error("timed out waiting for {operation}")]
    Timeout { operation: String },

    #[error("unsupported server type: {0}")]
    UnsupportedServerType(String),
}

impl Error {
    /// Whether this error is the API telling us the object already exists.
    /// Every idempotent creation path tolerates this.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 409)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 404)
    }
}

/// Whether a raw kube error is a 404. Used on `get` paths before conversion.
pub fn is_not_found_err(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Whether a raw kube error is a 409. Used on `create` paths before
/// conversion, where the error must stay borrowed inside a match guard.
pub fn is_already_exists_err(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: String::new(),
            reason: String::new(),
            code,
        }))
    }

    #[test]
    fn test_already_exists_detection() {
        assert!(api_error(409).is_already_exists());
        assert!(!api_error(404).is_already_exists());
        assert!(!Error::NotPartOfInit.is_already_exists());
    }

    #[test]
    fn test_not_found_detection() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(409).is_not_found());
    }

    #[test]
    fn test_raw_error_predicates_borrow() {
        let conflict = kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: String::new(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        });
        // The predicates take a reference so match guards keep the binding
        assert!(is_already_exists_err(&conflict));
        assert!(!is_not_found_err(&conflict));
        assert!(matches!(Error::from(conflict), Error::Kube(_)));
    }

    #[test]
    fn test_nodetool_error_message() {
        let err = Error::NodetoolLocalhost;
        assert_eq!(
            err.to_string(),
            "unable to execute nodetool against localhost"
        );
    }
}
