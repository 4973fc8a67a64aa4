//! Minimal client for the management API sidecar
//!
//! The migrated pod runs with `MGMT_API_EXPLICIT_START=true`, so the database
//! process stays stopped until the lifecycle start endpoint is called. No
//! authentication support yet, plain HTTP against the pod IP.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use reqwest::StatusCode;
use tracing::debug;

use crate::error::{Error, Result};

const MGMT_API_PORT: u16 = 8080;

pub struct ManagementClient {
    http: reqwest::Client,
}

impl ManagementClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { http })
    }

    /// Ask the management API inside `pod` to start the database process.
    pub async fn call_lifecycle_start(&self, pod: &Pod) -> Result<()> {
        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .ok_or_else(|| Error::MissingResource("pod IP for lifecycle start".to_string()))?;

        let url = format!("http://{pod_ip}:{MGMT_API_PORT}/api/v0/lifecycle/start");
        debug!(%url, "calling management API lifecycle start");

        let response = self.http.post(&url).send().await?;
        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            Ok(())
        } else {
            Err(Error::UnexpectedOutput {
                command: "management API lifecycle start".to_string(),
                reason: format!("unexpected status code {status}"),
            })
        }
    }
}
