//! Lease-based mutual exclusion for migration runs
//!
//! Only one migration process may mutate the shared cluster state (topology
//! snapshot, seed endpoints) at a time. The lock blocks until leadership is
//! acquired and keeps renewing the lease in the background for the duration
//! of the run. Losing the lease mid-run is fatal: the process exits so the
//! operator can restart the step under a fresh election.

use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::Result;

const LEASE_NAME: &str = "cass-migrate-leader";
const LEASE_TTL: Duration = Duration::from_secs(10);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Hostname plus a fresh random suffix. Repeated invocations on the same
/// host must not be mistaken for the same holder.
fn holder_identity() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{host}_{suffix}")
}

/// Held leadership over the migration lease. Renewed in the background until
/// [`LeadershipLock::release`] is called.
pub struct LeadershipLock {
    lease: LeaseLock,
    renewal: JoinHandle<()>,
}

impl LeadershipLock {
    /// Block until this process holds the migration lease, then keep
    /// renewing it.
    pub async fn acquire(client: Client, namespace: &str) -> Result<Self> {
        let holder_id = holder_identity();
        info!(%holder_id, namespace, lease = LEASE_NAME, "waiting to acquire migration lease");

        let params = || LeaseLockParams {
            holder_id: holder_id.clone(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: LEASE_TTL,
        };
        let lease = LeaseLock::new(client.clone(), namespace, params());

        loop {
            match lease.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    info!(%holder_id, "acquired migration lease");
                    break;
                }
                Ok(_) => {
                    info!("another migration holds the lease, waiting");
                }
                Err(err) => {
                    warn!(error = %err, "failed to acquire lease, retrying");
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }

        let renewal_lease = LeaseLock::new(client, namespace, params());
        let renewal = tokio::spawn(async move {
            loop {
                tokio::time::sleep(RENEW_INTERVAL).await;

                match renewal_lease.try_acquire_or_renew().await {
                    Ok(result) if result.acquired_lease => {}
                    Ok(_) => {
                        error!("lost the migration lease mid-run, aborting");
                        std::process::exit(1);
                    }
                    Err(err) => {
                        error!(error = %err, "failed to renew the migration lease, aborting");
                        std::process::exit(1);
                    }
                }
            }
        });

        Ok(Self { lease, renewal })
    }

    /// Stop renewing and hand the lease back.
    pub async fn release(self) -> Result<()> {
        self.renewal.abort();
        if let Err(err) = self.lease.step_down().await {
            // The lease expires on its own; a failed step-down only delays
            // the next acquirer
            warn!(error = %err, "failed to step down from the migration lease");
        }
        info!("released migration lease");
        Ok(())
    }
}
