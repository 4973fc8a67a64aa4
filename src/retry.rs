//! Bounded polling for slow Kubernetes state transitions.
//!
//! All wait loops in the migration (pod startup, server readiness, datacenter
//! adoption) share the same shape: probe a condition at a fixed interval until
//! it holds or a deadline passes. This module implements that shape once.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// Poll `condition` at `interval` until it returns `Ok(true)` or `timeout`
/// elapses. The first probe runs immediately. A probe error aborts the wait;
/// exhausting the deadline returns [`Error::Timeout`] carrying `operation`.
pub async fn poll_until<F, Fut>(
    interval: Duration,
    timeout: Duration,
    operation: &str,
    mut condition: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if condition().await? {
            debug!(operation, attempt, "condition met");
            return Ok(());
        }

        if Instant::now() + interval > deadline {
            return Err(Error::Timeout {
                operation: operation.to_string(),
            });
        }

        debug!(operation, attempt, "condition not met, waiting");
        tokio::time::sleep(interval).await;
    }
}
