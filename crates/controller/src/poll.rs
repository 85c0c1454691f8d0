//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::{ControllerError, Result};

/// Call `check` every `interval` until it yields a value.
///
/// Fails with [`ControllerError::Timeout`] once `timeout` has elapsed
/// without a value. Check errors end the wait immediately.
pub(crate) async fn poll_until<T, F, Fut>(
    operation: &str,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Some(value) = check().await? {
            return Ok(value);
        }

        if start.elapsed() >= timeout {
            return Err(ControllerError::Timeout {
                operation: operation.to_string(),
                waited_secs: timeout.as_secs(),
            });
        }

        debug!(operation, attempts, "Not ready yet, retrying");
        sleep(interval).await;
    }
}
