use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::Result;

const ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_millis(250);

/// run an external call with bounded exponential backoff. only failures
/// classified transient are retried; everything else surfaces immediately.
pub async fn with_backoff<T, F, Fut>(what: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = BASE_DELAY;
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < ATTEMPTS => {
                warn!(what, attempt, error = %e, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
