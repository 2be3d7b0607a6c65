//! Devices spoken to over HTTP/JSON.

pub mod dtu;
pub mod shelly;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::{DriverError, DEFAULT_TIMEOUT};

pub use dtu::{Ahoy, OpenDtu};
pub use shelly::Shelly;

/// Attempts per request before the poll counts as failed
pub const ATTEMPTS: u32 = 3;
/// Pause between attempts
pub const BACKOFF: Duration = Duration::from_secs(1);

pub fn client() -> Result<reqwest::Client, DriverError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static("bess-controller/0.3"));
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .default_headers(headers)
        .build()
        .map_err(DriverError::from)
}

/// Runs `op` up to [`ATTEMPTS`] times, sleeping `backoff` between attempts
pub async fn with_retries<T, F, Fut>(what: &'static str, backoff: Duration, mut op: F) -> Result<T, DriverError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DriverError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < ATTEMPTS => {
                debug!(what, attempt, error = %e, "request failed, retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Turns a non-success HTTP status into a transport error
pub fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DriverError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(DriverError::Transport(format!("HTTP {status} from {}", response.url())))
    }
}
