//! Async timeout helpers and default durations.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default bound for a single handshake step or connection attempt
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound for waiting on a conversation reply
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period for in-flight connections during shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `future` with a deadline, mapping expiry to `ProtocolError::Timeout`.
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

/// Like [`with_timeout_error`] but `None` waits forever.
pub async fn maybe_timeout<F, T>(future: F, duration: Option<Duration>) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match duration {
        Some(d) => with_timeout_error(future, d).await,
        None => future.await,
    }
}
