//! Bounds every network call of a run in time, and lets the scheduler cancel it

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CalDavError, CalDavResult};

/// The point in time a run must be over by, plus a token to cancel it earlier
#[derive(Clone, Debug)]
pub struct Deadline {
    at: Instant,
    cancel: CancellationToken,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self::with_cancellation(timeout, CancellationToken::new())
    }

    pub fn with_cancellation(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { at: Instant::now() + timeout, cancel }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel()
    }

    /// Run a network operation, failing with `ConnectionFailed` as soon as the deadline expires or the run is cancelled
    pub async fn run<T, F>(&self, operation: F) -> CalDavResult<T>
    where
        F: Future<Output = CalDavResult<T>>,
    {
        if self.is_cancelled() {
            return Err(CalDavError::ConnectionFailed("operation cancelled".to_string()));
        }
        if self.is_expired() {
            return Err(CalDavError::ConnectionFailed("deadline exceeded".to_string()));
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CalDavError::ConnectionFailed("operation cancelled".to_string())),
            res = tokio::time::timeout_at(self.at, operation) => match res {
                Ok(inner) => inner,
                Err(_elapsed) => Err(CalDavError::ConnectionFailed("deadline exceeded".to_string())),
            },
        }
    }
}
