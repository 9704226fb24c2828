//! Error types of the sync engine

use std::error::Error;

use thiserror::Error;

/// Errors returned by the collaborator traits (persistence, credentials...)
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Errors of a single CalDAV operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalDavError {
    /// Network failure, server-side failure (5xx), expired deadline or cancellation
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// The server refused our credentials (401/403)
    #[error("authentication failed")]
    AuthFailed,
    /// The resource (or collection) does not exist
    #[error("resource not found")]
    NotFound,
    /// The server replied something we cannot make sense of
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// A calendar object that is not valid iCalendar data
    #[error("malformed content: {0}")]
    MalformedContent(String),
    /// A conditional write was refused (412), i.e. the resource changed meanwhile
    #[error("precondition failed")]
    PreconditionFailed,
}

impl CalDavError {
    /// Whether this error means talking to this server any further in this run is pointless.
    ///
    /// A connection failure only concerns the request that hit it, unless the deadline of the run is over
    pub fn is_fatal(&self) -> bool {
        matches!(self, CalDavError::AuthFailed)
    }
}

impl From<reqwest::Error> for CalDavError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
                return CalDavError::AuthFailed;
            }
        }
        CalDavError::ConnectionFailed(err.to_string())
    }
}

impl From<minidom::Error> for CalDavError {
    fn from(err: minidom::Error) -> Self {
        CalDavError::InvalidResponse(format!("unable to parse XML: {}", err))
    }
}

pub type CalDavResult<T> = Result<T, CalDavError>;


/// Errors that terminate a whole sync run early
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source {0} does not exist")]
    SourceNotFound(String),
    #[error("endpoint {url} was rejected: {reason}")]
    EndpointRejected { url: String, reason: String },
    #[error("unable to get credentials: {0}")]
    Credentials(String),
    #[error("persistence failure: {0}")]
    Store(String),
    #[error("unable to reach the {side} server: {source}")]
    Aborted { side: &'static str, source: CalDavError },
}

pub type SyncResult<T> = Result<T, SyncError>;


/// Errors returned by the [`Scheduler`](crate::scheduler::Scheduler)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Another run of the same source holds its lock
    #[error("a sync of source {0} is already running")]
    AlreadyRunning(String),
    /// `start` was called twice
    #[error("scheduler already started")]
    AlreadyStarted,
    /// The scheduler has been stopped and does not accept runs anymore
    #[error("scheduler is stopped")]
    Stopped,
    #[error("unable to load sources: {0}")]
    Store(String),
}


/// An invalid configuration value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {variable}: {reason}")]
    InvalidValue { variable: &'static str, value: String, reason: String },
    #[error("{min_variable} ({min}s) is greater than {max_variable} ({max}s)")]
    InvertedBounds { min_variable: &'static str, min: u64, max_variable: &'static str, max: u64 },
}
