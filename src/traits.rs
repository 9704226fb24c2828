//! Traits at the seams of the sync engine
//!
//! [`CalDavSource`] abstracts one CalDAV server, so that the reconciler runs against a real
//! [`Client`](crate::client::Client) or against a [`MockCalDav`](crate::mock::MockCalDav).
//! The other traits are the collaborators the engine consumes but does not implement itself
//! (credential storage, outbound URL policy, persistence, notifications).

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use crate::calendar::Calendar;
use crate::deadline::Deadline;
use crate::error::{BoxError, CalDavResult};
use crate::event::Event;
use crate::malformed::MalformedEventInfo;
use crate::resource::{Credentials, SourceCredentials};
use crate::source::Source;
use crate::sync::state::SourceState;
use crate::sync_log::SyncRun;


/// What changed in a calendar since its cursor
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncDelta {
    /// Events created or modified since the cursor (every event of the collection for a full resync)
    pub changed: Vec<Event>,
    /// Paths the server reported deleted. Always empty for a full resync
    pub deleted: Vec<String>,
    /// The new sync-token, if the server supports them
    pub new_token: Option<String>,
    pub ctag: Option<String>,
    /// `changed` is the complete content of the collection, not a delta
    pub full_resync: bool,
    /// For a full resync, every path present in the collection (including the malformed ones)
    pub listed_paths: Option<BTreeSet<String>>,
    /// Resources that could not be parsed
    pub malformed: Vec<MalformedEventInfo>,
}

/// The complete content of a calendar
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Listing {
    pub events: Vec<Event>,
    /// Every path found in the collection, parsable or not
    pub paths: BTreeSet<String>,
    pub malformed: Vec<MalformedEventInfo>,
}

/// Precondition of a write
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutCondition {
    /// Fail with `PreconditionFailed` if a resource already exists at this path (`If-None-Match: *`)
    CreateOnly,
    /// Fail with `PreconditionFailed` if the resource has another ETag (`If-Match`)
    IfMatch(String),
    /// Unconditional write
    Overwrite,
}


/// One CalDAV server, accessed with one set of credentials
#[async_trait]
pub trait CalDavSource: Send + Sync {
    /// Returns every calendar (able to hold events) of this account
    async fn discover(&self, deadline: &Deadline) -> CalDavResult<Vec<Calendar>>;

    /// Returns what changed since the cursor held by `calendar`.
    ///
    /// `calendar` is updated with the new cursor. A cursor the server rejects is cleared and replaced by a full listing.
    async fn sync(&self, calendar: &mut Calendar, deadline: &Deadline) -> CalDavResult<SyncDelta>;

    /// Returns every event of a calendar
    async fn list_events(&self, calendar: &Calendar, deadline: &Deadline) -> CalDavResult<Listing>;

    /// Returns a single event. Unparsable content is reported as `MalformedContent`
    async fn fetch_event(&self, calendar: &Calendar, path: &str, deadline: &Deadline) -> CalDavResult<Event>;

    /// Writes raw calendar data to `path`, and returns the new ETag (when the server tells it)
    async fn put_event(&self, calendar: &Calendar, path: &str, data: &str, condition: PutCondition, deadline: &Deadline) -> CalDavResult<Option<String>>;

    /// Deletes a resource. Deleting a resource that does not exist is not an error
    async fn delete_event(&self, calendar: &Calendar, path: &str, deadline: &Deadline) -> CalDavResult<()>;

    /// Creates a new calendar collection under the calendar home of this account
    async fn create_calendar(&self, name: &str, deadline: &Deadline) -> CalDavResult<Calendar>;
}

/// Something able to build a [`CalDavSource`] for an endpoint
pub trait CalDavConnector: Send + Sync {
    fn connect(&self, endpoint: &Url, credentials: &Credentials) -> CalDavResult<Arc<dyn CalDavSource>>;
}


/// Where the decrypted credentials of a source come from
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credentials(&self, source_id: &str) -> Result<SourceCredentials, BoxError>;
}

/// Outbound URL policy. A rejected endpoint is never contacted
pub trait UrlValidator: Send + Sync {
    /// Returns the reason of the rejection, if any
    fn validate(&self, url: &Url) -> Result<(), String>;
}

/// Persistence of sources, cursors and run history
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn source(&self, source_id: &str) -> Result<Option<Source>, BoxError>;
    async fn enabled_sources(&self) -> Result<Vec<Source>, BoxError>;

    /// Returns the cursor state of a source (the default state if it never synced)
    async fn load_state(&self, source_id: &str) -> Result<SourceState, BoxError>;
    async fn save_state(&self, source_id: &str, state: &SourceState) -> Result<(), BoxError>;

    async fn append_run(&self, run: &SyncRun) -> Result<(), BoxError>;
    async fn latest_run(&self, source_id: &str) -> Result<Option<SyncRun>, BoxError>;
    /// When the latest completed (successful or partial) run of a source finished
    async fn last_success(&self, source_id: &str) -> Result<Option<DateTime<Utc>>, BoxError>;
    /// Deletes the runs that finished before `cutoff`, and returns how many were deleted
    async fn prune_runs(&self, cutoff: DateTime<Utc>) -> Result<usize, BoxError>;

    /// Replaces the malformed events known for this source by the ones of its latest run
    async fn save_malformed_events(&self, source_id: &str, events: &[MalformedEventInfo]) -> Result<(), BoxError>;
    async fn malformed_events(&self, source_id: &str) -> Result<Vec<MalformedEventInfo>, BoxError>;
}

/// Told when a source has not synced successfully for too long, and when it recovers
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn source_stale(&self, source: &Source, last_success: Option<DateTime<Utc>>);
    async fn source_recovered(&self, source: &Source);
}

