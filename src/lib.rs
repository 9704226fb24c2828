//! This crate keeps calendars of two CalDAV servers in sync.
//!
//! It provides a CalDAV client in the [`client`] module, that can be used as a stand-alone module.
//!
//! A [`Source`](source::Source) pairs a source server with a destination server. \
//! The [`SyncEngine`](sync::SyncEngine) runs a sync of a source: it pulls what changed on each side since the previous run
//! (using sync-tokens or CTags when the servers support them), and applies it to the other side, one way or both ways. \
//! The [`Scheduler`](scheduler::Scheduler) runs the sync of every enabled source periodically, and tells a
//! [`Notifier`](traits::Notifier) about the sources that stopped syncing.
//!
//! Every server is abstracted by the [`CalDavSource`](traits::CalDavSource) trait, so that the engine runs against a
//! real [`Client`](client::Client) as well as against a [`MockCalDav`](mock::MockCalDav).

pub mod traits;
pub mod error;
pub use error::{CalDavError, SchedulerError, SyncError};

pub mod resource;
pub mod calendar;
pub use calendar::Calendar;
mod event;
pub use event::Event;
pub mod ical;
pub mod malformed;
pub mod deadline;
pub use deadline::Deadline;

pub mod client;
pub mod mock;
pub mod mock_behaviour;

pub mod source;
pub use source::Source;
pub mod sync;
pub use sync::SyncEngine;
pub mod sync_log;
pub use sync_log::SyncRun;
pub mod scheduler;
pub use scheduler::Scheduler;

pub mod store;
pub mod collaborators;
pub mod config;
pub mod utils;
