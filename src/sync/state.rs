//! Cursor state of a source, persisted between runs

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::event::Event;
use crate::source::Side;

/// Where a side of a calendar pair was left by the previous run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub sync_token: Option<String>,
    pub ctag: Option<String>,
}

impl Cursor {
    /// Take the cursor a `sync` call left in a calendar
    pub fn from_calendar(calendar: &Calendar) -> Self {
        Self {
            sync_token: calendar.sync_token.clone(),
            ctag: calendar.ctag.clone(),
        }
    }
}

/// One resource on one side
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub path: String,
    pub etag: String,
    pub uid: String,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ResourceRef {
    pub fn from_event(event: &Event) -> Self {
        Self {
            path: event.path().to_string(),
            etag: event.etag().to_string(),
            uid: event.uid().to_string(),
            last_modified: event.last_modified(),
        }
    }

    /// A resource this engine just wrote with the content of `event`
    pub fn written(path: &str, etag: Option<String>, event: &Event) -> Self {
        Self {
            path: path.to_string(),
            etag: etag.unwrap_or_default(),
            uid: event.uid().to_string(),
            last_modified: event.last_modified(),
        }
    }
}

/// The same event on both sides
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedEvent {
    pub source: ResourceRef,
    pub destination: ResourceRef,
}

impl MappedEvent {
    pub fn new(side: Side, this_side: ResourceRef, other_side: ResourceRef) -> Self {
        match side {
            Side::Source => Self { source: this_side, destination: other_side },
            Side::Destination => Self { source: other_side, destination: this_side },
        }
    }

    pub fn side(&self, side: Side) -> &ResourceRef {
        match side {
            Side::Source => &self.source,
            Side::Destination => &self.destination,
        }
    }

    pub fn side_mut(&mut self, side: Side) -> &mut ResourceRef {
        match side {
            Side::Source => &mut self.source,
            Side::Destination => &mut self.destination,
        }
    }
}

/// State of a source calendar and the destination calendar it is synced with
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairState {
    pub destination_path: String,
    pub source_cursor: Cursor,
    pub destination_cursor: Cursor,
    /// Keyed by the UID of the source side
    #[serde(default)]
    pub events: BTreeMap<String, MappedEvent>,
    /// Mapped events that were missing from a full listing of a side, and are waiting to be confirmed deleted
    #[serde(default)]
    pub pending_deletions: BTreeMap<String, Side>,
}

impl PairState {
    pub fn new<S: ToString>(destination_path: S) -> Self {
        Self {
            destination_path: destination_path.to_string(),
            ..Self::default()
        }
    }

    pub fn cursor(&self, side: Side) -> &Cursor {
        match side {
            Side::Source => &self.source_cursor,
            Side::Destination => &self.destination_cursor,
        }
    }

    pub fn cursor_mut(&mut self, side: Side) -> &mut Cursor {
        match side {
            Side::Source => &mut self.source_cursor,
            Side::Destination => &mut self.destination_cursor,
        }
    }

    pub fn key_by_uid(&self, side: Side, uid: &str) -> Option<String> {
        self.events.iter()
            .find(|(_, mapped)| mapped.side(side).uid == uid)
            .map(|(key, _)| key.clone())
    }

    pub fn key_by_path(&self, side: Side, path: &str) -> Option<String> {
        self.events.iter()
            .find(|(_, mapped)| mapped.side(side).path == path)
            .map(|(key, _)| key.clone())
    }

    /// Every mapped path of a side
    pub fn paths(&self, side: Side) -> BTreeSet<String> {
        self.events.values()
            .map(|mapped| mapped.side(side).path.clone())
            .collect()
    }

    /// Forget a mapped event
    pub fn remove(&mut self, key: &str) -> Option<MappedEvent> {
        self.pending_deletions.remove(key);
        self.events.remove(key)
    }
}

/// Everything a source remembers between two runs, keyed by source calendar path
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceState {
    #[serde(default)]
    pub pairs: BTreeMap<String, PairState>,
}

impl SourceState {
    pub fn mapped_event_count(&self) -> usize {
        self.pairs.values().map(|pair| pair.events.len()).sum()
    }
}
