//! Configured sync relationships

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

pub type SourceId = String;

/// Which way events flow
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Source to destination only
    OneWay,
    /// Source to destination, then destination to source
    TwoWay,
}

impl Default for SyncDirection {
    fn default() -> Self {
        SyncDirection::OneWay
    }
}

/// Which side is kept when both sides changed the same event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    SourceWins,
    DestinationWins,
    /// The most recently modified side wins. Timestamps are compared to the second, and the source wins ties
    NewestWins,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::SourceWins
    }
}

/// One side of a reconciliation pass
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Source,
    Destination,
}

impl Side {
    pub fn other(self) -> Self {
        match self {
            Side::Source => Side::Destination,
            Side::Destination => Side::Source,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Destination => "destination",
        }
    }
}

impl ConflictStrategy {
    /// Decide which side wins when both changed the same event
    pub fn winner(self, source_modified: Option<DateTime<Utc>>, destination_modified: Option<DateTime<Utc>>) -> Side {
        match self {
            ConflictStrategy::SourceWins => Side::Source,
            ConflictStrategy::DestinationWins => Side::Destination,
            ConflictStrategy::NewestWins => match (source_modified, destination_modified) {
                (Some(src), Some(dst)) if dst.timestamp() > src.timestamp() => Side::Destination,
                (None, Some(_)) => Side::Destination,
                _ => Side::Source,
            },
        }
    }
}


/// One configured sync relationship
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    #[serde(default)]
    pub user_id: String,
    pub name: String,
    pub source_url: Url,
    pub destination_url: Url,
    /// Seconds between two scheduled runs
    pub sync_interval: u64,
    #[serde(default)]
    pub direction: SyncDirection,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}
