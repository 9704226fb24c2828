//! Outcomes of sync runs, as shown to operators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::malformed::MalformedEventInfo;
use crate::source::SourceId;

/// Terminal status of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// The run completed, but some items failed or could not be parsed
    Partial,
    Failed,
    TimedOut,
}

/// What started a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    pub skipped: u32,
    pub conflicts: u32,
    pub failed: u32,
}

impl SyncCounts {
    /// How many writes (creations, updates and deletions) were applied
    pub fn writes(&self) -> u32 {
        self.created + self.updated + self.deleted
    }
}

/// Outcome of one job execution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: String,
    pub source_id: SourceId,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: RunStatus,
    pub message: Option<String>,
    pub counts: SyncCounts,
    #[serde(default)]
    pub malformed_events: Vec<MalformedEventInfo>,
}

impl SyncRun {
    /// A run that is finishing now
    pub fn finish(source_id: &str, trigger: RunTrigger, started_at: DateTime<Utc>, status: RunStatus) -> Self {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            id: uuid::Uuid::new_v4().to_hyphenated().to_string(),
            source_id: source_id.to_string(),
            trigger,
            started_at,
            finished_at,
            duration_ms,
            status,
            message: None,
            counts: SyncCounts::default(),
            malformed_events: Vec::new(),
        }
    }

    /// A run that failed before (or without) syncing anything
    pub fn failed<S: ToString>(source_id: &str, trigger: RunTrigger, started_at: DateTime<Utc>, status: RunStatus, message: S) -> Self {
        let mut run = Self::finish(source_id, trigger, started_at, status);
        run.message = Some(message.to_string());
        run
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// The run went through every calendar, even if some items failed
    pub fn completed(&self) -> bool {
        matches!(self.status, RunStatus::Success | RunStatus::Partial)
    }
}
