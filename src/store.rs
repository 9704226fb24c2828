//! Persistence of sources, cursor states and run history in a folder of JSON files
//!
//! ```text
//! <folder>/sources.json           every configured source
//! <folder>/runs.json              the run history
//! <folder>/state/<source>.json    cursors and UID maps of a source
//! <folder>/malformed/<source>.json malformed events seen by the latest run of a source
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BoxError;
use crate::malformed::MalformedEventInfo;
use crate::source::Source;
use crate::sync::state::SourceState;
use crate::sync_log::SyncRun;
use crate::traits::SyncStore;

const SOURCES_FILE: &str = "sources.json";
const RUNS_FILE: &str = "runs.json";
const STATE_FOLDER: &str = "state";
const MALFORMED_FOLDER: &str = "malformed";

/// A [`SyncStore`] backed by JSON files
#[derive(Debug)]
pub struct JsonFileStore {
    folder: PathBuf,
    /// Serializes every read-modify-write of the files
    io_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (and create if needed) a store in a folder
    pub fn open(folder: &Path) -> Result<Self, BoxError> {
        std::fs::create_dir_all(folder.join(STATE_FOLDER))
            .map_err(|err| format!("Unable to create {:?}: {}", folder, err))?;
        std::fs::create_dir_all(folder.join(MALFORMED_FOLDER))
            .map_err(|err| format!("Unable to create {:?}: {}", folder, err))?;

        Ok(Self {
            folder: PathBuf::from(folder),
            io_lock: Mutex::new(()),
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.io_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn source_file(&self, subfolder: &str, source_id: &str) -> PathBuf {
        let name = sanitize_filename::sanitize(source_id);
        self.folder.join(subfolder).join(format!("{}.json", name))
    }

    /// Adds a source, or replaces the source with the same ID
    pub fn put_source(&self, source: &Source) -> Result<(), BoxError> {
        let _guard = self.lock();
        let path = self.folder.join(SOURCES_FILE);
        let mut sources: Vec<Source> = read_or_default(&path)?;
        sources.retain(|s| s.id != source.id);
        sources.push(source.clone());
        write_file(&path, &sources)
    }

    /// Removes a source and everything known about it
    pub fn remove_source(&self, source_id: &str) -> Result<(), BoxError> {
        let _guard = self.lock();
        let path = self.folder.join(SOURCES_FILE);
        let mut sources: Vec<Source> = read_or_default(&path)?;
        sources.retain(|s| s.id != source_id);
        write_file(&path, &sources)?;

        for file in [self.source_file(STATE_FOLDER, source_id), self.source_file(MALFORMED_FOLDER, source_id)] {
            if let Err(err) = std::fs::remove_file(&file) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Unable to remove {:?}: {}", file, err);
                }
            }
        }
        Ok(())
    }

    fn runs(&self) -> Result<Vec<SyncRun>, BoxError> {
        read_or_default(&self.folder.join(RUNS_FILE))
    }
}

/// Reads a JSON file, or returns the default value if it does not exist yet
fn read_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, BoxError> {
    match std::fs::File::open(path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(format!("Unable to open file {:?}: {}", path, err).into()),
        Ok(file) => Ok(serde_json::from_reader(std::io::BufReader::new(file))?),
    }
}

/// Writes a JSON file, through a temporary file so that a crash never leaves a truncated file
fn write_file<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<(), BoxError> {
    let tmp_path = path.with_extension("json.tmp");
    let file = std::fs::File::create(&tmp_path)
        .map_err(|err| format!("Unable to save file {:?}: {}", tmp_path, err))?;
    serde_json::to_writer(std::io::BufWriter::new(file), data)?;
    std::fs::rename(&tmp_path, path)
        .map_err(|err| format!("Unable to save file {:?}: {}", path, err))?;
    Ok(())
}

#[async_trait]
impl SyncStore for JsonFileStore {
    async fn source(&self, source_id: &str) -> Result<Option<Source>, BoxError> {
        let _guard = self.lock();
        let sources: Vec<Source> = read_or_default(&self.folder.join(SOURCES_FILE))?;
        Ok(sources.into_iter().find(|s| s.id == source_id))
    }

    async fn enabled_sources(&self) -> Result<Vec<Source>, BoxError> {
        let _guard = self.lock();
        let sources: Vec<Source> = read_or_default(&self.folder.join(SOURCES_FILE))?;
        Ok(sources.into_iter().filter(|s| s.enabled).collect())
    }

    async fn load_state(&self, source_id: &str) -> Result<SourceState, BoxError> {
        let _guard = self.lock();
        read_or_default(&self.source_file(STATE_FOLDER, source_id))
    }

    async fn save_state(&self, source_id: &str, state: &SourceState) -> Result<(), BoxError> {
        let _guard = self.lock();
        write_file(&self.source_file(STATE_FOLDER, source_id), state)
    }

    async fn append_run(&self, run: &SyncRun) -> Result<(), BoxError> {
        let _guard = self.lock();
        let mut runs = self.runs()?;
        runs.push(run.clone());
        write_file(&self.folder.join(RUNS_FILE), &runs)
    }

    async fn latest_run(&self, source_id: &str) -> Result<Option<SyncRun>, BoxError> {
        let _guard = self.lock();
        Ok(self.runs()?
            .into_iter()
            .filter(|run| run.source_id == source_id)
            .max_by_key(|run| run.finished_at))
    }

    async fn last_success(&self, source_id: &str) -> Result<Option<DateTime<Utc>>, BoxError> {
        let _guard = self.lock();
        Ok(self.runs()?
            .iter()
            .filter(|run| run.source_id == source_id && run.completed())
            .map(|run| run.finished_at)
            .max())
    }

    async fn prune_runs(&self, cutoff: DateTime<Utc>) -> Result<usize, BoxError> {
        let _guard = self.lock();
        let mut runs = self.runs()?;
        let before = runs.len();
        runs.retain(|run| run.finished_at >= cutoff);
        let pruned = before - runs.len();
        if pruned > 0 {
            write_file(&self.folder.join(RUNS_FILE), &runs)?;
        }
        Ok(pruned)
    }

    async fn save_malformed_events(&self, source_id: &str, events: &[MalformedEventInfo]) -> Result<(), BoxError> {
        let _guard = self.lock();
        write_file(&self.source_file(MALFORMED_FOLDER, source_id), events)
    }

    async fn malformed_events(&self, source_id: &str) -> Result<Vec<MalformedEventInfo>, BoxError> {
        let _guard = self.lock();
        read_or_default(&self.source_file(MALFORMED_FOLDER, source_id))
    }
}
