//! This module runs the sync of a source
//!
//! [`SyncEngine::sync_source`] does everything a run needs: it loads the source and its state, checks its
//! endpoints, connects to both servers, reconciles their calendars and persists the resulting state.

use std::sync::Arc;

use chrono::Utc;

use crate::config::SyncSettings;
use crate::deadline::Deadline;
use crate::error::{SyncError, SyncResult};
use crate::resource::SourceCredentials;
use crate::source::Source;
use crate::sync_log::{RunStatus, RunTrigger, SyncRun};
use crate::traits::{CalDavConnector, CalDavSource, CredentialStore, SyncStore, UrlValidator};

pub mod reconciler;
pub mod state;
pub mod sync_progress;

use reconciler::Reconciler;
use sync_progress::SyncProgress;

/// Everything that is needed to sync sources
pub struct SyncEngine {
    store: Arc<dyn SyncStore>,
    credentials: Arc<dyn CredentialStore>,
    validator: Arc<dyn UrlValidator>,
    connector: Arc<dyn CalDavConnector>,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn SyncStore>,
        credentials: Arc<dyn CredentialStore>,
        validator: Arc<dyn UrlValidator>,
        connector: Arc<dyn CalDavConnector>,
        settings: SyncSettings,
    ) -> Self {
        Self { store, credentials, validator, connector, settings }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    /// Run a sync of a source. Failures are reported in the returned run, never as an error
    pub async fn sync_source(&self, source_id: &str, trigger: RunTrigger, deadline: &Deadline) -> SyncRun {
        self.sync_source_with_progress(source_id, trigger, deadline, SyncProgress::new()).await
    }

    /// Same as [`Self::sync_source`], with a caller-supplied progress tracker (that may hold a feedback channel)
    pub async fn sync_source_with_progress(&self, source_id: &str, trigger: RunTrigger, deadline: &Deadline, mut progress: SyncProgress) -> SyncRun {
        let started_at = Utc::now();

        let result = self.run(source_id, deadline, &mut progress).await;

        let status = match &result {
            Ok(()) if progress.is_success() => RunStatus::Success,
            Ok(()) => RunStatus::Partial,
            Err(_) if deadline.is_expired() => RunStatus::TimedOut,
            Err(_) => RunStatus::Failed,
        };
        let (counts, malformed) = progress.into_parts();

        let mut run = SyncRun::finish(source_id, trigger, started_at, status);
        run.counts = counts;
        run.malformed_events = malformed.into_events();
        match result {
            Err(err) => {
                log::error!("Sync of source {} failed: {}", source_id, err);
                run.message = Some(err.to_string());
            },
            Ok(()) => {
                log::info!(
                    "Sync of source {} finished ({:?}): {} created, {} updated, {} deleted, {} skipped, {} conflicts, {} failed, {} malformed",
                    source_id, run.status, counts.created, counts.updated, counts.deleted, counts.skipped, counts.conflicts, counts.failed, run.malformed_events.len(),
                );
            },
        }
        run
    }

    async fn run(&self, source_id: &str, deadline: &Deadline, progress: &mut SyncProgress) -> SyncResult<()> {
        let source = self.store.source(source_id).await
            .map_err(|err| SyncError::Store(err.to_string()))?
            .ok_or_else(|| SyncError::SourceNotFound(source_id.to_string()))?;

        for url in [&source.source_url, &source.destination_url] {
            self.validator.validate(url).map_err(|reason| SyncError::EndpointRejected {
                url: url.to_string(),
                reason,
            })?;
        }

        let credentials = self.credentials.credentials(source_id).await
            .map_err(|err| SyncError::Credentials(err.to_string()))?;
        let (src, dst) = self.connect(&source, &credentials)?;

        let mut state = self.store.load_state(source_id).await
            .map_err(|err| SyncError::Store(err.to_string()))?;

        let result = Reconciler::new(&source, src.as_ref(), dst.as_ref(), &self.settings, deadline, progress)
            .run(&mut state)
            .await;

        // Even an aborted run may have written things
        if let Err(err) = self.store.save_state(source_id, &state).await {
            log::error!("Unable to save the state of source {}: {}", source_id, err);
            result?;
            return Err(SyncError::Store(err.to_string()));
        }
        result
    }

    fn connect(&self, source: &Source, credentials: &SourceCredentials)
        -> SyncResult<(Arc<dyn CalDavSource>, Arc<dyn CalDavSource>)>
    {
        let src = self.connector.connect(&source.source_url, &credentials.source)
            .map_err(|err| SyncError::Aborted { side: "source", source: err })?;
        let dst = self.connector.connect(&source.destination_url, &credentials.destination)
            .map_err(|err| SyncError::Aborted { side: "destination", source: err })?;
        Ok((src, dst))
    }
}
