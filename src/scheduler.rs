//! Runs the sync of every enabled source periodically
//!
//! Each source gets a [`Job`]: a task that waits for its interval, then spawns a run. Runs are spawned
//! tasks as well, and they hold the lock of their source for their whole duration. A manual trigger
//! takes the same lock, so that a source never syncs twice at the same time. Whoever takes the lock
//! first runs, the other one is rejected at once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::deadline::Deadline;
use crate::error::{BoxError, SchedulerError};
use crate::malformed::MalformedEventInfo;
use crate::source::SourceId;
use crate::sync::SyncEngine;
use crate::sync_log::{RunStatus, RunTrigger, SyncRun};
use crate::traits::Notifier;

/// How long a run may outlive its own deadline before it is aborted
const RUN_GRACE_PERIOD: Duration = Duration::from_secs(5);
/// How long `stop` waits for each task
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

type SourceLock = Arc<tokio::sync::Mutex<()>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The in-memory handle of the periodic sync of one source
struct Job {
    interval: watch::Sender<Duration>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Health {
    installed_at: HashMap<SourceId, DateTime<Utc>>,
    stale: HashSet<SourceId>,
}

struct Inner {
    engine: SyncEngine,
    notifier: Arc<dyn Notifier>,
    jobs: Mutex<HashMap<SourceId, Job>>,
    /// Created on first use, never removed
    sync_locks: Mutex<HashMap<SourceId, SourceLock>>,
    health: Mutex<Health>,
    shutdown: CancellationToken,
    started: AtomicBool,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

/// Owns one periodic job per enabled source
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(engine: SyncEngine, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                notifier,
                jobs: Mutex::new(HashMap::new()),
                sync_locks: Mutex::new(HashMap::new()),
                health: Mutex::new(Health::default()),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                cleanup: Mutex::new(None),
            }),
        }
    }

    /// Install a job for every enabled source, and start pruning old runs
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::Stopped);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }

        let sources = match self.inner.engine.store().enabled_sources().await {
            Ok(sources) => sources,
            Err(err) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(SchedulerError::Store(err.to_string()));
            },
        };
        for source in &sources {
            self.add_job(&source.id, source.sync_interval);
        }

        let inner = self.inner.clone();
        let cancel = self.inner.shutdown.child_token();
        let handle = tokio::spawn(async move {
            Inner::cleanup_loop(inner, cancel).await;
        });
        *lock(&self.inner.cleanup) = Some(handle);

        log::info!("Scheduler started with {} jobs", sources.len());
        Ok(())
    }

    /// Stop every job, the cleanup and the runs in flight. Calling it again does nothing
    pub async fn stop(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        log::info!("Stopping the scheduler");
        self.inner.shutdown.cancel();

        let jobs: Vec<(SourceId, Job)> = lock(&self.inner.jobs).drain().collect();
        let cleanup = lock(&self.inner.cleanup).take();
        let handles = jobs.into_iter()
            .map(|(source_id, job)| (source_id, job.handle))
            .chain(cleanup.map(|handle| ("cleanup".to_string(), handle)));

        for (name, handle) in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                log::warn!("Task {} did not stop in time, aborting it", name);
                abort.abort();
            }
        }
        log::info!("Scheduler stopped");
    }

    /// Install a periodic job for a source. If it already has one, its interval is updated instead
    pub fn add_job(&self, source_id: &str, interval_secs: u64) {
        if self.inner.shutdown.is_cancelled() {
            log::warn!("Not adding a job for {}, the scheduler is stopped", source_id);
            return;
        }
        let interval = self.inner.engine.settings().clamp_interval(interval_secs);

        let mut jobs = lock(&self.inner.jobs);
        if let Some(job) = jobs.get(source_id) {
            log::debug!("Job of {} already exists, setting its interval to {:?}", source_id, interval);
            let _ = job.interval.send(interval);
            return;
        }

        let (sender, receiver) = watch::channel(interval);
        let cancel = self.inner.shutdown.child_token();
        let inner = self.inner.clone();
        let id = source_id.to_string();
        let job_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            Inner::job_loop(inner, id, receiver, job_cancel).await;
        });

        jobs.insert(source_id.to_string(), Job { interval: sender, cancel, handle });
        lock(&self.inner.health).installed_at.insert(source_id.to_string(), Utc::now());
        log::info!("Added a job for {} every {:?}", source_id, interval);
    }

    /// Remove the job of a source. A run in flight is allowed to finish. Unknown sources are ignored
    pub fn remove_job(&self, source_id: &str) {
        match lock(&self.inner.jobs).remove(source_id) {
            Some(job) => {
                job.cancel.cancel();
                log::info!("Removed the job of {}", source_id);
            },
            None => log::debug!("No job to remove for {}", source_id),
        }
        let mut health = lock(&self.inner.health);
        health.installed_at.remove(source_id);
        health.stale.remove(source_id);
    }

    /// Change the interval of a job, starting from its next tick. Unknown sources are ignored
    pub fn update_job_interval(&self, source_id: &str, interval_secs: u64) {
        let interval = self.inner.engine.settings().clamp_interval(interval_secs);
        match lock(&self.inner.jobs).get(source_id) {
            Some(job) => {
                let _ = job.interval.send(interval);
                log::debug!("Interval of {} is now {:?}", source_id, interval);
            },
            None => log::debug!("No job to update for {}", source_id),
        }
    }

    pub fn job_count(&self) -> usize {
        lock(&self.inner.jobs).len()
    }

    /// Whether a run of this source is in flight
    pub fn is_running(&self, source_id: &str) -> bool {
        self.inner.sync_lock(source_id).try_lock().is_err()
    }

    /// Start a run now, unless one is already running for this source
    pub fn trigger_sync(&self, source_id: &str) -> Result<JoinHandle<SyncRun>, SchedulerError> {
        self.inner.spawn_run(source_id, RunTrigger::Manual)
    }

    pub async fn latest_run(&self, source_id: &str) -> Result<Option<SyncRun>, BoxError> {
        self.inner.engine.store().latest_run(source_id).await
    }

    pub async fn malformed_events(&self, source_id: &str) -> Result<Vec<MalformedEventInfo>, BoxError> {
        self.inner.engine.store().malformed_events(source_id).await
    }
}

impl Inner {
    fn sync_lock(&self, source_id: &str) -> SourceLock {
        lock(&self.sync_locks)
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn job_loop(inner: Arc<Inner>, source_id: SourceId, mut interval: watch::Receiver<Duration>, cancel: CancellationToken) {
        let mut last_tick = Instant::now();
        loop {
            let period = *interval.borrow();
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Job of {} cancelled", source_id);
                    break;
                }
                changed = interval.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(last_tick + period) => {
                    last_tick = Instant::now();
                    match inner.spawn_run(&source_id, RunTrigger::Scheduled) {
                        Ok(run) => {
                            // Panics are already turned into failed runs
                            let _ = run.await;
                        },
                        Err(SchedulerError::AlreadyRunning(_)) => {
                            log::info!("Skipping a scheduled sync of {}, another one is running", source_id);
                        },
                        Err(err) => {
                            log::warn!("Unable to start a scheduled sync of {}: {}", source_id, err);
                        },
                    }
                }
            }
        }
    }

    fn spawn_run(self: &Arc<Self>, source_id: &str, trigger: RunTrigger) -> Result<JoinHandle<SyncRun>, SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::Stopped);
        }
        let guard = self.sync_lock(source_id)
            .try_lock_owned()
            .map_err(|_| SchedulerError::AlreadyRunning(source_id.to_string()))?;

        let inner = self.clone();
        let source_id = source_id.to_string();
        Ok(tokio::spawn(async move {
            let _guard = guard;
            let run = inner.execute(&source_id, trigger).await;
            inner.record(&run).await;
            run
        }))
    }

    /// Run a sync in its own task, bounded by the run timeout
    async fn execute(self: &Arc<Self>, source_id: &str, trigger: RunTrigger) -> SyncRun {
        let started_at = Utc::now();
        let timeout = self.engine.settings().sync_timeout;
        let deadline = Deadline::with_cancellation(timeout, self.shutdown.child_token());

        let inner = self.clone();
        let id = source_id.to_string();
        let run_deadline = deadline.clone();
        let mut task = tokio::spawn(async move {
            inner.engine.sync_source(&id, trigger, &run_deadline).await
        });

        match tokio::time::timeout(timeout + RUN_GRACE_PERIOD, &mut task).await {
            Ok(Ok(run)) => run,
            Ok(Err(join_error)) => {
                log::error!("Sync of {} crashed: {}", source_id, join_error);
                SyncRun::failed(source_id, trigger, started_at, RunStatus::Failed, format!("sync crashed: {}", join_error))
            },
            Err(_elapsed) => {
                log::error!("Sync of {} did not stop after its deadline, aborting it", source_id);
                deadline.cancel();
                task.abort();
                SyncRun::failed(source_id, trigger, started_at, RunStatus::TimedOut, "deadline exceeded")
            },
        }
    }

    /// Persist the outcome of a run, then check whether the source is stale
    async fn record(&self, run: &SyncRun) {
        let store = self.engine.store();
        if let Err(err) = store.append_run(run).await {
            log::error!("Unable to record a run of {}: {}", run.source_id, err);
        }
        if let Err(err) = store.save_malformed_events(&run.source_id, &run.malformed_events).await {
            log::error!("Unable to record the malformed events of {}: {}", run.source_id, err);
        }
        self.check_staleness(run).await;
    }

    async fn check_staleness(&self, run: &SyncRun) {
        let store = self.engine.store();
        let source = match store.source(&run.source_id).await {
            Ok(Some(source)) => source,
            _ => return,
        };
        let last_success = match store.last_success(&source.id).await {
            Ok(last_success) => last_success,
            Err(err) => {
                log::warn!("Unable to get the last success of {}: {}", source.id, err);
                return;
            },
        };

        let settings = self.engine.settings();
        let interval = settings.clamp_interval(source.sync_interval);
        let threshold = chrono::Duration::from_std(interval * settings.stale_multiplier)
            .unwrap_or_else(|_| chrono::Duration::max_value());
        let now = Utc::now();

        let (is_stale, recovered) = {
            let mut health = lock(&self.health);
            let reference = last_success.or_else(|| health.installed_at.get(&source.id).copied());
            let is_stale = match reference {
                Some(reference) => now - reference > threshold,
                None => false,
            };
            let recovered = if is_stale {
                health.stale.insert(source.id.clone());
                false
            } else {
                run.completed() && health.stale.remove(&source.id)
            };
            (is_stale, recovered)
        };

        if is_stale {
            self.notifier.source_stale(&source, last_success).await;
        } else if recovered {
            self.notifier.source_recovered(&source).await;
        }
    }

    async fn cleanup_loop(inner: Arc<Inner>, cancel: CancellationToken) {
        loop {
            inner.prune().await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Cleanup loop cancelled");
                    break;
                }
                _ = tokio::time::sleep(inner.engine.settings().cleanup_interval) => {}
            }
        }
    }

    async fn prune(&self) {
        let cutoff = Utc::now() - self.engine.settings().log_retention();
        match self.engine.store().prune_runs(cutoff).await {
            Ok(0) => log::debug!("No run older than {} to prune", cutoff),
            Ok(pruned) => log::info!("Pruned {} runs older than {}", pruned, cutoff),
            Err(err) => log::warn!("Unable to prune old runs: {}", err),
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::collaborators::{HttpsOnlyValidator, StaticCredentialStore};
    use crate::config::SyncSettings;
    use crate::mock::{ical_event, MockCalDav, MockConnector};
    use crate::mock_behaviour::MockBehaviour;
    use crate::resource::{Credentials, SourceCredentials};
    use crate::source::Source;
    use crate::store::JsonFileStore;
    use crate::traits::SyncStore;

    const SRC: &str = "https://src.example.com/dav/";
    const DST: &str = "https://dst.example.com/dav/";

    #[derive(Default)]
    struct RecordingNotifier {
        stale: Mutex<Vec<String>>,
        recovered: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        async fn source_stale(&self, source: &Source, _last_success: Option<DateTime<Utc>>) {
            self.stale.lock().unwrap().push(source.id.clone());
        }
        async fn source_recovered(&self, source: &Source) {
            self.recovered.lock().unwrap().push(source.id.clone());
        }
    }

    struct Fixture {
        scheduler: Scheduler,
        store: Arc<JsonFileStore>,
        src: Arc<MockCalDav>,
        dst: Arc<MockCalDav>,
        notifier: Arc<RecordingNotifier>,
        _folder: tempfile::TempDir,
    }

    fn source(id: &str, sync_interval: u64) -> Source {
        Source {
            id: id.to_string(),
            user_id: "user".to_string(),
            name: format!("Source {}", id),
            source_url: SRC.parse().unwrap(),
            destination_url: DST.parse().unwrap(),
            sync_interval,
            direction: Default::default(),
            conflict_strategy: Default::default(),
            enabled: true,
        }
    }

    fn fixture(sources: &[Source]) -> Fixture {
        let folder = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::open(folder.path()).unwrap());
        let mut credentials = StaticCredentialStore::new();
        for s in sources {
            store.put_source(s).unwrap();
            credentials.insert(&s.id, SourceCredentials {
                source: Credentials::new("alice", "secret"),
                destination: Credentials::new("alice", "secret"),
            });
        }

        let src = Arc::new(MockCalDav::new());
        src.add_calendar("/calendars/work/", "Work");
        src.insert_resource("/calendars/work/", "/calendars/work/u1.ics", &ical_event("u1", "Standup", "20240101T100000Z")).unwrap();
        let dst = Arc::new(MockCalDav::new());
        let mut connector = MockConnector::new();
        connector.register(SRC, src.clone());
        connector.register(DST, dst.clone());

        let settings = SyncSettings {
            min_sync_interval: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(10),
            stale_multiplier: 1,
            ..SyncSettings::default()
        };
        let engine = SyncEngine::new(store.clone(), Arc::new(credentials), Arc::new(HttpsOnlyValidator), Arc::new(connector), settings);
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = Scheduler::new(engine, notifier.clone());

        Fixture { scheduler, store, src, dst, notifier, _folder: folder }
    }

    #[tokio::test]
    async fn test_job_bookkeeping() {
        let f = fixture(&[]);
        f.scheduler.add_job("a", 60);
        f.scheduler.add_job("a", 120);
        f.scheduler.add_job("b", 1);
        assert_eq!(f.scheduler.job_count(), 2);

        f.scheduler.update_job_interval("b", 90);
        f.scheduler.update_job_interval("unknown", 90);
        f.scheduler.remove_job("a");
        f.scheduler.remove_job("a");
        f.scheduler.remove_job("unknown");
        assert_eq!(f.scheduler.job_count(), 1);

        f.scheduler.stop().await;
        assert_eq!(f.scheduler.job_count(), 0);
        f.scheduler.add_job("c", 60);
        assert_eq!(f.scheduler.job_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_runs_are_exclusive() {
        let f = fixture(&[source("s1", 300)]);
        f.src.set_behaviour(MockBehaviour { hangs: true, ..MockBehaviour::default() });

        let first = f.scheduler.trigger_sync("s1").unwrap();
        assert!(f.scheduler.is_running("s1"));
        let second = f.scheduler.trigger_sync("s1");
        assert_eq!(second.err(), Some(SchedulerError::AlreadyRunning("s1".to_string())));

        // The hung server is cut off by the run timeout
        let run = first.await.unwrap();
        assert_eq!(run.status, RunStatus::TimedOut);
        assert_eq!(run.trigger, RunTrigger::Manual);
        assert!(f.scheduler.is_running("s1") == false);
        assert_eq!(f.scheduler.latest_run("s1").await.unwrap(), Some(run));

        f.src.set_behaviour(MockBehaviour::default());
        let run = f.scheduler.trigger_sync("s1").unwrap().await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.counts.created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_tick_is_skipped_during_a_manual_run() {
        let f = fixture(&[source("s1", 30)]);
        f.src.set_behaviour(MockBehaviour { hangs: true, ..MockBehaviour::default() });
        f.scheduler.add_job("s1", 30);

        // The manual run holds the lock from 25s to its deadline at 35s, over the tick at 30s
        tokio::time::sleep(Duration::from_secs(25)).await;
        let manual = f.scheduler.trigger_sync("s1").unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(f.scheduler.is_running("s1"));

        let run = manual.await.unwrap();
        assert_eq!(run.status, RunStatus::TimedOut);
        f.src.set_behaviour(MockBehaviour::default());

        // The skipped tick is not queued behind the manual run
        tokio::time::sleep(Duration::from_secs(15)).await;
        let latest = f.scheduler.latest_run("s1").await.unwrap().unwrap();
        assert_eq!(latest.trigger, RunTrigger::Manual);
        assert!(f.scheduler.is_running("s1") == false);

        // The next tick runs as usual
        tokio::time::sleep(Duration::from_secs(11)).await;
        let latest = f.scheduler.latest_run("s1").await.unwrap().unwrap();
        assert_eq!(latest.trigger, RunTrigger::Scheduled);
        assert_eq!(latest.status, RunStatus::Success);

        f.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_runs() {
        let f = fixture(&[source("s1", 60)]);
        f.scheduler.start().await.unwrap();
        assert_eq!(f.scheduler.job_count(), 1);
        assert_eq!(f.scheduler.start().await, Err(SchedulerError::AlreadyStarted));

        // Nothing runs before the first interval elapsed
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(f.scheduler.latest_run("s1").await.unwrap(), None);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let run = f.scheduler.latest_run("s1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.trigger, RunTrigger::Scheduled);
        let calendar = f.dst.calendar_named("Work").unwrap();
        assert_eq!(f.dst.resource_paths(&calendar).len(), 1);

        f.scheduler.stop().await;
        f.scheduler.stop().await;
        assert_eq!(f.scheduler.job_count(), 0);
        assert_eq!(f.scheduler.trigger_sync("s1").err(), Some(SchedulerError::Stopped));
        assert_eq!(f.scheduler.start().await, Err(SchedulerError::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_runs_in_flight() {
        let f = fixture(&[source("s1", 30)]);
        f.src.set_behaviour(MockBehaviour { hangs: true, ..MockBehaviour::default() });
        f.scheduler.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(f.scheduler.is_running("s1"));

        f.scheduler.stop().await;
        let run = f.store.latest_run("s1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(f.scheduler.is_running("s1") == false);
    }

    #[tokio::test]
    async fn test_stale_and_recovered_notifications() {
        let f = fixture(&[source("s1", 30)]);
        let long_ago = Utc::now() - chrono::Duration::days(1);
        let mut old = SyncRun::finish("s1", RunTrigger::Scheduled, long_ago, RunStatus::Success);
        old.finished_at = long_ago;
        f.store.append_run(&old).await.unwrap();

        f.src.set_behaviour(MockBehaviour::reject_credentials());
        for _ in 0..2 {
            let run = f.scheduler.trigger_sync("s1").unwrap().await.unwrap();
            assert_eq!(run.status, RunStatus::Failed);
        }
        assert_eq!(*f.notifier.stale.lock().unwrap(), vec!["s1".to_string(), "s1".to_string()]);
        assert!(f.notifier.recovered.lock().unwrap().is_empty());

        f.src.set_behaviour(MockBehaviour::default());
        for _ in 0..2 {
            let run = f.scheduler.trigger_sync("s1").unwrap().await.unwrap();
            assert_eq!(run.status, RunStatus::Success);
        }
        assert_eq!(f.notifier.stale.lock().unwrap().len(), 2);
        assert_eq!(*f.notifier.recovered.lock().unwrap(), vec!["s1".to_string()]);
    }
}
