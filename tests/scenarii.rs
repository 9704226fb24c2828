//! Fixtures shared by the sync tests
//!
//! A [`Bench`] is a source whose both ends are [`MockCalDav`] servers, persisted in a temporary [`JsonFileStore`].
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use calbridge::collaborators::{HttpsOnlyValidator, StaticCredentialStore};
use calbridge::config::SyncSettings;
use calbridge::mock::{ical_event, MockCalDav, MockConnector};
use calbridge::resource::{Credentials, SourceCredentials};
use calbridge::source::{ConflictStrategy, SyncDirection};
use calbridge::store::JsonFileStore;
use calbridge::sync_log::RunTrigger;
use calbridge::{Deadline, Source, SyncEngine, SyncRun};

pub const SOURCE_ID: &str = "work-sync";
pub const SRC_URL: &str = "https://caldav.source.example.com/dav/";
pub const DST_URL: &str = "https://caldav.destination.example.com/dav/";
/// The calendar every bench starts with on the source server
pub const SRC_CAL: &str = "/calendars/work/";
pub const CAL_NAME: &str = "Work";

pub struct Bench {
    pub engine: SyncEngine,
    pub store: Arc<JsonFileStore>,
    pub src: Arc<MockCalDav>,
    pub dst: Arc<MockCalDav>,
    _folder: tempfile::TempDir,
}

pub fn source(direction: SyncDirection, conflict_strategy: ConflictStrategy) -> Source {
    Source {
        id: SOURCE_ID.to_string(),
        user_id: "alice".to_string(),
        name: "Work calendars".to_string(),
        source_url: SRC_URL.parse().unwrap(),
        destination_url: DST_URL.parse().unwrap(),
        sync_interval: 300,
        direction,
        conflict_strategy,
        enabled: true,
    }
}

impl Bench {
    pub fn one_way() -> Self {
        Self::new(source(SyncDirection::OneWay, ConflictStrategy::SourceWins), SyncSettings::default())
    }

    pub fn two_way(conflict_strategy: ConflictStrategy) -> Self {
        Self::new(source(SyncDirection::TwoWay, conflict_strategy), SyncSettings::default())
    }

    pub fn new(source: Source, settings: SyncSettings) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let folder = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::open(folder.path()).unwrap());
        store.put_source(&source).unwrap();

        let mut credentials = StaticCredentialStore::new();
        credentials.insert(&source.id, SourceCredentials {
            source: Credentials::new("alice", "source-secret"),
            destination: Credentials::new("alice", "destination-secret"),
        });

        let src = Arc::new(MockCalDav::new());
        src.add_calendar(SRC_CAL, CAL_NAME);
        let dst = Arc::new(MockCalDav::new());
        let mut connector = MockConnector::new();
        connector.register(SRC_URL, src.clone());
        connector.register(DST_URL, dst.clone());

        let engine = SyncEngine::new(store.clone(), Arc::new(credentials), Arc::new(HttpsOnlyValidator), Arc::new(connector), settings);
        Self { engine, store, src, dst, _folder: folder }
    }

    pub async fn run(&self) -> SyncRun {
        let deadline = Deadline::after(Duration::from_secs(60));
        self.engine.sync_source(SOURCE_ID, RunTrigger::Manual, &deadline).await
    }

    /// Adds (or replaces) an event on the source calendar, stored at `<uid>.ics`
    pub fn add_source_event(&self, uid: &str, summary: &str, start: &str) -> String {
        let path = format!("{}{}.ics", SRC_CAL, uid);
        self.src.insert_resource(SRC_CAL, &path, &ical_event(uid, summary, start)).unwrap();
        path
    }

    /// The path of the calendar paired with the source calendar
    pub fn dst_cal(&self) -> String {
        self.dst.calendar_named(CAL_NAME).expect("no destination calendar")
    }

    pub fn dst_paths(&self) -> Vec<String> {
        self.dst.resource_paths(&self.dst_cal())
    }

    pub fn src_paths(&self) -> Vec<String> {
        self.src.resource_paths(SRC_CAL)
    }
}
