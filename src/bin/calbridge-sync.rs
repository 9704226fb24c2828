//! Runs the scheduler until Ctrl+C is pressed
//!
//! Usage: `calbridge-sync [data-folder]` (the data folder defaults to `$CALBRIDGE_DATA`, then `./calbridge-data`).
//!
//! The data folder holds `sources.json`, `credentials.json` and everything the store persists.
//! Settings are read from environment variables, see [`calbridge::config`].

use std::path::PathBuf;
use std::sync::Arc;

use calbridge::client::HttpConnector;
use calbridge::collaborators::{HttpsOnlyValidator, LogNotifier, StaticCredentialStore};
use calbridge::config::SyncSettings;
use calbridge::error::BoxError;
use calbridge::store::JsonFileStore;
use calbridge::{Scheduler, SyncEngine};

const DEFAULT_DATA_FOLDER: &str = "calbridge-data";
const CREDENTIALS_FILE: &str = "credentials.json";

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(err) = run().await {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), BoxError> {
    let folder = std::env::args_os().nth(1)
        .or_else(|| std::env::var_os("CALBRIDGE_DATA"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_FOLDER));

    let settings = SyncSettings::from_env()?;
    log::info!("Starting with data folder {:?} and {:?}", folder, settings);

    let store = Arc::new(JsonFileStore::open(&folder)?);
    let credentials = Arc::new(StaticCredentialStore::from_file(&folder.join(CREDENTIALS_FILE))?);
    let engine = SyncEngine::new(store, credentials, Arc::new(HttpsOnlyValidator), Arc::new(HttpConnector), settings);

    let scheduler = Scheduler::new(engine, Arc::new(LogNotifier));
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    log::info!("Interrupted, shutting down");
    scheduler.stop().await;
    Ok(())
}
