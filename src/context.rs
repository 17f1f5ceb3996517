use crate::calendar::BusinessCalendar;
use crate::data_context::{DataContext, MarketDataSnapshot};
use crate::database::Database;
use crate::pg_store::PgStore;
use crate::search_status::SearchStatus;
use crate::store::{InMemoryStore, JsonlTrialLog};
use anyhow::{anyhow, Result};
use log::info;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;

#[derive(Clone)]
pub struct AppContext {
    database_url: Option<String>,
}

impl AppContext {
    pub async fn initialize(database_url: Option<String>) -> Result<Self> {
        Ok(Self { database_url })
    }

    pub async fn database(&self) -> Result<Database> {
        let Some(database_url) = self.database_url.as_deref() else {
            return Err(anyhow!(
                "DATABASE_URL must be set to use database-backed engine commands."
            ));
        };
        let db = Database::new(database_url).await?;
        db.ensure_schema().await?;
        Ok(db)
    }

    /// Offline context over a snapshot file when one is given, otherwise the database.
    pub async fn engine_context(
        &self,
        data_file: Option<&Path>,
        trial_log: Option<&Path>,
    ) -> Result<EngineContext> {
        match data_file {
            Some(path) => EngineContext::from_snapshot_file(path, trial_log),
            None => {
                let db = self.database().await?;
                EngineContext::from_database(db).await
            }
        }
    }
}

/// Offline state that has to be written back once a command finishes.
struct SnapshotBacking {
    path: PathBuf,
    store: InMemoryStore,
    calendar: BusinessCalendar,
}

pub struct EngineContext {
    data: DataContext,
    settings: HashMap<String, String>,
    status: SearchStatus,
    snapshot: Option<SnapshotBacking>,
}

impl EngineContext {
    pub fn from_snapshot_file(data_file: &Path, trial_log: Option<&Path>) -> Result<Self> {
        let status = SearchStatus::new();
        let snapshot = MarketDataSnapshot::load_from_file(data_file, &status)?;
        let (store, calendar, settings) = snapshot.into_store()?;

        let trial_log_path = trial_log
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_trial_log_path(data_file));
        let trials = JsonlTrialLog::open(&trial_log_path)?;
        info!("Appending trials to {}", trials.path().display());

        let data = DataContext::in_memory(store.clone(), calendar.clone(), Arc::new(trials));
        status.set_phase("Idle");
        Ok(Self {
            data,
            settings,
            status,
            snapshot: Some(SnapshotBacking {
                path: data_file.to_path_buf(),
                store,
                calendar,
            }),
        })
    }

    /// Must be called from within the runtime; the returned collaborators block
    /// on it and may only be used from blocking threads.
    pub async fn from_database(db: Database) -> Result<Self> {
        let status = SearchStatus::new();
        status.set_phase("Loading settings and holidays");
        let settings = db.get_all_settings().await?;
        let calendar = BusinessCalendar::new(db.get_holidays().await?);
        let store = Arc::new(PgStore::new(db, Handle::current()));
        status.set_phase("Idle");
        Ok(Self {
            data: DataContext::shared(store, calendar),
            settings,
            status,
            snapshot: None,
        })
    }

    pub fn data_context(&self) -> DataContext {
        self.data.clone()
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        &self.settings
    }

    pub fn status_handle(&self) -> SearchStatus {
        self.status.clone()
    }

    /// Write offline changes (events, completeness, imported records) back to
    /// the snapshot file. No-op for database-backed contexts.
    pub fn persist(&self) -> Result<()> {
        let Some(backing) = self.snapshot.as_ref() else {
            return Ok(());
        };
        MarketDataSnapshot::from_store(&backing.store, &backing.calendar, &self.settings)
            .save_to_file(&backing.path)?;
        info!("Market data snapshot updated at {}", backing.path.display());
        Ok(())
    }
}

fn default_trial_log_path(data_file: &Path) -> PathBuf {
    let mut name = data_file
        .file_stem()
        .map(|stem| stem.to_os_string())
        .unwrap_or_default();
    name.push(".trials.jsonl");
    data_file.with_file_name(name)
}
