use crate::calendar::{BusinessCalendar, CalendarService};
use crate::database::Database;
use crate::models::{Bar, DividendRecord, Event, Instrument};
use crate::search_status::SearchStatus;
use crate::store::*;
use anyhow::{anyhow, Context, Result};
use chrono::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_ALLOWED_SETTINGS: [&str; 5] = [
    "HISTORY_END_DATE",
    "HISTORY_YEARS",
    "HOLDING_DAYS",
    "STOP_LOSS_PERCENTAGES",
    "WORKER_COUNT",
];

/// Collaborators the backtest pipeline runs against.
#[derive(Clone)]
pub struct DataContext {
    pub calendar: Arc<dyn CalendarService>,
    pub market_data: Arc<dyn MarketDataStore>,
    pub dividends: Arc<dyn DividendRepository>,
    pub assets: Arc<dyn AssetRepository>,
    pub events: Arc<dyn EventRepository>,
    pub trials: Arc<dyn TrialLog>,
}

impl DataContext {
    /// Every repository backed by `store`; trials go to `trials`.
    pub fn in_memory(
        store: InMemoryStore,
        calendar: BusinessCalendar,
        trials: Arc<dyn TrialLog>,
    ) -> Self {
        Self {
            calendar: Arc::new(calendar),
            market_data: Arc::new(store.clone()),
            dividends: Arc::new(store.clone()),
            assets: Arc::new(store.clone()),
            events: Arc::new(store),
            trials,
        }
    }

    /// Every collaborator, trials included, backed by one shared store.
    pub fn shared<S>(store: Arc<S>, calendar: BusinessCalendar) -> Self
    where
        S: MarketDataStore
            + DividendRepository
            + AssetRepository
            + EventRepository
            + TrialLog
            + 'static,
    {
        Self {
            calendar: Arc::new(calendar),
            market_data: store.clone(),
            dividends: store.clone(),
            assets: store.clone(),
            events: store.clone(),
            trials: store,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    holidays: Vec<NaiveDate>,
    instruments: Vec<Instrument>,
    dividends: Vec<DividendRecord>,
    bars: Vec<Bar>,
    events: Vec<Event>,
    settings: HashMap<String, String>,
}

fn scrub_snapshot_settings(settings: &HashMap<String, String>) -> HashMap<String, String> {
    settings
        .iter()
        .filter(|(key, _)| SNAPSHOT_ALLOWED_SETTINGS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

impl MarketDataSnapshot {
    pub fn from_store(
        store: &InMemoryStore,
        calendar: &BusinessCalendar,
        settings: &HashMap<String, String>,
    ) -> Self {
        Self {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            holidays: calendar.holidays().copied().collect(),
            instruments: store.instruments(),
            dividends: store.all_records(),
            bars: store.all_bars(),
            events: store.all_events(),
            settings: scrub_snapshot_settings(settings),
        }
    }

    pub async fn load_from_database(db: &Database, status: &SearchStatus) -> Result<Self> {
        status.set_phase("Loading holidays and settings");
        let holidays = db.get_holidays().await?;
        let settings = db.get_all_settings().await?;
        status.set_phase("Loading instruments and dividend records");
        let instruments = db.get_all_instruments().await?;
        let dividends = db.get_all_dividend_records().await?;
        status.set_phase("Loading bars");
        let bars = db.get_all_bars().await?;
        let events = db.get_all_events().await?;
        info!(
            "Loaded {} instruments, {} dividend records, {} bars and {} events from database",
            instruments.len(),
            dividends.len(),
            bars.len(),
            events.len()
        );
        Ok(Self {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            holidays,
            instruments,
            dividends,
            bars,
            events,
            settings: scrub_snapshot_settings(&settings),
        })
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P, status: &SearchStatus) -> Result<Self> {
        let path = path.as_ref();
        status.set_phase(format!(
            "Loading market data snapshot from {}",
            path.display()
        ));
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot =
            bincode::deserialize_from(reader).context("Snapshot decode failed")?;

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }
        info!(
            "Loaded snapshot generated at {} ({} instruments, {} bars)",
            snapshot.generated_at.format("%Y-%m-%d %H:%M:%S"),
            snapshot.instruments.len(),
            snapshot.bars.len()
        );
        Ok(snapshot)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, self)
            .context("Failed to serialize market data snapshot")?;
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        &self.settings
    }

    /// Rebuild the in-memory store and calendar described by this snapshot.
    pub fn into_store(self) -> Result<(InMemoryStore, BusinessCalendar, HashMap<String, String>)> {
        let store = InMemoryStore::new();
        for instrument in self.instruments {
            store.insert_instrument(instrument);
        }
        store.attach_records(&self.dividends)?;
        store.insert_bars(self.bars);
        store.append_events(&self.events)?;
        Ok((store, BusinessCalendar::new(self.holidays), self.settings))
    }
}
