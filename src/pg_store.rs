use crate::database::Database;
use crate::frequency::FrequencyEstimate;
use crate::models::*;
use crate::retry::retry_db_operation;
use crate::store::*;
use anyhow::Result;
use chrono::NaiveDate;
use log::debug;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Mutex;

/// Blocking adapter over [`Database`] for the synchronous repository traits.
/// Must be called from threads outside the async runtime (worker threads or
/// `spawn_blocking`).
pub struct PgStore {
    db: Mutex<Database>,
    handle: Handle,
    bar_source: Option<Arc<dyn BarSource>>,
}

impl PgStore {
    pub fn new(db: Database, handle: Handle) -> Self {
        Self {
            db: Mutex::new(db),
            handle,
            bar_source: None,
        }
    }

    pub fn with_bar_source(mut self, source: Arc<dyn BarSource>) -> Self {
        self.bar_source = Some(source);
        self
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

impl MarketDataStore for PgStore {
    fn bars(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        if end < start {
            return Ok(Vec::new());
        }
        self.block_on(async {
            let db = self.db.lock().await;
            retry_db_operation!(
                format!("loading bars for {}", symbol),
                db.get_bars(symbol, start, end)
            )
        })
    }

    fn ensure_backfilled(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<()> {
        let Some(source) = self.bar_source.as_ref() else {
            debug!(
                "No bar source configured; skipping backfill for {} {} - {}",
                symbol, start, end
            );
            return Ok(());
        };
        let fetched: Vec<Bar> = source
            .fetch_bars(symbol, start, end)?
            .into_iter()
            .filter(|bar| bar.symbol == symbol && bar.date >= start && bar.date <= end)
            .collect();
        let inserted = self.block_on(async {
            let mut db = self.db.lock().await;
            retry_db_operation!(
                format!("storing backfilled bars for {}", symbol),
                db.insert_bars(&fetched)
            )
        })?;
        debug!(
            "Backfilled {} bar(s) for {} {} - {}",
            inserted, symbol, start, end
        );
        Ok(())
    }
}

impl DividendRepository for PgStore {
    fn records(&self, symbol: &str) -> Result<Vec<DividendRecord>> {
        self.block_on(async {
            let db = self.db.lock().await;
            retry_db_operation!(
                format!("loading dividends for {}", symbol),
                db.get_dividend_records(symbol)
            )
        })
    }

    fn attach_records(&self, records: &[DividendRecord]) -> Result<usize> {
        self.block_on(async {
            let mut db = self.db.lock().await;
            retry_db_operation!("attaching dividend records", db.insert_dividend_records(records))
        })
    }
}

impl AssetRepository for PgStore {
    fn get(&self, symbol: &str) -> Result<Option<Instrument>> {
        self.block_on(async {
            let db = self.db.lock().await;
            retry_db_operation!(
                format!("loading instrument {}", symbol),
                db.get_instrument(symbol)
            )
        })
    }

    fn dividend_symbols(&self) -> Result<Vec<String>> {
        self.block_on(async {
            let db = self.db.lock().await;
            retry_db_operation!("listing dividend instruments", db.get_dividend_symbols())
        })
    }

    fn update_completeness(
        &self,
        symbol: &str,
        estimate: &FrequencyEstimate,
    ) -> Result<Instrument> {
        self.block_on(async {
            let db = self.db.lock().await;
            retry_db_operation!(
                format!("updating completeness for {}", symbol),
                db.update_instrument_completeness(
                    symbol,
                    estimate.frequency,
                    estimate.expected_events,
                    estimate.completeness,
                )
            )
        })
    }
}

impl EventRepository for PgStore {
    fn events(&self, symbol: &str) -> Result<Vec<Event>> {
        self.block_on(async {
            let db = self.db.lock().await;
            retry_db_operation!(format!("loading events for {}", symbol), db.get_events(symbol))
        })
    }

    fn append_events(&self, events: &[Event]) -> Result<()> {
        self.block_on(async {
            let mut db = self.db.lock().await;
            retry_db_operation!("storing events", db.insert_events(events))
        })
    }
}

impl TrialLog for PgStore {
    fn append(&self, trial: &Trial) -> Result<()> {
        self.block_on(async {
            let db = self.db.lock().await;
            retry_db_operation!(
                format!("appending trial for {}", trial.symbol),
                db.insert_trial(trial)
            )
        })
    }

    fn recent(&self, symbol: &str, limit: usize) -> Result<Vec<Trial>> {
        self.block_on(async {
            let db = self.db.lock().await;
            retry_db_operation!(
                format!("loading recent trials for {}", symbol),
                db.get_recent_trials(symbol, limit)
            )
        })
    }
}
