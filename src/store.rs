use crate::frequency::FrequencyEstimate;
use crate::models::*;
use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;

pub trait MarketDataStore: Send + Sync {
    /// Resident bars for `symbol` in `[start, end]`, ordered by date.
    fn bars(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>>;
    fn ensure_backfilled(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<()>;
}

/// Vendor feed used to backfill bars that are not yet resident.
pub trait BarSource: Send + Sync {
    fn fetch_bars(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>>;
}

pub trait DividendRepository: Send + Sync {
    /// Records for `symbol`, ascending by ex-dividend date.
    fn records(&self, symbol: &str) -> Result<Vec<DividendRecord>>;
    /// Store new records, ignoring ones already known for (symbol, ex-dividend date).
    /// Returns the number of records inserted.
    fn attach_records(&self, records: &[DividendRecord]) -> Result<usize>;
}

pub trait AssetRepository: Send + Sync {
    fn get(&self, symbol: &str) -> Result<Option<Instrument>>;
    fn dividend_symbols(&self) -> Result<Vec<String>>;
    fn update_completeness(&self, symbol: &str, estimate: &FrequencyEstimate)
        -> Result<Instrument>;
}

pub trait EventRepository: Send + Sync {
    /// Built events for `symbol`, ascending by ex-dividend date.
    fn events(&self, symbol: &str) -> Result<Vec<Event>>;
    fn append_events(&self, events: &[Event]) -> Result<()>;
}

pub trait TrialLog: Send + Sync {
    fn append(&self, trial: &Trial) -> Result<()>;
    /// Last `limit` trials for `symbol`, newest first.
    fn recent(&self, symbol: &str, limit: usize) -> Result<Vec<Trial>>;
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    instruments: Arc<DashMap<String, Instrument>>,
    dividends: Arc<DashMap<String, BTreeMap<NaiveDate, DividendRecord>>>,
    bars: Arc<DashMap<String, BTreeMap<NaiveDate, Bar>>>,
    events: Arc<DashMap<String, BTreeMap<NaiveDate, Event>>>,
    trials: Arc<DashMap<String, Vec<Trial>>>,
    bar_source: Option<Arc<dyn BarSource>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bar_source(mut self, source: Arc<dyn BarSource>) -> Self {
        self.bar_source = Some(source);
        self
    }

    pub fn insert_instrument(&self, instrument: Instrument) {
        self.instruments
            .insert(instrument.symbol.clone(), instrument);
    }

    /// Insert bars, keeping the first bar seen for each (symbol, date).
    pub fn insert_bars<I: IntoIterator<Item = Bar>>(&self, bars: I) -> usize {
        let mut inserted = 0;
        for bar in bars {
            let mut entry = self.bars.entry(bar.symbol.clone()).or_default();
            if !entry.contains_key(&bar.date) {
                entry.insert(bar.date, bar);
                inserted += 1;
            }
        }
        inserted
    }

    pub fn instruments(&self) -> Vec<Instrument> {
        let mut all: Vec<Instrument> = self
            .instruments
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        all
    }

    pub fn all_records(&self) -> Vec<DividendRecord> {
        let mut all: Vec<DividendRecord> = self
            .dividends
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by(|a, b| {
            a.symbol
                .cmp(&b.symbol)
                .then(a.ex_dividend_date.cmp(&b.ex_dividend_date))
        });
        all
    }

    pub fn all_bars(&self) -> Vec<Bar> {
        let mut all: Vec<Bar> = self
            .bars
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.date.cmp(&b.date)));
        all
    }

    pub fn all_events(&self) -> Vec<Event> {
        let mut all: Vec<Event> = self
            .events
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by(|a, b| {
            a.symbol
                .cmp(&b.symbol)
                .then(a.ex_dividend_date.cmp(&b.ex_dividend_date))
        });
        all
    }
}

impl MarketDataStore for InMemoryStore {
    fn bars(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        if end < start {
            return Ok(Vec::new());
        }
        Ok(self
            .bars
            .get(symbol)
            .map(|entry| entry.range(start..=end).map(|(_, bar)| bar.clone()).collect())
            .unwrap_or_default())
    }

    fn ensure_backfilled(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<()> {
        let Some(source) = self.bar_source.as_ref() else {
            debug!(
                "No bar source configured; skipping backfill for {} {} - {}",
                symbol, start, end
            );
            return Ok(());
        };
        let fetched = source
            .fetch_bars(symbol, start, end)
            .with_context(|| format!("failed to backfill bars for {}", symbol))?;
        let inserted = self.insert_bars(
            fetched
                .into_iter()
                .filter(|bar| bar.symbol == symbol && bar.date >= start && bar.date <= end),
        );
        debug!(
            "Backfilled {} bar(s) for {} {} - {}",
            inserted, symbol, start, end
        );
        Ok(())
    }
}

impl DividendRepository for InMemoryStore {
    fn records(&self, symbol: &str) -> Result<Vec<DividendRecord>> {
        Ok(self
            .dividends
            .get(symbol)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default())
    }

    fn attach_records(&self, records: &[DividendRecord]) -> Result<usize> {
        let mut inserted = 0;
        for record in records {
            {
                let mut entry = self.dividends.entry(record.symbol.clone()).or_default();
                if entry.contains_key(&record.ex_dividend_date) {
                    continue;
                }
                entry.insert(record.ex_dividend_date, record.clone());
            }
            inserted += 1;
            self.instruments
                .entry(record.symbol.clone())
                .or_insert_with(|| Instrument::new(record.symbol.clone(), None))
                .dividend = true;
        }
        Ok(inserted)
    }
}

impl AssetRepository for InMemoryStore {
    fn get(&self, symbol: &str) -> Result<Option<Instrument>> {
        Ok(self.instruments.get(symbol).map(|entry| entry.clone()))
    }

    fn dividend_symbols(&self) -> Result<Vec<String>> {
        let mut symbols: Vec<String> = self
            .instruments
            .iter()
            .filter(|entry| entry.dividend)
            .map(|entry| entry.key().clone())
            .collect();
        symbols.sort();
        Ok(symbols)
    }

    fn update_completeness(
        &self,
        symbol: &str,
        estimate: &FrequencyEstimate,
    ) -> Result<Instrument> {
        let mut entry = self
            .instruments
            .get_mut(symbol)
            .ok_or_else(|| anyhow!("Unknown instrument {}", symbol))?;
        entry.frequency = estimate.frequency;
        entry.expected_events = estimate.expected_events;
        entry.completeness = estimate.completeness;
        Ok(entry.clone())
    }
}

impl EventRepository for InMemoryStore {
    fn events(&self, symbol: &str) -> Result<Vec<Event>> {
        Ok(self
            .events
            .get(symbol)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default())
    }

    fn append_events(&self, events: &[Event]) -> Result<()> {
        for event in events {
            self.events
                .entry(event.symbol.clone())
                .or_default()
                .entry(event.ex_dividend_date)
                .or_insert_with(|| event.clone());
        }
        Ok(())
    }
}

impl TrialLog for InMemoryStore {
    fn append(&self, trial: &Trial) -> Result<()> {
        self.trials
            .entry(trial.symbol.clone())
            .or_default()
            .push(trial.clone());
        Ok(())
    }

    fn recent(&self, symbol: &str, limit: usize) -> Result<Vec<Trial>> {
        Ok(self
            .trials
            .get(symbol)
            .map(|entry| entry.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

/// Trial log persisted as one JSON document per line. Every append is synced
/// before returning so a crashed search resumes from the last accepted trial.
pub struct JsonlTrialLog {
    path: PathBuf,
    file: Mutex<File>,
    index: InMemoryStore,
}

impl JsonlTrialLog {
    /// Open (or create) the log at `path` and index the trials already in it.
    /// A torn final line left by an interrupted append is dropped from the file;
    /// an unreadable line anywhere else is an error.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let index = InMemoryStore::new();
        let mut needs_newline = false;
        if path.exists() {
            let contents = fs::read(&path)
                .with_context(|| format!("failed to open trial log {}", path.display()))?;
            let kept = load_trials(&path, &contents, &index)?;
            if kept < contents.len() {
                OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .and_then(|file| {
                        file.set_len(kept as u64)?;
                        file.sync_data()
                    })
                    .with_context(|| format!("failed to truncate trial log {}", path.display()))?;
            }
            needs_newline = kept > 0 && contents[kept - 1] != b'\n';
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open trial log {}", path.display()))?;
        if needs_newline {
            writeln!(file)?;
            file.sync_data()?;
        }
        Ok(Self {
            path,
            file: Mutex::new(file),
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Index every trial in `contents` and return how many leading bytes to keep.
fn load_trials(path: &Path, contents: &[u8], index: &InMemoryStore) -> Result<usize> {
    let lines: Vec<&[u8]> = contents.split_inclusive(|byte| *byte == b'\n').collect();
    let mut kept = 0usize;
    for (line_number, line) in lines.iter().enumerate() {
        let parsed = std::str::from_utf8(line)
            .map_err(anyhow::Error::from)
            .and_then(|text| match text.trim() {
                "" => Ok(None),
                text => serde_json::from_str::<Trial>(text)
                    .map(Some)
                    .map_err(anyhow::Error::from),
            });
        match parsed {
            Ok(trial) => {
                if let Some(trial) = trial {
                    index.append(&trial)?;
                }
                kept += line.len();
            }
            Err(err) if line_number + 1 == lines.len() => {
                warn!(
                    "Dropping incomplete trial on line {} of {}: {}",
                    line_number + 1,
                    path.display(),
                    err
                );
            }
            Err(err) => {
                return Err(err.context(format!(
                    "invalid trial on line {} of {}",
                    line_number + 1,
                    path.display()
                )));
            }
        }
    }
    Ok(kept)
}

impl TrialLog for JsonlTrialLog {
    fn append(&self, trial: &Trial) -> Result<()> {
        let line = serde_json::to_string(trial)?;
        {
            let mut file = self
                .file
                .lock()
                .map_err(|_| anyhow!("trial log lock poisoned"))?;
            writeln!(file, "{}", line)?;
            file.flush()?;
            file.sync_data()?;
        }
        self.index.append(trial)
    }

    fn recent(&self, symbol: &str, limit: usize) -> Result<Vec<Trial>> {
        self.index.recent(symbol, limit)
    }
}
