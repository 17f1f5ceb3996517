use crate::batch::{InstrumentOutcome, InstrumentReport};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// Live view of a batch run, shared by the driver, its workers and the command
/// that started it.
#[derive(Clone, Default)]
pub struct SearchStatus {
    inner: Arc<Mutex<SearchStatusData>>,
}

#[derive(Default)]
struct SearchStatusData {
    phase: String,
    total_instruments: usize,
    in_flight: BTreeSet<String>,
    outcomes: BTreeMap<&'static str, usize>,
    trials_run: usize,
    events_evaluated: usize,
    best: Option<BestResult>,
}

/// Highest portion to risk reached by any instrument in the batch.
#[derive(Clone, Debug, PartialEq)]
pub struct BestResult {
    pub symbol: String,
    pub multiplier: f64,
    pub stop_loss: f64,
    pub portion_to_risk: f64,
}

#[derive(Clone, Debug)]
pub struct SearchStatusSnapshot {
    pub phase: String,
    pub total_instruments: usize,
    pub completed_instruments: usize,
    /// Symbols currently held by a worker, sorted.
    pub in_flight: Vec<String>,
    /// Finished instruments per outcome kind.
    pub outcomes: BTreeMap<&'static str, usize>,
    pub trials_run: usize,
    pub events_evaluated: usize,
    pub best: Option<BestResult>,
}

impl SearchStatusSnapshot {
    pub fn failed_instruments(&self) -> usize {
        let succeeded = self.outcomes.get("success").copied().unwrap_or(0);
        self.completed_instruments - succeeded
    }
}

impl SearchStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SearchStatusData {
                phase: "Initializing".to_string(),
                ..Default::default()
            })),
        }
    }

    pub fn set_phase<S: Into<String>>(&self, phase: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = phase.into();
        }
    }

    /// Reset the counters for a batch of `total` instruments.
    pub fn begin_batch(&self, total: usize) {
        if let Ok(mut data) = self.inner.lock() {
            data.total_instruments = total;
            data.in_flight.clear();
            data.outcomes.clear();
            data.trials_run = 0;
            data.events_evaluated = 0;
            data.best = None;
        }
    }

    pub fn instrument_started(&self, symbol: &str) {
        if let Ok(mut data) = self.inner.lock() {
            data.in_flight.insert(symbol.to_string());
        }
    }

    pub fn instrument_finished(&self, report: &InstrumentReport) {
        let Ok(mut data) = self.inner.lock() else {
            return;
        };
        data.in_flight.remove(&report.symbol);
        *data.outcomes.entry(report.outcome.kind()).or_insert(0) += 1;

        let InstrumentOutcome::Success {
            final_trial,
            trials_run,
            events,
        } = &report.outcome
        else {
            return;
        };
        data.trials_run += trials_run;
        data.events_evaluated += events;
        if let Some(trial) = final_trial {
            let improves = data
                .best
                .as_ref()
                .map_or(true, |best| trial.portion_to_risk > best.portion_to_risk);
            if improves {
                data.best = Some(BestResult {
                    symbol: trial.symbol.clone(),
                    multiplier: trial.multiplier,
                    stop_loss: trial.stop_loss,
                    portion_to_risk: trial.portion_to_risk,
                });
            }
        }
    }

    pub fn snapshot(&self) -> SearchStatusSnapshot {
        if let Ok(data) = self.inner.lock() {
            SearchStatusSnapshot {
                phase: data.phase.clone(),
                total_instruments: data.total_instruments,
                completed_instruments: data.outcomes.values().sum(),
                in_flight: data.in_flight.iter().cloned().collect(),
                outcomes: data.outcomes.clone(),
                trials_run: data.trials_run,
                events_evaluated: data.events_evaluated,
                best: data.best.clone(),
            }
        } else {
            SearchStatusSnapshot {
                phase: "Status unavailable".to_string(),
                total_instruments: 0,
                completed_instruments: 0,
                in_flight: Vec::new(),
                outcomes: BTreeMap::new(),
                trials_run: 0,
                events_evaluated: 0,
                best: None,
            }
        }
    }
}
