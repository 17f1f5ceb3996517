use crate::aggregator::summarize;
use crate::error::{BacktestError, BacktestResult};
use crate::models::{generate_trial_id, Event, Instrument, Trial};
use crate::simulator::{simulate_events, TradeParameters};
use crate::store::{MarketDataStore, TrialLog};
use chrono::Utc;
use log::{info, warn};

pub const MAX_TRIALS: usize = 15;
const LOW_PROBE_MULTIPLIER: f64 = 1.0;
const HIGH_PROBE_MULTIPLIER: f64 = 2.0;
const CLIMB_STEP: f64 = 1.0;
const REVERSAL_STEP: f64 = 0.75;
const FINE_TUNE_STEP: f64 = 0.25;
const STOP_LOSS_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPhase {
    Init,
    ProbeLow,
    ProbeHigh,
    Climb,
    FineTune,
    Done,
}

impl SearchPhase {
    pub fn label(self) -> &'static str {
        match self {
            SearchPhase::Init => "init",
            SearchPhase::ProbeLow => "probe-low",
            SearchPhase::ProbeHigh => "probe-high",
            SearchPhase::Climb => "climb",
            SearchPhase::FineTune => "fine-tune",
            SearchPhase::Done => "done",
        }
    }
}

/// Hill climb over the dividend multiplier that reverses once into a finer
/// step when the allocation ratio stops improving.
#[derive(Debug, Clone)]
pub struct MultiplierSearch {
    phase: SearchPhase,
    tune: bool,
    rounds: usize,
    last_multiplier: Option<f64>,
}

impl Default for MultiplierSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiplierSearch {
    pub fn new() -> Self {
        Self {
            phase: SearchPhase::Init,
            tune: false,
            rounds: 0,
            last_multiplier: None,
        }
    }

    /// Rebuild the search state by replaying persisted trials (oldest first).
    pub fn resume(history: &[Trial]) -> Self {
        let mut search = Self::new();
        for (index, trial) in history.iter().enumerate() {
            let newest_first: Vec<f64> = history[..index]
                .iter()
                .rev()
                .map(|t| t.portion_to_risk)
                .collect();
            match search.next_candidate(&newest_first) {
                Some(expected) => {
                    if (expected - trial.multiplier).abs() > 1e-9 {
                        warn!(
                            "Trial history for {} diverges at round {}: expected multiplier {} but found {}",
                            trial.symbol, index, expected, trial.multiplier
                        );
                    }
                    search.accept(trial.multiplier);
                }
                None => break,
            }
        }
        if search.phase != SearchPhase::Done {
            let newest_first: Vec<f64> = history.iter().rev().map(|t| t.portion_to_risk).collect();
            // Peek without mutating so a finished history reports Done.
            if search.clone().next_candidate(&newest_first).is_none() {
                search.phase = SearchPhase::Done;
            }
        }
        search
    }

    pub fn phase(&self) -> SearchPhase {
        self.phase
    }

    pub fn tune(&self) -> bool {
        self.tune
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn last_multiplier(&self) -> Option<f64> {
        self.last_multiplier
    }

    pub fn is_done(&self) -> bool {
        self.phase == SearchPhase::Done
    }

    /// Next multiplier to try, or `None` once the search has stopped.
    /// `ratios` holds the accepted trials' portion-to-risk values, newest first.
    pub fn next_candidate(&mut self, ratios: &[f64]) -> Option<f64> {
        if self.phase == SearchPhase::Done {
            return None;
        }
        let candidate = match self.rounds {
            0 => {
                self.phase = SearchPhase::ProbeLow;
                Some(LOW_PROBE_MULTIPLIER)
            }
            1 => {
                self.phase = SearchPhase::ProbeHigh;
                Some(HIGH_PROBE_MULTIPLIER)
            }
            rounds if rounds < MAX_TRIALS => self.step(ratios),
            _ => None,
        };
        if candidate.is_none() {
            self.phase = SearchPhase::Done;
        }
        candidate
    }

    fn step(&mut self, ratios: &[f64]) -> Option<f64> {
        let delta = *risk_deltas(ratios).first()?;
        let previous = self.last_multiplier?;
        match (self.tune, delta > 0.0) {
            (false, true) => {
                self.phase = SearchPhase::Climb;
                Some(previous + CLIMB_STEP)
            }
            (false, false) => {
                self.tune = true;
                self.phase = SearchPhase::FineTune;
                Some(previous - REVERSAL_STEP)
            }
            (true, true) => {
                self.phase = SearchPhase::FineTune;
                Some(previous + FINE_TUNE_STEP)
            }
            (true, false) => None,
        }
    }

    pub fn accept(&mut self, multiplier: f64) {
        self.rounds += 1;
        self.last_multiplier = Some(multiplier);
    }
}

/// Successive differences of newest-first ratios, rounded to 3 decimals.
pub fn risk_deltas(ratios: &[f64]) -> Vec<f64> {
    ratios
        .windows(2)
        .map(|pair| ((pair[0] - pair[1]) * 1000.0).round() / 1000.0)
        .collect()
}

#[derive(Debug, Clone)]
pub struct SearchSummary {
    pub symbol: String,
    pub stop_loss: f64,
    pub trials_run: usize,
    pub rounds: usize,
    /// Last accepted trial; its multiplier is the search result.
    pub final_trial: Option<Trial>,
}

pub struct SearchRunner<'a> {
    market_data: &'a dyn MarketDataStore,
    trials: &'a dyn TrialLog,
    history_limit: usize,
}

impl<'a> SearchRunner<'a> {
    pub fn new(
        market_data: &'a dyn MarketDataStore,
        trials: &'a dyn TrialLog,
        stop_loss_count: usize,
    ) -> Self {
        Self {
            market_data,
            trials,
            history_limit: MAX_TRIALS * stop_loss_count.max(1),
        }
    }

    /// Accepted trials for (symbol, stop loss), newest first.
    fn history(&self, symbol: &str, stop_loss: f64) -> BacktestResult<Vec<Trial>> {
        let recent = self
            .trials
            .recent(symbol, self.history_limit)
            .map_err(BacktestError::io(format!("reading trial history for {}", symbol)))?;
        Ok(recent
            .into_iter()
            .filter(|trial| (trial.stop_loss - stop_loss).abs() < STOP_LOSS_TOLERANCE)
            .collect())
    }

    pub fn run(
        &self,
        instrument: &Instrument,
        events: &[Event],
        stop_loss: f64,
    ) -> BacktestResult<SearchSummary> {
        let symbol = instrument.symbol.as_str();
        let mut history = self.history(symbol, stop_loss)?;
        let oldest_first: Vec<Trial> = history.iter().rev().cloned().collect();
        let mut search = MultiplierSearch::resume(&oldest_first);
        if search.rounds() > 0 {
            info!(
                "Resuming multiplier search for {} (stop loss {:.2}) after {} trial(s), phase {}",
                symbol,
                stop_loss,
                search.rounds(),
                search.phase().label()
            );
        }

        let cash_amounts: Vec<f64> = events.iter().map(|event| event.cash_amount).collect();
        let mut trials_run = 0usize;

        loop {
            let ratios: Vec<f64> = history.iter().map(|t| t.portion_to_risk).collect();
            let Some(multiplier) = search.next_candidate(&ratios) else {
                break;
            };
            let params = TradeParameters::new(multiplier, stop_loss)?;
            let outcomes = simulate_events(self.market_data, events, params)?;
            let summary = summarize(&outcomes, &cash_amounts);
            let portion_to_risk = summary
                .portion_to_risk()
                .map_err(|reason| BacktestError::NonEvaluable {
                    symbol: symbol.to_string(),
                    reason,
                })?;

            let trial = Trial {
                id: generate_trial_id(),
                symbol: symbol.to_string(),
                multiplier,
                stop_loss,
                win_rate: summary.win_rate,
                loss_rate: summary.loss_rate,
                avg_gain: summary.avg_gain,
                avg_loss: summary.avg_loss,
                sample_size: summary.sample_size as i32,
                completeness: instrument.completeness,
                avg_dividend: summary.avg_dividend,
                portion_to_risk,
                created_at: Utc::now(),
            };
            self.trials
                .append(&trial)
                .map_err(BacktestError::io(format!("appending trial for {}", symbol)))?;
            search.accept(multiplier);
            trials_run += 1;
            info!(
                "{} trial {} ({}): multiplier {:.2}, stop loss {:.2}, win rate {:.2}%, portion to risk {:.4}",
                symbol,
                search.rounds(),
                search.phase().label(),
                multiplier,
                stop_loss,
                summary.win_rate * 100.0,
                portion_to_risk
            );

            history = self.history(symbol, stop_loss)?;
        }

        Ok(SearchSummary {
            symbol: symbol.to_string(),
            stop_loss,
            trials_run,
            rounds: search.rounds(),
            final_trial: history.into_iter().next(),
        })
    }
}
