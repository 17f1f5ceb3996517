use crate::config::SearchSettings;
use crate::data_context::DataContext;
use crate::error::{BacktestError, BacktestResult, NonEvaluableReason};
use crate::events::EventBuilder;
use crate::frequency::estimate_frequency;
use crate::models::{Event, Instrument, Trial};
use crate::search::{SearchRunner, SearchSummary};
use crate::search_status::SearchStatus;
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub enum InstrumentOutcome {
    Success {
        /// Best final trial across the stop-loss grid.
        final_trial: Option<Trial>,
        trials_run: usize,
        events: usize,
    },
    NonEvaluable(NonEvaluableReason),
    DataUnavailable(String),
    TransientIo(String),
    InvalidParameters(String),
}

impl InstrumentOutcome {
    fn from_error(error: &BacktestError) -> Self {
        match error {
            BacktestError::NonEvaluable { reason, .. } => InstrumentOutcome::NonEvaluable(*reason),
            BacktestError::DataUnavailable { .. } => {
                InstrumentOutcome::DataUnavailable(error.to_string())
            }
            BacktestError::TransientIo { .. } => InstrumentOutcome::TransientIo(error.to_string()),
            BacktestError::InvalidParameters(_) => {
                InstrumentOutcome::InvalidParameters(error.to_string())
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InstrumentOutcome::Success { .. } => "success",
            InstrumentOutcome::NonEvaluable(_) => "non_evaluable",
            InstrumentOutcome::DataUnavailable(_) => "data_unavailable",
            InstrumentOutcome::TransientIo(_) => "transient_io",
            InstrumentOutcome::InvalidParameters(_) => "invalid_parameters",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InstrumentOutcome::Success { .. })
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentReport {
    pub symbol: String,
    pub outcome: InstrumentOutcome,
    pub duration: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub reports: Vec<InstrumentReport>,
}

impl BatchReport {
    pub fn get(&self, symbol: &str) -> Option<&InstrumentReport> {
        self.reports.iter().find(|report| report.symbol == symbol)
    }

    /// Final trials of successful instruments, best portion to risk first.
    pub fn ranked_trials(&self) -> Vec<&Trial> {
        let mut trials: Vec<&Trial> = self
            .reports
            .iter()
            .filter_map(|report| match &report.outcome {
                InstrumentOutcome::Success { final_trial, .. } => final_trial.as_ref(),
                _ => None,
            })
            .collect();
        trials.sort_by(|a, b| b.portion_to_risk.total_cmp(&a.portion_to_risk));
        trials
    }
}

/// Estimate completeness, build events and run the multiplier search for one
/// instrument.
pub fn process_instrument(
    context: &DataContext,
    settings: &SearchSettings,
    symbol: &str,
) -> BacktestResult<InstrumentOutcome> {
    let instrument = context
        .assets
        .get(symbol)
        .map_err(BacktestError::io(format!("loading instrument {}", symbol)))?
        .ok_or_else(|| BacktestError::InvalidParameters(format!("unknown instrument {}", symbol)))?;
    let records = context
        .dividends
        .records(symbol)
        .map_err(BacktestError::io(format!("loading dividends for {}", symbol)))?;

    let estimate = estimate_frequency(&instrument, &records, settings.history_end);
    let instrument: Instrument = context
        .assets
        .update_completeness(symbol, &estimate)
        .map_err(BacktestError::io(format!("updating completeness for {}", symbol)))?;

    EventBuilder::new(
        context.calendar.as_ref(),
        context.market_data.as_ref(),
        context.events.as_ref(),
        settings.holding_days,
    )
    .build(symbol, &records)?;

    let events: Vec<Event> = context
        .events
        .events(symbol)
        .map_err(BacktestError::io(format!("loading events for {}", symbol)))?
        .into_iter()
        .filter(|event| {
            event.ex_dividend_date >= settings.history_start
                && event.ex_dividend_date <= settings.history_end
        })
        .collect();

    let runner = SearchRunner::new(
        context.market_data.as_ref(),
        context.trials.as_ref(),
        settings.stop_loss_percentages.len(),
    );
    let mut summaries: Vec<SearchSummary> =
        Vec::with_capacity(settings.stop_loss_percentages.len());
    for stop_loss in &settings.stop_loss_percentages {
        summaries.push(runner.run(&instrument, &events, *stop_loss)?);
    }

    let trials_run = summaries.iter().map(|summary| summary.trials_run).sum();
    let final_trial = summaries
        .into_iter()
        .filter_map(|summary| summary.final_trial)
        .max_by(|a, b| a.portion_to_risk.total_cmp(&b.portion_to_risk));

    Ok(InstrumentOutcome::Success {
        final_trial,
        trials_run,
        events: events.len(),
    })
}

pub struct BatchDriver {
    context: DataContext,
    settings: SearchSettings,
    status: SearchStatus,
    show_progress: bool,
}

impl BatchDriver {
    pub fn new(context: DataContext, settings: SearchSettings) -> Self {
        Self {
            context,
            settings,
            status: SearchStatus::new(),
            show_progress: true,
        }
    }

    pub fn with_status(mut self, status: SearchStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn status_handle(&self) -> SearchStatus {
        self.status.clone()
    }

    /// Requested symbols, or every dividend-paying instrument when none are given.
    pub fn resolve_symbols(&self, requested: &[String]) -> Result<Vec<String>> {
        if !requested.is_empty() {
            let mut symbols: Vec<String> = requested
                .iter()
                .map(|symbol| symbol.trim().to_uppercase())
                .filter(|symbol| !symbol.is_empty())
                .collect();
            symbols.sort();
            symbols.dedup();
            return Ok(symbols);
        }
        self.context
            .assets
            .dividend_symbols()
            .context("failed to list dividend instruments")
    }

    /// Run every symbol through the pipeline on a bounded worker pool. A failed
    /// instrument is reported and never aborts the batch.
    pub fn run(&self, symbols: &[String]) -> Result<BatchReport> {
        let total = symbols.len();
        self.status.begin_batch(total);
        if total == 0 {
            info!("No dividend instruments to process");
            self.status.set_phase("No instruments to process");
            return Ok(BatchReport::default());
        }

        let num_workers = self.settings.resolved_worker_count(total);
        info!(
            "Processing {} instrument{} with {} worker threads",
            total,
            if total == 1 { "" } else { "s" },
            num_workers
        );
        self.status
            .set_phase(format!("Searching {} instruments in parallel", total));

        let (task_tx, task_rx): (Sender<String>, Receiver<String>) = bounded(total);
        let (result_tx, result_rx): (Sender<InstrumentReport>, Receiver<InstrumentReport>) =
            bounded(total);

        let mut handles = Vec::new();
        for _ in 0..num_workers {
            let rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let context = self.context.clone();
            let settings = self.settings.clone();
            let status = self.status.clone();

            let handle = thread::spawn(move || {
                while let Ok(symbol) = rx.recv() {
                    status.instrument_started(&symbol);
                    let start = Instant::now();
                    let outcome = match process_instrument(&context, &settings, &symbol) {
                        Ok(outcome) => outcome,
                        Err(error) => {
                            warn!("{} failed ({}): {}", symbol, error.kind(), error);
                            InstrumentOutcome::from_error(&error)
                        }
                    };
                    let report = InstrumentReport {
                        symbol,
                        outcome,
                        duration: start.elapsed(),
                    };
                    if result_tx.send(report).is_err() {
                        break;
                    }
                }
            });
            handles.push(handle);
        }
        drop(result_tx);

        for symbol in symbols {
            task_tx.send(symbol.clone())?;
        }
        drop(task_tx);

        let pb = if self.show_progress {
            ProgressBar::new(total as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
                )?
                .progress_chars("#>-"),
        );

        let mut report = BatchReport::default();
        while report.reports.len() < total {
            match result_rx.recv() {
                Ok(instrument_report) => {
                    if let InstrumentOutcome::Success {
                        final_trial,
                        trials_run,
                        events,
                    } = &instrument_report.outcome
                    {
                        log_completed(
                            &instrument_report,
                            final_trial.as_ref(),
                            *trials_run,
                            *events,
                        );
                    }
                    self.status.instrument_finished(&instrument_report);
                    self.status.set_phase(format!(
                        "Completed {}/{} instruments (last: {})",
                        report.reports.len() + 1,
                        total,
                        instrument_report.symbol
                    ));
                    report.reports.push(instrument_report);
                    pb.set_position(report.reports.len() as u64);
                    pb.set_message(self.status.snapshot().in_flight.join(","));
                }
                Err(_) => {
                    warn!("Result channel closed unexpectedly. Some results may be lost.");
                    break;
                }
            }
        }

        for handle in handles {
            let _ = handle.join();
        }

        let snapshot = self.status.snapshot();
        let failures = snapshot.failed_instruments();
        if failures == 0 {
            pb.finish_with_message("Search completed");
            self.status.set_phase("Search completed successfully");
        } else {
            pb.finish_with_message("Search completed with failures");
            warn!(
                "Search completed with {} failure{}: {:?}",
                failures,
                if failures == 1 { "" } else { "s" },
                snapshot.outcomes
            );
            self.status.set_phase(format!(
                "Completed with {} failure{}",
                failures,
                if failures == 1 { "" } else { "s" }
            ));
        }

        Ok(report)
    }
}

fn log_completed(
    report: &InstrumentReport,
    final_trial: Option<&Trial>,
    trials_run: usize,
    events: usize,
) {
    match final_trial {
        Some(trial) => info!(
            "Completed {} in {:.1}s: {} event(s), {} new trial(s), multiplier {:.2}, stop loss {:.2}, portion to risk {:.4}",
            report.symbol,
            report.duration.as_secs_f64(),
            events,
            trials_run,
            trial.multiplier,
            trial.stop_loss,
            trial.portion_to_risk
        ),
        None => info!(
            "Completed {} in {:.1}s without a trial",
            report.symbol,
            report.duration.as_secs_f64()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::BusinessCalendar;
    use crate::models::{Bar, DividendRecord};
    use crate::store::{DividendRepository, InMemoryStore, TrialLog};
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn settings() -> SearchSettings {
        SearchSettings {
            holding_days: 5,
            stop_loss_percentages: vec![0.10],
            history_start: date(2014, 1, 1),
            history_end: date(2024, 12, 31),
            worker_count: 2,
        }
    }

    fn record(symbol: &str, ex: NaiveDate) -> DividendRecord {
        DividendRecord {
            symbol: symbol.to_string(),
            ex_dividend_date: ex,
            declared_date: ex,
            record_date: ex,
            pay_date: ex,
            cash_amount: 1.0,
            currency: "USD".to_string(),
            frequency: "4".to_string(),
        }
    }

    fn flat_bar(symbol: &str, day: NaiveDate, price: f64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            date: day,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1000.0,
            trade_count: 10.0,
        }
    }

    #[test]
    fn test_failures_do_not_abort_batch() {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = InMemoryStore::new();
        // One event with flat prices: a single sample is not evaluable.
        store
            .attach_records(&[record("FLAT", date(2024, 1, 10))])
            .unwrap();
        store.insert_bars(vec![flat_bar("FLAT", date(2024, 1, 2), 20.0)]);
        // Missing opening price inside the window.
        store
            .attach_records(&[record("GAP", date(2024, 1, 10))])
            .unwrap();
        store.insert_bars(vec![flat_bar("GAP", date(2024, 1, 3), f64::NAN)]);

        let trials = Arc::new(InMemoryStore::new());
        let context = DataContext::in_memory(store, BusinessCalendar::default(), trials.clone());
        let driver = BatchDriver::new(context, settings()).with_progress(false);
        let symbols = driver.resolve_symbols(&[]).unwrap();
        assert_eq!(symbols, vec!["FLAT".to_string(), "GAP".to_string()]);

        let mut requested = symbols.clone();
        requested.push("MISSING".to_string());
        let report = driver.run(&requested).unwrap();
        assert_eq!(report.reports.len(), 3);
        assert!(report.reports.iter().all(|report| !report.outcome.is_success()));
        assert!(matches!(
            report.get("FLAT").unwrap().outcome,
            InstrumentOutcome::NonEvaluable(NonEvaluableReason::TooFewEvents { sample_size: 1 })
        ));
        assert!(matches!(
            report.get("GAP").unwrap().outcome,
            InstrumentOutcome::DataUnavailable(_)
        ));
        assert!(matches!(
            report.get("MISSING").unwrap().outcome,
            InstrumentOutcome::InvalidParameters(_)
        ));
        assert!(trials.recent("FLAT", 10).unwrap().is_empty());
        let snapshot = driver.status_handle().snapshot();
        assert_eq!(snapshot.failed_instruments(), 3);
        assert_eq!(snapshot.outcomes.get("data_unavailable"), Some(&1));
        assert!(snapshot.in_flight.is_empty());
        assert!(snapshot.best.is_none());
    }

    #[test]
    fn test_resolve_symbols_normalizes_requested() {
        let context = DataContext::in_memory(
            InMemoryStore::new(),
            BusinessCalendar::default(),
            Arc::new(InMemoryStore::new()),
        );
        let driver = BatchDriver::new(context, settings()).with_progress(false);
        let symbols = driver
            .resolve_symbols(&[" mo".to_string(), "T".to_string(), "MO".to_string()])
            .unwrap();
        assert_eq!(symbols, vec!["MO".to_string(), "T".to_string()]);
        assert!(driver.run(&[]).unwrap().reports.is_empty());
    }
}
