use crate::batch::BatchDriver;
use crate::commands::market_data_snapshot::ensure_market_data_file;
use crate::config::SearchSettings;
use crate::context::AppContext;
use anyhow::{anyhow, Result};
use log::info;
use std::path::Path;

const TOP_RESULTS_TO_LOG: usize = 10;

pub async fn run(
    app: &AppContext,
    data_file: Option<&Path>,
    trial_log: Option<&Path>,
    symbols: &[String],
) -> Result<()> {
    ensure_market_data_file(data_file).await?;
    let engine = app.engine_context(data_file, trial_log).await?;
    let settings = SearchSettings::from_settings_map(engine.settings())?;
    info!(
        "Searching multipliers over {} - {} (holding {} business days, stop losses {:?})",
        settings.history_start,
        settings.history_end,
        settings.holding_days,
        settings.stop_loss_percentages
    );

    let status = engine.status_handle();
    let driver = BatchDriver::new(engine.data_context(), settings).with_status(status.clone());
    let requested = symbols.to_vec();
    let report = tokio::task::spawn_blocking(move || {
        let symbols = driver.resolve_symbols(&requested)?;
        driver.run(&symbols)
    })
    .await
    .map_err(|err| anyhow!("search worker panicked: {}", err))??;

    let summary = status.snapshot();
    info!(
        "Processed {}/{} instruments over {} events with {} new trials: {:?}",
        summary.completed_instruments,
        summary.total_instruments,
        summary.events_evaluated,
        summary.trials_run,
        summary.outcomes
    );
    if let Some(best) = &summary.best {
        info!(
            "Best instrument {}: portion to risk {:.4} at multiplier {:.2}, stop loss {:.2}",
            best.symbol, best.portion_to_risk, best.multiplier, best.stop_loss
        );
    }
    for (rank, trial) in report
        .ranked_trials()
        .into_iter()
        .take(TOP_RESULTS_TO_LOG)
        .enumerate()
    {
        info!(
            "#{} {}: portion to risk {:.4}, multiplier {:.2}, stop loss {:.2}, win rate {:.2}%, {} events, completeness {:.2}",
            rank + 1,
            trial.symbol,
            trial.portion_to_risk,
            trial.multiplier,
            trial.stop_loss,
            trial.win_rate * 100.0,
            trial.sample_size,
            trial.completeness
        );
    }

    engine.persist()?;
    Ok(())
}
