use crate::commands::market_data_snapshot::ensure_market_data_file;
use crate::config::SearchSettings;
use crate::context::AppContext;
use crate::data_context::DataContext;
use crate::frequency::{estimate_frequency, FrequencyEstimate};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use log::{info, warn};
use std::path::Path;

/// Re-estimate frequency and completeness for `symbols`, or for every dividend
/// instrument when `symbols` is empty. Symbols that fail are logged and skipped.
pub fn refresh_completeness(
    data: &DataContext,
    symbols: &[String],
    as_of: NaiveDate,
) -> Result<Vec<(String, FrequencyEstimate)>> {
    let symbols = if symbols.is_empty() {
        data.assets
            .dividend_symbols()
            .context("failed to list dividend instruments")?
    } else {
        symbols.to_vec()
    };

    let mut estimates = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        match refresh_one(data, &symbol, as_of) {
            Ok(estimate) => estimates.push((symbol, estimate)),
            Err(err) => warn!("Completeness update for {} failed: {:#}", symbol, err),
        }
    }
    Ok(estimates)
}

fn refresh_one(data: &DataContext, symbol: &str, as_of: NaiveDate) -> Result<FrequencyEstimate> {
    let instrument = data
        .assets
        .get(symbol)?
        .ok_or_else(|| anyhow!("unknown instrument {}", symbol))?;
    let records = data.dividends.records(symbol)?;
    let estimate = estimate_frequency(&instrument, &records, as_of);
    data.assets.update_completeness(symbol, &estimate)?;
    Ok(estimate)
}

pub async fn run(app: &AppContext, data_file: Option<&Path>) -> Result<()> {
    ensure_market_data_file(data_file).await?;
    let engine = app.engine_context(data_file, None).await?;
    let settings = SearchSettings::from_settings_map(engine.settings())?;
    let data = engine.data_context();
    let as_of = settings.history_end;

    let estimates = tokio::task::spawn_blocking(move || refresh_completeness(&data, &[], as_of))
        .await
        .map_err(|err| anyhow!("completeness worker panicked: {}", err))??;

    let ambiguous = estimates
        .iter()
        .filter(|(_, estimate)| estimate.is_ambiguous())
        .count();
    let unknown = estimates
        .iter()
        .filter(|(_, estimate)| estimate.frequency <= 0)
        .count();
    info!(
        "Updated completeness for {} instruments as of {} ({} ambiguous, {} without a usable frequency)",
        estimates.len(),
        as_of,
        ambiguous,
        unknown
    );

    engine.persist()?;
    Ok(())
}
