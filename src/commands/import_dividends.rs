use crate::commands::estimate::refresh_completeness;
use crate::commands::market_data_snapshot::ensure_market_data_file;
use crate::config::SearchSettings;
use crate::context::AppContext;
use crate::models::{DividendAnnouncement, DividendRecord};
use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;

/// Accepts a JSON array of announcements, a vendor page object with a
/// `results` array, or one announcement per line.
pub fn parse_announcements(raw: &str) -> Result<Vec<DividendAnnouncement>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut object) => match object.remove("results") {
                Some(Value::Array(items)) => items,
                Some(_) => return Err(anyhow!("`results` must be an array")),
                None => vec![Value::Object(object)],
            },
            _ => return Err(anyhow!("expected a JSON array or object of announcements")),
        };
        return items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                serde_json::from_value(item)
                    .with_context(|| format!("invalid announcement at index {}", index))
            })
            .collect();
    }

    trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(line_number, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("invalid announcement on line {}", line_number + 1))
        })
        .collect()
}

/// Normalize announcements, dropping (and logging) the ones that cannot be used.
pub fn normalize_announcements(announcements: &[DividendAnnouncement]) -> Vec<DividendRecord> {
    announcements
        .iter()
        .filter_map(|announcement| match announcement.normalize() {
            Ok(record) => Some(record),
            Err(err) => {
                warn!("Skipping dividend announcement: {}", err);
                None
            }
        })
        .collect()
}

pub async fn run(app: &AppContext, input: &Path, data_file: Option<&Path>) -> Result<()> {
    ensure_market_data_file(data_file).await?;
    let raw = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("failed to read {}", input.display()))?;
    let announcements = parse_announcements(&raw)?;
    let records = normalize_announcements(&announcements);
    info!(
        "Normalized {} of {} dividend announcements from {}",
        records.len(),
        announcements.len(),
        input.display()
    );

    let engine = app.engine_context(data_file, None).await?;
    let settings = SearchSettings::from_settings_map(engine.settings())?;
    let data = engine.data_context();
    let symbols: Vec<String> = records
        .iter()
        .map(|record| record.symbol.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let (inserted, refreshed) = tokio::task::spawn_blocking(move || -> Result<(usize, usize)> {
        let inserted = data.dividends.attach_records(&records)?;
        let refreshed = refresh_completeness(&data, &symbols, settings.history_end)?;
        Ok((inserted, refreshed.len()))
    })
    .await
    .map_err(|err| anyhow!("import worker panicked: {}", err))??;

    info!(
        "Attached {} new dividend record(s); refreshed completeness for {} instrument(s)",
        inserted, refreshed
    );

    engine.persist()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_vendor_page() {
        let raw = r#"{"results": [
            {"ticker": "MO", "ex_dividend_date": "2024-03-22", "declaration_date": "2024-02-22",
             "record_date": "2024-03-25", "pay_date": "2024-04-30", "cash_amount": 0.98,
             "currency": "USD", "frequency": 4},
            {"ticker": "T", "ex_dividend_date": "2024-04-09", "cash_amount": 0.2775}
        ], "status": "OK"}"#;
        let announcements = parse_announcements(raw).unwrap();
        assert_eq!(announcements.len(), 2);
        let records = normalize_announcements(&announcements);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].frequency, "4");
        assert_eq!(records[1].pay_date, records[1].ex_dividend_date);
    }

    #[test]
    fn test_parses_lines_and_skips_unusable() {
        let raw = "{\"ticker\": \"BRX\", \"ex_dividend_date\": \"2024-04-02\", \"cash_amount\": 0.25}\n\n{\"ticker\": \"BRX\", \"cash_amount\": 0.25}\n";
        let announcements = parse_announcements(raw).unwrap();
        assert_eq!(announcements.len(), 2);
        let records = normalize_announcements(&announcements);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].symbol, "BRX");
        assert!(parse_announcements("  ").unwrap().is_empty());
    }
}
