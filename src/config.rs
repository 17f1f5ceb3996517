use anyhow::{anyhow, Result};
use chrono::{Datelike, NaiveDate, Utc};
use std::collections::HashMap;

pub const DEFAULT_HOLDING_DAYS: i32 = 5;
pub const DEFAULT_STOP_LOSS_PERCENTAGE: f64 = 0.10;
pub const DEFAULT_HISTORY_YEARS: i32 = 10;

/// Parameters shared by every instrument in a batch run.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub holding_days: i32,
    pub stop_loss_percentages: Vec<f64>,
    pub history_start: NaiveDate,
    pub history_end: NaiveDate,
    pub worker_count: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        let history_end = Utc::now().date_naive();
        Self {
            holding_days: DEFAULT_HOLDING_DAYS,
            stop_loss_percentages: vec![DEFAULT_STOP_LOSS_PERCENTAGE],
            history_start: years_before(history_end, DEFAULT_HISTORY_YEARS),
            history_end,
            worker_count: 0,
        }
    }
}

impl SearchSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let holding_days = optional_setting_i32(settings, "HOLDING_DAYS", 1)?
            .unwrap_or(DEFAULT_HOLDING_DAYS);
        let stop_loss_percentages = optional_setting_f64_list(settings, "STOP_LOSS_PERCENTAGES")?
            .unwrap_or_else(|| vec![DEFAULT_STOP_LOSS_PERCENTAGE]);
        for value in &stop_loss_percentages {
            if *value <= 0.0 || *value >= 1.0 {
                return Err(anyhow!(
                    "STOP_LOSS_PERCENTAGES entries must be between 0 and 1 exclusive (value: {})",
                    value
                ));
            }
        }
        let history_years = optional_setting_i32(settings, "HISTORY_YEARS", 1)?
            .unwrap_or(DEFAULT_HISTORY_YEARS);
        let history_end = match optional_setting(settings, "HISTORY_END_DATE") {
            Some(_) => require_setting_date(settings, "HISTORY_END_DATE")?,
            None => Utc::now().date_naive(),
        };
        let worker_count = optional_setting_i32(settings, "WORKER_COUNT", 0)?.unwrap_or(0) as usize;

        Ok(Self {
            holding_days,
            stop_loss_percentages,
            history_start: years_before(history_end, history_years),
            history_end,
            worker_count,
        })
    }

    pub fn resolved_worker_count(&self, jobs: usize) -> usize {
        let configured = if self.worker_count == 0 {
            num_cpus::get()
        } else {
            self.worker_count
        };
        std::cmp::min(jobs, std::cmp::max(1, configured))
    }
}

fn years_before(date: NaiveDate, years: i32) -> NaiveDate {
    let target_year = date.year() - years;
    NaiveDate::from_ymd_opt(target_year, date.month(), date.day())
        // Feb 29 in a non-leap target year
        .or_else(|| NaiveDate::from_ymd_opt(target_year, date.month(), 28))
        .unwrap_or(date)
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn require_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    optional_setting(settings, key).ok_or_else(|| anyhow!("Missing required setting {}", key))
}

pub fn require_setting_date(settings: &HashMap<String, String>, key: &str) -> Result<NaiveDate> {
    let raw = require_setting(settings, key)?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        anyhow!(
            "Setting {} must be a date in YYYY-MM-DD format (value: {})",
            key,
            raw
        )
    })
}

fn optional_setting_i32(
    settings: &HashMap<String, String>,
    key: &str,
    min: i32,
) -> Result<Option<i32>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    let value = raw
        .parse::<i32>()
        .map_err(|_| anyhow!("Setting {} must be an integer (value: {})", key, raw))?;
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(Some(value))
}

fn optional_setting_f64_list(
    settings: &HashMap<String, String>,
    key: &str,
) -> Result<Option<Vec<f64>>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    let trimmed = raw.trim_matches(|c| c == '[' || c == ']');
    let mut values = Vec::new();

    for part in trimmed.split(|c: char| c == ',' || c.is_whitespace()) {
        let entry = part.trim();
        if entry.is_empty() {
            continue;
        }
        let value = entry
            .parse::<f64>()
            .map_err(|_| anyhow!("Setting {} must be a list of numbers (value: {})", key, raw))?;
        if !value.is_finite() {
            return Err(anyhow!(
                "Setting {} must contain only finite numbers (value: {})",
                key,
                raw
            ));
        }
        values.push(value);
    }

    if values.is_empty() {
        return Err(anyhow!(
            "Setting {} must contain at least one number (value: {})",
            key,
            raw
        ));
    }

    Ok(Some(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_when_settings_missing() {
        let parsed = SearchSettings::from_settings_map(&HashMap::new()).unwrap();
        assert_eq!(parsed.holding_days, 5);
        assert_eq!(parsed.stop_loss_percentages, vec![0.10]);
        assert_eq!(parsed.history_end.year() - parsed.history_start.year(), 10);
    }

    #[test]
    fn test_parses_explicit_settings() {
        let parsed = SearchSettings::from_settings_map(&settings(&[
            ("HOLDING_DAYS", "3"),
            ("STOP_LOSS_PERCENTAGES", "[0.10, 0.12 0.15]"),
            ("HISTORY_YEARS", "2"),
            ("HISTORY_END_DATE", "2024-02-29"),
            ("WORKER_COUNT", "4"),
        ]))
        .unwrap();
        assert_eq!(parsed.holding_days, 3);
        assert_eq!(parsed.stop_loss_percentages, vec![0.10, 0.12, 0.15]);
        assert_eq!(
            parsed.history_end,
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert_eq!(
            parsed.history_start,
            NaiveDate::from_ymd_opt(2022, 2, 28).unwrap()
        );
        assert_eq!(parsed.resolved_worker_count(10), 4);
        assert_eq!(parsed.resolved_worker_count(2), 2);
    }

    #[test]
    fn test_rejects_invalid_settings() {
        assert!(SearchSettings::from_settings_map(&settings(&[("HOLDING_DAYS", "0")])).is_err());
        assert!(
            SearchSettings::from_settings_map(&settings(&[("STOP_LOSS_PERCENTAGES", "1.5")]))
                .is_err()
        );
        assert!(SearchSettings::from_settings_map(&settings(&[(
            "HISTORY_END_DATE",
            "02/29/2024"
        )]))
        .is_err());
    }
}
