use anyhow::{anyhow, Result as AnyResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const UNKNOWN_FREQUENCY: &str = "unknown";
pub const UNSET_FREQUENCY: i32 = -1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: f64,
}

impl Bar {
    /// Opening price, or `None` when the vendor left it blank.
    pub fn open_price(&self) -> Option<f64> {
        priced(self.open)
    }

    pub fn close_price(&self) -> Option<f64> {
        priced(self.close)
    }
}

fn priced(value: f64) -> Option<f64> {
    if value.is_finite() && value > 0.0 {
        Some(value)
    } else {
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DividendRecord {
    pub symbol: String,
    pub ex_dividend_date: NaiveDate,
    pub declared_date: NaiveDate,
    pub record_date: NaiveDate,
    pub pay_date: NaiveDate,
    pub cash_amount: f64,
    pub currency: String,
    pub frequency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instrument {
    pub symbol: String,
    pub first_trade_date: Option<NaiveDate>,
    pub dividend: bool,
    pub frequency: i32,
    pub expected_events: i64,
    pub completeness: f64,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, first_trade_date: Option<NaiveDate>) -> Self {
        Self {
            symbol: symbol.into(),
            first_trade_date,
            dividend: false,
            frequency: UNSET_FREQUENCY,
            expected_events: -1,
            completeness: 0.0,
        }
    }
}

/// Backtest window derived from a single dividend record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub symbol: String,
    pub ex_dividend_date: NaiveDate,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub cash_amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trial {
    pub id: String,
    pub symbol: String,
    pub multiplier: f64,
    pub stop_loss: f64,
    pub win_rate: f64,
    pub loss_rate: f64,
    pub avg_gain: f64,
    pub avg_loss: f64,
    pub sample_size: i32,
    pub completeness: f64,
    pub avg_dividend: f64,
    pub portion_to_risk: f64,
    pub created_at: DateTime<Utc>,
}

pub fn generate_trial_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Raw dividend announcement as delivered by the vendor feed. Field presence is
/// inconsistent, so everything is optional until `normalize` runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DividendAnnouncement {
    #[serde(alias = "symbol")]
    pub ticker: Option<String>,
    pub ex_dividend_date: Option<String>,
    #[serde(alias = "declared_date")]
    pub declaration_date: Option<String>,
    pub record_date: Option<String>,
    pub pay_date: Option<String>,
    pub cash_amount: Option<f64>,
    pub currency: Option<String>,
    pub frequency: Option<Value>,
}

impl DividendAnnouncement {
    pub fn normalize(&self) -> AnyResult<DividendRecord> {
        let symbol = self
            .ticker
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("Dividend announcement is missing a ticker"))?
            .to_string();
        let ex_dividend_date = match self.ex_dividend_date.as_deref() {
            Some(raw) => parse_announcement_date(raw)?,
            None => {
                return Err(anyhow!(
                    "Dividend announcement for {} is missing ex_dividend_date",
                    symbol
                ))
            }
        };
        let cash_amount = self
            .cash_amount
            .filter(|value| value.is_finite() && *value > 0.0)
            .ok_or_else(|| {
                anyhow!(
                    "Dividend announcement for {} on {} has no usable cash_amount",
                    symbol,
                    ex_dividend_date
                )
            })?;

        let backfill = |raw: &Option<String>| -> AnyResult<NaiveDate> {
            match raw.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
                Some(value) => parse_announcement_date(value),
                None => Ok(ex_dividend_date),
            }
        };

        Ok(DividendRecord {
            declared_date: backfill(&self.declaration_date)?,
            record_date: backfill(&self.record_date)?,
            pay_date: backfill(&self.pay_date)?,
            currency: self
                .currency
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or("USD")
                .to_string(),
            frequency: normalize_frequency_tag(self.frequency.as_ref()),
            symbol,
            ex_dividend_date,
            cash_amount,
        })
    }
}

fn parse_announcement_date(raw: &str) -> AnyResult<NaiveDate> {
    let trimmed = raw.trim();
    let date_part = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map_err(|_| anyhow!("Invalid announcement date '{}'", raw))
}

fn normalize_frequency_tag(value: Option<&Value>) -> String {
    match value {
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::String(text)) if !text.trim().is_empty() => text.trim().to_string(),
        _ => UNKNOWN_FREQUENCY.to_string(),
    }
}

pub fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_backfills_missing_dates() {
        let payload = r#"{
            "ticker": "ASML",
            "ex_dividend_date": "2024-04-26",
            "record_date": "2024-04-29",
            "cash_amount": 1.899275
        }"#;
        let announcement: DividendAnnouncement = serde_json::from_str(payload).unwrap();
        let record = announcement.normalize().unwrap();
        let ex_date = NaiveDate::from_ymd_opt(2024, 4, 26).unwrap();
        assert_eq!(record.symbol, "ASML");
        assert_eq!(record.ex_dividend_date, ex_date);
        assert_eq!(record.declared_date, ex_date);
        assert_eq!(record.pay_date, ex_date);
        assert_eq!(
            record.record_date,
            NaiveDate::from_ymd_opt(2024, 4, 29).unwrap()
        );
        assert_eq!(record.currency, "USD");
        assert_eq!(record.frequency, UNKNOWN_FREQUENCY);
    }

    #[test]
    fn test_normalize_accepts_numeric_and_string_frequency() {
        let numeric: DividendAnnouncement = serde_json::from_str(
            r#"{"symbol": "AAVMY", "ex_dividend_date": "2024-04-26", "cash_amount": 0.95, "frequency": 4}"#,
        )
        .unwrap();
        assert_eq!(numeric.normalize().unwrap().frequency, "4");

        let text: DividendAnnouncement = serde_json::from_str(
            r#"{"symbol": "AAVMY", "ex_dividend_date": "2024-04-26T00:00:00Z", "cash_amount": 0.95, "frequency": "12"}"#,
        )
        .unwrap();
        let record = text.normalize().unwrap();
        assert_eq!(record.frequency, "12");
        assert_eq!(
            record.ex_dividend_date,
            NaiveDate::from_ymd_opt(2024, 4, 26).unwrap()
        );
    }

    #[test]
    fn test_normalize_rejects_incomplete_payloads() {
        let missing_amount = DividendAnnouncement {
            ticker: Some("BRX".to_string()),
            ex_dividend_date: Some("2024-01-10".to_string()),
            ..Default::default()
        };
        assert!(missing_amount.normalize().is_err());

        let missing_ticker = DividendAnnouncement {
            ex_dividend_date: Some("2024-01-10".to_string()),
            cash_amount: Some(1.0),
            ..Default::default()
        };
        assert!(missing_ticker.normalize().is_err());
    }

    #[test]
    fn test_bar_prices_treat_blank_values_as_missing() {
        let bar = Bar {
            symbol: "BRX".to_string(),
            date: NaiveDate::from_ymd_opt(2023, 4, 24).unwrap(),
            open: f64::NAN,
            high: 20.79,
            low: 20.35,
            close: 0.0,
            volume: 1_653_600.0,
            trade_count: 0.0,
        };
        assert!(bar.open_price().is_none());
        assert!(bar.close_price().is_none());
    }

    #[test]
    fn test_round_to_cents() {
        assert_eq!(round_to_cents(21.004), 21.0);
        assert_eq!(round_to_cents(18.005_1), 18.01);
        assert_eq!(round_to_cents(20.0 * 0.9), 18.0);
    }
}
