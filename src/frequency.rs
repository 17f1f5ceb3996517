use crate::models::{DividendRecord, Instrument, UNKNOWN_FREQUENCY, UNSET_FREQUENCY};
use chrono::{Datelike, NaiveDate};
use log::warn;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyEstimate {
    pub frequency: i32,
    pub expected_events: i64,
    pub completeness: f64,
    /// Frequencies that shared the top count when the tie-break had to decide.
    pub tied_frequencies: Vec<i32>,
}

impl FrequencyEstimate {
    fn unset() -> Self {
        Self {
            frequency: UNSET_FREQUENCY,
            expected_events: -1,
            completeness: 0.0,
            tied_frequencies: Vec::new(),
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        !self.tied_frequencies.is_empty()
    }
}

/// Infer payment cadence and the expected number of dividend events between the
/// instrument's first trade and `as_of`.
pub fn estimate_frequency(
    instrument: &Instrument,
    records: &[DividendRecord],
    as_of: NaiveDate,
) -> FrequencyEstimate {
    let Some((frequency, tied_frequencies)) = most_common_frequency(records) else {
        return FrequencyEstimate::unset();
    };
    if !tied_frequencies.is_empty() {
        warn!(
            "Ambiguous dividend frequency for {}: {:?} tie, using {}",
            instrument.symbol, tied_frequencies, frequency
        );
    }

    let first_trade = instrument
        .first_trade_date
        .or_else(|| records.iter().map(|r| r.ex_dividend_date).min())
        .unwrap_or(as_of);
    let months = whole_months_between(first_trade, as_of);
    let months_per_payment = 12.0 / frequency as f64;
    let expected_events = (months as f64 / months_per_payment).floor() as i64;
    let observed = records.len() as i64;

    let (expected_events, completeness) = if expected_events == 0 {
        (observed, 1.0)
    } else {
        (expected_events, observed as f64 / expected_events as f64)
    };

    FrequencyEstimate {
        frequency,
        expected_events,
        completeness,
        tied_frequencies,
    }
}

/// Most common usable frequency tag. Ties resolve to the highest frequency and
/// the tied values are returned alongside.
fn most_common_frequency(records: &[DividendRecord]) -> Option<(i32, Vec<i32>)> {
    let mut counts: BTreeMap<i32, usize> = BTreeMap::new();
    for record in records {
        if let Some(frequency) = parse_frequency_tag(&record.frequency) {
            *counts.entry(frequency).or_insert(0) += 1;
        }
    }
    let top = *counts.values().max()?;
    let leaders: Vec<i32> = counts
        .iter()
        .filter(|(_, count)| **count == top)
        .map(|(frequency, _)| *frequency)
        .collect();
    let chosen = *leaders.last()?;
    let tied = if leaders.len() > 1 { leaders } else { Vec::new() };
    Some((chosen, tied))
}

fn parse_frequency_tag(tag: &str) -> Option<i32> {
    let trimmed = tag.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(UNKNOWN_FREQUENCY) {
        return None;
    }
    let value = trimmed.parse::<f64>().ok()?;
    if !value.is_finite() || value.fract() != 0.0 || value < 1.0 || value > 365.0 {
        return None;
    }
    Some(value as i32)
}

fn whole_months_between(start: NaiveDate, end: NaiveDate) -> i64 {
    if end <= start {
        return 0;
    }
    let mut months = (end.year() - start.year()) as i64 * 12
        + (end.month() as i64 - start.month() as i64);
    if end.day() < start.day() {
        months -= 1;
    }
    months.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(ex: NaiveDate, frequency: &str) -> DividendRecord {
        DividendRecord {
            symbol: "MO".to_string(),
            ex_dividend_date: ex,
            declared_date: ex,
            record_date: ex,
            pay_date: ex,
            cash_amount: 0.98,
            currency: "USD".to_string(),
            frequency: frequency.to_string(),
        }
    }

    fn quarterly(count: usize) -> Vec<DividendRecord> {
        (0..count)
            .map(|i| {
                let month = (i % 4) as u32 * 3 + 1;
                let year = 2020 + (i / 4) as i32;
                record(date(year, month, 15), "4")
            })
            .collect()
    }

    #[test]
    fn test_quarterly_completeness() {
        let instrument = Instrument::new("MO", Some(date(2020, 1, 2)));
        let records = quarterly(12);
        let estimate = estimate_frequency(&instrument, &records, date(2024, 1, 2));
        assert_eq!(estimate.frequency, 4);
        assert_eq!(estimate.expected_events, 16);
        assert!((estimate.completeness - 0.75).abs() < 1e-12);
        assert!(!estimate.is_ambiguous());
    }

    #[test]
    fn test_completeness_is_not_clamped() {
        let instrument = Instrument::new("MO", Some(date(2023, 1, 2)));
        let records = quarterly(8);
        let estimate = estimate_frequency(&instrument, &records, date(2024, 1, 2));
        assert_eq!(estimate.expected_events, 4);
        assert!((estimate.completeness - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_tags_leave_frequency_unset() {
        let instrument = Instrument::new("MO", Some(date(2020, 1, 2)));
        let records = vec![
            record(date(2023, 1, 15), UNKNOWN_FREQUENCY),
            record(date(2023, 4, 15), "0"),
            record(date(2023, 7, 15), "quarterly"),
        ];
        let estimate = estimate_frequency(&instrument, &records, date(2024, 1, 2));
        assert_eq!(estimate.frequency, -1);
        assert_eq!(estimate.expected_events, -1);
        assert_eq!(estimate.completeness, 0.0);

        let empty = estimate_frequency(&instrument, &[], date(2024, 1, 2));
        assert_eq!(empty.frequency, -1);
    }

    #[test]
    fn test_zero_expected_redefined_to_record_count() {
        let instrument = Instrument::new("NEW", Some(date(2023, 12, 1)));
        let records = vec![record(date(2023, 12, 14), "4")];
        let estimate = estimate_frequency(&instrument, &records, date(2024, 1, 2));
        assert_eq!(estimate.expected_events, 1);
        assert_eq!(estimate.completeness, 1.0);
    }

    #[test]
    fn test_tie_prefers_highest_frequency() {
        let instrument = Instrument::new("MIX", Some(date(2014, 1, 2)));
        let records = vec![
            record(date(2023, 1, 15), "4"),
            record(date(2023, 2, 15), "12"),
            record(date(2023, 3, 15), "4"),
            record(date(2023, 4, 15), "12"),
            record(date(2023, 5, 15), "2"),
        ];
        let estimate = estimate_frequency(&instrument, &records, date(2024, 1, 2));
        assert_eq!(estimate.frequency, 12);
        assert_eq!(estimate.tied_frequencies, vec![4, 12]);
        assert!(estimate.is_ambiguous());
    }

    #[test]
    fn test_missing_first_trade_date_uses_earliest_record() {
        let instrument = Instrument::new("MO", None);
        let records = quarterly(4);
        let estimate = estimate_frequency(&instrument, &records, date(2021, 1, 15));
        // 2020-01-15 to 2021-01-15 is 12 months
        assert_eq!(estimate.expected_events, 4);
        assert_eq!(estimate.completeness, 1.0);
    }

    #[test]
    fn test_whole_months_between() {
        assert_eq!(whole_months_between(date(2020, 1, 31), date(2020, 2, 29)), 0);
        assert_eq!(whole_months_between(date(2020, 1, 15), date(2021, 1, 15)), 12);
        assert_eq!(whole_months_between(date(2021, 1, 15), date(2020, 1, 15)), 0);
    }
}
