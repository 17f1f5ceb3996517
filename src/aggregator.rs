use crate::error::NonEvaluableReason;
use crate::models::round_to_cents;
use crate::simulator::TradeOutcome;
use statrs::statistics::Statistics;

pub const MIN_SAMPLE_SIZE: usize = 2;

/// Win/loss statistics for one instrument under one parameter set.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeSummary {
    pub sample_size: usize,
    pub win_rate: f64,
    pub loss_rate: f64,
    pub avg_gain: f64,
    pub avg_loss: f64,
    pub avg_dividend: f64,
}

impl OutcomeSummary {
    /// Kelly-style allocation: win_rate / avg_loss - loss_rate / avg_gain.
    pub fn portion_to_risk(&self) -> Result<f64, NonEvaluableReason> {
        if self.sample_size < MIN_SAMPLE_SIZE {
            return Err(NonEvaluableReason::TooFewEvents {
                sample_size: self.sample_size,
            });
        }
        if self.avg_gain <= 0.0 {
            return Err(NonEvaluableReason::NoWinningEvents);
        }
        if self.avg_loss <= 0.0 {
            return Err(NonEvaluableReason::NoLosingEvents);
        }
        Ok(self.win_rate / self.avg_loss - self.loss_rate / self.avg_gain)
    }
}

/// Reduce per-event outcomes. `cash_amounts` feeds the average dividend and may
/// be empty.
pub fn summarize(outcomes: &[TradeOutcome], cash_amounts: &[f64]) -> OutcomeSummary {
    let sample_size = outcomes.len();
    let mut winning_percents = Vec::new();
    let mut losing_percents = Vec::new();

    for outcome in outcomes {
        let gain = outcome.gain();
        let Some(purchase_price) = outcome.purchase_price() else {
            continue;
        };
        let percent_gain = gain / purchase_price;
        if gain > 0.0 {
            winning_percents.push(percent_gain);
        } else if gain < 0.0 {
            losing_percents.push(percent_gain.abs());
        }
    }

    let win_rate = if sample_size == 0 {
        0.0
    } else {
        winning_percents.len() as f64 / sample_size as f64
    };

    OutcomeSummary {
        sample_size,
        win_rate,
        loss_rate: 1.0 - win_rate,
        avg_gain: mean_or_zero(&winning_percents),
        avg_loss: mean_or_zero(&losing_percents),
        avg_dividend: round_to_cents(mean_or_zero(cash_amounts)),
    }
}

fn mean_or_zero(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().mean()
    }
}
