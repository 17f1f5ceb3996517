use chrono::NaiveDate;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonEvaluableReason {
    TooFewEvents { sample_size: usize },
    NoWinningEvents,
    NoLosingEvents,
}

impl fmt::Display for NonEvaluableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NonEvaluableReason::TooFewEvents { sample_size } => {
                write!(f, "only {} event(s), at least 2 required", sample_size)
            }
            NonEvaluableReason::NoWinningEvents => write!(f, "no winning events (avg gain is 0)"),
            NonEvaluableReason::NoLosingEvents => write!(f, "no losing events (avg loss is 0)"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("price data unavailable for {symbol} between {start} and {end}")]
    DataUnavailable {
        symbol: String,
        start: NaiveDate,
        end: NaiveDate,
    },
    #[error("{symbol} is not evaluable: {reason}")]
    NonEvaluable {
        symbol: String,
        reason: NonEvaluableReason,
    },
    #[error("{context}: {source:#}")]
    TransientIo {
        context: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid backtest parameters: {0}")]
    InvalidParameters(String),
}

impl BacktestError {
    pub fn io<S: Into<String>>(context: S) -> impl FnOnce(anyhow::Error) -> Self {
        let context = context.into();
        move |source| BacktestError::TransientIo { context, source }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BacktestError::DataUnavailable { .. } => "data_unavailable",
            BacktestError::NonEvaluable { .. } => "non_evaluable",
            BacktestError::TransientIo { .. } => "transient_io",
            BacktestError::InvalidParameters(_) => "invalid_parameters",
        }
    }
}

pub type BacktestResult<T> = std::result::Result<T, BacktestError>;
