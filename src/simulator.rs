use crate::error::{BacktestError, BacktestResult};
use crate::models::{round_to_cents, Bar, Event};
use crate::store::MarketDataStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    ProfitTarget,
    StopLoss,
    HoldToClose,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TradeOutcome {
    /// No resident bars in the window; the event contributes a zero gain.
    NoTrade,
    Closed {
        gain: f64,
        purchase_price: f64,
        exit: ExitReason,
    },
}

impl TradeOutcome {
    pub fn gain(&self) -> f64 {
        match self {
            TradeOutcome::NoTrade => 0.0,
            TradeOutcome::Closed { gain, .. } => *gain,
        }
    }

    pub fn purchase_price(&self) -> Option<f64> {
        match self {
            TradeOutcome::NoTrade => None,
            TradeOutcome::Closed { purchase_price, .. } => Some(*purchase_price),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeParameters {
    pub multiplier: f64,
    pub stop_loss: f64,
}

impl TradeParameters {
    pub fn new(multiplier: f64, stop_loss: f64) -> BacktestResult<Self> {
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(BacktestError::InvalidParameters(format!(
                "multiplier must be positive (value: {})",
                multiplier
            )));
        }
        if !stop_loss.is_finite() || stop_loss <= 0.0 || stop_loss >= 1.0 {
            return Err(BacktestError::InvalidParameters(format!(
                "stop loss must be between 0 and 1 exclusive (value: {})",
                stop_loss
            )));
        }
        Ok(Self {
            multiplier,
            stop_loss,
        })
    }
}

/// Replay `bars` (ordered by date) for a single dividend event. Within one bar
/// the profit target is checked before the stop price.
pub fn simulate_bars(
    event: &Event,
    bars: &[Bar],
    params: TradeParameters,
) -> BacktestResult<TradeOutcome> {
    let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
        return Ok(TradeOutcome::NoTrade);
    };
    let unavailable = || BacktestError::DataUnavailable {
        symbol: event.symbol.clone(),
        start: event.start_date,
        end: event.end_date,
    };
    let beginning_price = first.open_price().ok_or_else(unavailable)?;
    let end_price = last.close_price().ok_or_else(unavailable)?;

    let profit_target = round_to_cents(beginning_price + params.multiplier * event.cash_amount);
    let stop_price = round_to_cents(beginning_price * (1.0 - params.stop_loss));

    for bar in bars {
        if bar.high >= profit_target {
            return Ok(TradeOutcome::Closed {
                gain: profit_target - beginning_price,
                purchase_price: beginning_price,
                exit: ExitReason::ProfitTarget,
            });
        }
        if bar.low <= stop_price {
            return Ok(TradeOutcome::Closed {
                gain: stop_price - beginning_price,
                purchase_price: beginning_price,
                exit: ExitReason::StopLoss,
            });
        }
    }

    Ok(TradeOutcome::Closed {
        gain: end_price - beginning_price + event.cash_amount,
        purchase_price: beginning_price,
        exit: ExitReason::HoldToClose,
    })
}

/// Simulate one event from resident bars. When the resident bars do not span
/// the event window, or a price inside it is unusable, the window is backfilled
/// once and replayed; only then is a missing price reported as unavailable.
pub fn simulate_event(
    market_data: &dyn MarketDataStore,
    event: &Event,
    params: TradeParameters,
) -> BacktestResult<TradeOutcome> {
    let bars = window_bars(market_data, event)?;
    if covers_window(event, &bars) {
        match simulate_bars(event, &bars, params) {
            Err(BacktestError::DataUnavailable { .. }) => {}
            result => return result,
        }
    }

    market_data
        .ensure_backfilled(&event.symbol, event.start_date, event.end_date)
        .map_err(BacktestError::io(format!(
            "backfilling {} {} - {}",
            event.symbol, event.start_date, event.end_date
        )))?;
    let bars = window_bars(market_data, event)?;
    simulate_bars(event, &bars, params)
}

fn window_bars(market_data: &dyn MarketDataStore, event: &Event) -> BacktestResult<Vec<Bar>> {
    market_data
        .bars(&event.symbol, event.start_date, event.end_date)
        .map_err(BacktestError::io(format!(
            "loading bars for {} {} - {}",
            event.symbol, event.start_date, event.end_date
        )))
}

fn covers_window(event: &Event, bars: &[Bar]) -> bool {
    match (bars.first(), bars.last()) {
        (Some(first), Some(last)) => {
            first.date <= event.start_date && last.date >= event.end_date
        }
        _ => false,
    }
}

/// Simulate every event, stopping at the first unavailable price.
pub fn simulate_events(
    market_data: &dyn MarketDataStore,
    events: &[Event],
    params: TradeParameters,
) -> BacktestResult<Vec<TradeOutcome>> {
    events
        .iter()
        .map(|event| simulate_event(market_data, event, params))
        .collect()
}
