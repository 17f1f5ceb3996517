use crate::calendar::CalendarService;
use crate::error::{BacktestError, BacktestResult};
use crate::models::{DividendRecord, Event};
use crate::store::{EventRepository, MarketDataStore};
use log::{debug, info};

pub struct EventBuilder<'a> {
    calendar: &'a dyn CalendarService,
    market_data: &'a dyn MarketDataStore,
    events: &'a dyn EventRepository,
    holding_days: i32,
}

impl<'a> EventBuilder<'a> {
    pub fn new(
        calendar: &'a dyn CalendarService,
        market_data: &'a dyn MarketDataStore,
        events: &'a dyn EventRepository,
        holding_days: i32,
    ) -> Self {
        Self {
            calendar,
            market_data,
            events,
            holding_days,
        }
    }

    /// Window for a single record: sell one business day before the ex-date and
    /// buy `holding_days` business days before that.
    pub fn event_for(&self, record: &DividendRecord) -> Event {
        let end_date = self
            .calendar
            .business_day_offset(record.ex_dividend_date, -1);
        let start_date = self
            .calendar
            .business_day_offset(end_date, -self.holding_days);
        Event {
            symbol: record.symbol.clone(),
            ex_dividend_date: record.ex_dividend_date,
            start_date,
            end_date,
            cash_amount: record.cash_amount,
        }
    }

    /// Build events for records past the last built ex-dividend date. Records
    /// must be ascending by ex-dividend date. Returns the newly built events.
    pub fn build(&self, symbol: &str, records: &[DividendRecord]) -> BacktestResult<Vec<Event>> {
        let existing = self
            .events
            .events(symbol)
            .map_err(BacktestError::io(format!("loading events for {}", symbol)))?;
        let built_through = existing.last().map(|event| event.ex_dividend_date);

        let pending: Vec<&DividendRecord> = records
            .iter()
            .filter(|record| record.symbol == symbol)
            .filter(|record| built_through.map_or(true, |last| record.ex_dividend_date > last))
            .collect();
        if pending.is_empty() {
            debug!("All dividend records for {} already have events", symbol);
            return Ok(Vec::new());
        }

        let required_bars = (self.holding_days + 1) as usize;
        let mut built = Vec::with_capacity(pending.len());
        for record in pending {
            let event = self.event_for(record);
            let resident = self
                .market_data
                .bars(symbol, event.start_date, event.end_date)
                .map_err(BacktestError::io(format!("loading bars for {}", symbol)))?;
            if resident.len() < required_bars {
                self.market_data
                    .ensure_backfilled(symbol, event.start_date, event.end_date)
                    .map_err(BacktestError::io(format!(
                        "backfilling {} {} - {}",
                        symbol, event.start_date, event.end_date
                    )))?;
            }
            built.push(event);
        }

        self.events
            .append_events(&built)
            .map_err(BacktestError::io(format!("storing events for {}", symbol)))?;
        info!("Built {} new event(s) for {}", built.len(), symbol);
        Ok(built)
    }
}
