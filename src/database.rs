use crate::models::*;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use log::error;
use std::collections::HashMap;
use tokio_postgres::{Client, NoTls, Row};

// Limit per-transaction inserts to keep large bar imports manageable.
const BAR_INSERT_CHUNK_SIZE: usize = 50_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS settings (
    setting_key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS holidays (
    date DATE PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS instruments (
    symbol TEXT PRIMARY KEY,
    first_trade_date DATE,
    dividend BOOLEAN NOT NULL DEFAULT FALSE,
    frequency INTEGER NOT NULL DEFAULT -1,
    expected_events BIGINT NOT NULL DEFAULT -1,
    completeness DOUBLE PRECISION NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS dividends (
    symbol TEXT NOT NULL,
    ex_dividend_date DATE NOT NULL,
    declared_date DATE NOT NULL,
    record_date DATE NOT NULL,
    pay_date DATE NOT NULL,
    cash_amount DOUBLE PRECISION NOT NULL,
    currency TEXT NOT NULL,
    frequency TEXT NOT NULL,
    PRIMARY KEY (symbol, ex_dividend_date)
);
CREATE TABLE IF NOT EXISTS bars (
    symbol TEXT NOT NULL,
    date DATE NOT NULL,
    open DOUBLE PRECISION NOT NULL,
    high DOUBLE PRECISION NOT NULL,
    low DOUBLE PRECISION NOT NULL,
    close DOUBLE PRECISION NOT NULL,
    volume DOUBLE PRECISION NOT NULL,
    trade_count DOUBLE PRECISION NOT NULL,
    PRIMARY KEY (symbol, date)
);
CREATE TABLE IF NOT EXISTS events (
    symbol TEXT NOT NULL,
    ex_dividend_date DATE NOT NULL,
    start_date DATE NOT NULL,
    end_date DATE NOT NULL,
    cash_amount DOUBLE PRECISION NOT NULL,
    PRIMARY KEY (symbol, ex_dividend_date)
);
CREATE TABLE IF NOT EXISTS trials (
    seq BIGSERIAL PRIMARY KEY,
    id TEXT NOT NULL UNIQUE,
    symbol TEXT NOT NULL,
    multiplier DOUBLE PRECISION NOT NULL,
    stop_loss DOUBLE PRECISION NOT NULL,
    win_rate DOUBLE PRECISION NOT NULL,
    loss_rate DOUBLE PRECISION NOT NULL,
    avg_gain DOUBLE PRECISION NOT NULL,
    avg_loss DOUBLE PRECISION NOT NULL,
    sample_size INTEGER NOT NULL,
    completeness DOUBLE PRECISION NOT NULL,
    avg_dividend DOUBLE PRECISION NOT NULL,
    portion_to_risk DOUBLE PRECISION NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS trials_symbol_seq_idx ON trials (symbol, seq);
";

const INSTRUMENT_COLUMNS: &str =
    "symbol, first_trade_date, dividend, frequency, expected_events, completeness";
const DIVIDEND_COLUMNS: &str =
    "symbol, ex_dividend_date, declared_date, record_date, pay_date, cash_amount, currency, frequency";
const BAR_COLUMNS: &str = "symbol, date, open, high, low, close, volume, trade_count";
const EVENT_COLUMNS: &str = "symbol, ex_dividend_date, start_date, end_date, cash_amount";
const TRIAL_COLUMNS: &str = "id, symbol, multiplier, stop_loss, win_rate, loss_rate, avg_gain, avg_loss, sample_size, completeness, avg_dividend, portion_to_risk, created_at";

pub struct Database {
    client: Client,
}

impl Database {
    pub async fn new<S: AsRef<str>>(database_url: S) -> Result<Self> {
        let database_url = database_url.as_ref().to_string();
        let (client, connection) = tokio_postgres::connect(&database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to PostgreSQL at {}", database_url))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self { client })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        self.client
            .batch_execute(SCHEMA)
            .await
            .context("failed to create database schema")
    }

    pub async fn get_all_settings(&self) -> Result<HashMap<String, String>> {
        let rows = self
            .client
            .query("SELECT setting_key, value FROM settings", &[])
            .await?;
        let mut settings = HashMap::with_capacity(rows.len());
        for row in rows {
            settings.insert(row.get::<_, String>(0), row.get::<_, String>(1));
        }
        Ok(settings)
    }

    pub async fn upsert_setting(&self, setting_key: &str, value: &str) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO settings (setting_key, value) VALUES ($1, $2)
                 ON CONFLICT (setting_key) DO UPDATE SET value = EXCLUDED.value",
                &[&setting_key, &value],
            )
            .await?;
        Ok(())
    }

    pub async fn get_holidays(&self) -> Result<Vec<NaiveDate>> {
        let rows = self
            .client
            .query("SELECT date FROM holidays ORDER BY date", &[])
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    pub async fn insert_holidays(&self, holidays: &[NaiveDate]) -> Result<()> {
        for date in holidays {
            self.client
                .execute(
                    "INSERT INTO holidays (date) VALUES ($1) ON CONFLICT (date) DO NOTHING",
                    &[date],
                )
                .await?;
        }
        Ok(())
    }

    pub async fn get_instrument(&self, symbol: &str) -> Result<Option<Instrument>> {
        let query = format!("SELECT {} FROM instruments WHERE symbol = $1", INSTRUMENT_COLUMNS);
        let row = self.client.query_opt(query.as_str(), &[&symbol]).await?;
        Ok(row.as_ref().map(map_instrument_row))
    }

    pub async fn get_all_instruments(&self) -> Result<Vec<Instrument>> {
        let query = format!("SELECT {} FROM instruments ORDER BY symbol", INSTRUMENT_COLUMNS);
        let rows = self.client.query(query.as_str(), &[]).await?;
        Ok(rows.iter().map(map_instrument_row).collect())
    }

    pub async fn get_dividend_symbols(&self) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT symbol FROM instruments WHERE dividend ORDER BY symbol",
                &[],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    pub async fn upsert_instrument(&self, instrument: &Instrument) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO instruments (symbol, first_trade_date, dividend, frequency, expected_events, completeness)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (symbol) DO UPDATE
                 SET first_trade_date = EXCLUDED.first_trade_date,
                     dividend = EXCLUDED.dividend,
                     frequency = EXCLUDED.frequency,
                     expected_events = EXCLUDED.expected_events,
                     completeness = EXCLUDED.completeness",
                &[
                    &instrument.symbol,
                    &instrument.first_trade_date,
                    &instrument.dividend,
                    &instrument.frequency,
                    &instrument.expected_events,
                    &instrument.completeness,
                ],
            )
            .await?;
        Ok(())
    }

    /// Single-statement update so readers never see a partially written estimate.
    pub async fn update_instrument_completeness(
        &self,
        symbol: &str,
        frequency: i32,
        expected_events: i64,
        completeness: f64,
    ) -> Result<Instrument> {
        let query = format!(
            "UPDATE instruments SET frequency = $2, expected_events = $3, completeness = $4
             WHERE symbol = $1
             RETURNING {}",
            INSTRUMENT_COLUMNS
        );
        let row = self
            .client
            .query_opt(
                query.as_str(),
                &[&symbol, &frequency, &expected_events, &completeness],
            )
            .await?
            .ok_or_else(|| anyhow!("Unknown instrument {}", symbol))?;
        Ok(map_instrument_row(&row))
    }

    pub async fn get_dividend_records(&self, symbol: &str) -> Result<Vec<DividendRecord>> {
        let query = format!(
            "SELECT {} FROM dividends WHERE symbol = $1 ORDER BY ex_dividend_date",
            DIVIDEND_COLUMNS
        );
        let rows = self.client.query(query.as_str(), &[&symbol]).await?;
        Ok(rows.iter().map(map_dividend_row).collect())
    }

    pub async fn get_all_dividend_records(&self) -> Result<Vec<DividendRecord>> {
        let query = format!(
            "SELECT {} FROM dividends ORDER BY symbol, ex_dividend_date",
            DIVIDEND_COLUMNS
        );
        let rows = self.client.query(query.as_str(), &[]).await?;
        Ok(rows.iter().map(map_dividend_row).collect())
    }

    /// Insert records, skipping (symbol, ex-dividend date) pairs already stored,
    /// and flag their instruments as dividend payers.
    pub async fn insert_dividend_records(&mut self, records: &[DividendRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let tx = self.client.transaction().await?;
        let insert = tx
            .prepare(
                "INSERT INTO dividends (symbol, ex_dividend_date, declared_date, record_date, pay_date, cash_amount, currency, frequency)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (symbol, ex_dividend_date) DO NOTHING",
            )
            .await?;
        let mark = tx
            .prepare(
                "INSERT INTO instruments (symbol, dividend) VALUES ($1, TRUE)
                 ON CONFLICT (symbol) DO UPDATE SET dividend = TRUE",
            )
            .await?;

        let mut inserted = 0usize;
        for record in records {
            let changed = tx
                .execute(
                    &insert,
                    &[
                        &record.symbol,
                        &record.ex_dividend_date,
                        &record.declared_date,
                        &record.record_date,
                        &record.pay_date,
                        &record.cash_amount,
                        &record.currency,
                        &record.frequency,
                    ],
                )
                .await?;
            if changed > 0 {
                inserted += 1;
                tx.execute(&mark, &[&record.symbol]).await?;
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn get_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>> {
        let query = format!(
            "SELECT {} FROM bars WHERE symbol = $1 AND date BETWEEN $2 AND $3 ORDER BY date",
            BAR_COLUMNS
        );
        let rows = self
            .client
            .query(query.as_str(), &[&symbol, &start, &end])
            .await?;
        Ok(rows.iter().map(map_bar_row).collect())
    }

    pub async fn get_all_bars(&self) -> Result<Vec<Bar>> {
        let query = format!("SELECT {} FROM bars ORDER BY symbol, date", BAR_COLUMNS);
        let rows = self.client.query(query.as_str(), &[]).await?;
        Ok(rows.iter().map(map_bar_row).collect())
    }

    pub async fn insert_bars(&mut self, bars: &[Bar]) -> Result<usize> {
        let mut inserted = 0usize;
        for chunk in bars.chunks(BAR_INSERT_CHUNK_SIZE) {
            let tx = self.client.transaction().await?;
            let stmt = tx
                .prepare(
                    "INSERT INTO bars (symbol, date, open, high, low, close, volume, trade_count)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                     ON CONFLICT (symbol, date) DO NOTHING",
                )
                .await?;

            for bar in chunk {
                let changed = tx
                    .execute(
                        &stmt,
                        &[
                            &bar.symbol,
                            &bar.date,
                            &bar.open,
                            &bar.high,
                            &bar.low,
                            &bar.close,
                            &bar.volume,
                            &bar.trade_count,
                        ],
                    )
                    .await?;
                if changed > 0 {
                    inserted += 1;
                }
            }

            tx.commit().await?;
        }
        Ok(inserted)
    }

    pub async fn get_events(&self, symbol: &str) -> Result<Vec<Event>> {
        let query = format!(
            "SELECT {} FROM events WHERE symbol = $1 ORDER BY ex_dividend_date",
            EVENT_COLUMNS
        );
        let rows = self.client.query(query.as_str(), &[&symbol]).await?;
        Ok(rows.iter().map(map_event_row).collect())
    }

    pub async fn get_all_events(&self) -> Result<Vec<Event>> {
        let query = format!(
            "SELECT {} FROM events ORDER BY symbol, ex_dividend_date",
            EVENT_COLUMNS
        );
        let rows = self.client.query(query.as_str(), &[]).await?;
        Ok(rows.iter().map(map_event_row).collect())
    }

    pub async fn insert_events(&mut self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let tx = self.client.transaction().await?;
        let stmt = tx
            .prepare(
                "INSERT INTO events (symbol, ex_dividend_date, start_date, end_date, cash_amount)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (symbol, ex_dividend_date) DO NOTHING",
            )
            .await?;
        for event in events {
            tx.execute(
                &stmt,
                &[
                    &event.symbol,
                    &event.ex_dividend_date,
                    &event.start_date,
                    &event.end_date,
                    &event.cash_amount,
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_trial(&self, trial: &Trial) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO trials (id, symbol, multiplier, stop_loss, win_rate, loss_rate, avg_gain, avg_loss, sample_size, completeness, avg_dividend, portion_to_risk, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &trial.id,
                    &trial.symbol,
                    &trial.multiplier,
                    &trial.stop_loss,
                    &trial.win_rate,
                    &trial.loss_rate,
                    &trial.avg_gain,
                    &trial.avg_loss,
                    &trial.sample_size,
                    &trial.completeness,
                    &trial.avg_dividend,
                    &trial.portion_to_risk,
                    &trial.created_at,
                ],
            )
            .await
            .with_context(|| format!("failed to insert trial {} for {}", trial.id, trial.symbol))?;
        Ok(())
    }

    pub async fn get_recent_trials(&self, symbol: &str, limit: usize) -> Result<Vec<Trial>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let query = format!(
            "SELECT {} FROM trials WHERE symbol = $1 ORDER BY seq DESC LIMIT $2",
            TRIAL_COLUMNS
        );
        let rows = self
            .client
            .query(query.as_str(), &[&symbol, &limit])
            .await?;
        Ok(rows.iter().map(map_trial_row).collect())
    }
}

fn map_instrument_row(row: &Row) -> Instrument {
    Instrument {
        symbol: row.get(0),
        first_trade_date: row.get::<_, Option<NaiveDate>>(1),
        dividend: row.get(2),
        frequency: row.get(3),
        expected_events: row.get(4),
        completeness: row.get(5),
    }
}

fn map_dividend_row(row: &Row) -> DividendRecord {
    DividendRecord {
        symbol: row.get(0),
        ex_dividend_date: row.get(1),
        declared_date: row.get(2),
        record_date: row.get(3),
        pay_date: row.get(4),
        cash_amount: row.get(5),
        currency: row.get(6),
        frequency: row.get(7),
    }
}

fn map_bar_row(row: &Row) -> Bar {
    Bar {
        symbol: row.get(0),
        date: row.get(1),
        open: row.get(2),
        high: row.get(3),
        low: row.get(4),
        close: row.get(5),
        volume: row.get(6),
        trade_count: row.get(7),
    }
}

fn map_event_row(row: &Row) -> Event {
    Event {
        symbol: row.get(0),
        ex_dividend_date: row.get(1),
        start_date: row.get(2),
        end_date: row.get(3),
        cash_amount: row.get(4),
    }
}

fn map_trial_row(row: &Row) -> Trial {
    Trial {
        id: row.get(0),
        symbol: row.get(1),
        multiplier: row.get(2),
        stop_loss: row.get(3),
        win_rate: row.get(4),
        loss_rate: row.get(5),
        avg_gain: row.get(6),
        avg_loss: row.get(7),
        sample_size: row.get(8),
        completeness: row.get(9),
        avg_dividend: row.get(10),
        portion_to_risk: row.get(11),
        created_at: row.get(12),
    }
}
