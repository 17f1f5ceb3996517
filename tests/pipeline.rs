use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use dividend_engine::batch::{BatchDriver, InstrumentOutcome};
use dividend_engine::calendar::{BusinessCalendar, CalendarService};
use dividend_engine::commands::{import_dividends, search};
use dividend_engine::config::SearchSettings;
use dividend_engine::context::{AppContext, EngineContext};
use dividend_engine::data_context::{DataContext, MarketDataSnapshot};
use dividend_engine::database::Database;
use dividend_engine::error::NonEvaluableReason;
use dividend_engine::models::{generate_trial_id, Bar, DividendRecord, Instrument};
use dividend_engine::search_status::SearchStatus;
use dividend_engine::store::{
    AssetRepository, DividendRepository, EventRepository, InMemoryStore, JsonlTrialLog, TrialLog,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Once};

const SYMBOL: &str = "DIVX";
const CASH_AMOUNT: f64 = 0.5;
const HOLDING_DAYS: i32 = 5;

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn ex_dates() -> Vec<NaiveDate> {
    vec![
        date(2023, 1, 18),
        date(2023, 4, 19),
        date(2023, 7, 19),
        date(2023, 10, 18),
        date(2024, 1, 17),
        date(2024, 4, 17),
        date(2024, 7, 17),
        date(2024, 10, 16),
    ]
}

fn settings() -> SearchSettings {
    SearchSettings {
        holding_days: HOLDING_DAYS,
        stop_loss_percentages: vec![0.10],
        history_start: date(2014, 12, 31),
        history_end: date(2024, 12, 31),
        worker_count: 2,
    }
}

fn settings_map() -> HashMap<String, String> {
    [
        ("HOLDING_DAYS", "5"),
        ("STOP_LOSS_PERCENTAGES", "0.10"),
        ("HISTORY_END_DATE", "2024-12-31"),
        ("WORKER_COUNT", "2"),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value.to_string()))
    .collect()
}

fn record(symbol: &str, ex: NaiveDate) -> DividendRecord {
    DividendRecord {
        symbol: symbol.to_string(),
        ex_dividend_date: ex,
        declared_date: ex,
        record_date: ex,
        pay_date: ex,
        cash_amount: CASH_AMOUNT,
        currency: "USD".to_string(),
        frequency: "4".to_string(),
    }
}

/// Every third window dips through the 10% stop. The others drift sideways and
/// close at 20.60 with a last-day high of 20.60, so only multipliers up to 1.2
/// take profit early.
fn window_bars(calendar: &BusinessCalendar, symbol: &str, index: usize, ex: NaiveDate) -> Vec<Bar> {
    let end = calendar.business_day_offset(ex, -1);
    let start = calendar.business_day_offset(end, -HOLDING_DAYS);
    let loser = index % 3 == 0;
    let mut bars = Vec::new();
    let mut day = start;
    let mut position = 0;
    while day <= end {
        if calendar.is_business_day(day) {
            let last = day == end;
            bars.push(Bar {
                symbol: symbol.to_string(),
                date: day,
                open: 20.0,
                high: if last && !loser { 20.6 } else { 20.4 },
                low: if loser && position == 1 { 17.5 } else { 19.8 },
                close: if last && !loser { 20.6 } else { 20.0 },
                volume: 250_000.0,
                trade_count: 1_200.0,
            });
            position += 1;
        }
        day = day.succ_opt().unwrap();
    }
    bars
}

fn seed(store: &InMemoryStore, calendar: &BusinessCalendar, symbol: &str) {
    store.insert_instrument(Instrument::new(symbol, Some(date(2022, 1, 3))));
    let records: Vec<DividendRecord> = ex_dates()
        .into_iter()
        .map(|ex| record(symbol, ex))
        .collect();
    store.attach_records(&records).unwrap();
    for (index, ex) in ex_dates().into_iter().enumerate() {
        store.insert_bars(window_bars(calendar, symbol, index, ex));
    }
}

fn seeded_store(calendar: &BusinessCalendar) -> InMemoryStore {
    let store = InMemoryStore::new();
    seed(&store, calendar, SYMBOL);
    // A single payment can never produce a usable ratio.
    store.insert_instrument(Instrument::new("ONCE", Some(date(2024, 1, 2))));
    store.attach_records(&[record("ONCE", date(2024, 6, 12))]).unwrap();
    store
}

fn temp_path(prefix: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}-{}.{}", prefix, generate_trial_id(), extension))
}

#[test]
fn offline_batch_climbs_then_fine_tunes() -> Result<()> {
    ensure_test_env();
    let calendar = BusinessCalendar::default();
    let store = seeded_store(&calendar);
    let trials = Arc::new(InMemoryStore::new());
    let context = DataContext::in_memory(store.clone(), calendar, trials.clone());

    let driver = BatchDriver::new(context.clone(), settings()).with_progress(false);
    let symbols = driver.resolve_symbols(&[])?;
    assert_eq!(symbols, vec!["DIVX".to_string(), "ONCE".to_string()]);
    let report = driver.run(&symbols)?;

    assert_eq!(report.reports.len(), 2);
    assert!(matches!(
        report.get("ONCE").unwrap().outcome,
        InstrumentOutcome::NonEvaluable(NonEvaluableReason::TooFewEvents { sample_size: 1 })
    ));
    let InstrumentOutcome::Success {
        final_trial,
        trials_run,
        events,
    } = &report.get(SYMBOL).unwrap().outcome
    else {
        return Err(anyhow!("expected {} to succeed", SYMBOL));
    };
    assert_eq!(*events, 8);
    assert_eq!(*trials_run, 4);
    let final_trial = final_trial.as_ref().unwrap();
    assert_eq!(final_trial.multiplier, 2.25);
    assert_eq!(final_trial.sample_size, 8);
    assert!((final_trial.completeness - 8.0 / 11.0).abs() < 1e-12);
    assert!((final_trial.win_rate - 0.625).abs() < 1e-12);
    assert!((final_trial.avg_loss - 0.10).abs() < 1e-9);

    let history: Vec<f64> = trials
        .recent(SYMBOL, 20)?
        .into_iter()
        .rev()
        .map(|trial| trial.multiplier)
        .collect();
    assert_eq!(history, vec![1.0, 2.0, 3.0, 2.25]);
    assert!(trials.recent("ONCE", 20)?.is_empty());

    let instrument = store.get(SYMBOL)?.unwrap();
    assert_eq!(instrument.frequency, 4);
    assert_eq!(instrument.expected_events, 11);
    assert_eq!(store.events(SYMBOL)?.len(), 8);

    // A finished search resumes as done and appends nothing.
    let rerun = BatchDriver::new(context, settings())
        .with_progress(false)
        .run(&[SYMBOL.to_string()])?;
    match &rerun.get(SYMBOL).unwrap().outcome {
        InstrumentOutcome::Success {
            final_trial,
            trials_run,
            ..
        } => {
            assert_eq!(*trials_run, 0);
            assert_eq!(final_trial.as_ref().unwrap().multiplier, 2.25);
        }
        other => return Err(anyhow!("unexpected rerun outcome {:?}", other)),
    }
    assert_eq!(trials.recent(SYMBOL, 20)?.len(), 4);
    Ok(())
}

#[test]
fn interrupted_search_resumes_from_trial_log() -> Result<()> {
    ensure_test_env();
    let calendar = BusinessCalendar::default();
    let store = seeded_store(&calendar);
    let log_path = temp_path("resume-trials", "jsonl");

    {
        let trials = Arc::new(JsonlTrialLog::open(&log_path)?);
        let context = DataContext::in_memory(store.clone(), calendar.clone(), trials.clone());
        BatchDriver::new(context, settings())
            .with_progress(false)
            .run(&[SYMBOL.to_string()])?;
        assert_eq!(trials.recent(SYMBOL, 20)?.len(), 4);
    }

    // Drop the last two accepted trials to simulate a crash after round two.
    let contents = std::fs::read_to_string(&log_path)?;
    let kept: Vec<&str> = contents.lines().take(2).collect();
    std::fs::write(&log_path, format!("{}\n", kept.join("\n")))?;

    let trials = Arc::new(JsonlTrialLog::open(&log_path)?);
    let context = DataContext::in_memory(store, calendar, trials.clone());
    let report = BatchDriver::new(context, settings())
        .with_progress(false)
        .run(&[SYMBOL.to_string()])?;
    let multipliers: Vec<f64> = trials
        .recent(SYMBOL, 20)?
        .into_iter()
        .rev()
        .map(|trial| trial.multiplier)
        .collect();
    std::fs::remove_file(&log_path)?;

    assert_eq!(multipliers, vec![1.0, 2.0, 3.0, 2.25]);
    match &report.get(SYMBOL).unwrap().outcome {
        InstrumentOutcome::Success { trials_run, .. } => assert_eq!(*trials_run, 2),
        other => return Err(anyhow!("unexpected outcome {:?}", other)),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn search_command_updates_snapshot() -> Result<()> {
    ensure_test_env();
    let calendar = BusinessCalendar::new([date(2023, 7, 4)]);
    let store = seeded_store(&calendar);
    let data_file = temp_path("market-data", "bin");
    let trial_log = temp_path("market-data-trials", "jsonl");
    MarketDataSnapshot::from_store(&store, &calendar, &settings_map()).save_to_file(&data_file)?;

    let app = AppContext::initialize(None).await?;
    search::run(&app, Some(&data_file), Some(&trial_log), &[SYMBOL.to_string()]).await?;

    let snapshot = MarketDataSnapshot::load_from_file(&data_file, &SearchStatus::new())?;
    let (restored, restored_calendar, _) = snapshot.into_store()?;
    let log = JsonlTrialLog::open(&trial_log)?;
    let logged = log.recent(SYMBOL, 20)?;
    std::fs::remove_file(&data_file)?;
    std::fs::remove_file(&trial_log)?;

    assert!(!restored_calendar.is_business_day(date(2023, 7, 4)));
    assert_eq!(restored.events(SYMBOL)?.len(), 8);
    assert_eq!(restored.get(SYMBOL)?.unwrap().frequency, 4);
    assert_eq!(logged.len(), 4);
    assert_eq!(logged[0].multiplier, 2.25);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn import_dividends_attaches_and_estimates() -> Result<()> {
    ensure_test_env();
    let calendar = BusinessCalendar::default();
    let store = InMemoryStore::new();
    store.insert_instrument(Instrument::new("MO", Some(date(2023, 1, 3))));
    let data_file = temp_path("import-market-data", "bin");
    MarketDataSnapshot::from_store(&store, &calendar, &settings_map()).save_to_file(&data_file)?;

    let input = temp_path("announcements", "json");
    std::fs::write(
        &input,
        r#"{"results": [
            {"ticker": "MO", "ex_dividend_date": "2023-03-14", "pay_date": "2023-04-10", "cash_amount": 0.94, "frequency": 4},
            {"ticker": "MO", "ex_dividend_date": "2023-06-14", "cash_amount": 0.94, "frequency": 4},
            {"ticker": "MO", "ex_dividend_date": "2023-09-14", "cash_amount": 0.98, "frequency": 4},
            {"ticker": "MO", "ex_dividend_date": "2023-12-21", "cash_amount": 0.98, "frequency": 4},
            {"ticker": "MO", "cash_amount": 0.98},
            {"ticker": "NEW", "ex_dividend_date": "2024-03-21", "cash_amount": 0.25, "frequency": "12"}
        ]}"#,
    )?;

    let app = AppContext::initialize(None).await?;
    import_dividends::run(&app, &input, Some(&data_file)).await?;

    let trial_log = temp_path("import-trials", "jsonl");
    let engine = EngineContext::from_snapshot_file(&data_file, Some(&trial_log))?;
    let data = engine.data_context();
    let mo = data.assets.get("MO")?.unwrap();
    let new_listing = data.assets.get("NEW")?.unwrap();
    let records = data.dividends.records("MO")?;
    std::fs::remove_file(&data_file)?;
    std::fs::remove_file(&input)?;
    std::fs::remove_file(&trial_log)?;

    assert_eq!(records.len(), 4);
    assert_eq!(records[0].pay_date, date(2023, 4, 10));
    assert_eq!(records[1].pay_date, date(2023, 6, 14));
    assert!(mo.dividend);
    assert_eq!(mo.frequency, 4);
    // 2023-01-03 through 2024-12-31 is 23 whole months.
    assert_eq!(mo.expected_events, 7);
    assert!(new_listing.dividend);
    assert_eq!(new_listing.frequency, 12);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn postgres_store_round_trip() -> Result<()> {
    ensure_test_env();
    dotenvy::dotenv().ok();
    let Ok(database_url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping Postgres round trip");
        return Ok(());
    };

    let symbol = format!("T{}", &generate_trial_id()[..8]).to_uppercase();
    let calendar = BusinessCalendar::default();
    let seed_store = InMemoryStore::new();
    seed(&seed_store, &calendar, &symbol);

    let mut db = Database::new(&database_url).await?;
    db.ensure_schema().await?;
    for instrument in seed_store.instruments() {
        db.upsert_instrument(&instrument).await?;
    }
    let inserted = db.insert_dividend_records(&seed_store.all_records()).await?;
    assert_eq!(inserted, 8);
    assert_eq!(db.insert_dividend_records(&seed_store.all_records()).await?, 0);
    db.insert_bars(&seed_store.all_bars()).await?;

    let engine = EngineContext::from_database(db).await?;
    let driver = BatchDriver::new(engine.data_context(), settings()).with_progress(false);
    let requested = vec![symbol.clone()];
    let report = tokio::task::spawn_blocking(move || driver.run(&requested)).await??;
    assert!(report.get(&symbol).unwrap().outcome.is_success());

    let verify = Database::new(&database_url).await?;
    let trials = verify.get_recent_trials(&symbol, 20).await?;
    let events = verify.get_events(&symbol).await?;
    let instrument = verify.get_instrument(&symbol).await?.unwrap();

    let (client, connection) = tokio_postgres::connect(&database_url, tokio_postgres::NoTls).await?;
    tokio::spawn(connection);
    for table in ["trials", "events", "bars", "dividends", "instruments"] {
        client
            .execute(
                format!("DELETE FROM {} WHERE symbol = $1", table).as_str(),
                &[&symbol],
            )
            .await?;
    }

    assert_eq!(trials.len(), 4);
    assert_eq!(trials[0].multiplier, 2.25);
    assert_eq!(events.len(), 8);
    assert_eq!(instrument.frequency, 4);
    Ok(())
}
