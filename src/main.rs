use anyhow::anyhow;
use clap::{Parser, Subcommand};
use dividend_engine::{
    commands::{estimate, export_market_data, import_dividends, search},
    context::AppContext,
};
use log::info;
use std::env;
use std::path::PathBuf;

const DEFAULT_MARKET_DATA_FILE: &str = "../data/market-data.bin";

#[derive(Parser)]
#[command(name = "dividend-engine")]
#[command(about = "Dividend-capture backtests with an adaptive profit-target search")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate completeness, build events and search multipliers per instrument
    Search {
        /// Path to a market data snapshot; uses the database when omitted
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// JSON-lines trial log for offline runs (defaults next to the snapshot)
        #[arg(long = "trial-log", value_name = "PATH")]
        trial_log: Option<PathBuf>,
        /// Symbols to process (defaults to every dividend-paying instrument)
        #[arg(value_delimiter = ',', num_args = 0..)]
        symbols: Vec<String>,
    },
    /// Refresh dividend frequency and completeness for every dividend instrument
    Estimate {
        /// Path to a market data snapshot; uses the database when omitted
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
    },
    /// Normalize vendor dividend announcements and attach them to instruments
    ImportDividends {
        /// JSON file with announcements (array, vendor page or JSON lines)
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
        /// Path to a market data snapshot; uses the database when omitted
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
    },
    /// Export database contents into a market data snapshot for offline runs
    ExportMarketData {
        /// Destination file for the snapshot
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let Cli { command } = cli;

    let database_url = env::var("DATABASE_URL").ok();
    if database_url.is_none() && command_requires_database(&command) {
        return Err(anyhow!(
            "DATABASE_URL must be set for this command. For offline runs, pass --data-file with a market data snapshot."
        ));
    }
    let app_context = AppContext::initialize(database_url).await?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting dividend engine. Not financial advice. Backtested results do not guarantee future returns.");

    match command {
        Commands::Search {
            data_file,
            trial_log,
            symbols,
        } => {
            search::run(
                &app_context,
                data_file.as_deref(),
                trial_log.as_deref(),
                &symbols,
            )
            .await?;
        }
        Commands::Estimate { data_file } => {
            estimate::run(&app_context, data_file.as_deref()).await?;
        }
        Commands::ImportDividends { input, data_file } => {
            import_dividends::run(&app_context, &input, data_file.as_deref()).await?;
        }
        Commands::ExportMarketData { output } => {
            let output_path = resolve_market_data_path(output);
            export_market_data::run(&app_context, &output_path).await?;
        }
    }

    Ok(())
}

fn resolve_market_data_path(cli_value: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli_value {
        return path;
    }

    PathBuf::from(DEFAULT_MARKET_DATA_FILE)
}

fn command_requires_database(command: &Commands) -> bool {
    match command {
        Commands::Search { data_file, .. }
        | Commands::Estimate { data_file }
        | Commands::ImportDividends { data_file, .. } => data_file.is_none(),
        Commands::ExportMarketData { .. } => true,
    }
}
