pub mod estimate;
pub mod export_market_data;
pub mod import_dividends;
pub mod market_data_snapshot;
pub mod search;
