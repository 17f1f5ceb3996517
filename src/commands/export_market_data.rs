use crate::context::AppContext;
use crate::data_context::MarketDataSnapshot;
use crate::search_status::SearchStatus;
use anyhow::Result;
use log::info;
use std::path::Path;

pub async fn run(app: &AppContext, output_path: &Path) -> Result<()> {
    info!(
        "Generating market data snapshot at {}",
        output_path.display()
    );

    let db = app.database().await?;
    let snapshot = MarketDataSnapshot::load_from_database(&db, &SearchStatus::new()).await?;

    snapshot.save_to_file(output_path)?;
    info!(
        "Market data snapshot successfully written to {}",
        output_path.display()
    );

    Ok(())
}
