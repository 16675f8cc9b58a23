use anyhow::Result;

use timbre_search::IndexState;
use timbre_sync::Config;

pub async fn show_status(config: &Config, json: bool) -> Result<()> {
    let coordinator = config.open_coordinator()?;
    let stats = coordinator.stats().await?;

    if json {
        return super::print_json(&stats);
    }

    println!("\n📊 Timbre Status\n");
    println!("  Database: {}", config.database_path.display());
    println!("  Index: {}", config.index_path.display());
    println!("  Live assets: {}", stats.catalog.live_assets);
    println!("  Total bytes: {}", stats.catalog.total_bytes);
    println!("  Duplicate groups: {}", stats.catalog.duplicate_groups);
    println!(
        "  Indexed vectors: {} ({} dimensions, {})",
        stats.index.vectors, stats.index.dimension, stats.index.metric
    );
    if stats.index.state == IndexState::Rebuilding {
        println!("  Index is rebuilding");
    }

    if stats.catalog.duplicate_groups > 0 {
        println!("\n  Run `timbre dedupe` to review duplicate content");
    }
    if stats.index.vectors != stats.catalog.live_assets {
        println!("\n  Catalog and index disagree; run `timbre verify`");
    }

    Ok(())
}
