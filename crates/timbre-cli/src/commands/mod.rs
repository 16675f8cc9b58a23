pub mod admit;
pub mod cleanup;
pub mod config;
pub mod query;
pub mod status;
pub mod verify;

pub use admit::run_admit;
pub use cleanup::{run_cleanup, run_dedupe};
pub use query::run_query;
pub use status::show_status;
pub use verify::run_verify;

use anyhow::{Context, Result};
use serde::Serialize;

use timbre_sync::{ConsistencyCoordinator, Config};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render JSON")?;
    println!("{rendered}");
    Ok(())
}

/// Persist the embedding index after a mutating command.
async fn checkpoint(coordinator: &ConsistencyCoordinator, config: &Config) -> Result<()> {
    coordinator
        .checkpoint(&config.index_path)
        .await
        .with_context(|| format!("Failed to save index to {}", config.index_path.display()))?;
    Ok(())
}
