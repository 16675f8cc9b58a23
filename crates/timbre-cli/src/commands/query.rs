use anyhow::{Context, Result};

use timbre_core::model::{AssetId, AssetSummary};
use timbre_sync::Config;

/// Parse a comma-separated list of floats.
pub fn parse_vector(raw: &str) -> Result<Vec<f32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<f32>()
                .with_context(|| format!("Invalid vector component '{part}'"))
        })
        .collect()
}

pub async fn run_query(
    config: &Config,
    vector: Option<&str>,
    like: Option<&str>,
    k: usize,
    tags: &[String],
    json: bool,
) -> Result<()> {
    let coordinator = config.open_coordinator()?;

    let results = match (vector, like) {
        (Some(raw), _) => {
            let vector = parse_vector(raw)?;
            coordinator.query_similar_tagged(&vector, k, tags).await?
        }
        (None, Some(id)) => {
            let asset_id: AssetId = id
                .parse()
                .with_context(|| format!("Invalid asset id '{id}'"))?;
            coordinator.find_similar(asset_id, k).await?
        }
        (None, None) => anyhow::bail!("Either --vector or --like is required"),
    };

    if json {
        return super::print_json(&results);
    }
    print_results(&results);
    Ok(())
}

fn print_results(results: &[AssetSummary]) {
    if results.is_empty() {
        println!("No matching assets");
        return;
    }
    for (rank, summary) in results.iter().enumerate() {
        println!(
            "{:>3}. {:.4}  {}  {}  {}",
            rank + 1,
            summary.similarity,
            summary.asset_id,
            summary.content_hash.short(),
            summary.location
        );
    }
}
