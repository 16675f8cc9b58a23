use anyhow::Result;
use serde::Serialize;

use timbre_core::model::ConsistencyWarning;
use timbre_sync::{Config, ConsistencyReport, IndexOutcome, OrphanBlobReport};

#[derive(Debug, Serialize)]
struct Verification {
    #[serde(flatten)]
    report: ConsistencyReport,
    orphan_blobs: Vec<ConsistencyWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blob_repair: Option<OrphanBlobReport>,
}

pub async fn run_verify(config: &Config, repair: bool, json: bool) -> Result<()> {
    let coordinator = config.open_coordinator()?;
    let report = coordinator.reconcile(repair).await?;
    let orphan_blobs = coordinator.orphan_blobs().await?;
    let blob_repair = if repair && !orphan_blobs.is_empty() {
        Some(coordinator.delete_orphan_blobs().await?)
    } else {
        None
    };
    if matches!(report.repair, Some(IndexOutcome::Rebuilt { removed, .. }) if removed > 0) {
        super::checkpoint(&coordinator, config).await?;
    }

    if json {
        return super::print_json(&Verification {
            report,
            orphan_blobs,
            blob_repair,
        });
    }

    println!(
        "Catalog assets: {}, indexed vectors: {}",
        report.catalog_assets, report.indexed_vectors
    );
    for warning in report.warnings.iter().chain(&orphan_blobs) {
        println!("  ⚠ {warning}");
    }
    match report.repair {
        Some(IndexOutcome::Rebuilt { removed, remaining }) => {
            println!("\nRepaired index: {removed} removed, {remaining} remaining");
        }
        Some(IndexOutcome::Failed { message, .. }) => {
            println!("\nRepair failed: {message}");
        }
        Some(IndexOutcome::Skipped) | None => {}
    }
    if let Some(blobs) = &blob_repair {
        println!(
            "Removed {} of {} orphan blobs",
            blobs.removed.len(),
            blobs.found
        );
        for failure in &blobs.failures {
            println!("  ✗ {}: {}", failure.location, failure.message);
        }
    }

    if report.warnings.is_empty() && orphan_blobs.is_empty() {
        println!("✓ Stores agree");
    } else if !repair {
        println!("\nRun `timbre verify --repair` to drop dangling index entries and orphan blobs");
    }
    Ok(())
}
