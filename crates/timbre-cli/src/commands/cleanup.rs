use anyhow::Result;

use timbre_core::model::CleanupCriteria;
use timbre_sync::{CleanupReport, Config, IndexOutcome};

/// Combine command-line flags into cleanup criteria.
pub fn criteria(duplicates: bool, orphaned: bool, older_than_days: Option<u32>) -> CleanupCriteria {
    let mut criteria = CleanupCriteria::default();
    if duplicates {
        criteria = criteria.and(CleanupCriteria::duplicates());
    }
    if orphaned {
        criteria = criteria.and(CleanupCriteria::orphaned());
    }
    if let Some(days) = older_than_days {
        criteria = criteria.and(CleanupCriteria::older_than(chrono::Duration::days(
            i64::from(days),
        )));
    }
    criteria
}

pub async fn run_cleanup(
    config: &Config,
    criteria: CleanupCriteria,
    execute: bool,
    json: bool,
) -> Result<()> {
    if criteria.is_empty() {
        anyhow::bail!("Select at least one of --duplicates, --orphaned, --older-than-days");
    }
    let coordinator = config.open_coordinator()?;
    let report = coordinator.cleanup(criteria, !execute).await?;
    if execute {
        super::checkpoint(&coordinator, config).await?;
    }

    if json {
        return super::print_json(&report);
    }
    print_report(&report);
    Ok(())
}

pub async fn run_dedupe(config: &Config, execute: bool, json: bool) -> Result<()> {
    let coordinator = config.open_coordinator()?;
    let report = coordinator.resolve_duplicates(!execute).await?;
    if execute {
        super::checkpoint(&coordinator, config).await?;
    }

    if json {
        return super::print_json(&report);
    }
    println!("Duplicate groups: {}", report.groups.len());
    for group in &report.groups {
        println!(
            "  {}  keep {}  remove {}",
            group.content_hash.short(),
            group.canonical.id,
            group.duplicates.len()
        );
    }
    println!();
    print_report(&report.cleanup);
    Ok(())
}

fn print_report(report: &CleanupReport) {
    if report.dry_run {
        println!("Dry run: {} candidates", report.candidates.len());
        for candidate in &report.candidates {
            println!(
                "  {}  {:<10} {} bytes",
                candidate.asset_id, candidate.reason, candidate.estimated_bytes_freed
            );
        }
        println!(
            "\nWould free {} bytes. Re-run with --execute to delete.",
            report.estimated_bytes
        );
        return;
    }

    println!(
        "Deleted {} of {} candidates, freed {} bytes",
        report.deleted_count,
        report.candidates.len(),
        report.bytes_freed
    );
    match &report.index {
        IndexOutcome::Skipped => {}
        IndexOutcome::Rebuilt { removed, remaining } => {
            println!("Index rebuilt: {removed} removed, {remaining} remaining");
        }
        IndexOutcome::Failed { message, stale } => {
            println!(
                "Index rebuild failed ({message}); {} entries will be removed by the next \
                 cleanup or `timbre verify --repair`",
                stale.len()
            );
        }
    }
    if !report.errors.is_empty() {
        println!("\n{} errors:", report.errors.len());
        for failure in &report.errors {
            println!("  ✗ {failure}");
        }
    }
}
