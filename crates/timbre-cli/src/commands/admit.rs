use anyhow::{Context, Result};
use std::io::{BufRead, BufReader};
use std::path::Path;

use timbre_sync::{Admission, AdmitRequest, Config};

/// Parse a JSON Lines manifest. Blank lines and `#` comments are skipped.
pub fn read_manifest(path: &Path) -> Result<Vec<AdmitRequest>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open manifest {}", path.display()))?;
    let mut requests = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context("Failed to read manifest")?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let request: AdmitRequest = serde_json::from_str(trimmed)
            .with_context(|| format!("Invalid manifest entry on line {}", n + 1))?;
        requests.push(request);
    }
    Ok(requests)
}

pub async fn run_admit(config: &Config, manifest: &Path) -> Result<()> {
    let requests = read_manifest(manifest)?;
    let coordinator = config.open_coordinator()?;
    log::info!("Admitting {} entries from {}", requests.len(), manifest.display());

    let (mut admitted, mut duplicates, mut failed) = (0_usize, 0_usize, 0_usize);
    for request in requests {
        let hash = request.content_hash.clone();
        match coordinator.admit(request).await {
            Ok(Admission::Admitted(id)) => {
                admitted += 1;
                println!("  ✓ {} → {}", hash.short(), id);
            }
            Ok(Admission::DuplicateOf(id)) => {
                duplicates += 1;
                println!("  = {} already held by {}", hash.short(), id);
            }
            Err(e) => {
                failed += 1;
                eprintln!("  ✗ {}: {}", hash.short(), e);
            }
        }
    }

    if admitted > 0 {
        super::checkpoint(&coordinator, config).await?;
    }

    println!("\nAdmitted {admitted}, duplicates {duplicates}, failed {failed}");
    if failed > 0 {
        anyhow::bail!("{failed} manifest entries could not be admitted");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_manifest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# generated").unwrap();
        writeln!(
            file,
            r#"{{"content_hash":"abc","vector":[1.0,0.0],"size_bytes":3,"location":"a/abc"}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"content_hash":"def","vector":[0.0,1.0],"size_bytes":4,"location":"a/def","tags":["x"]}}"#
        )
        .unwrap();

        let requests = read_manifest(file.path()).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].content_hash.as_str(), "abc");
        assert!(requests[0].tags.is_empty());
        assert_eq!(requests[1].tags, vec!["x".to_string()]);
    }

    #[test]
    fn test_read_manifest_reports_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"content_hash":"abc"}}"#).unwrap();
        let err = read_manifest(file.path()).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}
