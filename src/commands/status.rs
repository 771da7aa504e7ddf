use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::model::{CheckpointRecord, SkipManifest};

pub fn run(args: StatusArgs) -> Result<()> {
    info!(data_root = %args.data_root.display(), "status requested");

    report_checkpoints(&args.data_root.join("checkpoints"))?;
    report_skip_manifest(&args.data_root.join("manifests").join("skip_pages.json"));

    Ok(())
}

fn report_checkpoints(checkpoints_dir: &Path) -> Result<()> {
    if !checkpoints_dir.is_dir() {
        warn!(path = %checkpoints_dir.display(), "no checkpoints recorded");
        return Ok(());
    }

    let mut paths = Vec::new();
    for entry in fs::read_dir(checkpoints_dir)
        .with_context(|| format!("failed to read {}", checkpoints_dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();

    if paths.is_empty() {
        warn!(path = %checkpoints_dir.display(), "no checkpoints recorded");
        return Ok(());
    }

    for path in paths {
        // One stale or truncated checkpoint should not hide the rest of the listing.
        let record: CheckpointRecord = match fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_slice(&raw).map_err(anyhow::Error::from))
        {
            Ok(record) => record,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable checkpoint");
                continue;
            }
        };

        info!(
            step = %record.step,
            stage = record.stage,
            status = %record.status,
            total = record.progress.total_items,
            completed = record.progress.completed,
            failed = record.progress.failed,
            skipped = record.progress.skipped,
            updated_at = %record.updated_at,
            "checkpoint"
        );
    }

    Ok(())
}

fn report_skip_manifest(path: &Path) {
    if !path.exists() {
        warn!(path = %path.display(), "skip manifest missing");
        return;
    }

    let manifest: SkipManifest = match fs::read(path)
        .map_err(anyhow::Error::from)
        .and_then(|raw| serde_json::from_slice(&raw).map_err(anyhow::Error::from))
    {
        Ok(manifest) => manifest,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "skip manifest unreadable");
            return;
        }
    };

    info!(
        generated_at = %manifest.generated_at,
        total_pages = manifest.total_pages,
        skipped_pages = manifest.skipped_pages,
        "loaded skip manifest"
    );
    for (reason, count) in &manifest.by_reason {
        info!(reason = %reason, count = count, "skip tally");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::util::{now_utc_string, write_json_pretty};

    #[test]
    fn empty_data_root_is_reported_without_error() {
        let dir = tempfile::TempDir::new().unwrap();

        let args = StatusArgs {
            data_root: dir.path().to_path_buf(),
        };
        assert!(run(args).is_ok());
    }

    #[test]
    fn populated_data_root_is_summarized() {
        let dir = tempfile::TempDir::new().unwrap();
        let checkpoints_dir = dir.path().join("checkpoints");

        let mut store = CheckpointStore::load_or_create(&checkpoints_dir, "scan", 4).unwrap();
        store.set_total(12).unwrap();
        fs::write(checkpoints_dir.join("extract_stage05.json"), "{ truncated").unwrap();

        let manifest = SkipManifest {
            manifest_version: 1,
            generated_at: now_utc_string(),
            total_pages: 12,
            skipped_pages: 1,
            by_reason: BTreeMap::from([("repeated_lines".to_string(), 1)]),
            pages: Vec::new(),
        };
        let manifest_path = dir.path().join("manifests").join("skip_pages.json");
        write_json_pretty(&manifest_path, &manifest).unwrap();

        let args = StatusArgs {
            data_root: dir.path().to_path_buf(),
        };
        assert!(run(args).is_ok());
    }

    #[test]
    fn corrupt_skip_manifest_is_reported_not_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let manifest_path = dir.path().join("manifests").join("skip_pages.json");
        fs::create_dir_all(manifest_path.parent().unwrap()).unwrap();
        fs::write(&manifest_path, "][").unwrap();

        let args = StatusArgs {
            data_root: dir.path().to_path_buf(),
        };
        assert!(run(args).is_ok());
    }
}
