use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::cli::DeltaArgs;
use crate::delta::SnapshotDiffer;
use crate::model::DeltaRunManifest;
use crate::util::{now_utc_string, utc_compact_string, write_json_pretty};

pub fn run(args: DeltaArgs) -> Result<()> {
    let started_ts = Utc::now();
    let run_id = format!("delta-{}", utc_compact_string(started_ts));

    let snapshots_root = args
        .snapshots_root
        .clone()
        .unwrap_or_else(|| args.data_root.join("snapshots"));
    let current = match args.current.clone() {
        Some(path) => path,
        None => latest_snapshot(&snapshots_root)?,
    };

    let key_fields = if args.key_fields.is_empty() {
        SnapshotDiffer::default_key_fields()
    } else {
        args.key_fields.clone()
    };

    info!(
        run_id = %run_id,
        previous = %args.previous.display(),
        current = %current.display(),
        output = %args.output.display(),
        "starting snapshot delta"
    );

    let differ = SnapshotDiffer::new(key_fields.clone());
    let outcome = differ.diff(&args.previous, &current, &args.output, args.overwrite)?;

    let manifest = DeltaRunManifest {
        manifest_version: 1,
        run_id: run_id.clone(),
        generated_at: now_utc_string(),
        previous_root: args.previous.display().to_string(),
        current_root: current.display().to_string(),
        output_root: args.output.display().to_string(),
        key_fields,
        known_identities: outcome.known_identities,
        current_rows: outcome.current_rows,
        rows_written: outcome.rows_written,
        files_written: outcome.files_written,
        duplicate_rows_dropped: outcome.duplicate_rows_dropped,
        unparsable_lines: outcome.unparsable_lines,
        warnings: outcome.warnings,
    };

    let manifest_path = args.manifest_path.clone().unwrap_or_else(|| {
        args.data_root
            .join("manifests")
            .join(format!("delta_run_{}.json", utc_compact_string(started_ts)))
    });
    write_json_pretty(&manifest_path, &manifest)?;

    info!(path = %manifest_path.display(), "wrote delta run manifest");
    info!(
        rows = outcome.rows_written,
        files = outcome.files_written,
        dropped = outcome.duplicate_rows_dropped,
        "delta completed"
    );

    Ok(())
}

fn latest_snapshot(snapshots_root: &Path) -> Result<PathBuf> {
    let entries = fs::read_dir(snapshots_root)
        .with_context(|| format!("failed to read {}", snapshots_root.display()))?;

    let mut snapshots = Vec::new();
    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed to read entry in {}", snapshots_root.display()))?;
        if entry
            .file_type()
            .with_context(|| format!("failed to inspect {}", entry.path().display()))?
            .is_dir()
        {
            snapshots.push(entry.path());
        }
    }

    snapshots.sort();
    snapshots
        .pop()
        .with_context(|| format!("no snapshots found in {}", snapshots_root.display()))
}
