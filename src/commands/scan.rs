use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::checkpoint::{self, CheckpointStore};
use crate::cli::ScanArgs;
use crate::model::{SkipManifest, SkipPageEntry};
use crate::quality::{CorruptionDetector, CorruptionFlag};
use crate::stage::{StageSink, StageWorker, WorkItem, run_stage};
use crate::util::{DigestKind, hash_str, now_utc_string, relative_path_string, write_json_pretty};

const SCAN_STEP: &str = "scan";

#[derive(Debug, Clone)]
pub struct PageScan {
    pub relative_path: String,
    pub page: Option<u32>,
    pub flag: Option<CorruptionFlag>,
    pub sha256: String,
}

struct PageScanWorker {
    detector: CorruptionDetector,
    page_pattern: Regex,
}

#[async_trait]
impl StageWorker for PageScanWorker {
    type Output = PageScan;

    async fn process(&self, item: &WorkItem) -> Result<PageScan> {
        let text = fs::read_to_string(&item.source_path)
            .with_context(|| format!("failed to read page: {}", item.source_path.display()))?;

        Ok(PageScan {
            relative_path: item.id.clone(),
            page: page_number(&item.id, &self.page_pattern),
            flag: self.detector.classify(&text),
            sha256: hash_str(&text, DigestKind::Sha256),
        })
    }
}

// Keeps the on-disk manifest ahead of checkpoint completions: a page's entry
// (or the removal of a stale one) lands before the page can be marked
// complete, so a resumed run that skips the page still has its flag.
struct SkipManifestSink {
    path: PathBuf,
    total_pages: usize,
    entries: BTreeMap<String, SkipPageEntry>,
}

impl SkipManifestSink {
    fn write(&self) -> Result<()> {
        write_json_pretty(&self.path, &build_manifest(self.total_pages, &self.entries))
    }
}

impl StageSink<PageScan> for SkipManifestSink {
    fn persist(&mut self, _item: &WorkItem, scan: &PageScan) -> Result<()> {
        let changed = match &scan.flag {
            Some(flag) => {
                self.entries.insert(
                    scan.relative_path.clone(),
                    SkipPageEntry {
                        relative_path: scan.relative_path.clone(),
                        page: scan.page,
                        reason: flag.reason().to_string(),
                        sha256: scan.sha256.clone(),
                    },
                );
                true
            }
            None => self.entries.remove(&scan.relative_path).is_some(),
        };

        if changed {
            self.write()?;
        }
        Ok(())
    }
}

pub async fn run(args: ScanArgs) -> Result<()> {
    let checkpoints_dir = args.data_root.join("checkpoints");
    let manifest_path = args
        .manifest_path
        .clone()
        .unwrap_or_else(|| args.data_root.join("manifests").join("skip_pages.json"));

    if !args.pages_root.is_dir() {
        bail!("pages root missing: {}", args.pages_root.display());
    }

    info!(
        pages_root = %args.pages_root.display(),
        stage = args.stage,
        missing_marker = %args.missing_marker,
        "starting corruption scan"
    );

    if args.fresh {
        checkpoint::discard(&checkpoints_dir, SCAN_STEP, args.stage)?;
    }

    let items = discover_pages(&args.pages_root)?;
    if items.is_empty() {
        bail!("no page files found in {}", args.pages_root.display());
    }
    let discovered: HashSet<String> = items.iter().map(|item| item.id.clone()).collect();
    let total_pages = items.len();

    // An empty marker would match between every pair of characters, so it
    // disables the data_missing rule instead.
    let detector = if args.missing_marker.is_empty() {
        CorruptionDetector::new()
    } else {
        CorruptionDetector::with_missing_marker(&args.missing_marker)
    };

    let mut checkpoint = CheckpointStore::load_or_create(&checkpoints_dir, SCAN_STEP, args.stage)?;
    let worker = Arc::new(PageScanWorker {
        detector,
        page_pattern: Regex::new(r"(\d+)$").context("failed to compile page number pattern")?,
    });

    let previous = load_previous_manifest(&manifest_path);
    let mut sink = SkipManifestSink {
        path: manifest_path.clone(),
        total_pages,
        entries: retained_entries(previous, &discovered),
    };

    let summary = run_stage(&mut checkpoint, None, Some(&mut sink), worker, items, args.workers)
        .await?;

    let manifest = build_manifest(total_pages, &sink.entries);
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote skip manifest");

    for (reason, count) in &manifest.by_reason {
        info!(reason = %reason, count = count, "pages flagged");
    }
    info!(
        total_pages = manifest.total_pages,
        skipped_pages = manifest.skipped_pages,
        scanned = summary.processed,
        previously_scanned = summary.skipped,
        failed = summary.failed,
        "scan completed"
    );

    Ok(())
}

fn discover_pages(pages_root: &Path) -> Result<Vec<WorkItem>> {
    let mut items = Vec::new();

    for entry in WalkDir::new(pages_root) {
        let entry = entry.with_context(|| format!("failed to walk {}", pages_root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let is_page = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("md"))
            .unwrap_or(false);

        if is_page {
            items.push(WorkItem {
                id: relative_path_string(entry.path(), pages_root),
                source_path: entry.into_path(),
                output_path: None,
            });
        }
    }

    items.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(items)
}

fn page_number(relative_path: &str, pattern: &Regex) -> Option<u32> {
    let stem = Path::new(relative_path).file_stem()?.to_str()?;
    let captures = pattern.captures(stem)?;
    captures.get(1)?.as_str().parse().ok()
}

fn load_previous_manifest(path: &Path) -> Option<SkipManifest> {
    if !path.exists() {
        return None;
    }

    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "existing skip manifest unreadable, rebuilding");
            return None;
        }
    };

    match serde_json::from_slice(&raw) {
        Ok(manifest) => Some(manifest),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "existing skip manifest unreadable, rebuilding");
            None
        }
    }
}

// Entries for pages still in the tree are carried forward; the sink replaces
// or clears them as pages are re-scanned, and entries for pages that left
// the tree drop out here.
fn retained_entries(
    previous: Option<SkipManifest>,
    discovered: &HashSet<String>,
) -> BTreeMap<String, SkipPageEntry> {
    let mut entries = BTreeMap::new();

    if let Some(previous) = previous {
        for entry in previous.pages {
            if discovered.contains(&entry.relative_path) {
                entries.insert(entry.relative_path.clone(), entry);
            }
        }
    }

    entries
}

fn build_manifest(total_pages: usize, entries: &BTreeMap<String, SkipPageEntry>) -> SkipManifest {
    let mut by_reason: BTreeMap<String, usize> = BTreeMap::new();
    for entry in entries.values() {
        *by_reason.entry(entry.reason.clone()).or_insert(0) += 1;
    }

    SkipManifest {
        manifest_version: 1,
        generated_at: now_utc_string(),
        total_pages,
        skipped_pages: entries.len(),
        by_reason,
        pages: entries.values().cloned().collect(),
    }
}
