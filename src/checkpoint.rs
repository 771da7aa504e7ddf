use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::model::{CheckpointProgress, CheckpointRecord};
use crate::util::{now_utc_string, write_json_pretty};

const STATUS_IN_PROGRESS: &str = "in_progress";
const STATUS_COMPLETED: &str = "completed";

// complete() persists every PERSIST_EVERY items. A crash loses at most the
// unflushed tail, and those items are simply redone on the next run.
const PERSIST_EVERY: usize = 100;

#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    step: String,
    stage: u32,
    status: &'static str,
    started_at: String,
    updated_at: String,
    total_items: usize,
    skipped: usize,
    completed_items: HashSet<String>,
    failed_items: BTreeMap<String, String>,
    resume_from: Option<String>,
    unsaved_completions: usize,
}

impl CheckpointStore {
    pub fn load_or_create(dir: &Path, step: &str, stage: u32) -> Result<Self> {
        let path = checkpoint_path(dir, step, stage);

        if path.exists() {
            match read_record(&path) {
                Ok(record) if record.step == step && record.stage == stage => {
                    if record.status == STATUS_IN_PROGRESS {
                        let store = Self::from_record(path, record);
                        info!(
                            step = %store.step,
                            stage = store.stage,
                            completed = store.completed_count(),
                            failed = store.failed_count(),
                            "resuming from checkpoint"
                        );
                        return Ok(store);
                    }
                    info!(
                        step = %step,
                        stage = stage,
                        "previous run completed, starting fresh checkpoint"
                    );
                }
                Ok(record) => {
                    warn!(
                        path = %path.display(),
                        found_step = %record.step,
                        found_stage = record.stage,
                        "checkpoint does not match this step, starting fresh"
                    );
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "checkpoint unreadable, starting fresh"
                    );
                }
            }
        }

        let now = now_utc_string();
        Ok(Self {
            path,
            step: step.to_string(),
            stage,
            status: STATUS_IN_PROGRESS,
            started_at: now.clone(),
            updated_at: now,
            total_items: 0,
            skipped: 0,
            completed_items: HashSet::new(),
            failed_items: BTreeMap::new(),
            resume_from: None,
            unsaved_completions: 0,
        })
    }

    fn from_record(path: PathBuf, record: CheckpointRecord) -> Self {
        Self {
            path,
            step: record.step,
            stage: record.stage,
            status: STATUS_IN_PROGRESS,
            started_at: record.started_at,
            updated_at: record.updated_at,
            total_items: record.progress.total_items,
            // Skip tallies are a derived view of filesystem state and are
            // recounted on every run.
            skipped: 0,
            completed_items: record.completed_items.into_iter().collect(),
            failed_items: record.failed_items,
            resume_from: record.resume_from,
            unsaved_completions: 0,
        }
    }

    pub fn set_total(&mut self, total: usize) -> Result<()> {
        self.total_items = total;
        self.updated_at = now_utc_string();
        self.save()
    }

    pub fn mark_in_progress(&mut self, item_id: &str) {
        self.resume_from = Some(item_id.to_string());
    }

    pub fn complete(&mut self, item_id: &str) -> Result<()> {
        self.completed_items.insert(item_id.to_string());
        self.resume_from = None;
        self.updated_at = now_utc_string();

        self.unsaved_completions += 1;
        if self.unsaved_completions >= PERSIST_EVERY {
            self.save()?;
        }
        Ok(())
    }

    pub fn fail(&mut self, item_id: &str, error: &str) -> Result<()> {
        self.failed_items
            .insert(item_id.to_string(), error.to_string());
        self.updated_at = now_utc_string();
        self.save()
    }

    pub fn skip(&mut self, item_id: &str) {
        self.skipped += 1;
        debug!(item = item_id, "skipped");
    }

    pub fn finalize(&mut self) -> Result<()> {
        self.status = STATUS_COMPLETED;
        self.resume_from = None;
        self.updated_at = now_utc_string();
        self.save()?;

        info!(
            step = %self.step,
            stage = self.stage,
            completed = self.completed_count(),
            failed = self.failed_count(),
            skipped = self.skipped,
            "checkpoint finalized"
        );
        Ok(())
    }

    // Resume consults completed items only. Previously failed items stay in
    // failed_items as a log and are re-attempted on the next run.
    pub fn is_completed(&self, item_id: &str) -> bool {
        self.completed_items.contains(item_id)
    }

    pub fn completed_count(&self) -> usize {
        self.completed_items.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed_items.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped
    }

    pub fn total_items(&self) -> usize {
        self.total_items
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&mut self) -> Result<()> {
        let record = self.to_record();
        let temp_path = self.path.with_extension("json.tmp");

        write_json_pretty(&temp_path, &record)?;
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("failed to replace checkpoint: {}", self.path.display()))?;

        self.unsaved_completions = 0;
        Ok(())
    }

    fn to_record(&self) -> CheckpointRecord {
        let mut completed_items: Vec<String> = self.completed_items.iter().cloned().collect();
        completed_items.sort();

        CheckpointRecord {
            step: self.step.clone(),
            stage: self.stage,
            started_at: self.started_at.clone(),
            updated_at: self.updated_at.clone(),
            status: self.status.to_string(),
            progress: CheckpointProgress {
                total_items: self.total_items,
                completed: self.completed_items.len(),
                failed: self.failed_items.len(),
                skipped: self.skipped,
            },
            completed_items,
            failed_items: self.failed_items.clone(),
            resume_from: self.resume_from.clone(),
        }
    }
}

pub fn discard(dir: &Path, step: &str, stage: u32) -> Result<()> {
    let path = checkpoint_path(dir, step, stage);
    if path.exists() {
        fs::remove_file(&path)
            .with_context(|| format!("failed to remove checkpoint: {}", path.display()))?;
        info!(path = %path.display(), "discarded checkpoint");
    }
    Ok(())
}

fn checkpoint_path(dir: &Path, step: &str, stage: u32) -> PathBuf {
    dir.join(format!("{step}_stage{stage:02}.json"))
}

fn read_record(path: &Path) -> Result<CheckpointRecord> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let record = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(record)
}
