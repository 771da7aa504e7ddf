use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointProgress {
    pub total_items: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub step: String,
    pub stage: u32,
    pub started_at: String,
    pub updated_at: String,
    pub status: String,
    pub progress: CheckpointProgress,
    pub completed_items: Vec<String>,
    pub failed_items: BTreeMap<String, String>,
    pub resume_from: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipPageEntry {
    pub relative_path: String,
    pub page: Option<u32>,
    pub reason: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub total_pages: usize,
    pub skipped_pages: usize,
    pub by_reason: BTreeMap<String, usize>,
    pub pages: Vec<SkipPageEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeltaRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub generated_at: String,
    pub previous_root: String,
    pub current_root: String,
    pub output_root: String,
    pub key_fields: Vec<String>,
    pub known_identities: usize,
    pub current_rows: usize,
    pub rows_written: usize,
    pub files_written: usize,
    pub duplicate_rows_dropped: usize,
    pub unparsable_lines: usize,
    pub warnings: Vec<String>,
}
