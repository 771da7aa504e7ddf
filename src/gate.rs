use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::warn;

use crate::util::write_json_pretty;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GateDecision {
    MissingOutput,
    HashChanged,
    Untracked,
    OutputCurrent,
    HashMatch,
}

impl GateDecision {
    pub fn should_process(self) -> bool {
        matches!(
            self,
            Self::MissingOutput | Self::HashChanged | Self::Untracked
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingOutput => "missing_output",
            Self::HashChanged => "hash_changed",
            Self::Untracked => "untracked",
            Self::OutputCurrent => "output_current",
            Self::HashMatch => "hash_match",
        }
    }
}

pub fn decide(
    item_id: &str,
    output_path: &Path,
    source_hash: Option<&str>,
    store: &HashStore,
) -> GateDecision {
    if !output_path.exists() {
        return GateDecision::MissingOutput;
    }

    let Some(source_hash) = source_hash else {
        return GateDecision::OutputCurrent;
    };

    match store.get(item_id) {
        Some(stored) if stored == source_hash => GateDecision::HashMatch,
        Some(_) => GateDecision::HashChanged,
        None => GateDecision::Untracked,
    }
}

#[derive(Debug)]
pub struct HashStore {
    path: PathBuf,
    hashes: BTreeMap<String, String>,
    dirty: bool,
}

impl HashStore {
    // A missing or unreadable store degrades to empty: every tracked item
    // then looks untracked and gets reprocessed, which is safe.
    pub fn load(path: &Path) -> Self {
        let mut store = Self {
            path: path.to_path_buf(),
            hashes: BTreeMap::new(),
            dirty: false,
        };

        if !path.exists() {
            return store;
        }

        match fs::read(path) {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(hashes) => store.hashes = hashes,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "hash store unreadable, starting fresh");
                }
            },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "hash store unreadable, starting fresh");
            }
        }

        store
    }

    pub fn get(&self, item_id: &str) -> Option<&str> {
        self.hashes.get(item_id).map(String::as_str)
    }

    pub fn record(&mut self, item_id: &str, digest: &str) {
        self.hashes.insert(item_id.to_string(), digest.to_string());
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // Full rewrite of the store file. Not safe under concurrent writers;
    // during a stage run only the coordinator calls this.
    pub fn save(&mut self) -> Result<()> {
        write_json_pretty(&self.path, &self.hashes)?;
        self.dirty = false;
        Ok(())
    }
}
