use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use blake3::Hasher as Blake3Hasher;
use chrono::{DateTime, SecondsFormat, Utc};
use clap::ValueEnum;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn utc_compact_string(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum DigestKind {
    Blake3,
    Sha256,
}

impl DigestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blake3 => "blake3",
            Self::Sha256 => "sha256",
        }
    }
}

pub fn hash_file(path: &Path, kind: DigestKind) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;

    let mut buf = [0_u8; 8192];

    match kind {
        DigestKind::Blake3 => {
            let mut hasher = Blake3Hasher::new();
            loop {
                let count = file
                    .read(&mut buf)
                    .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;
                if count == 0 {
                    break;
                }
                hasher.update(&buf[..count]);
            }
            Ok(hasher.finalize().to_hex().to_string())
        }
        DigestKind::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let count = file
                    .read(&mut buf)
                    .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;
                if count == 0 {
                    break;
                }
                hasher.update(&buf[..count]);
            }
            Ok(format!("{:x}", hasher.finalize()))
        }
    }
}

pub fn hash_str(content: &str, kind: DigestKind) -> String {
    match kind {
        DigestKind::Blake3 => {
            let mut hasher = Blake3Hasher::new();
            hasher.update(content.as_bytes());
            hasher.finalize().to_hex().to_string()
        }
        DigestKind::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(content.as_bytes());
            format!("{:x}", hasher.finalize())
        }
    }
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize json: {}", path.display()))?;

    let mut file = File::create(path)
        .with_context(|| format!("failed to create json file: {}", path.display()))?;
    file.write_all(&data)
        .with_context(|| format!("failed to write json file: {}", path.display()))?;
    file.write_all(b"\n")
        .with_context(|| format!("failed to finalize json file: {}", path.display()))?;

    Ok(())
}

pub fn relative_path_string(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn hash_file_matches_hash_str_for_both_digests() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("page_0001.md");
        fs::write(&path, "net revenue 1,204").unwrap();

        for kind in [DigestKind::Blake3, DigestKind::Sha256] {
            let from_file = hash_file(&path, kind).unwrap();
            let from_str = hash_str("net revenue 1,204", kind);
            assert_eq!(from_file, from_str);
            assert_eq!(from_file.len(), 64);
        }
    }

    #[test]
    fn hash_str_differs_when_content_changes() {
        let original = hash_str("total assets 9,410", DigestKind::Blake3);
        let edited = hash_str("total assets 9,411", DigestKind::Blake3);
        assert_ne!(original, edited);
    }
}
