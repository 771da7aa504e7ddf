use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::util::{ensure_directory, relative_path_string};

#[derive(Debug, Default)]
pub struct DeltaOutcome {
    pub known_identities: usize,
    pub current_rows: usize,
    pub rows_written: usize,
    pub files_written: usize,
    pub duplicate_rows_dropped: usize,
    pub unparsable_lines: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotDiffer {
    key_fields: Vec<String>,
}

impl SnapshotDiffer {
    pub fn new(key_fields: Vec<String>) -> Self {
        Self { key_fields }
    }

    pub fn default_key_fields() -> Vec<String> {
        ["ticker", "filing_type", "fiscal_year", "seq"]
            .into_iter()
            .map(ToOwned::to_owned)
            .collect()
    }

    // Two passes with a barrier between them: every previous identity is
    // known before the first current record is judged, otherwise a record
    // could slip into the delta and be re-uploaded.
    pub fn diff(
        &self,
        previous_root: &Path,
        current_root: &Path,
        output_root: &Path,
        overwrite: bool,
    ) -> Result<DeltaOutcome> {
        if !current_root.is_dir() {
            bail!("current snapshot missing: {}", current_root.display());
        }

        let mut outcome = DeltaOutcome::default();
        let mut known = self.collect_previous_identities(previous_root, &mut outcome)?;
        outcome.known_identities = known.len();

        if output_root.exists() {
            if !overwrite {
                bail!(
                    "delta output already exists: {} (pass --overwrite to replace it)",
                    output_root.display()
                );
            }
            fs::remove_dir_all(output_root).with_context(|| {
                format!("failed to clear delta output: {}", output_root.display())
            })?;
        }
        ensure_directory(output_root)?;

        for path in jsonl_files(current_root)? {
            let relative = relative_path_string(&path, current_root);
            let kept = self.filter_new_rows(&path, &mut known, &mut outcome)?;
            if kept.is_empty() {
                continue;
            }

            let output_path = output_root.join(&relative);
            write_rows(&output_path, &kept)?;
            outcome.rows_written += kept.len();
            outcome.files_written += 1;
            info!(file = %relative, rows = kept.len(), "delta rows collected");
        }

        outcome.duplicate_rows_dropped = outcome.current_rows - outcome.rows_written;
        if outcome.unparsable_lines > 0 {
            warn!(
                lines = outcome.unparsable_lines,
                "skipped unparsable snapshot lines"
            );
        }

        Ok(outcome)
    }

    fn collect_previous_identities(
        &self,
        previous_root: &Path,
        outcome: &mut DeltaOutcome,
    ) -> Result<HashSet<Vec<String>>> {
        let mut known = HashSet::new();

        if !previous_root.is_dir() {
            warn!(
                path = %previous_root.display(),
                "previous snapshot missing, delta will contain every current record"
            );
            outcome.warnings.push(format!(
                "previous snapshot missing: {}",
                previous_root.display()
            ));
            return Ok(known);
        }

        for path in jsonl_files(previous_root)? {
            let unparsable = for_each_record(&path, |record| {
                known.insert(self.identity_key(record));
            })?;
            outcome.unparsable_lines += unparsable;
        }

        Ok(known)
    }

    fn filter_new_rows(
        &self,
        path: &Path,
        known: &mut HashSet<Vec<String>>,
        outcome: &mut DeltaOutcome,
    ) -> Result<Vec<String>> {
        let file = File::open(path)
            .with_context(|| format!("failed to open snapshot file: {}", path.display()))?;
        let mut kept = Vec::new();

        for line in BufReader::new(file).lines() {
            let line = line
                .with_context(|| format!("failed to read snapshot file: {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }

            let record: Value = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(_) => {
                    outcome.unparsable_lines += 1;
                    continue;
                }
            };

            outcome.current_rows += 1;
            if known.insert(self.identity_key(&record)) {
                kept.push(line);
            }
        }

        Ok(kept)
    }

    // The key stays a vector of field values, never a joined string: a
    // separator character inside one value must not collide two distinct
    // identities.
    fn identity_key(&self, record: &Value) -> Vec<String> {
        let mut parts = Vec::with_capacity(self.key_fields.len());
        for field in &self.key_fields {
            let part = match record.get(field) {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            parts.push(part);
        }
        parts
    }
}

fn jsonl_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("failed to walk snapshot: {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let is_jsonl = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("jsonl"))
            .unwrap_or(false);

        if is_jsonl {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

fn for_each_record(path: &Path, mut handle: impl FnMut(&Value)) -> Result<usize> {
    let file = File::open(path)
        .with_context(|| format!("failed to open snapshot file: {}", path.display()))?;
    let mut unparsable = 0;

    for line in BufReader::new(file).lines() {
        let line =
            line.with_context(|| format!("failed to read snapshot file: {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Value>(&line) {
            Ok(record) => handle(&record),
            Err(_) => unparsable += 1,
        }
    }

    Ok(unparsable)
}

fn write_rows(path: &Path, rows: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let mut file = File::create(path)
        .with_context(|| format!("failed to create delta file: {}", path.display()))?;
    for row in rows {
        file.write_all(row.as_bytes())
            .with_context(|| format!("failed to write delta file: {}", path.display()))?;
        file.write_all(b"\n")
            .with_context(|| format!("failed to write delta file: {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn differ() -> SnapshotDiffer {
        SnapshotDiffer::new(SnapshotDiffer::default_key_fields())
    }

    fn row(ticker: &str, seq: u32, revenue: &str) -> String {
        format!(
            "{{\"ticker\":\"{ticker}\",\"filing_type\":\"annual\",\"fiscal_year\":2023,\"seq\":{seq},\"revenue\":\"{revenue}\"}}"
        )
    }

    fn write_snapshot(root: &Path, relative: &str, rows: &[String]) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut body = rows.join("\n");
        body.push('\n');
        fs::write(path, body).unwrap();
    }

    fn read_rows(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(ToOwned::to_owned)
            .collect()
    }

    #[test]
    fn delta_contains_exactly_the_new_records_in_mirrored_layout() {
        let dir = tempfile::TempDir::new().unwrap();
        let previous = dir.path().join("previous");
        let current = dir.path().join("current");
        let output = dir.path().join("delta");

        write_snapshot(
            &previous,
            "X/annual_2023.jsonl",
            &[row("X", 1, "100"), row("X", 2, "200")],
        );
        write_snapshot(&previous, "Y/annual_2023.jsonl", &[row("Y", 1, "50")]);

        write_snapshot(
            &current,
            "X/annual_2023.jsonl",
            &[row("X", 1, "100"), row("X", 2, "200"), row("X", 3, "300")],
        );
        write_snapshot(&current, "Y/annual_2023.jsonl", &[row("Y", 1, "50")]);
        write_snapshot(&current, "Z/annual_2023.jsonl", &[row("Z", 1, "75")]);

        let outcome = differ().diff(&previous, &current, &output, false).unwrap();

        assert_eq!(outcome.known_identities, 3);
        assert_eq!(outcome.current_rows, 5);
        assert_eq!(outcome.rows_written, 2);
        assert_eq!(outcome.files_written, 2);
        assert_eq!(outcome.duplicate_rows_dropped, 3);

        assert_eq!(
            read_rows(&output.join("X/annual_2023.jsonl")),
            vec![row("X", 3, "300")]
        );
        assert_eq!(
            read_rows(&output.join("Z/annual_2023.jsonl")),
            vec![row("Z", 1, "75")]
        );
        assert!(!output.join("Y/annual_2023.jsonl").exists());
    }

    #[test]
    fn applying_the_delta_and_rediffing_yields_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let previous = dir.path().join("previous");
        let current = dir.path().join("current");
        let output = dir.path().join("delta");

        write_snapshot(&previous, "X/annual_2023.jsonl", &[row("X", 1, "100")]);
        write_snapshot(
            &current,
            "X/annual_2023.jsonl",
            &[row("X", 1, "100"), row("X", 2, "200")],
        );
        write_snapshot(&current, "Z/annual_2023.jsonl", &[row("Z", 1, "75")]);

        let first = differ().diff(&previous, &current, &output, false).unwrap();
        assert_eq!(first.rows_written, 2);

        for relative in ["X/annual_2023.jsonl", "Z/annual_2023.jsonl"] {
            let delta_path = output.join(relative);
            if !delta_path.exists() {
                continue;
            }
            let previous_path = previous.join(relative);
            fs::create_dir_all(previous_path.parent().unwrap()).unwrap();
            let mut merged = if previous_path.exists() {
                fs::read_to_string(&previous_path).unwrap()
            } else {
                String::new()
            };
            merged.push_str(&fs::read_to_string(&delta_path).unwrap());
            fs::write(&previous_path, merged).unwrap();
        }

        let second = differ()
            .diff(&previous, &current, &dir.path().join("delta_again"), false)
            .unwrap();
        assert_eq!(second.rows_written, 0);
        assert_eq!(second.files_written, 0);
    }

    #[test]
    fn duplicate_identities_within_current_are_dropped() {
        let dir = tempfile::TempDir::new().unwrap();
        let previous = dir.path().join("previous");
        let current = dir.path().join("current");
        let output = dir.path().join("delta");

        fs::create_dir_all(&previous).unwrap();
        write_snapshot(
            &current,
            "X/annual_2023.jsonl",
            &[row("X", 1, "100"), row("X", 1, "999")],
        );

        let outcome = differ().diff(&previous, &current, &output, false).unwrap();

        assert_eq!(outcome.rows_written, 1);
        assert_eq!(outcome.duplicate_rows_dropped, 1);
        assert_eq!(
            read_rows(&output.join("X/annual_2023.jsonl")),
            vec![row("X", 1, "100")]
        );
    }

    #[test]
    fn missing_previous_snapshot_emits_everything_with_a_warning() {
        let dir = tempfile::TempDir::new().unwrap();
        let current = dir.path().join("current");
        let output = dir.path().join("delta");

        write_snapshot(&current, "X/annual_2023.jsonl", &[row("X", 1, "100")]);

        let outcome = differ()
            .diff(&dir.path().join("no_such_snapshot"), &current, &output, false)
            .unwrap();

        assert_eq!(outcome.known_identities, 0);
        assert_eq!(outcome.rows_written, 1);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("previous snapshot missing"));
    }

    #[test]
    fn missing_current_snapshot_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = differ().diff(
            &dir.path().join("previous"),
            &dir.path().join("no_such_snapshot"),
            &dir.path().join("delta"),
            false,
        );

        assert!(result.is_err());
    }

    #[test]
    fn existing_output_requires_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let previous = dir.path().join("previous");
        let current = dir.path().join("current");
        let output = dir.path().join("delta");

        fs::create_dir_all(&previous).unwrap();
        write_snapshot(&current, "X/annual_2023.jsonl", &[row("X", 1, "100")]);
        fs::create_dir_all(&output).unwrap();
        fs::write(output.join("stale.jsonl"), "{}\n").unwrap();

        let blocked = differ().diff(&previous, &current, &output, false);
        assert!(blocked.is_err());

        let replaced = differ().diff(&previous, &current, &output, true).unwrap();
        assert_eq!(replaced.rows_written, 1);
        assert!(!output.join("stale.jsonl").exists());
    }

    #[test]
    fn unparsable_lines_are_tallied_but_not_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let previous = dir.path().join("previous");
        let current = dir.path().join("current");
        let output = dir.path().join("delta");

        write_snapshot(
            &previous,
            "X/annual_2023.jsonl",
            &[row("X", 1, "100"), "not json at all".to_string()],
        );
        write_snapshot(
            &current,
            "X/annual_2023.jsonl",
            &["{broken".to_string(), row("X", 2, "200")],
        );

        let outcome = differ().diff(&previous, &current, &output, false).unwrap();

        assert_eq!(outcome.unparsable_lines, 2);
        assert_eq!(outcome.rows_written, 1);
    }

    #[test]
    fn records_missing_key_fields_still_compare_by_identity() {
        let dir = tempfile::TempDir::new().unwrap();
        let previous = dir.path().join("previous");
        let current = dir.path().join("current");
        let output = dir.path().join("delta");

        let partial = "{\"ticker\":\"X\",\"filing_type\":\"annual\",\"fiscal_year\":2023}";
        write_snapshot(&previous, "X/annual_2023.jsonl", &[partial.to_string()]);
        write_snapshot(&current, "X/annual_2023.jsonl", &[partial.to_string()]);

        let outcome = differ().diff(&previous, &current, &output, false).unwrap();
        assert_eq!(outcome.rows_written, 0);
    }

    #[test]
    fn key_field_values_containing_separators_keep_distinct_identities() {
        let dir = tempfile::TempDir::new().unwrap();
        let previous = dir.path().join("previous");
        let current = dir.path().join("current");
        let output = dir.path().join("delta");

        let old = "{\"ticker\":\"A|B\",\"filing_type\":\"C\",\"fiscal_year\":2023,\"seq\":1}";
        let new = "{\"ticker\":\"A\",\"filing_type\":\"B|C\",\"fiscal_year\":2023,\"seq\":1}";
        write_snapshot(&previous, "A/annual_2023.jsonl", &[old.to_string()]);
        write_snapshot(&current, "A/annual_2023.jsonl", &[new.to_string()]);

        let outcome = differ().diff(&previous, &current, &output, false).unwrap();

        assert_eq!(outcome.rows_written, 1);
        assert_eq!(
            read_rows(&output.join("A/annual_2023.jsonl")),
            vec![new.to_string()]
        );
    }
}
