use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::cli::PlanArgs;
use crate::gate::{self, GateDecision, HashStore};
use crate::util::{hash_file, relative_path_string};

pub fn run(args: PlanArgs) -> Result<()> {
    if !args.source_root.is_dir() {
        bail!("source root missing: {}", args.source_root.display());
    }

    let store_path = args
        .hash_store
        .clone()
        .unwrap_or_else(|| args.data_root.join("hashes").join("sources.json"));
    let compare_hashes = args.hash_store.is_some() || store_path.exists();
    let store = HashStore::load(&store_path);

    info!(
        source_root = %args.source_root.display(),
        output_root = %args.output_root.display(),
        hash_store = %store_path.display(),
        digest = args.digest.as_str(),
        tracked = store.len(),
        compare_hashes,
        "planning incremental work"
    );
    if compare_hashes && store.is_empty() {
        warn!(
            path = %store_path.display(),
            "hash store is empty, files with outputs will be replanned as untracked"
        );
    }

    let files = source_files(&args.source_root, args.source_ext.as_deref())?;
    let (decisions, unreadable) = plan_decisions(&args, &store, compare_hashes, files);

    let mut tallies: BTreeMap<&'static str, usize> = BTreeMap::new();
    for (relative, decision) in &decisions {
        info!(file = %relative, decision = decision.as_str(), "planned");
        *tallies.entry(decision.as_str()).or_insert(0) += 1;
    }
    for (decision, count) in &tallies {
        info!(decision = %decision, count = count, "decision tally");
    }

    let pending = decisions
        .iter()
        .filter(|(_, decision)| decision.should_process())
        .count();
    info!(
        total = decisions.len(),
        pending = pending,
        unreadable = unreadable,
        "plan completed"
    );

    Ok(())
}

// Files can vanish between discovery and hashing; those are reported and
// left out of the plan instead of failing the whole report.
fn plan_decisions(
    args: &PlanArgs,
    store: &HashStore,
    compare_hashes: bool,
    files: Vec<PathBuf>,
) -> (Vec<(String, GateDecision)>, usize) {
    let mut decisions = Vec::new();
    let mut unreadable = 0;

    for path in files {
        let relative = relative_path_string(&path, &args.source_root);
        let output_path = args
            .output_root
            .join(&relative)
            .with_extension(&args.output_ext);

        let source_hash = if compare_hashes {
            match hash_file(&path, args.digest) {
                Ok(digest) => Some(digest),
                Err(err) => {
                    warn!(file = %relative, error = %err, "source unreadable");
                    unreadable += 1;
                    continue;
                }
            }
        } else {
            None
        };

        let decision = gate::decide(&relative, &output_path, source_hash.as_deref(), store);
        decisions.push((relative, decision));
    }

    (decisions, unreadable)
}

fn source_files(source_root: &Path, source_ext: Option<&str>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(source_root) {
        let entry = entry.with_context(|| format!("failed to walk {}", source_root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        if let Some(wanted) = source_ext {
            let matches = entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case(wanted))
                .unwrap_or(false);
            if !matches {
                continue;
            }
        }

        files.push(entry.into_path());
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::util::DigestKind;

    fn plan_args(dir: &Path) -> PlanArgs {
        PlanArgs {
            data_root: dir.join("state"),
            source_root: dir.join("sources"),
            output_root: dir.join("outputs"),
            output_ext: "md".to_string(),
            source_ext: Some("txt".to_string()),
            hash_store: None,
            digest: DigestKind::Blake3,
        }
    }

    #[test]
    fn without_a_hash_store_existing_outputs_are_trusted() {
        let dir = tempfile::TempDir::new().unwrap();
        let args = plan_args(dir.path());

        fs::create_dir_all(&args.source_root).unwrap();
        fs::create_dir_all(&args.output_root).unwrap();
        fs::write(args.source_root.join("page_0001.txt"), "scan one").unwrap();
        fs::write(args.source_root.join("page_0002.txt"), "scan two").unwrap();
        fs::write(args.source_root.join("notes.log"), "ignored").unwrap();
        fs::write(args.output_root.join("page_0001.md"), "extracted").unwrap();

        let store = HashStore::load(&dir.path().join("missing.json"));
        let files = source_files(&args.source_root, args.source_ext.as_deref()).unwrap();
        let (decisions, unreadable) = plan_decisions(&args, &store, false, files);

        assert_eq!(unreadable, 0);
        assert_eq!(
            decisions,
            vec![
                ("page_0001.txt".to_string(), GateDecision::OutputCurrent),
                ("page_0002.txt".to_string(), GateDecision::MissingOutput),
            ]
        );
    }

    #[test]
    fn with_a_hash_store_changed_sources_are_replanned() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut args = plan_args(dir.path());
        let store_path = dir.path().join("hashes.json");
        args.hash_store = Some(store_path.clone());

        fs::create_dir_all(&args.source_root).unwrap();
        fs::create_dir_all(&args.output_root).unwrap();
        for name in ["page_0001", "page_0002", "page_0003"] {
            fs::write(
                args.source_root.join(format!("{name}.txt")),
                format!("scan {name}"),
            )
            .unwrap();
            fs::write(args.output_root.join(format!("{name}.md")), "extracted").unwrap();
        }

        let unchanged =
            hash_file(&args.source_root.join("page_0001.txt"), DigestKind::Blake3).unwrap();
        let mut store = HashStore::load(&store_path);
        store.record("page_0001.txt", &unchanged);
        store.record("page_0002.txt", "stale-digest");
        store.save().unwrap();

        let store = HashStore::load(&store_path);
        let files = source_files(&args.source_root, args.source_ext.as_deref()).unwrap();
        let (decisions, _) = plan_decisions(&args, &store, true, files);

        assert_eq!(
            decisions,
            vec![
                ("page_0001.txt".to_string(), GateDecision::HashMatch),
                ("page_0002.txt".to_string(), GateDecision::HashChanged),
                ("page_0003.txt".to_string(), GateDecision::Untracked),
            ]
        );
    }

    #[test]
    fn sources_that_vanish_before_hashing_are_tallied_not_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let args = plan_args(dir.path());

        fs::create_dir_all(&args.source_root).unwrap();
        fs::write(args.source_root.join("page_0001.txt"), "scan one").unwrap();

        let files = vec![
            args.source_root.join("page_0001.txt"),
            args.source_root.join("page_0002.txt"),
        ];
        let store = HashStore::load(&dir.path().join("hashes.json"));
        let (decisions, unreadable) = plan_decisions(&args, &store, true, files);

        assert_eq!(unreadable, 1);
        assert_eq!(
            decisions,
            vec![("page_0001.txt".to_string(), GateDecision::MissingOutput)]
        );
    }

    #[test]
    fn missing_source_root_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let args = plan_args(dir.path());

        assert!(run(args).is_err());
    }
}
