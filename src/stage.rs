use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::gate::{self, HashStore};
use crate::util::{DigestKind, hash_file};

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: String,
    pub source_path: PathBuf,
    pub output_path: Option<PathBuf>,
}

#[async_trait]
pub trait StageWorker: Send + Sync {
    type Output: Send + 'static;

    async fn process(&self, item: &WorkItem) -> Result<Self::Output>;
}

// Durable destination for successful outcomes. The coordinator persists
// through the sink before marking the item complete, so a crash can redo an
// item but never leaves a completed item without its persisted outcome. A
// sink error aborts the stage and the item is retried on the next run.
pub trait StageSink<T> {
    fn persist(&mut self, item: &WorkItem, output: &T) -> Result<()>;
}

pub struct StageGate {
    pub store: HashStore,
    pub digest: DigestKind,
}

#[derive(Debug)]
pub struct StageSummary<T> {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub outputs: Vec<T>,
}

// Workers are pure item-to-outcome functions. Every checkpoint and hash
// store mutation happens in the coordinator loop below, so completion order
// can be arbitrary while state writes stay totally ordered.
pub async fn run_stage<W>(
    checkpoint: &mut CheckpointStore,
    mut stage_gate: Option<StageGate>,
    mut sink: Option<&mut dyn StageSink<W::Output>>,
    worker: Arc<W>,
    items: Vec<WorkItem>,
    worker_count: usize,
) -> Result<StageSummary<W::Output>>
where
    W: StageWorker + 'static,
{
    checkpoint.set_total(items.len())?;

    let mut pending: Vec<(WorkItem, Option<String>)> = Vec::new();
    let mut unreadable = 0;
    for item in items {
        if checkpoint.is_completed(&item.id) {
            checkpoint.skip(&item.id);
            continue;
        }

        let mut source_hash = None;
        if let (Some(stage_gate), Some(output_path)) =
            (stage_gate.as_ref(), item.output_path.as_ref())
        {
            // A source that vanished after discovery is a per-item failure,
            // not a stage abort.
            let digest = match hash_file(&item.source_path, stage_gate.digest) {
                Ok(digest) => digest,
                Err(err) => {
                    warn!(item = %item.id, error = %err, "source unreadable");
                    checkpoint.fail(&item.id, &format!("{err:#}"))?;
                    unreadable += 1;
                    continue;
                }
            };
            let decision = gate::decide(&item.id, output_path, Some(&digest), &stage_gate.store);
            if !decision.should_process() {
                checkpoint.skip(&item.id);
                continue;
            }
            source_hash = Some(digest);
        }

        pending.push((item, source_hash));
    }

    info!(
        step = %checkpoint.step(),
        checkpoint = %checkpoint.path().display(),
        total = checkpoint.total_items(),
        pending = pending.len(),
        skipped = checkpoint.skipped_count(),
        workers = worker_count,
        "stage planned"
    );

    let semaphore = Arc::new(Semaphore::new(worker_count.max(1)));
    let (tx, mut rx) = mpsc::channel(worker_count.max(1));

    for (item, source_hash) in pending {
        checkpoint.mark_in_progress(&item.id);

        let worker = Arc::clone(&worker);
        let semaphore = Arc::clone(&semaphore);
        let tx = tx.clone();
        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            let result = worker.process(&item).await;
            let _ = tx.send((item, source_hash, result)).await;
        });
    }
    drop(tx);

    let mut summary = StageSummary {
        processed: 0,
        failed: unreadable,
        skipped: checkpoint.skipped_count(),
        outputs: Vec::new(),
    };

    while let Some((item, source_hash, result)) = rx.recv().await {
        match result {
            Ok(output) => {
                if let Some(sink) = sink.as_mut() {
                    sink.persist(&item, &output)?;
                }
                checkpoint.complete(&item.id)?;
                if let (Some(stage_gate), Some(digest)) = (stage_gate.as_mut(), source_hash) {
                    stage_gate.store.record(&item.id, &digest);
                }
                summary.processed += 1;
                summary.outputs.push(output);
            }
            Err(err) => {
                warn!(item = %item.id, error = %err, "item failed");
                checkpoint.fail(&item.id, &format!("{err:#}"))?;
                summary.failed += 1;
            }
        }
    }

    if let Some(stage_gate) = stage_gate.as_mut()
        && stage_gate.store.is_dirty()
    {
        stage_gate.store.save()?;
        info!(path = %stage_gate.store.path().display(), "hash store updated");
    }

    checkpoint.finalize()?;

    if summary.failed > 0 {
        warn!(
            step = %checkpoint.step(),
            failed = summary.failed,
            "stage finished with failures, re-run the step to retry them"
        );
    }

    Ok(summary)
}
