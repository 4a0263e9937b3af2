//! Collector worker: drop-folder scan and ingestion.
//!
//! Start-up runs a full scan; afterwards the directory is re-scanned every
//! tick (dedup is by content hash, so re-reading a known file is cheap and
//! idempotent). Files are fed through a bounded queue into a fixed pool of
//! parser tasks; each parse runs on the blocking pool under a per-file
//! timeout. A timed-out or failing file is reported and skipped, never
//! fatal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ledgerd_core::collect::{self, GroupCandidate, IngestOutcome};
use ledgerd_core::config::LedgerConfig;
use ledgerd_core::model::now_ms;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::Services;

/// Worker name.
pub const NAME: &str = "collector";

/// One scan-and-ingest tick.
///
/// # Errors
///
/// Returns an error only when the input directory itself is unusable;
/// individual file failures are absorbed.
pub async fn tick(services: Arc<Services>, config: Arc<LedgerConfig>) -> anyhow::Result<()> {
    let input_dir = config.paths.input_dir.clone();
    std::fs::create_dir_all(&input_dir)
        .with_context(|| format!("cannot create input dir {}", input_dir.display()))?;

    let files = scan(&input_dir)?;
    if files.is_empty() {
        return Ok(());
    }

    let per_file_timeout = Duration::from_secs(config.collector.per_file_timeout_s);
    let pool_size = usize::try_from(config.collector.workers.max(1)).unwrap_or(1);
    let queue_depth = usize::try_from(config.collector.queue_depth.max(1)).unwrap_or(1);

    // Fixed parser pool fed by a bounded queue; the feeder applies
    // backpressure instead of loading the whole directory listing into
    // flight at once.
    let (file_tx, file_rx) = mpsc::channel::<(PathBuf, i64)>(queue_depth);
    let (done_tx, mut done_rx) = mpsc::channel::<GroupCandidate>(queue_depth);
    let file_rx = Arc::new(tokio::sync::Mutex::new(file_rx));

    let mut pool = Vec::with_capacity(pool_size);
    for _ in 0..pool_size {
        let services = Arc::clone(&services);
        let file_rx = Arc::clone(&file_rx);
        let done_tx = done_tx.clone();
        pool.push(tokio::spawn(async move {
            loop {
                let next = file_rx.lock().await.recv().await;
                let Some((path, modified_at)) = next else {
                    break;
                };
                if let Some(candidate) =
                    process_one(&services, path, modified_at, per_file_timeout).await
                {
                    let _ = done_tx.send(candidate).await;
                }
            }
        }));
    }
    drop(done_tx);

    // Feed from a separate task so a full results queue can never wedge
    // the feeder against the bounded file queue.
    let feeder = tokio::spawn(async move {
        for file in files {
            if file_tx.send(file).await.is_err() {
                break;
            }
        }
    });

    let mut group_candidates = Vec::new();
    while let Some(candidate) = done_rx.recv().await {
        group_candidates.push(candidate);
    }
    let _ = feeder.await;
    for worker in pool {
        let _ = worker.await;
    }

    // Multimodal grouping over the images ingested this pass.
    let window_ms = i64::try_from(config.collector.group_window_s).unwrap_or(60) * 1_000;
    let groups = collect::assign_groups(&group_candidates, window_ms);
    for (path, group_id) in &groups {
        if let Err(e) = attach_group(&services, path, group_id) {
            warn!(path = %path.display(), error = %e, "group assignment failed");
        }
    }
    if !groups.is_empty() {
        info!(grouped = groups.len(), "multimodal captures grouped");
    }

    Ok(())
}

/// Ingest one file under the per-file timeout. Returns a grouping candidate
/// when the file is a freshly ingested image.
async fn process_one(
    services: &Arc<Services>,
    path: PathBuf,
    modified_at: i64,
    per_file_timeout: Duration,
) -> Option<GroupCandidate> {
    let is_image = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("jpg" | "jpeg" | "png")
    );

    let services = Arc::clone(services);
    let task_path = path.clone();
    let parse = tokio::task::spawn_blocking(move || ingest_one(&services, &task_path));

    match tokio::time::timeout(per_file_timeout, parse).await {
        Ok(Ok(Ok(outcome))) => {
            if is_image && !matches!(outcome, IngestOutcome::Duplicate { .. }) {
                return Some(GroupCandidate { path, modified_at });
            }
        }
        Ok(Ok(Err(e))) => warn!(path = %path.display(), error = %e, "ingestion failed"),
        Ok(Err(join_error)) => {
            warn!(path = %path.display(), error = %join_error, "parse task panicked");
        }
        Err(_) => {
            warn!(path = %path.display(), "parse timed out; file skipped this pass");
        }
    }
    None
}

/// List regular files with their mtimes.
fn scan(dir: &std::path::Path) -> anyhow::Result<Vec<(PathBuf, i64)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("scan {}", dir.display()))? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        let modified_at = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .and_then(|d| i64::try_from(d.as_millis()).ok())
            .unwrap_or_else(now_ms);
        files.push((path, modified_at));
    }
    files.sort();
    Ok(files)
}

fn ingest_one(
    services: &Services,
    path: &std::path::Path,
) -> Result<IngestOutcome, anyhow::Error> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let outcome = collect::ingest_file(&services.store, &services.registry, path, &bytes)?;
    match &outcome {
        IngestOutcome::Statement { rows, skipped, .. } => {
            info!(path = %path.display(), rows, skipped, "statement ingested");
        }
        IngestOutcome::Document { doc_id } => {
            info!(path = %path.display(), doc_id, "document recorded");
        }
        IngestOutcome::Failed { cause, .. } => {
            warn!(path = %path.display(), cause = %cause, "file marked FAILED");
        }
        IngestOutcome::Duplicate { .. } => {}
    }
    Ok(outcome)
}

fn attach_group(
    services: &Services,
    path: &std::path::Path,
    group_id: &str,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(path)?;
    let hash = collect::content_hash(&bytes);
    if let Some(doc) = services.store.document_by_hash(&hash)? {
        services.store.set_document_group(doc.doc_id, group_id)?;
    }
    Ok(())
}
