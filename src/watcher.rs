//! Inbox watcher.
//!
//! A debounced `notify` watcher forwards changed paths over a channel to a
//! single async consumer, so files are ingested one at a time:
//!
//! ```text
//! notify thread ──paths──▶ mpsc ──▶ consumer ──▶ ingest_file ──▶ processed/
//! ```
//!
//! A path that is gone by the time the consumer sees it is skipped without
//! logging an error. Files that fail to ingest stay in the inbox.

use anyhow::{Context, Result};
use notify_debouncer_mini::notify::{self, RecommendedWatcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::context::AppContext;
use crate::ingest;

/// Keeps the OS watcher alive. Dropping it stops event delivery.
pub struct InboxWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
    pub consumer: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxOutcome {
    /// Not a supported file, or already gone.
    Skipped,
    Archived(PathBuf),
    /// Ingestion failed; the file was left in place.
    Failed(String),
}

pub fn is_supported(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Ingests one inbox file and archives it on success.
pub async fn process_inbox_file(ctx: &AppContext, path: &Path) -> InboxOutcome {
    if !is_supported(path, &ctx.config.watcher.extensions) || !path.is_file() {
        debug!(path = %path.display(), "ignoring inbox event");
        return InboxOutcome::Skipped;
    }

    match ingest::ingest_file(ctx, path, None).await {
        Ok(outcome) => {
            info!(
                path = %path.display(),
                rows = outcome.rows,
                videos = outcome.persisted.videos_upserted,
                "ingested inbox file"
            );
            match ingest::archive_file(path, &ctx.config.paths.processed_dir()) {
                Ok(target) => InboxOutcome::Archived(target),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ingested but could not archive");
                    InboxOutcome::Failed(e.to_string())
                }
            }
        }
        Err(e) => {
            // The file may have been moved away while loading
            if !path.exists() {
                return InboxOutcome::Skipped;
            }
            error!(path = %path.display(), error = %e, "failed to ingest inbox file");
            InboxOutcome::Failed(e.to_string())
        }
    }
}

/// Starts watching the inbox. Files already waiting there are queued first.
pub fn start(ctx: AppContext, cancel: CancellationToken) -> Result<InboxWatcher> {
    let inbox = ctx.config.paths.inbox_dir.clone();
    std::fs::create_dir_all(&inbox)
        .with_context(|| format!("failed to create inbox {}", inbox.display()))?;

    let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();

    let mut pending: Vec<PathBuf> = std::fs::read_dir(&inbox)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    pending.sort();
    for path in pending {
        let _ = tx.send(path);
    }

    let event_tx = tx.clone();
    let mut debouncer = new_debouncer(
        Duration::from_millis(ctx.config.watcher.debounce_ms),
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                for event in events {
                    // Receiver gone means the consumer has shut down
                    if event_tx.send(event.path).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = ?e, "watcher error"),
        },
    )
    .context("failed to create file watcher")?;

    debouncer
        .watcher()
        .watch(&inbox, notify::RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", inbox.display()))?;
    drop(tx);

    info!(inbox = %inbox.display(), "watching inbox");
    let consumer = tokio::spawn(consume(ctx, rx, cancel));

    Ok(InboxWatcher {
        _debouncer: debouncer,
        consumer,
    })
}

async fn consume(
    ctx: AppContext,
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(path) => {
                    process_inbox_file(&ctx, &path).await;
                }
                None => break,
            },
        }
    }
    debug!("inbox consumer stopped");
}

/// `evillens watch`: runs the watcher in the foreground until Ctrl-C.
pub async fn run_watch(config: &Config) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let cancel = CancellationToken::new();
    let watcher = start(ctx.clone(), cancel.clone())?;

    println!("watching {} (Ctrl-C to stop)", config.paths.inbox_dir.display());
    tokio::signal::ctrl_c().await?;
    cancel.cancel();
    let _ = watcher.consumer.await;
    ctx.pool.close().await;
    println!("ok");
    Ok(())
}
