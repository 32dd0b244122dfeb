//! Single-file ingestion: load → fetch covers → persist.
//!
//! Used by the watcher, the task orchestrator (for round files) and the
//! `evillens ingest` command.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Config;
use crate::context::AppContext;
use crate::loader;
use crate::persist::{self, PersistSummary};

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub rows: usize,
    pub images_downloaded: usize,
    pub persisted: PersistSummary,
}

/// Runs one file through the pipeline. Load errors abort before any write.
pub async fn ingest_file(
    ctx: &AppContext,
    path: &Path,
    task_id: Option<&str>,
) -> Result<IngestOutcome> {
    let format = ctx.config.analysis.timestamp_format.clone();
    let owned = path.to_path_buf();
    let batch = tokio::task::spawn_blocking(move || loader::load_file(&owned, &format))
        .await
        .context("loader task panicked")??;

    let analysis = &ctx.config.analysis;
    let images_downloaded = if analysis.download_covers {
        loader::download_covers(
            &batch,
            &ctx.http,
            &ctx.config.paths.images_dir(),
            analysis.download_concurrency,
            Duration::from_secs(analysis.download_timeout_secs),
        )
        .await
    } else {
        0
    };

    let persisted = persist::persist_batch(ctx, &batch, task_id).await?;
    Ok(IngestOutcome {
        rows: batch.rows.len(),
        images_downloaded,
        persisted,
    })
}

/// Moves a processed file into `processed_dir`, suffixing the name with a
/// timestamp (and a counter if needed) until it does not clash with an
/// archived file.
pub fn archive_file(path: &Path, processed_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(processed_dir)
        .with_context(|| format!("failed to create {}", processed_dir.display()))?;

    let file_name = path
        .file_name()
        .with_context(|| format!("not a file path: {}", path.display()))?;
    let mut target = processed_dir.join(file_name);
    if target.exists() {
        let name = file_name.to_string_lossy();
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
        target = processed_dir.join(format!("{}.{}", name, stamp));
        let mut n = 1;
        while target.exists() {
            target = processed_dir.join(format!("{}.{}-{}", name, stamp, n));
            n += 1;
        }
    }

    std::fs::rename(path, &target)
        .with_context(|| format!("failed to archive {}", path.display()))?;
    Ok(target)
}

pub async fn run_ingest(
    config: &Config,
    path: &Path,
    task_id: Option<&str>,
    archive: bool,
) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let outcome = ingest_file(&ctx, path, task_id)
        .await
        .with_context(|| format!("failed to ingest {}", path.display()))?;

    println!("ingest {}", path.display());
    println!("  rows: {}", outcome.rows);
    println!("  upserted videos: {}", outcome.persisted.videos_upserted);
    println!("  skipped rows: {}", outcome.persisted.skipped_rows);
    println!("  tags linked: {}", outcome.persisted.tags_linked);
    if let Some(task_id) = task_id {
        println!("  detection rows ({}): {}", task_id, outcome.persisted.detection_rows);
    }
    println!("  accounts: {}", outcome.persisted.accounts);
    println!("  similar-user edges: {}", outcome.persisted.similar_edges);
    if config.analysis.download_covers {
        println!("  covers downloaded: {}", outcome.images_downloaded);
    }
    if archive {
        let target = archive_file(path, &config.paths.processed_dir())?;
        println!("  archived: {}", target.display());
    }
    println!("ok");

    ctx.pool.close().await;
    Ok(())
}
