//! Media liveness checks.
//!
//! Every video not yet marked `removed` is probed with a `HEAD` request on its
//! cover URL. The platform answers 403 once content has been taken down, so a
//! 403 marks the video `removed`. Any other answer leaves it alone, and a
//! network error only counts towards the run's `errors`.

use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::Row;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::AppContext;
use crate::db;

const PROBE_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LivenessSummary {
    pub checked: u64,
    pub removed: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Alive,
    Gone,
    Unreachable,
}

async fn probe(client: &reqwest::Client, url: &str, timeout: Duration) -> Probe {
    match client.head(url).timeout(timeout).send().await {
        Ok(resp) if resp.status() == reqwest::StatusCode::FORBIDDEN => Probe::Gone,
        Ok(resp) => {
            debug!(url, status = %resp.status(), "media reachable");
            Probe::Alive
        }
        Err(e) => {
            debug!(url, error = %e, "probe failed");
            Probe::Unreachable
        }
    }
}

/// Runs one pass. Returns `None` when another pass is still running.
pub async fn check_removed_videos(ctx: &AppContext) -> Result<Option<LivenessSummary>> {
    let Ok(_running) = ctx.liveness_guard.try_lock() else {
        info!("liveness check already running, skipping");
        return Ok(None);
    };

    let rows = sqlx::query(
        r#"
        SELECT vd_id, img_url FROM videos
        WHERE removed = 0 AND img_url IS NOT NULL AND img_url != ''
        ORDER BY vd_id
        "#,
    )
    .fetch_all(&ctx.pool)
    .await?;
    let targets: Vec<(String, String)> = rows
        .into_iter()
        .map(|row| (row.get("vd_id"), row.get("img_url")))
        .collect();

    let timeout = Duration::from_secs(ctx.config.liveness.timeout_secs);
    let client = &ctx.http;
    let results: Vec<(String, Probe)> = stream::iter(targets)
        .map(|(vd_id, url)| async move {
            let outcome = probe(client, &url, timeout).await;
            (vd_id, outcome)
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .collect()
        .await;

    let mut summary = LivenessSummary {
        checked: results.len() as u64,
        ..Default::default()
    };
    let gone: Vec<&str> = results
        .iter()
        .filter(|(_, p)| *p == Probe::Gone)
        .map(|(id, _)| id.as_str())
        .collect();
    summary.errors = results
        .iter()
        .filter(|(_, p)| *p == Probe::Unreachable)
        .count() as u64;

    if !gone.is_empty() {
        let now = db::now_ts();
        let _guard = ctx.write_lock.lock().await;
        let mut tx = ctx.pool.begin().await?;
        for vd_id in &gone {
            let result = sqlx::query(
                "UPDATE videos SET removed = 1, updated_at = ? WHERE vd_id = ? AND removed = 0",
            )
            .bind(&now)
            .bind(*vd_id)
            .execute(&mut *tx)
            .await?;
            summary.removed += result.rows_affected();
        }
        tx.commit().await?;
    }

    info!(
        checked = summary.checked,
        removed = summary.removed,
        errors = summary.errors,
        "liveness check finished"
    );
    Ok(Some(summary))
}

/// Runs a pass immediately and then every `liveness.interval_minutes`.
pub fn spawn_scheduler(ctx: AppContext, cancel: CancellationToken) -> JoinHandle<()> {
    let period = Duration::from_secs(ctx.config.liveness.interval_minutes * 60);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = check_removed_videos(&ctx).await {
                        warn!(error = %e, "liveness check failed");
                    }
                }
            }
        }
        debug!("liveness scheduler stopped");
    })
}

/// `evillens check-links`
pub async fn run_check_links(config: &Config) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let summary = check_removed_videos(&ctx).await?.unwrap_or_default();
    println!("check-links");
    println!("  checked: {}", summary.checked);
    println!("  removed: {}", summary.removed);
    println!("  errors: {}", summary.errors);
    println!("ok");
    ctx.pool.close().await;
    Ok(())
}
