//! Evidence reports and the governance summary.
//!
//! `generate_report` collects every video that has not been reported yet,
//! writes `evidence_report.md` and `evidence_report.csv` into the output
//! directory and flags the videos `reported`. A video whose cover image is
//! no longer on disk is listed as taken down and flagged `removed`.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::Row;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::Config;
use crate::context::AppContext;
use crate::db;
use crate::loader::cover_path;

pub const REPORT_MD: &str = "evidence_report.md";
pub const REPORT_CSV: &str = "evidence_report.csv";

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct EngagementTotals {
    pub total_likes: i64,
    pub total_share: i64,
    pub total_collect: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ActionCounts {
    pub reported: i64,
    pub removed: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct GovernanceSummary {
    pub total_videos: i64,
    /// Distinct authors.
    pub key_users: i64,
    pub engagement: EngagementTotals,
    pub actions: ActionCounts,
}

pub async fn summary(pool: &sqlx::SqlitePool) -> Result<GovernanceSummary> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total_videos,
            COUNT(DISTINCT author) AS key_users,
            COALESCE(SUM(likes), 0) AS total_likes,
            COALESCE(SUM(shares), 0) AS total_share,
            COALESCE(SUM(collects), 0) AS total_collect,
            COALESCE(SUM(reported), 0) AS reported,
            COALESCE(SUM(removed), 0) AS removed
        FROM videos
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(GovernanceSummary {
        total_videos: row.get("total_videos"),
        key_users: row.get("key_users"),
        engagement: EngagementTotals {
            total_likes: row.get("total_likes"),
            total_share: row.get("total_share"),
            total_collect: row.get("total_collect"),
        },
        actions: ActionCounts {
            reported: row.get("reported"),
            removed: row.get("removed"),
        },
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedReport {
    pub content: String,
    pub path: PathBuf,
    #[serde(skip)]
    pub csv_path: PathBuf,
    #[serde(skip)]
    pub videos: usize,
    #[serde(skip)]
    pub taken_down: usize,
}

struct PendingVideo {
    vd_id: String,
    title: Option<String>,
    author: Option<String>,
    create_time: Option<String>,
    likes: Option<i64>,
    shares: Option<i64>,
    collects: Option<i64>,
    cover: Option<PathBuf>,
}

impl PendingVideo {
    fn has_cover(&self) -> bool {
        self.cover.as_ref().is_some_and(|p| p.exists())
    }
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

fn render_markdown(videos: &[PendingVideo], output_dir: &Path) -> String {
    let mut out = String::new();
    out.push_str("# Harmful video evidence report\n\n");
    out.push_str("## Unreported videos\n\n");
    for video in videos {
        match video.cover.as_ref().filter(|_| video.has_cover()) {
            Some(cover) => {
                let link = cover.strip_prefix(output_dir).unwrap_or(cover);
                let _ = writeln!(out, "![{}]({})", video.vd_id, link.display());
            }
            None => {
                let _ = writeln!(out, "*Video {} has been taken down*", video.vd_id);
            }
        }
        let _ = writeln!(out, "- **Video ID**: {}", video.vd_id);
        let _ = writeln!(out, "  - Title: {}", opt(&video.title));
        let _ = writeln!(out, "  - Author: {}", opt(&video.author));
        let _ = writeln!(out, "  - Likes: {}", video.likes.unwrap_or(0));
        let _ = writeln!(out, "  - Shares: {}", video.shares.unwrap_or(0));
        out.push('\n');
    }
    out
}

fn write_csv(path: &Path, videos: &[PendingVideo]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record([
        "vd_id",
        "vd_title",
        "author",
        "create_time",
        "likes",
        "shares",
        "collects",
        "reported",
    ])?;
    for video in videos {
        writer.write_record([
            video.vd_id.clone(),
            opt(&video.title),
            opt(&video.author),
            opt(&video.create_time),
            video.likes.unwrap_or(0).to_string(),
            video.shares.unwrap_or(0).to_string(),
            video.collects.unwrap_or(0).to_string(),
            "false".to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Returns `None` when every video has already been reported.
pub async fn generate_report(ctx: &AppContext) -> Result<Option<GeneratedReport>> {
    let _guard = ctx.write_lock.lock().await;
    let images_dir = ctx.config.paths.images_dir();
    let output_dir = &ctx.config.paths.output_dir;

    let rows = sqlx::query(
        r#"
        SELECT vd_id, vd_title, author, create_time, likes, shares, collects
        FROM videos
        WHERE reported = 0
        ORDER BY vd_id
        "#,
    )
    .fetch_all(&ctx.pool)
    .await?;
    if rows.is_empty() {
        return Ok(None);
    }

    let videos: Vec<PendingVideo> = rows
        .into_iter()
        .map(|row| {
            let vd_id: String = row.get("vd_id");
            PendingVideo {
                cover: cover_path(&images_dir, &vd_id),
                vd_id,
                title: row.get("vd_title"),
                author: row.get("author"),
                create_time: row.get("create_time"),
                likes: row.get("likes"),
                shares: row.get("shares"),
                collects: row.get("collects"),
            }
        })
        .collect();

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let content = render_markdown(&videos, output_dir);
    let md_path = output_dir.join(REPORT_MD);
    std::fs::write(&md_path, &content)
        .with_context(|| format!("failed to write {}", md_path.display()))?;
    let csv_path = output_dir.join(REPORT_CSV);
    write_csv(&csv_path, &videos)?;

    let now = db::now_ts();
    let mut taken_down = 0;
    let mut tx = ctx.pool.begin().await?;
    for video in &videos {
        let gone = !video.has_cover();
        if gone {
            taken_down += 1;
        }
        sqlx::query(
            "UPDATE videos SET reported = 1, removed = MAX(removed, ?), updated_at = ? WHERE vd_id = ?",
        )
        .bind(gone)
        .bind(&now)
        .bind(&video.vd_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    for cover in videos.iter().filter_map(|v| v.cover.as_ref()) {
        if cover.exists() {
            if let Err(e) = std::fs::remove_file(cover) {
                warn!(path = %cover.display(), error = %e, "failed to delete cover image");
            }
        }
    }

    info!(
        videos = videos.len(),
        taken_down,
        path = %md_path.display(),
        "evidence report generated"
    );
    Ok(Some(GeneratedReport {
        content,
        path: md_path,
        csv_path,
        videos: videos.len(),
        taken_down,
    }))
}

/// `evillens report`
pub async fn run_report(config: &Config) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    println!("report");
    match generate_report(&ctx).await? {
        Some(report) => {
            println!("  videos: {}", report.videos);
            println!("  taken down: {}", report.taken_down);
            println!("  markdown: {}", report.path.display());
            println!("  csv: {}", report.csv_path.display());
            println!("ok");
        }
        None => println!("  no unreported videos"),
    }
    ctx.pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::test_context;

    async fn insert_video(ctx: &AppContext, vd_id: &str, author: &str, likes: i64) {
        sqlx::query(
            "INSERT INTO videos (vd_id, vd_title, author, likes, shares, collects, updated_at) VALUES (?, 'title', ?, ?, 1, 2, ?)",
        )
        .bind(vd_id)
        .bind(author)
        .bind(likes)
        .bind(db::now_ts())
        .execute(&ctx.pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let (_tmp, ctx) = test_context().await;
        insert_video(&ctx, "1", "a", 10).await;
        insert_video(&ctx, "2", "a", 5).await;
        insert_video(&ctx, "3", "b", 1).await;
        sqlx::query("UPDATE videos SET reported = 1 WHERE vd_id = '3'")
            .execute(&ctx.pool)
            .await
            .unwrap();

        let s = summary(&ctx.pool).await.unwrap();
        assert_eq!(s.total_videos, 3);
        assert_eq!(s.key_users, 2);
        assert_eq!(s.engagement.total_likes, 16);
        assert_eq!(s.engagement.total_share, 3);
        assert_eq!(s.engagement.total_collect, 6);
        assert_eq!(s.actions, ActionCounts { reported: 1, removed: 0 });
    }

    #[tokio::test]
    async fn test_generate_report_marks_videos_and_cleans_covers() {
        let (_tmp, ctx) = test_context().await;
        insert_video(&ctx, "100", "a", 10).await;
        insert_video(&ctx, "200", "b", 3).await;

        let images = ctx.config.paths.images_dir();
        std::fs::create_dir_all(&images).unwrap();
        let cover = images.join("100.jpg");
        std::fs::write(&cover, b"jpeg").unwrap();

        let report = generate_report(&ctx).await.unwrap().unwrap();
        assert_eq!(report.videos, 2);
        assert_eq!(report.taken_down, 1);
        assert!(report.content.contains("![100](images/100.jpg)"));
        assert!(report.content.contains("Video 200 has been taken down"));
        assert!(report.path.exists());

        let csv = std::fs::read_to_string(&report.csv_path).unwrap();
        assert!(csv.starts_with("vd_id,vd_title,author"));
        assert_eq!(csv.lines().count(), 3);

        assert!(!cover.exists());
        let flags: Vec<(String, bool, bool)> =
            sqlx::query_as("SELECT vd_id, reported, removed FROM videos ORDER BY vd_id")
                .fetch_all(&ctx.pool)
                .await
                .unwrap();
        assert_eq!(
            flags,
            vec![
                ("100".to_string(), true, false),
                ("200".to_string(), true, true)
            ]
        );

        // Nothing left to report
        assert!(generate_report(&ctx).await.unwrap().is_none());
    }
}
