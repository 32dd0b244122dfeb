//! Database statistics overview.
//!
//! Used by `evillens stats` to show what has been ingested: governance totals,
//! row counts per table and the most recent tasks.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::report;

const TABLES: &[&str] = &[
    "videos",
    "tag_video_mapping",
    "top_videos",
    "account_stats",
    "similar_users",
    "malicious_users",
    "tasks",
    "detection_results",
    "gangs",
];

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let summary = report::summary(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("EvilLens — Database Stats");
    println!("=========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Videos:      {}", summary.total_videos);
    println!("  Authors:     {}", summary.key_users);
    println!("  Likes:       {}", summary.engagement.total_likes);
    println!("  Shares:      {}", summary.engagement.total_share);
    println!("  Collects:    {}", summary.engagement.total_collect);
    println!("  Reported:    {}", summary.actions.reported);
    println!("  Removed:     {}", summary.actions.removed);

    println!();
    println!("  {:<24} {:>8}", "TABLE", "ROWS");
    println!("  {}", "-".repeat(33));
    for table in TABLES {
        let rows: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&pool)
            .await?;
        println!("  {:<24} {:>8}", table, rows);
    }

    let recent = sqlx::query(
        "SELECT task_id, status, created_at FROM tasks ORDER BY created_at DESC LIMIT 5",
    )
    .fetch_all(&pool)
    .await?;
    if !recent.is_empty() {
        println!();
        println!("  Recent tasks:");
        for row in &recent {
            let created: String = row.get("created_at");
            let age = db::parse_ts(&created)
                .map(|ts| format_age(&ts))
                .unwrap_or(created);
            println!(
                "  {:<38} {:<11} {}",
                row.get::<String, _>("task_id"),
                row.get::<String, _>("status"),
                age
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Relative age of a local timestamp, e.g. "3 hours ago".
fn format_age(ts: &chrono::NaiveDateTime) -> String {
    let delta = (chrono::Local::now().naive_local() - *ts).num_seconds();

    if delta < 0 {
        db::format_ts(ts)
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        db::format_ts(ts)
    }
}
