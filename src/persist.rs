//! Batch persistence.
//!
//! | Table | Policy |
//! |-------|--------|
//! | `videos` | upsert by `vd_id`; missing fields keep stored values; `reported` / `removed` never cleared |
//! | `tag_video_mapping` | insert-or-ignore on `(tag, vd_id)` |
//! | `detection_results` | insert-or-ignore on `(task_id, vd_id)` |
//! | `malicious_users` | upsert by `user_id` |
//! | derived tables (incl. `top_videos`) | recomputed from the whole `videos` table |
//!
//! Everything happens in one transaction, serialised behind the context's
//! write gate. Cover images of reported videos are removed after commit.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{Row, SqliteConnection};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::analysis::{self, Analysis};
use crate::context::AppContext;
use crate::db;
use crate::loader::{cover_path, Batch, NormalizedRow};
use crate::models::{MaliciousUser, VideoRecord};

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PersistSummary {
    pub videos_upserted: u64,
    /// Rows without a video id.
    pub skipped_rows: u64,
    pub tags_linked: u64,
    pub detection_rows: u64,
    pub accounts: u64,
    pub similar_edges: u64,
    pub images_deleted: u64,
}

/// Writes one batch and refreshes every derived table.
pub async fn persist_batch(
    ctx: &AppContext,
    batch: &Batch,
    task_id: Option<&str>,
) -> Result<PersistSummary> {
    let _guard = ctx.write_lock.lock().await;
    let now = db::now_ts();
    let mut summary = PersistSummary::default();

    let mut tx = ctx.pool.begin().await?;

    for row in &batch.rows {
        let record = &row.record;
        let Some(vd_id) = record.vd_id.as_deref() else {
            summary.skipped_rows += 1;
            continue;
        };

        upsert_video(&mut tx, vd_id, row, &now)
            .await
            .with_context(|| format!("failed to upsert video {}", vd_id))?;
        summary.videos_upserted += 1;

        for tag in &record.tags {
            let result =
                sqlx::query("INSERT OR IGNORE INTO tag_video_mapping (tag, vd_id) VALUES (?, ?)")
                    .bind(tag)
                    .bind(vd_id)
                    .execute(&mut *tx)
                    .await?;
            summary.tags_linked += result.rows_affected();
        }

        if let Some(task_id) = task_id {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO detection_results (task_id, vd_id, is_evil, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(task_id)
            .bind(vd_id)
            .bind(record.evil)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            summary.detection_rows += result.rows_affected();
        }
    }

    if let Some(user) = &batch.user {
        upsert_user(&mut tx, user, &now).await?;
    }

    let all_videos = load_videos(&mut tx).await?;
    let analysis = analysis::analyze(
        &all_videos,
        ctx.config.analysis.min_videos,
        ctx.config.analysis.top_n,
    );
    replace_derived(&mut tx, &analysis).await?;
    summary.accounts = analysis.accounts.len() as u64;
    summary.similar_edges = analysis.similar_users.len() as u64;

    tx.commit().await?;

    let batch_ids: HashSet<&str> = batch
        .rows
        .iter()
        .filter_map(|r| r.record.vd_id.as_deref())
        .collect();
    let images_dir = ctx.config.paths.images_dir();
    for video in all_videos.iter().filter(|v| v.reported) {
        let Some(vd_id) = video.vd_id.as_deref() else {
            continue;
        };
        if !batch_ids.contains(vd_id) {
            continue;
        }
        if let Some(path) = cover_path(&images_dir, vd_id) {
            if path.exists() {
                match std::fs::remove_file(&path) {
                    Ok(()) => summary.images_deleted += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to delete cover"),
                }
            }
        }
    }

    info!(
        source = %batch.source.display(),
        videos = summary.videos_upserted,
        skipped = summary.skipped_rows,
        "batch persisted"
    );
    Ok(summary)
}

/// A placeholder `create_time` never replaces a stored one.
async fn upsert_video(
    conn: &mut SqliteConnection,
    vd_id: &str,
    row: &NormalizedRow,
    now: &str,
) -> Result<()> {
    let record = &row.record;
    sqlx::query(
        r#"
        INSERT INTO videos (vd_id, vd_title, author, likes, shares, collects, engagement_rate,
                            follower_rate, create_time, img_url, evil, reported, removed,
                            updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(vd_id) DO UPDATE SET
            vd_title = COALESCE(excluded.vd_title, videos.vd_title),
            author = COALESCE(excluded.author, videos.author),
            likes = COALESCE(excluded.likes, videos.likes),
            shares = COALESCE(excluded.shares, videos.shares),
            collects = COALESCE(excluded.collects, videos.collects),
            engagement_rate = (COALESCE(excluded.likes, videos.likes, 0)
                + 10 * COALESCE(excluded.shares, videos.shares, 0)
                + 10 * COALESCE(excluded.collects, videos.collects, 0)) / 100.0,
            follower_rate = COALESCE(excluded.follower_rate, videos.follower_rate),
            create_time = CASE WHEN ?
                THEN COALESCE(videos.create_time, excluded.create_time)
                ELSE COALESCE(excluded.create_time, videos.create_time)
            END,
            img_url = COALESCE(excluded.img_url, videos.img_url),
            evil = excluded.evil,
            reported = MAX(videos.reported, excluded.reported),
            removed = MAX(videos.removed, excluded.removed),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(vd_id)
    .bind(&record.title)
    .bind(&record.author)
    .bind(record.likes)
    .bind(record.shares)
    .bind(record.collects)
    .bind(record.engagement_rate())
    .bind(row.follower_rate)
    .bind(record.create_time.as_ref().map(db::format_ts))
    .bind(&record.img_url)
    .bind(record.evil)
    .bind(record.reported)
    .bind(record.removed)
    .bind(now)
    .bind(row.create_time_defaulted)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_user(conn: &mut SqliteConnection, user: &MaliciousUser, now: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO malicious_users (user_id, user_name, age, follow_count, fans_count, like_count,
                                     douyin_id, ip_location, self_description, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET
            user_name = COALESCE(excluded.user_name, malicious_users.user_name),
            age = COALESCE(excluded.age, malicious_users.age),
            follow_count = excluded.follow_count,
            fans_count = excluded.fans_count,
            like_count = excluded.like_count,
            douyin_id = COALESCE(excluded.douyin_id, malicious_users.douyin_id),
            ip_location = COALESCE(excluded.ip_location, malicious_users.ip_location),
            self_description = COALESCE(excluded.self_description, malicious_users.self_description),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&user.user_id)
    .bind(&user.user_name)
    .bind(&user.age)
    .bind(user.follow_count)
    .bind(user.fans_count)
    .bind(user.like_count)
    .bind(&user.douyin_id)
    .bind(&user.ip_location)
    .bind(&user.self_description)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

/// Reads every stored video with its tags.
pub async fn load_videos(conn: &mut SqliteConnection) -> Result<Vec<VideoRecord>> {
    let mut tags: HashMap<String, Vec<String>> = HashMap::new();
    let tag_rows = sqlx::query("SELECT tag, vd_id FROM tag_video_mapping")
        .fetch_all(&mut *conn)
        .await?;
    for row in tag_rows {
        let vd_id: String = row.get("vd_id");
        tags.entry(vd_id).or_default().push(row.get("tag"));
    }

    let rows = sqlx::query(
        r#"
        SELECT vd_id, vd_title, author, likes, shares, collects, create_time, img_url,
               evil, reported, removed
        FROM videos
        ORDER BY vd_id
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    let videos = rows
        .into_iter()
        .map(|row| {
            let vd_id: String = row.get("vd_id");
            let create_time: Option<String> = row.get("create_time");
            VideoRecord {
                tags: tags.remove(&vd_id).unwrap_or_default().into_iter().collect(),
                vd_id: Some(vd_id),
                title: row.get("vd_title"),
                author: row.get("author"),
                likes: row.get("likes"),
                shares: row.get("shares"),
                collects: row.get("collects"),
                create_time: create_time.as_deref().and_then(db::parse_ts),
                img_url: row.get("img_url"),
                evil: row.get("evil"),
                reported: row.get("reported"),
                removed: row.get("removed"),
            }
        })
        .collect();
    Ok(videos)
}

async fn replace_derived(conn: &mut SqliteConnection, analysis: &Analysis) -> Result<()> {
    for table in [
        "top_videos",
        "account_stats",
        "hourly_distribution",
        "daily_distribution",
        "interaction_correlations",
        "tag_frequencies",
        "similar_users",
    ] {
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut *conn)
            .await?;
    }

    for (position, vd_id) in analysis.ranked.iter().enumerate() {
        sqlx::query("INSERT INTO top_videos (position, vd_id) VALUES (?, ?)")
            .bind(position as i64 + 1)
            .bind(vd_id)
            .execute(&mut *conn)
            .await?;
    }

    for stat in &analysis.accounts {
        sqlx::query(
            r#"
            INSERT INTO account_stats (author, video_count, total_likes, total_shares,
                                       total_collects, engagement_rate)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stat.author)
        .bind(stat.video_count)
        .bind(stat.total_likes)
        .bind(stat.total_shares)
        .bind(stat.total_collects)
        .bind(stat.engagement_rate)
        .execute(&mut *conn)
        .await?;
    }

    for (hour, count) in &analysis.hourly {
        sqlx::query("INSERT INTO hourly_distribution (hour, count) VALUES (?, ?)")
            .bind(*hour as i64)
            .bind(count)
            .execute(&mut *conn)
            .await?;
    }

    for (date, count) in &analysis.daily {
        sqlx::query("INSERT INTO daily_distribution (date, count) VALUES (?, ?)")
            .bind(date.format("%Y-%m-%d").to_string())
            .bind(count)
            .execute(&mut *conn)
            .await?;
    }

    for corr in &analysis.correlations {
        sqlx::query(
            "INSERT INTO interaction_correlations (metric1, metric2, correlation) VALUES (?, ?, ?)",
        )
        .bind(&corr.metric1)
        .bind(&corr.metric2)
        .bind(corr.correlation)
        .execute(&mut *conn)
        .await?;
    }

    for (tag, frequency) in &analysis.tag_frequencies {
        sqlx::query("INSERT INTO tag_frequencies (tag, frequency) VALUES (?, ?)")
            .bind(tag)
            .bind(frequency)
            .execute(&mut *conn)
            .await?;
    }

    for edge in &analysis.similar_users {
        sqlx::query(
            r#"
            INSERT INTO similar_users (original_account, similar_account, similarity_score)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&edge.original_account)
        .bind(&edge.similar_account)
        .bind(edge.similarity_score)
        .execute(&mut *conn)
        .await?;
    }

    debug!(
        accounts = analysis.accounts.len(),
        tags = analysis.tag_frequencies.len(),
        edges = analysis.similar_users.len(),
        "derived tables refreshed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::test_context;
    use crate::loader::{load_csv, FileKind, NormalizedRow};
    use std::path::PathBuf;

    const CSV: &str = "vd_id,vd_title,author,likes,shares,collects,create_time\n\
        1,first #a #b,alice,100,10,5,2025-04-04 08:37:00\n\
        2,second #a,alice,50,0,0,2025-04-04 09:00:00\n\
        3,third,bob,10,1,1,2025-04-05 08:00:00\n\
        ,orphan,carol,1,1,1,2025-04-05 08:00:00\n";

    async fn counts(ctx: &AppContext) -> (i64, i64, i64, i64, i64) {
        let videos: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM videos")
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
        let tags: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tag_video_mapping")
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
        let hourly: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(count), 0) FROM hourly_distribution")
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
        let daily: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(count), 0) FROM daily_distribution")
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
        let likes: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(total_likes), 0) FROM account_stats")
                .fetch_one(&ctx.pool)
                .await
                .unwrap();
        (videos, tags, hourly, daily, likes)
    }

    #[tokio::test]
    async fn test_reingest_same_file_is_idempotent() {
        let (tmp, ctx) = test_context().await;
        let path = tmp.path().join("batch.csv");
        std::fs::write(&path, CSV).unwrap();
        let batch = load_csv(&path, db::TS_FORMAT).unwrap();

        let first = persist_batch(&ctx, &batch, None).await.unwrap();
        assert_eq!(first.videos_upserted, 3);
        assert_eq!(first.skipped_rows, 1);
        let after_first = counts(&ctx).await;
        assert_eq!(after_first, (3, 3, 3, 3, 160));

        let second = persist_batch(&ctx, &batch, None).await.unwrap();
        assert_eq!(second.tags_linked, 0);
        assert_eq!(counts(&ctx).await, after_first);
    }

    #[tokio::test]
    async fn test_missing_fields_keep_stored_values() {
        let (_tmp, ctx) = test_context().await;
        let mut full = VideoRecord::new("42");
        full.title = Some("title".to_string());
        full.author = Some("alice".to_string());
        full.likes = Some(100);
        full.shares = Some(10);
        full.collects = Some(5);
        full.reported = true;

        let mut partial = VideoRecord::new("42");
        partial.likes = Some(200);

        for record in [full, partial] {
            let batch = Batch {
                source: PathBuf::from("mem.csv"),
                kind: FileKind::Csv,
                rows: vec![NormalizedRow::new(record)],
                user: None,
            };
            persist_batch(&ctx, &batch, None).await.unwrap();
        }

        let row = sqlx::query(
            "SELECT vd_title, author, likes, shares, engagement_rate, reported FROM videos WHERE vd_id = '42'",
        )
        .fetch_one(&ctx.pool)
        .await
        .unwrap();
        assert_eq!(row.get::<Option<String>, _>("vd_title").as_deref(), Some("title"));
        assert_eq!(row.get::<Option<String>, _>("author").as_deref(), Some("alice"));
        assert_eq!(row.get::<Option<i64>, _>("likes"), Some(200));
        assert_eq!(row.get::<Option<i64>, _>("shares"), Some(10));
        assert!((row.get::<f64, _>("engagement_rate") - 3.5).abs() < 1e-9);
        assert!(row.get::<bool, _>("reported"));
    }

    #[tokio::test]
    async fn test_task_rows_and_user_are_recorded() {
        let (tmp, ctx) = test_context().await;
        let path = tmp.path().join("round.json");
        std::fs::write(
            &path,
            r#"{"user_info": {"user_id": "u1", "ip_location": "北京"},
                "videos": [{"vd_id": "7", "author": "x"}, {"vd_id": "8", "author": "x"}]}"#,
        )
        .unwrap();
        let batch = crate::loader::load_json(&path, db::TS_FORMAT).unwrap();

        let summary = persist_batch(&ctx, &batch, Some("task-1")).await.unwrap();
        assert_eq!(summary.detection_rows, 2);
        let again = persist_batch(&ctx, &batch, Some("task-1")).await.unwrap();
        assert_eq!(again.detection_rows, 0);

        let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM malicious_users")
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
        assert_eq!(users, 1);
    }

    async fn stored_create_time(ctx: &AppContext, vd_id: &str) -> Option<String> {
        sqlx::query_scalar("SELECT create_time FROM videos WHERE vd_id = ?")
            .bind(vd_id)
            .fetch_one(&ctx.pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reingest_keeps_stored_publication_time() {
        let (tmp, ctx) = test_context().await;
        let path = tmp.path().join("undated.json");
        std::fs::write(&path, r#"[{"vd_id": "31", "author": "x", "likes": 2}]"#).unwrap();

        let batch = crate::loader::load_json(&path, db::TS_FORMAT).unwrap();
        persist_batch(&ctx, &batch, None).await.unwrap();
        let first = stored_create_time(&ctx, "31").await;
        assert!(first.is_some());

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let batch = crate::loader::load_json(&path, db::TS_FORMAT).unwrap();
        persist_batch(&ctx, &batch, None).await.unwrap();
        assert_eq!(stored_create_time(&ctx, "31").await, first);

        // A real timestamp still replaces the placeholder
        std::fs::write(
            &path,
            r#"[{"vd_id": "31", "create_time": "2025-04-04 08:37:00"}]"#,
        )
        .unwrap();
        let batch = crate::loader::load_json(&path, db::TS_FORMAT).unwrap();
        persist_batch(&ctx, &batch, None).await.unwrap();
        assert_eq!(stored_create_time(&ctx, "31").await.as_deref(), Some("2025-04-04 08:37:00"));
    }

    #[tokio::test]
    async fn test_follower_rate_and_ranking_are_stored() {
        let (tmp, ctx) = test_context().await;
        let path = tmp.path().join("followers.csv");
        std::fs::write(&path, "vd_id,likes,followers\n1,50,200\n2,80,0\n").unwrap();
        let batch = load_csv(&path, db::TS_FORMAT).unwrap();
        persist_batch(&ctx, &batch, None).await.unwrap();

        let rate: Option<f64> =
            sqlx::query_scalar("SELECT follower_rate FROM videos WHERE vd_id = '1'")
                .fetch_one(&ctx.pool)
                .await
                .unwrap();
        assert_eq!(rate, Some(0.25));

        let ranked: Vec<String> =
            sqlx::query_scalar("SELECT vd_id FROM top_videos ORDER BY position")
                .fetch_all(&ctx.pool)
                .await
                .unwrap();
        assert_eq!(ranked, vec!["2", "1"]);
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_whole_batch() {
        let (tmp, ctx) = test_context().await;
        let path = tmp.path().join("batch.csv");
        std::fs::write(&path, CSV).unwrap();
        let batch = load_csv(&path, db::TS_FORMAT).unwrap();

        // Derived tables are written last, after every video upsert
        sqlx::query("DROP TABLE similar_users")
            .execute(&ctx.pool)
            .await
            .unwrap();

        assert!(persist_batch(&ctx, &batch, None).await.is_err());
        assert_eq!(counts(&ctx).await, (0, 0, 0, 0, 0));
    }

    #[tokio::test]
    async fn test_reported_covers_are_deleted_after_commit() {
        let (tmp, ctx) = test_context().await;
        let images = ctx.config.paths.images_dir();
        std::fs::create_dir_all(&images).unwrap();
        std::fs::write(images.join("5.jpg"), b"jpg").unwrap();
        std::fs::write(images.join("6.jpg"), b"jpg").unwrap();

        let path = tmp.path().join("flags.csv");
        std::fs::write(&path, "vd_id,reported\n5,true\n6,false\n").unwrap();
        let batch = load_csv(&path, db::TS_FORMAT).unwrap();
        let summary = persist_batch(&ctx, &batch, None).await.unwrap();

        assert_eq!(summary.images_deleted, 1);
        assert!(!images.join("5.jpg").exists());
        assert!(images.join("6.jpg").exists());
    }
}
