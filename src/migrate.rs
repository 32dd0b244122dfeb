use anyhow::Result;
use sqlx::SqlitePool;

use crate::auth;
use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    auth::ensure_admin(&pool, &config.auth).await?;
    pool.close().await;
    Ok(())
}

/// Creates every table and index. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Raw and derived video data
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            vd_id TEXT PRIMARY KEY,
            vd_title TEXT,
            author TEXT,
            likes INTEGER,
            shares INTEGER,
            collects INTEGER,
            engagement_rate REAL NOT NULL DEFAULT 0,
            follower_rate REAL,
            create_time TEXT,
            img_url TEXT,
            evil INTEGER NOT NULL DEFAULT 1,
            reported INTEGER NOT NULL DEFAULT 0,
            removed INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    add_column_if_missing(pool, "videos", "follower_rate", "REAL").await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS top_videos (
            position INTEGER PRIMARY KEY,
            vd_id TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tag_video_mapping (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tag TEXT NOT NULL,
            vd_id TEXT NOT NULL,
            UNIQUE(tag, vd_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS account_stats (
            author TEXT PRIMARY KEY,
            video_count INTEGER NOT NULL,
            total_likes INTEGER NOT NULL,
            total_shares INTEGER NOT NULL,
            total_collects INTEGER NOT NULL,
            engagement_rate REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tag_frequencies (
            tag TEXT PRIMARY KEY,
            frequency INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS hourly_distribution (
            hour INTEGER PRIMARY KEY,
            count INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS daily_distribution (
            date TEXT PRIMARY KEY,
            count INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS interaction_correlations (
            metric1 TEXT NOT NULL,
            metric2 TEXT NOT NULL,
            correlation REAL,
            PRIMARY KEY (metric1, metric2)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS similar_users (
            original_account TEXT NOT NULL,
            similar_account TEXT NOT NULL,
            similarity_score REAL NOT NULL,
            PRIMARY KEY (original_account, similar_account)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS malicious_users (
            user_id TEXT PRIMARY KEY,
            user_name TEXT,
            age TEXT,
            follow_count INTEGER NOT NULL DEFAULT 0,
            fans_count INTEGER NOT NULL DEFAULT 0,
            like_count INTEGER NOT NULL DEFAULT 0,
            douyin_id TEXT,
            ip_location TEXT,
            self_description TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Detection tasks
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            completed_at TEXT,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS detection_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            vd_id TEXT NOT NULL,
            is_evil INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE(task_id, vd_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Gangs and their accounts on other platforms
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gangs (
            gang_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            distribution TEXT,
            activity_time TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cross_platform_accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            gang_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            username TEXT NOT NULL,
            url TEXT,
            followers INTEGER,
            likes INTEGER,
            comments INTEGER,
            shares INTEGER,
            FOREIGN KEY (gang_id) REFERENCES gangs(gang_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            salt TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_videos_removed ON videos(removed)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_videos_author ON videos(author)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_videos_create_time ON videos(create_time DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tag_video_mapping_vd ON tag_video_mapping(vd_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_detection_results_task ON detection_results(task_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cross_platform_gang ON cross_platform_accounts(gang_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Databases created before a column existed get it added in place.
async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<()> {
    let present: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?",
    )
    .bind(table)
    .bind(column)
    .fetch_one(pool)
    .await?;
    if present == 0 {
        sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
            .execute(pool)
            .await?;
    }
    Ok(())
}
