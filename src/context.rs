//! Shared handles passed to every pipeline stage and HTTP handler.

use anyhow::{Context as _, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::auth;
use crate::config::Config;
use crate::db;
use crate::migrate;

/// Cheap to clone; every field is reference-counted.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub http: reqwest::Client,
    /// Serialises writers: watcher, task workers, liveness checks, reports.
    pub write_lock: Arc<Mutex<()>>,
    /// Held for the duration of one liveness pass.
    pub liveness_guard: Arc<Mutex<()>>,
}

impl AppContext {
    /// Connects to the database and makes sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool)
            .await
            .context("failed to apply schema")?;
        auth::ensure_admin(&pool, &config.auth).await?;
        Self::with_pool(config.clone(), pool)
    }

    pub fn with_pool(config: Config, pool: SqlitePool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("evillens/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            config: Arc::new(config),
            pool,
            http,
            write_lock: Arc::new(Mutex::new(())),
            liveness_guard: Arc::new(Mutex::new(())),
        })
    }
}
