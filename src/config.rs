use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub detector: CommandConfig,
    #[serde(default)]
    pub explorer: CommandConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub mail: Option<MailConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default = "default_cors_max_age")]
    pub cors_max_age_secs: u64,
}

fn default_cors_max_age() -> u64 {
    60
}

/// Filesystem layout. Everything the pipeline reads or writes lives under
/// one of these directories.
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Directory watched for incoming CSV/JSON exports.
    pub inbox_dir: PathBuf,
    /// Generated reports and mail archives.
    pub output_dir: PathBuf,
    /// Downloaded cover images. Defaults to `<output_dir>/images`.
    #[serde(default)]
    pub images_dir: Option<PathBuf>,
    /// Expansion round files written by the task orchestrator.
    pub rounds_dir: PathBuf,
    /// Per-task scratch directories (input CSVs handed to the detector).
    pub work_dir: PathBuf,
}

impl PathsConfig {
    pub fn images_dir(&self) -> PathBuf {
        self.images_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join("images"))
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.inbox_dir.join("processed")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
    #[serde(default = "default_min_videos")]
    pub min_videos: usize,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_true")]
    pub download_covers: bool,
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,
    #[serde(default = "default_http_timeout")]
    pub download_timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            timestamp_format: default_timestamp_format(),
            min_videos: default_min_videos(),
            top_n: default_top_n(),
            download_covers: true,
            download_concurrency: default_download_concurrency(),
            download_timeout_secs: default_http_timeout(),
        }
    }
}

fn default_timestamp_format() -> String {
    "%Y-%m-%d %H:%M:%S".to_string()
}
fn default_min_videos() -> usize {
    3
}
fn default_top_n() -> usize {
    5
}
fn default_true() -> bool {
    true
}
fn default_download_concurrency() -> usize {
    4
}
fn default_http_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: default_debounce_ms(),
            extensions: default_extensions(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    500
}
fn default_extensions() -> Vec<String> {
    vec!["csv".to_string(), "json".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct LivenessConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: default_interval_minutes(),
            timeout_secs: default_http_timeout(),
        }
    }
}

fn default_interval_minutes() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct TasksConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_task_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_rounds")]
    pub rounds: u32,
    #[serde(default = "default_http_timeout")]
    pub resolve_timeout_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            timeout_secs: default_task_timeout(),
            rounds: default_rounds(),
            resolve_timeout_secs: default_http_timeout(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    32
}
fn default_task_timeout() -> u64 {
    3600
}
fn default_rounds() -> u32 {
    2
}

/// An external program invoked with a JSON request on stdin.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CommandConfig {
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    900
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    #[serde(default = "default_geo_cache")]
    pub geography_cache_secs: u64,
    #[serde(default = "default_stats_days")]
    pub default_stats_days: i64,
    #[serde(default = "default_page_size")]
    pub default_page_size: i64,
    #[serde(default = "default_carousel_limit")]
    pub carousel_limit: i64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            geography_cache_secs: default_geo_cache(),
            default_stats_days: default_stats_days(),
            default_page_size: default_page_size(),
            carousel_limit: default_carousel_limit(),
        }
    }
}

fn default_geo_cache() -> u64 {
    300
}
fn default_stats_days() -> i64 {
    90
}
fn default_page_size() -> i64 {
    10
}
fn default_carousel_limit() -> i64 {
    6
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: i64,
    #[serde(default = "default_admin")]
    pub admin_username: String,
    #[serde(default = "default_admin")]
    pub admin_password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: None,
            token_ttl_secs: default_token_ttl(),
            admin_username: default_admin(),
            admin_password: default_admin(),
        }
    }
}

impl AuthConfig {
    /// Signing secret, `EVILLENS_TOKEN_SECRET` taking precedence over the file.
    pub fn secret(&self) -> String {
        std::env::var("EVILLENS_TOKEN_SECRET")
            .ok()
            .or_else(|| self.token_secret.clone())
            .unwrap_or_else(|| "evillens-dev-secret".to_string())
    }
}

fn default_token_ttl() -> i64 {
    3600
}
fn default_admin() -> String {
    "admin".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MailConfig {
    pub smtp_server: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    pub to: String,
    #[serde(default = "default_subject")]
    pub subject: String,
}

impl MailConfig {
    pub fn password(&self) -> Option<String> {
        std::env::var("EVILLENS_SMTP_PASSWORD")
            .ok()
            .or_else(|| self.password.clone())
    }
}

fn default_smtp_port() -> u16 {
    465
}
fn default_subject() -> String {
    "EvilLens detection report".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.analysis.min_videos == 0 {
        anyhow::bail!("analysis.min_videos must be >= 1");
    }
    if config.analysis.top_n == 0 {
        anyhow::bail!("analysis.top_n must be >= 1");
    }
    if config.analysis.download_concurrency == 0 {
        anyhow::bail!("analysis.download_concurrency must be >= 1");
    }

    if config.liveness.interval_minutes == 0 {
        anyhow::bail!("liveness.interval_minutes must be >= 1");
    }

    if config.tasks.workers == 0 {
        anyhow::bail!("tasks.workers must be >= 1");
    }
    if config.tasks.queue_capacity == 0 {
        anyhow::bail!("tasks.queue_capacity must be >= 1");
    }

    for (name, cmd) in [("detector", &config.detector), ("explorer", &config.explorer)] {
        if let Some(argv) = &cmd.command {
            if argv.is_empty() || argv[0].trim().is_empty() {
                anyhow::bail!("{}.command must name a program", name);
            }
        }
    }

    for ext in &config.watcher.extensions {
        match ext.to_ascii_lowercase().as_str() {
            "csv" | "json" => {}
            other => anyhow::bail!(
                "Unsupported watcher extension: '{}'. Must be csv or json.",
                other
            ),
        }
    }

    if config.dashboard.default_page_size < 1 {
        anyhow::bail!("dashboard.default_page_size must be >= 1");
    }
    if config.dashboard.default_stats_days < 0 {
        anyhow::bail!("dashboard.default_stats_days must be >= 0");
    }
    if config.dashboard.carousel_limit < 1 {
        anyhow::bail!("dashboard.carousel_limit must be >= 1");
    }

    Ok(())
}
