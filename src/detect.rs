//! External detection and expansion collaborators.
//!
//! Both are separate programs configured as an argv list. The request is
//! written to the program's stdin as JSON and the response is read from its
//! stdout as JSON:
//!
//! | Program | Request | Response |
//! |---------|---------|----------|
//! | detector | `{"task_id", "video_ids", "input_csv"}` | `{"evil_video_ids": [...], "videos": [...]}` |
//! | explorer | `{"task_id", "round", "seed_ids"}` | `{"user_info": {...}, "videos": [...]}` or `[...]` |

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::CommandConfig;

#[derive(Debug, Clone, Serialize)]
pub struct DetectRequest {
    pub task_id: String,
    pub video_ids: Vec<String>,
    /// CSV with a `vd_id` column listing the submitted ids.
    pub input_csv: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectResponse {
    #[serde(default)]
    pub evil_video_ids: Vec<String>,
    /// Metadata of the detected videos, in the JSON export shape.
    #[serde(default)]
    pub videos: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExploreRequest {
    pub task_id: String,
    pub round: u32,
    pub seed_ids: Vec<String>,
}

#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, request: &DetectRequest) -> Result<DetectResponse>;
}

/// Finds videos related to a set of seeds. The response is one round file.
#[async_trait]
pub trait Explorer: Send + Sync {
    async fn explore(&self, request: &ExploreRequest) -> Result<Value>;
}

/// Runs `argv` with `input` on stdin and parses its stdout as JSON.
pub async fn run_json_command<T: Serialize + ?Sized>(
    argv: &[String],
    input: &T,
    timeout: Duration,
) -> Result<Value> {
    let (program, args) = argv.split_first().context("empty command")?;
    let payload = serde_json::to_vec(input)?;

    let mut child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start {}", program))?;

    if let Some(mut stdin) = child.stdin.take() {
        // A program that ignores its input may close the pipe early
        if let Err(e) = stdin.write_all(&payload).await {
            debug!(program = %program, error = %e, "stdin closed before request was written");
        }
        drop(stdin);
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.with_context(|| format!("failed to wait for {}", program))?,
        Err(_) => bail!("{} timed out after {}s", program, timeout.as_secs()),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(program = %program, status = %output.status, stderr = %stderr.trim(), "command failed");
        bail!("{} exited with {}", program, output.status);
    }

    debug!(program = %program, bytes = output.stdout.len(), "command finished");
    serde_json::from_slice(&output.stdout)
        .with_context(|| format!("{} did not print valid JSON", program))
}

pub struct CommandDetector {
    config: CommandConfig,
}

impl CommandDetector {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Detector for CommandDetector {
    async fn detect(&self, request: &DetectRequest) -> Result<DetectResponse> {
        let Some(argv) = &self.config.command else {
            bail!("detector is not configured");
        };
        let value = run_json_command(
            argv,
            request,
            Duration::from_secs(self.config.timeout_secs),
        )
        .await?;
        serde_json::from_value(value).context("unexpected detector response")
    }
}

pub struct CommandExplorer {
    config: CommandConfig,
}

impl CommandExplorer {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Explorer for CommandExplorer {
    async fn explore(&self, request: &ExploreRequest) -> Result<Value> {
        let Some(argv) = &self.config.command else {
            bail!("explorer is not configured");
        };
        run_json_command(argv, request, Duration::from_secs(self.config.timeout_secs)).await
    }
}
