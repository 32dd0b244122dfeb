//! Expansion round files: `<rounds_dir>/<task_id>_round_<n>.json`.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct RoundVideos {
    pub round: u32,
    pub video_count: usize,
    pub videos: Vec<Value>,
}

pub fn round_path(rounds_dir: &Path, task_id: &str, round: u32) -> PathBuf {
    rounds_dir.join(format!("{}_round_{}.json", task_id, round))
}

pub fn write_round(rounds_dir: &Path, task_id: &str, round: u32, data: &Value) -> Result<PathBuf> {
    std::fs::create_dir_all(rounds_dir)
        .with_context(|| format!("failed to create {}", rounds_dir.display()))?;
    let path = round_path(rounds_dir, task_id, round);
    let text = serde_json::to_string_pretty(data)?;
    std::fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

fn videos_of(data: &Value) -> Vec<Value> {
    match data {
        Value::Array(items) => items.clone(),
        Value::Object(map) => match map.get("videos") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// `None` when the round file does not exist.
pub fn read_round(rounds_dir: &Path, task_id: &str, round: u32) -> Result<Option<RoundVideos>> {
    let path = round_path(rounds_dir, task_id, round);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let data: Value = serde_json::from_str(&text)
        .with_context(|| format!("round file {} is not valid JSON", path.display()))?;
    let videos = videos_of(&data);
    Ok(Some(RoundVideos {
        round,
        video_count: videos.len(),
        videos,
    }))
}

/// Every readable round of a task, ordered by round number. Unreadable
/// files are skipped.
pub fn read_all_rounds(rounds_dir: &Path, task_id: &str) -> Result<Vec<RoundVideos>> {
    if !rounds_dir.exists() {
        return Ok(Vec::new());
    }
    let prefix = format!("{}_round_", task_id);
    let mut rounds = Vec::new();

    for entry in std::fs::read_dir(rounds_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(number) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        match read_round(rounds_dir, task_id, number) {
            Ok(Some(round)) => rounds.push(round),
            Ok(None) => {}
            Err(e) => warn!(file = %name, error = %e, "skipping unreadable round file"),
        }
    }

    rounds.sort_by_key(|r| r.round);
    Ok(rounds)
}
