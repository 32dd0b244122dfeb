//! Batch loader: reads a CSV or JSON export and normalises it.
//!
//! A file that cannot be read or parsed fails the whole batch with a
//! [`LoadError`]. Individual rows never fail: unparseable cells simply become
//! missing values on the [`VideoRecord`].
//!
//! # Column aliases
//!
//! | Canonical | Accepted aliases |
//! |-----------|------------------|
//! | `vd_id` | `video_id` |
//! | `vd_title` | `title` |
//! | `author` | `author_nickname`, `nickname` |
//! | `img_url` | `cover_img`, `cover_url` |
//! | `create_time` | `publish_time` |

use chrono::NaiveDateTime;
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{MaliciousUser, VideoRecord};

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#([^#\s]+)").expect("valid regex"));

/// Fatal problems with an input file. Row-level problems never surface here.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed CSV in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path} is missing required column '{column}'")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("unexpected layout in {path}: {reason}")]
    Layout { path: PathBuf, reason: String },
    #[error("unsupported file type: {0}")]
    Unsupported(PathBuf),
}

/// Input formats understood by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Csv,
    Json,
}

impl FileKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(FileKind::Csv),
            "json" => Some(FileKind::Json),
            _ => None,
        }
    }
}

/// A loaded row plus the fields derived during normalisation.
#[derive(Debug, Clone)]
pub struct NormalizedRow {
    pub record: VideoRecord,
    /// `likes / followers` when the export carries a followers column.
    pub follower_rate: Option<f64>,
    /// `create_time` was missing and filled with the load time. A stored
    /// publication time always wins over such a placeholder.
    pub create_time_defaulted: bool,
}

impl NormalizedRow {
    pub fn new(record: VideoRecord) -> Self {
        Self {
            record,
            follower_rate: None,
            create_time_defaulted: false,
        }
    }
}

/// One file's worth of normalised records.
#[derive(Debug, Clone)]
pub struct Batch {
    pub source: PathBuf,
    pub kind: FileKind,
    pub rows: Vec<NormalizedRow>,
    /// Account profile carried by JSON exports.
    pub user: Option<MaliciousUser>,
}

impl Batch {
    pub fn records(&self) -> impl Iterator<Item = &VideoRecord> {
        self.rows.iter().map(|r| &r.record)
    }

    /// Ids of rows that carry one, in file order.
    pub fn video_ids(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|r| r.record.vd_id.clone())
            .collect()
    }
}

/// Tags are the tokens following `#`, up to the next whitespace or `#`.
pub fn extract_tags(title: &str) -> BTreeSet<String> {
    TAG_RE
        .captures_iter(title)
        .map(|c| c[1].to_string())
        .collect()
}

pub fn parse_timestamp(value: &str, format: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), format).ok()
}

/// Loads a file, dispatching on its extension.
pub fn load_file(path: &Path, timestamp_format: &str) -> Result<Batch, LoadError> {
    match FileKind::from_path(path) {
        Some(FileKind::Csv) => load_csv(path, timestamp_format),
        Some(FileKind::Json) => load_json(path, timestamp_format),
        None => Err(LoadError::Unsupported(path.to_path_buf())),
    }
}

// ============ CSV ============

const COLUMN_ALIASES: &[(&str, &[&str])] = &[
    ("vd_id", &["vd_id", "video_id"]),
    ("vd_title", &["vd_title", "title"]),
    ("author", &["author", "author_nickname", "nickname"]),
    ("likes", &["likes"]),
    ("shares", &["shares"]),
    ("collects", &["collects"]),
    ("followers", &["followers"]),
    ("create_time", &["create_time", "publish_time"]),
    ("img_url", &["img_url", "cover_img", "cover_url"]),
    ("evil", &["evil"]),
    ("reported", &["reported"]),
    ("removed", &["removed"]),
];

fn resolve_columns(headers: &csv::StringRecord) -> HashMap<&'static str, usize> {
    let normalized: Vec<String> = headers
        .iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_ascii_lowercase())
        .collect();

    let mut columns = HashMap::new();
    for (canonical, aliases) in COLUMN_ALIASES {
        // First alias wins so a canonical column beats its alias
        for alias in aliases.iter() {
            if let Some(idx) = normalized.iter().position(|h| h == alias) {
                columns.insert(*canonical, idx);
                break;
            }
        }
    }
    columns
}

pub fn load_csv(path: &Path, timestamp_format: &str) -> Result<Batch, LoadError> {
    let file = std::fs::File::open(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let headers = reader
        .headers()
        .map_err(|source| LoadError::Csv {
            path: path.to_path_buf(),
            source,
        })?
        .clone();
    let columns = resolve_columns(&headers);
    if !columns.contains_key("vd_id") {
        return Err(LoadError::MissingColumn {
            path: path.to_path_buf(),
            column: "vd_id",
        });
    }
    let has_followers = columns.contains_key("followers");

    let mut rows = Vec::new();
    for result in reader.byte_records() {
        let raw = result.map_err(|source| LoadError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let cell = |name: &str| -> Option<String> {
            let idx = *columns.get(name)?;
            let bytes = raw.get(idx)?;
            let text = String::from_utf8_lossy(bytes).trim().to_string();
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        };

        let mut record = VideoRecord {
            vd_id: cell("vd_id").map(normalize_id),
            title: cell("vd_title"),
            author: cell("author"),
            likes: cell("likes").as_deref().and_then(parse_count),
            shares: cell("shares").as_deref().and_then(parse_count),
            collects: cell("collects").as_deref().and_then(parse_count),
            create_time: cell("create_time")
                .as_deref()
                .and_then(|v| parse_timestamp(v, timestamp_format)),
            img_url: cell("img_url"),
            tags: BTreeSet::new(),
            evil: cell("evil").as_deref().and_then(parse_flag).unwrap_or(true),
            reported: cell("reported")
                .as_deref()
                .and_then(parse_flag)
                .unwrap_or(false),
            removed: cell("removed")
                .as_deref()
                .and_then(parse_flag)
                .unwrap_or(false),
        };
        record.tags = record
            .title
            .as_deref()
            .map(extract_tags)
            .unwrap_or_default();

        let follower_rate = if has_followers {
            let followers = cell("followers").as_deref().and_then(parse_count);
            match (record.likes, followers) {
                (Some(likes), Some(f)) if f > 0 => Some(likes as f64 / f as f64),
                _ => None,
            }
        } else {
            None
        };

        let mut row = NormalizedRow::new(record);
        row.follower_rate = follower_rate;
        rows.push(row);
    }

    debug!(path = %path.display(), rows = rows.len(), "loaded csv batch");
    Ok(Batch {
        source: path.to_path_buf(),
        kind: FileKind::Csv,
        rows,
        user: None,
    })
}

/// Pandas writes integer ids as `123.0` once a column contains blanks.
fn normalize_id(raw: String) -> String {
    match raw.strip_suffix(".0") {
        Some(stripped) if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) => {
            stripped.to_string()
        }
        _ => raw,
    }
}

fn parse_count(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(n) = value.parse::<i64>() {
        return Some(n);
    }
    match value.parse::<f64>() {
        Ok(f) if f.is_finite() => Some(f.trunc() as i64),
        _ => None,
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Some(true),
        "0" | "false" | "no" | "n" => Some(false),
        _ => None,
    }
}

// ============ JSON ============

pub fn load_json(path: &Path, timestamp_format: &str) -> Result<Batch, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&text).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let now = chrono::Local::now().naive_local();
    parse_json_export(path, &value, timestamp_format, now)
}

/// Normalises an already-parsed JSON export. `now` stands in for missing
/// creation times.
pub fn parse_json_export(
    path: &Path,
    value: &Value,
    timestamp_format: &str,
    now: NaiveDateTime,
) -> Result<Batch, LoadError> {
    let (videos, user_info) = match value {
        Value::Array(items) => (items.as_slice(), None),
        Value::Object(map) => {
            let videos = match map.get("videos") {
                Some(Value::Array(items)) => items.as_slice(),
                Some(Value::Null) | None => &[],
                Some(_) => {
                    return Err(LoadError::Layout {
                        path: path.to_path_buf(),
                        reason: "'videos' must be an array".to_string(),
                    })
                }
            };
            (videos, map.get("user_info"))
        }
        _ => {
            return Err(LoadError::Layout {
                path: path.to_path_buf(),
                reason: "expected an object or an array of videos".to_string(),
            })
        }
    };

    let user = user_info.and_then(parse_user_info);
    let rows = videos
        .iter()
        .map(|v| parse_json_video(v, timestamp_format, now))
        .collect();

    Ok(Batch {
        source: path.to_path_buf(),
        kind: FileKind::Json,
        rows,
        user,
    })
}

fn parse_json_video(value: &Value, timestamp_format: &str, now: NaiveDateTime) -> NormalizedRow {
    let get = |keys: &[&str]| keys.iter().find_map(|k| value.get(*k));

    let title = get(&["vd_title", "title"]).and_then(json_string);
    let (create_time, create_time_defaulted) = match get(&["create_time"]) {
        None | Some(Value::Null) => (Some(now), true),
        Some(v) => (
            json_string(v).and_then(|s| parse_timestamp(&s, timestamp_format)),
            false,
        ),
    };
    let tags = match get(&["video_label"]) {
        Some(Value::Array(labels)) => labels
            .iter()
            .filter_map(json_string)
            .map(|l| l.trim_start_matches('#').to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        Some(Value::String(s)) => extract_tags(s),
        _ => title.as_deref().map(extract_tags).unwrap_or_default(),
    };

    let record = VideoRecord {
        vd_id: get(&["vd_id", "video_id"]).and_then(json_string),
        title,
        author: get(&["author"]).and_then(json_string),
        likes: Some(get(&["likes"]).and_then(json_count).unwrap_or(0)),
        shares: Some(get(&["shares"]).and_then(json_count).unwrap_or(0)),
        collects: Some(get(&["collects"]).and_then(json_count).unwrap_or(0)),
        create_time,
        img_url: get(&["img_url", "cover_img"]).and_then(json_string),
        tags,
        evil: get(&["evil"]).and_then(json_flag).unwrap_or(true),
        reported: get(&["reported"]).and_then(json_flag).unwrap_or(false),
        removed: get(&["removed"]).and_then(json_flag).unwrap_or(false),
    };
    NormalizedRow {
        record,
        follower_rate: None,
        create_time_defaulted,
    }
}

fn parse_user_info(value: &Value) -> Option<MaliciousUser> {
    let obj = value.as_object()?;
    let user_id = obj.get("user_id").and_then(json_string)?;
    let text = |key: &str| obj.get(key).and_then(json_string);
    let count = |key: &str| obj.get(key).and_then(json_count).unwrap_or(0);

    Some(MaliciousUser {
        user_id,
        user_name: text("user_name"),
        age: text("age"),
        follow_count: count("follow_count"),
        fans_count: count("fans_count"),
        like_count: count("like_count"),
        douyin_id: text("douyin_id"),
        ip_location: text("ip_location"),
        self_description: text("self_description"),
    })
}

fn json_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_count(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => parse_count(s),
        _ => None,
    }
}

fn json_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => parse_flag(s),
        _ => None,
    }
}

// ============ Cover images ============

/// Ids end up in file names, so only plain tokens are allowed.
fn safe_file_stem(vd_id: &str) -> bool {
    !vd_id.is_empty()
        && vd_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Local path of a video's cover image.
pub fn cover_path(images_dir: &Path, vd_id: &str) -> Option<PathBuf> {
    safe_file_stem(vd_id).then(|| images_dir.join(format!("{}.jpg", vd_id)))
}

/// Fetches every row's cover image into `images_dir`.
///
/// Network failures are logged and never abort the batch. Returns the number
/// of images written.
pub async fn download_covers(
    batch: &Batch,
    client: &reqwest::Client,
    images_dir: &Path,
    concurrency: usize,
    timeout: Duration,
) -> usize {
    if let Err(e) = tokio::fs::create_dir_all(images_dir).await {
        warn!(dir = %images_dir.display(), error = %e, "cannot create images dir, skipping covers");
        return 0;
    }

    let mut jobs = Vec::new();
    for record in batch.records() {
        let Some(vd_id) = record.vd_id.as_deref() else {
            continue;
        };
        if let (Some(path), Some(url)) = (cover_path(images_dir, vd_id), record.img_url.clone()) {
            jobs.push((url, path));
        }
    }

    stream::iter(jobs)
        .map(|(url, path)| async move { download_image(client, &url, &path, timeout).await })
        .buffer_unordered(concurrency.max(1))
        .filter(|ok| futures::future::ready(*ok))
        .count()
        .await
}

async fn download_image(client: &reqwest::Client, url: &str, path: &Path, timeout: Duration) -> bool {
    let response = match client.get(url).timeout(timeout).send().await {
        Ok(r) => r,
        Err(e) => {
            debug!(url, error = %e, "cover download failed");
            return false;
        }
    };
    if response.status() != reqwest::StatusCode::OK {
        debug!(url, status = %response.status(), "cover download rejected");
        return false;
    }
    match response.bytes().await {
        Ok(bytes) => match tokio::fs::write(path, &bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to write cover image");
                false
            }
        },
        Err(e) => {
            debug!(url, error = %e, "cover body read failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const FMT: &str = "%Y-%m-%d %H:%M:%S";

    #[test]
    fn test_extract_tags_splits_on_hash_and_whitespace() {
        let tags = extract_tags("A#tag1 #tag2#tag3 B");
        let expected: BTreeSet<String> =
            ["tag1", "tag2", "tag3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(tags, expected);
    }

    #[test]
    fn test_extract_tags_without_hash_is_empty() {
        assert!(extract_tags("no tags at all").is_empty());
        assert!(extract_tags("").is_empty());
        assert!(extract_tags("trailing #").is_empty());
    }

    #[test]
    fn test_tags_are_case_sensitive() {
        let tags = extract_tags("#Tag #tag");
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn test_parse_timestamp_coerces_bad_values() {
        assert!(parse_timestamp("2025-04-04 08:37:00", FMT).is_some());
        assert!(parse_timestamp("04/04/2025", FMT).is_none());
        assert!(parse_timestamp("", FMT).is_none());
    }

    #[test]
    fn test_load_csv_with_aliases_and_degraded_rows() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("batch.csv");
        fs::write(
            &path,
            "video_id,title,author_nickname,likes,shares,collects,create_time,cover_img\n\
             101,Hello #a #b,alice,100,10,5,2025-04-04 08:37:00,http://img/101\n\
             102,Broken row,bob,lots,,3,not a date,\n\
             ,No id,carol,1,1,1,2025-04-05 09:00:00,\n",
        )
        .unwrap();

        let batch = load_csv(&path, FMT).unwrap();
        assert_eq!(batch.kind, FileKind::Csv);
        assert_eq!(batch.rows.len(), 3);

        let first = &batch.rows[0].record;
        assert_eq!(first.vd_id.as_deref(), Some("101"));
        assert_eq!(first.author.as_deref(), Some("alice"));
        assert_eq!(first.likes, Some(100));
        assert_eq!(first.tags.len(), 2);
        assert_eq!(first.hour_of_day(), Some(8));
        assert_eq!(first.img_url.as_deref(), Some("http://img/101"));
        assert!(first.evil);
        assert!(!first.reported);

        let broken = &batch.rows[1].record;
        assert_eq!(broken.likes, None);
        assert_eq!(broken.shares, None);
        assert_eq!(broken.collects, Some(3));
        assert_eq!(broken.create_time, None);
        assert_eq!(broken.hour_of_day(), None);
        assert_eq!(broken.img_url, None);

        assert_eq!(batch.rows[2].record.vd_id, None);
        assert_eq!(batch.video_ids(), vec!["101", "102"]);
    }

    #[test]
    fn test_follower_rate_only_with_followers_column() {
        let tmp = TempDir::new().unwrap();
        let with = tmp.path().join("with.csv");
        fs::write(&with, "vd_id,likes,followers\n1,50,200\n2,10,0\n").unwrap();
        let batch = load_csv(&with, FMT).unwrap();
        assert_eq!(batch.rows[0].follower_rate, Some(0.25));
        assert_eq!(batch.rows[1].follower_rate, None);

        let without = tmp.path().join("without.csv");
        fs::write(&without, "vd_id,likes\n1,50\n").unwrap();
        let batch = load_csv(&without, FMT).unwrap();
        assert_eq!(batch.rows[0].follower_rate, None);
    }

    #[test]
    fn test_csv_without_id_column_fails_batch() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.csv");
        fs::write(&path, "title,likes\nx,1\n").unwrap();
        let err = load_csv(&path, FMT).unwrap_err();
        assert!(matches!(err, LoadError::MissingColumn { column: "vd_id", .. }));
    }

    #[test]
    fn test_float_ids_and_counts_are_normalised() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("floats.csv");
        fs::write(&path, "vd_id,likes\n7460657806849445120.0,12.0\n").unwrap();
        let batch = load_csv(&path, FMT).unwrap();
        assert_eq!(
            batch.rows[0].record.vd_id.as_deref(),
            Some("7460657806849445120")
        );
        assert_eq!(batch.rows[0].record.likes, Some(12));
    }

    #[test]
    fn test_json_export_with_user_info() {
        let value = serde_json::json!({
            "user_info": {
                "user_id": 6006,
                "user_name": "xiaoming",
                "fans_count": 3000,
                "ip_location": "北京"
            },
            "videos": [
                {
                    "video_id": "201",
                    "title": "round video",
                    "author": "xiaoming",
                    "likes": 7,
                    "create_time": "2025-04-04 08:37:00",
                    "cover_img": "http://img/201",
                    "video_label": ["#x", "y"]
                },
                { "vd_id": "202", "create_time": "garbage" },
                { "vd_id": "203" }
            ]
        });
        let now = parse_timestamp("2025-05-01 12:00:00", FMT).unwrap();
        let batch = parse_json_export(Path::new("r.json"), &value, FMT, now).unwrap();

        let user = batch.user.as_ref().unwrap();
        assert_eq!(user.user_id, "6006");
        assert_eq!(user.fans_count, 3000);
        assert_eq!(user.follow_count, 0);

        let first = &batch.rows[0].record;
        assert_eq!(first.vd_id.as_deref(), Some("201"));
        assert_eq!(first.img_url.as_deref(), Some("http://img/201"));
        assert_eq!(first.shares, Some(0));
        assert!(first.tags.contains("x") && first.tags.contains("y"));

        assert_eq!(batch.rows[1].record.create_time, None);
        assert!(!batch.rows[1].create_time_defaulted);
        assert_eq!(batch.rows[2].record.create_time, Some(now));
        assert!(batch.rows[2].create_time_defaulted);
        assert!(!batch.rows[0].create_time_defaulted);
    }

    #[test]
    fn test_json_bare_array_and_bad_layout() {
        let now = parse_timestamp("2025-05-01 12:00:00", FMT).unwrap();
        let arr = serde_json::json!([{ "vd_id": "1", "title": "#t" }]);
        let batch = parse_json_export(Path::new("a.json"), &arr, FMT, now).unwrap();
        assert_eq!(batch.rows.len(), 1);
        assert!(batch.rows[0].record.tags.contains("t"));

        let bad = serde_json::json!("nope");
        assert!(parse_json_export(Path::new("b.json"), &bad, FMT, now).is_err());
    }

    #[test]
    fn test_load_file_rejects_unknown_extension() {
        let err = load_file(Path::new("x.xlsx"), FMT).unwrap_err();
        assert!(matches!(err, LoadError::Unsupported(_)));
    }

    #[test]
    fn test_cover_path_rejects_path_like_ids() {
        let dir = Path::new("/tmp/images");
        assert!(cover_path(dir, "123").is_some());
        assert!(cover_path(dir, "../etc/passwd").is_none());
    }

    #[tokio::test]
    async fn test_download_failure_does_not_abort_batch() {
        let tmp = TempDir::new().unwrap();
        let mut record = VideoRecord::new("1");
        // Port 9 (discard) is closed on loopback
        record.img_url = Some("http://127.0.0.1:9/cover.jpg".to_string());
        let batch = Batch {
            source: PathBuf::from("x.csv"),
            kind: FileKind::Csv,
            rows: vec![NormalizedRow::new(record), NormalizedRow::new(VideoRecord::new("2"))],
            user: None,
        };
        let client = reqwest::Client::new();
        let written = download_covers(
            &batch,
            &client,
            tmp.path(),
            2,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(written, 0);
        assert!(!tmp.path().join("1.jpg").exists());
    }
}
