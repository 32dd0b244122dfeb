//! Core data models used throughout EvilLens.
//!
//! These types represent the videos, accounts and derived statistics that
//! flow through the ingestion and analysis pipeline.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single video as produced by the loader or read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoRecord {
    /// Platform video id. Rows without one can be analysed but not stored.
    pub vd_id: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub likes: Option<i64>,
    pub shares: Option<i64>,
    pub collects: Option<i64>,
    pub create_time: Option<NaiveDateTime>,
    pub img_url: Option<String>,
    pub tags: BTreeSet<String>,
    pub evil: bool,
    pub reported: bool,
    pub removed: bool,
}

impl VideoRecord {
    pub fn new(vd_id: impl Into<String>) -> Self {
        Self {
            vd_id: Some(vd_id.into()),
            title: None,
            author: None,
            likes: None,
            shares: None,
            collects: None,
            create_time: None,
            img_url: None,
            tags: BTreeSet::new(),
            evil: true,
            reported: false,
            removed: false,
        }
    }

    pub fn likes_or_zero(&self) -> i64 {
        self.likes.unwrap_or(0)
    }

    pub fn shares_or_zero(&self) -> i64 {
        self.shares.unwrap_or(0)
    }

    pub fn collects_or_zero(&self) -> i64 {
        self.collects.unwrap_or(0)
    }

    /// Weighted engagement score stored with every video.
    pub fn engagement_rate(&self) -> f64 {
        engagement_score(
            self.likes_or_zero(),
            self.shares_or_zero(),
            self.collects_or_zero(),
        )
    }

    pub fn hour_of_day(&self) -> Option<u32> {
        self.create_time.map(|t| t.hour())
    }

    pub fn day_of_week(&self) -> Option<Weekday> {
        self.create_time.map(|t| t.weekday())
    }

    pub fn date(&self) -> Option<NaiveDate> {
        self.create_time.map(|t| t.date())
    }
}

/// `(likes + 10·shares + 10·collects) / 100`
pub fn engagement_score(likes: i64, shares: i64, collects: i64) -> f64 {
    (likes as f64 + shares as f64 * 10.0 + collects as f64 * 10.0) / 100.0
}

/// Profile of a flagged account, as exported by the scraper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaliciousUser {
    pub user_id: String,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub age: Option<String>,
    #[serde(default)]
    pub follow_count: i64,
    #[serde(default)]
    pub fans_count: i64,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub douyin_id: Option<String>,
    #[serde(default)]
    pub ip_location: Option<String>,
    #[serde(default)]
    pub self_description: Option<String>,
}

/// Per-author rollup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountStat {
    pub author: String,
    pub video_count: i64,
    pub total_likes: i64,
    pub total_shares: i64,
    pub total_collects: i64,
    pub engagement_rate: f64,
}

/// Pearson correlation between two engagement counters. `None` when undefined.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Correlation {
    pub metric1: String,
    pub metric2: String,
    pub correlation: Option<f64>,
}

/// Directed similarity edge between two authors, score in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarUserEdge {
    pub original_account: String,
    pub similar_account: String,
    pub similarity_score: f64,
}
