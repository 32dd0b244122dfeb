//! Read-only queries behind the dashboard endpoints.
//!
//! | Query | Source table(s) |
//! |-------|-----------------|
//! | [`geography_distribution`] | `malicious_users.ip_location` |
//! | [`recent_trend`] / [`hourly_trend`] | `daily_distribution` / `hourly_distribution` |
//! | [`keywords`] / [`keyword_videos`] | `tag_frequencies` / `tag_video_mapping` |
//! | [`list_gangs`] / [`gang_detail`] | `gangs`, `cross_platform_accounts` |
//! | [`search_videos`] / [`carousel`] | `videos` |
//! | [`top_videos`] | `top_videos`, `videos` |
//! | [`user_profile`] | `malicious_users`, `videos` |

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::models::MaliciousUser;

/// Short province names mapped to their official form.
const PROVINCE_ALIASES: &[(&str, &str)] = &[
    ("北京", "北京市"),
    ("天津", "天津市"),
    ("上海", "上海市"),
    ("重庆", "重庆市"),
    ("河北", "河北省"),
    ("山西", "山西省"),
    ("辽宁", "辽宁省"),
    ("吉林", "吉林省"),
    ("黑龙江", "黑龙江省"),
    ("江苏", "江苏省"),
    ("浙江", "浙江省"),
    ("安徽", "安徽省"),
    ("福建", "福建省"),
    ("江西", "江西省"),
    ("山东", "山东省"),
    ("河南", "河南省"),
    ("湖北", "湖北省"),
    ("湖南", "湖南省"),
    ("广东", "广东省"),
    ("海南", "海南省"),
    ("四川", "四川省"),
    ("贵州", "贵州省"),
    ("云南", "云南省"),
    ("陕西", "陕西省"),
    ("甘肃", "甘肃省"),
    ("青海", "青海省"),
    ("台湾", "台湾省"),
    ("内蒙古", "内蒙古自治区"),
    ("广西", "广西壮族自治区"),
    ("西藏", "西藏自治区"),
    ("宁夏", "宁夏回族自治区"),
    ("新疆", "新疆维吾尔自治区"),
    ("香港", "香港特别行政区"),
    ("澳门", "澳门特别行政区"),
];

/// Full province name for a raw `ip_location`, or `None` for blank and
/// placeholder values. Unknown names are kept as given.
pub fn normalize_province(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "无" {
        return None;
    }
    let full = PROVINCE_ALIASES
        .iter()
        .find(|(short, full)| trimmed == *short || trimmed == *full)
        .map(|(_, full)| full.to_string())
        .unwrap_or_else(|| trimmed.to_string());
    Some(full)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProvinceShare {
    pub province: String,
    pub percentage: f64,
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

pub async fn geography_distribution(pool: &SqlitePool) -> Result<Vec<ProvinceShare>> {
    let locations: Vec<Option<String>> =
        sqlx::query_scalar("SELECT ip_location FROM malicious_users")
            .fetch_all(pool)
            .await?;

    let mut counts: HashMap<String, u64> = HashMap::new();
    for location in locations.into_iter().flatten() {
        if let Some(province) = normalize_province(&location) {
            *counts.entry(province).or_default() += 1;
        }
    }

    let total: u64 = counts.values().sum();
    if total == 0 {
        return Ok(Vec::new());
    }

    let mut shares: Vec<ProvinceShare> = counts
        .into_iter()
        .map(|(province, count)| ProvinceShare {
            province,
            percentage: round_to(count as f64 / total as f64, 5),
        })
        .collect();
    shares.sort_by(|a, b| {
        b.percentage
            .total_cmp(&a.percentage)
            .then_with(|| a.province.cmp(&b.province))
    });
    Ok(shares)
}

/// Geography results reused until the TTL lapses.
pub struct GeographyCache {
    ttl: Duration,
    entry: Mutex<Option<(Instant, Vec<ProvinceShare>)>>,
}

impl GeographyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    pub async fn get(&self, pool: &SqlitePool) -> Result<Vec<ProvinceShare>> {
        let mut entry = self.entry.lock().await;
        if let Some((at, shares)) = entry.as_ref() {
            if at.elapsed() < self.ttl {
                return Ok(shares.clone());
            }
        }
        let shares = geography_distribution(pool).await?;
        *entry = Some((Instant::now(), shares.clone()));
        Ok(shares)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyCount {
    pub date: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HourlyCount {
    pub hour: i64,
    pub count: i64,
}

/// Widest window `recent_trend` accepts.
pub const MAX_TREND_DAYS: i64 = 3650;

/// Daily publication counts for the last `days` days, oldest first.
/// `days` is clamped to `0..=MAX_TREND_DAYS`.
pub async fn recent_trend(pool: &SqlitePool, days: i64) -> Result<Vec<DailyCount>> {
    let days = days.clamp(0, MAX_TREND_DAYS) as u64;
    let since = chrono::Local::now()
        .date_naive()
        .checked_sub_days(chrono::Days::new(days))
        .unwrap_or(chrono::NaiveDate::MIN);
    let rows = sqlx::query(
        "SELECT date, count FROM daily_distribution WHERE date >= ? ORDER BY date ASC",
    )
    .bind(since.format("%Y-%m-%d").to_string())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| DailyCount {
            date: row.get("date"),
            count: row.get("count"),
        })
        .collect())
}

pub async fn hourly_trend(pool: &SqlitePool) -> Result<Vec<HourlyCount>> {
    let rows = sqlx::query("SELECT hour, count FROM hourly_distribution ORDER BY hour ASC")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|row| HourlyCount {
            hour: row.get("hour"),
            count: row.get("count"),
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct KeywordShare {
    pub keyword: String,
    /// Share of all tag occurrences, formatted like `"12.5%"`.
    pub percentage: String,
}

pub async fn keywords(pool: &SqlitePool) -> Result<Vec<KeywordShare>> {
    let rows = sqlx::query(
        "SELECT tag, frequency FROM tag_frequencies ORDER BY frequency DESC, tag ASC",
    )
    .fetch_all(pool)
    .await?;

    let total: i64 = rows.iter().map(|row| row.get::<i64, _>("frequency")).sum();
    Ok(rows
        .into_iter()
        .map(|row| {
            let frequency: i64 = row.get("frequency");
            let share = if total > 0 {
                round_to(frequency as f64 / total as f64 * 100.0, 2)
            } else {
                0.0
            };
            KeywordShare {
                keyword: row.get("tag"),
                percentage: format!("{}%", share),
            }
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct KeywordVideos {
    pub keyword: String,
    pub video_ids: Vec<String>,
    pub count: usize,
}

pub async fn keyword_videos(pool: &SqlitePool, keyword: &str) -> Result<KeywordVideos> {
    let video_ids: Vec<String> =
        sqlx::query_scalar("SELECT vd_id FROM tag_video_mapping WHERE tag = ? ORDER BY vd_id")
            .bind(keyword)
            .fetch_all(pool)
            .await?;
    Ok(KeywordVideos {
        keyword: keyword.to_string(),
        count: video_ids.len(),
        video_ids,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct GangSummary {
    pub gang_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrossPlatformAccount {
    pub platform: String,
    pub username: String,
    pub url: Option<String>,
    pub followers: Option<i64>,
    pub likes: Option<i64>,
    pub comments: Option<i64>,
    pub shares: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GangDetail {
    pub gang_id: String,
    pub name: String,
    pub distribution: Option<String>,
    pub activity_time: Option<String>,
    pub cross_platform_accounts: Vec<CrossPlatformAccount>,
}

pub async fn list_gangs(pool: &SqlitePool) -> Result<Vec<GangSummary>> {
    let rows = sqlx::query("SELECT gang_id, name FROM gangs ORDER BY gang_id")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| GangSummary {
            gang_id: row.get("gang_id"),
            name: row.get("name"),
        })
        .collect())
}

/// `None` when the gang does not exist.
pub async fn gang_detail(pool: &SqlitePool, gang_id: &str) -> Result<Option<GangDetail>> {
    let Some(gang) = sqlx::query(
        "SELECT gang_id, name, distribution, activity_time FROM gangs WHERE gang_id = ?",
    )
    .bind(gang_id)
    .fetch_optional(pool)
    .await?
    else {
        return Ok(None);
    };

    let accounts = sqlx::query(
        r#"
        SELECT platform, username, url, followers, likes, comments, shares
        FROM cross_platform_accounts
        WHERE gang_id = ?
        ORDER BY id
        "#,
    )
    .bind(gang_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|row| CrossPlatformAccount {
        platform: row.get("platform"),
        username: row.get("username"),
        url: row.get("url"),
        followers: row.get("followers"),
        likes: row.get("likes"),
        comments: row.get("comments"),
        shares: row.get("shares"),
    })
    .collect();

    Ok(Some(GangDetail {
        gang_id: gang.get("gang_id"),
        name: gang.get("name"),
        distribution: gang.get("distribution"),
        activity_time: gang.get("activity_time"),
        cross_platform_accounts: accounts,
    }))
}

/// Query string of `GET /api/video`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoQuery {
    pub current: Option<i64>,
    pub page_size: Option<i64>,
    /// Substring of the video id.
    pub number: Option<String>,
    /// Substring of the title.
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoItem {
    pub id: i64,
    pub number: i64,
    pub name: Option<String>,
    pub author: Option<String>,
    pub engagement: f64,
    pub count: i64,
    /// `true` once the video has been taken down.
    pub status: bool,
    pub created_time: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoPage {
    pub list: Vec<VideoItem>,
    pub total: i64,
}

const MAX_PAGE_SIZE: i64 = 100;

impl VideoQuery {
    /// `(page_size, offset)`, or `None` when the page lies beyond any
    /// addressable row.
    pub fn page_bounds(&self, default_page_size: i64) -> Option<(i64, i64)> {
        let current = self.current.unwrap_or(1).max(1);
        let page_size = self
            .page_size
            .unwrap_or(default_page_size)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = (current - 1).checked_mul(page_size)?;
        Some((page_size, offset))
    }
}

/// `%text%` with LIKE wildcards in `text` matched literally (`ESCAPE '\'`).
fn contains_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn push_filters<'a>(builder: &mut QueryBuilder<'a, Sqlite>, query: &'a VideoQuery) {
    builder.push(" WHERE 1 = 1");
    if let Some(number) = query.number.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        builder
            .push(" AND vd_id LIKE ")
            .push_bind(contains_pattern(number))
            .push(" ESCAPE '\\'");
    }
    if let Some(name) = query.name.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        builder
            .push(" AND vd_title LIKE ")
            .push_bind(contains_pattern(name))
            .push(" ESCAPE '\\'");
    }
}

/// Pages past the last addressable row come back empty.
pub async fn search_videos(
    pool: &SqlitePool,
    query: &VideoQuery,
    default_page_size: i64,
) -> Result<VideoPage> {

    let mut count_query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM videos");
    push_filters(&mut count_query, query);
    let total: i64 = count_query.build_query_scalar().fetch_one(pool).await?;

    let Some((page_size, offset)) = query.page_bounds(default_page_size) else {
        return Ok(VideoPage {
            list: Vec::new(),
            total,
        });
    };

    let mut list_query = QueryBuilder::<Sqlite>::new(
        "SELECT rowid AS id, vd_id, vd_title, author, engagement_rate, likes, removed, create_time FROM videos",
    );
    push_filters(&mut list_query, query);
    list_query
        .push(" ORDER BY create_time DESC, vd_id ASC LIMIT ")
        .push_bind(page_size)
        .push(" OFFSET ")
        .push_bind(offset);

    let list = list_query
        .build()
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|row| {
            let vd_id: String = row.get("vd_id");
            VideoItem {
                id: row.get("id"),
                number: vd_id.parse().unwrap_or(0),
                name: row.get("vd_title"),
                author: row.get("author"),
                engagement: row.get("engagement_rate"),
                count: row.get::<Option<i64>, _>("likes").unwrap_or(0),
                status: row.get("removed"),
                created_time: row.get("create_time"),
            }
        })
        .collect();

    Ok(VideoPage { list, total })
}

#[derive(Debug, Clone, Serialize)]
pub struct TopVideo {
    pub rank: i64,
    pub vd_id: String,
    pub vd_title: Option<String>,
    pub author: Option<String>,
    pub likes: i64,
    pub shares: i64,
    pub collects: i64,
    pub engagement_rate: f64,
    pub follower_rate: Option<f64>,
    pub removed: bool,
}

/// Most liked videos, as ranked by the last analysis pass.
pub async fn top_videos(pool: &SqlitePool, limit: i64) -> Result<Vec<TopVideo>> {
    let rows = sqlx::query(
        r#"
        SELECT t.position, v.vd_id, v.vd_title, v.author, v.likes, v.shares, v.collects,
               v.engagement_rate, v.follower_rate, v.removed
        FROM top_videos t
        JOIN videos v ON v.vd_id = t.vd_id
        ORDER BY t.position
        LIMIT ?
        "#,
    )
    .bind(limit.clamp(1, MAX_PAGE_SIZE))
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| TopVideo {
            rank: row.get("position"),
            vd_id: row.get("vd_id"),
            vd_title: row.get("vd_title"),
            author: row.get("author"),
            likes: row.get::<Option<i64>, _>("likes").unwrap_or(0),
            shares: row.get::<Option<i64>, _>("shares").unwrap_or(0),
            collects: row.get::<Option<i64>, _>("collects").unwrap_or(0),
            engagement_rate: row.get("engagement_rate"),
            follower_rate: row.get("follower_rate"),
            removed: row.get("removed"),
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct CarouselItem {
    pub name: Option<String>,
    pub vd_id: String,
    pub cover_url: String,
}

/// Newest videos that carry a cover URL.
pub async fn carousel(pool: &SqlitePool, limit: i64, offset: i64) -> Result<Vec<CarouselItem>> {
    let rows = sqlx::query(
        r#"
        SELECT vd_id, vd_title, img_url
        FROM videos
        WHERE img_url IS NOT NULL
        ORDER BY create_time DESC, vd_id ASC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(limit.clamp(1, MAX_PAGE_SIZE))
    .bind(offset.max(0))
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| CarouselItem {
            name: row.get("vd_title"),
            vd_id: row.get("vd_id"),
            cover_url: row.get("img_url"),
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileVideo {
    pub vd_id: String,
    pub name: Option<String>,
    pub publish_time: Option<String>,
    pub likes: i64,
    pub shares: i64,
    pub collects: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    #[serde(flatten)]
    pub user: MaliciousUser,
    pub video_list: Vec<ProfileVideo>,
    pub total: usize,
}

/// Stored account profile plus the videos published under its name.
/// `None` when the account is unknown.
pub async fn user_profile(pool: &SqlitePool, user_id: &str) -> Result<Option<UserProfile>> {
    let Some(row) = sqlx::query(
        r#"
        SELECT user_id, user_name, age, follow_count, fans_count, like_count, douyin_id,
               ip_location, self_description
        FROM malicious_users
        WHERE user_id = ?
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    else {
        return Ok(None);
    };

    let user = MaliciousUser {
        user_id: row.get("user_id"),
        user_name: row.get("user_name"),
        age: row.get("age"),
        follow_count: row.get("follow_count"),
        fans_count: row.get("fans_count"),
        like_count: row.get("like_count"),
        douyin_id: row.get("douyin_id"),
        ip_location: row.get("ip_location"),
        self_description: row.get("self_description"),
    };

    let video_list: Vec<ProfileVideo> = match user.user_name.as_deref() {
        Some(name) => sqlx::query(
            r#"
            SELECT vd_id, vd_title, create_time, likes, shares, collects
            FROM videos
            WHERE author = ?
            ORDER BY create_time DESC, vd_id ASC
            "#,
        )
        .bind(name)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|row| ProfileVideo {
            vd_id: row.get("vd_id"),
            name: row.get("vd_title"),
            publish_time: row.get("create_time"),
            likes: row.get::<Option<i64>, _>("likes").unwrap_or(0),
            shares: row.get::<Option<i64>, _>("shares").unwrap_or(0),
            collects: row.get::<Option<i64>, _>("collects").unwrap_or(0),
        })
        .collect(),
        None => Vec::new(),
    };

    Ok(Some(UserProfile {
        total: video_list.len(),
        user,
        video_list,
    }))
}
