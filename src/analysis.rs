//! Aggregation over a set of normalised video records.
//!
//! [`analyze`] is pure: it never touches storage. The persister runs it over
//! the whole `videos` table after each batch and replaces the derived tables
//! with the result.

use chrono::NaiveDate;
use std::collections::BTreeMap;

use crate::models::{AccountStat, Correlation, SimilarUserEdge, VideoRecord};
use crate::similarity;

/// Everything derived from one set of records.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    pub accounts: Vec<AccountStat>,
    /// Video ids ordered by likes, most liked first.
    pub ranked: Vec<String>,
    pub hourly: BTreeMap<u32, i64>,
    pub daily: BTreeMap<NaiveDate, i64>,
    pub correlations: Vec<Correlation>,
    pub tag_frequencies: BTreeMap<String, i64>,
    pub similar_users: Vec<SimilarUserEdge>,
}

pub fn analyze(records: &[VideoRecord], min_videos: usize, top_n: usize) -> Analysis {
    Analysis {
        accounts: account_rollups(records),
        ranked: rank_by_likes(records),
        hourly: hourly_histogram(records),
        daily: daily_histogram(records),
        correlations: interaction_correlations(records),
        tag_frequencies: tag_frequencies(records),
        similar_users: similarity::similar_users(records, min_videos, top_n),
    }
}

pub fn account_rollups(records: &[VideoRecord]) -> Vec<AccountStat> {
    let mut by_author: BTreeMap<&str, AccountStat> = BTreeMap::new();
    for record in records {
        let Some(author) = record.author.as_deref() else {
            continue;
        };
        let stat = by_author.entry(author).or_insert_with(|| AccountStat {
            author: author.to_string(),
            video_count: 0,
            total_likes: 0,
            total_shares: 0,
            total_collects: 0,
            engagement_rate: 0.0,
        });
        stat.video_count += 1;
        // Counters saturate at i64::MAX for absurd exports
        stat.total_likes = stat.total_likes.saturating_add(record.likes_or_zero());
        stat.total_shares = stat.total_shares.saturating_add(record.shares_or_zero());
        stat.total_collects = stat.total_collects.saturating_add(record.collects_or_zero());
        stat.engagement_rate += record.engagement_rate();
    }
    by_author.into_values().collect()
}

pub fn rank_by_likes(records: &[VideoRecord]) -> Vec<String> {
    let mut ranked: Vec<(&str, i64)> = records
        .iter()
        .filter_map(|r| r.vd_id.as_deref().map(|id| (id, r.likes_or_zero())))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked.into_iter().map(|(id, _)| id.to_string()).collect()
}

pub fn hourly_histogram(records: &[VideoRecord]) -> BTreeMap<u32, i64> {
    let mut hist = BTreeMap::new();
    for hour in records.iter().filter_map(VideoRecord::hour_of_day) {
        *hist.entry(hour).or_insert(0) += 1;
    }
    hist
}

pub fn daily_histogram(records: &[VideoRecord]) -> BTreeMap<NaiveDate, i64> {
    let mut hist = BTreeMap::new();
    for date in records.iter().filter_map(VideoRecord::date) {
        *hist.entry(date).or_insert(0) += 1;
    }
    hist
}

pub fn tag_frequencies(records: &[VideoRecord]) -> BTreeMap<String, i64> {
    let mut freq = BTreeMap::new();
    for tag in records.iter().flat_map(|r| r.tags.iter()) {
        *freq.entry(tag.clone()).or_insert(0) += 1;
    }
    freq
}

pub fn interaction_correlations(records: &[VideoRecord]) -> Vec<Correlation> {
    let likes: Vec<f64> = records.iter().map(|r| r.likes_or_zero() as f64).collect();
    let shares: Vec<f64> = records.iter().map(|r| r.shares_or_zero() as f64).collect();
    let collects: Vec<f64> = records
        .iter()
        .map(|r| r.collects_or_zero() as f64)
        .collect();

    [
        ("likes", &likes, "shares", &shares),
        ("likes", &likes, "collects", &collects),
        ("shares", &shares, "collects", &collects),
    ]
    .into_iter()
    .map(|(m1, a, m2, b)| Correlation {
        metric1: m1.to_string(),
        metric2: m2.to_string(),
        correlation: pearson(a, b),
    })
    .collect()
}

/// `None` for fewer than two points or a constant series.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;

    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    Some((cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::parse_timestamp;

    fn video(id: &str, author: &str, likes: i64, shares: i64, collects: i64) -> VideoRecord {
        let mut v = VideoRecord::new(id);
        v.author = Some(author.to_string());
        v.likes = Some(likes);
        v.shares = Some(shares);
        v.collects = Some(collects);
        v
    }

    #[test]
    fn test_engagement_rate_formula() {
        let v = video("1", "a", 100, 10, 5);
        assert!((v.engagement_rate() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_account_rollups_sum_per_author() {
        let mut missing = VideoRecord::new("4");
        missing.author = Some("alice".to_string());
        let records = vec![
            video("1", "alice", 100, 10, 5),
            video("2", "alice", 50, 0, 0),
            video("3", "bob", 1, 1, 1),
            missing,
            VideoRecord::new("5"),
        ];
        let accounts = account_rollups(&records);
        assert_eq!(accounts.len(), 2);

        let alice = &accounts[0];
        assert_eq!(alice.author, "alice");
        assert_eq!(alice.video_count, 3);
        assert_eq!(alice.total_likes, 150);
        assert_eq!(alice.total_shares, 10);
        assert!((alice.engagement_rate - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_account_rollups_saturate() {
        let records = vec![
            video("1", "alice", i64::MAX, 1, 0),
            video("2", "alice", i64::MAX, 1, 0),
        ];
        let accounts = account_rollups(&records);
        assert_eq!(accounts[0].total_likes, i64::MAX);
        assert_eq!(accounts[0].total_shares, 2);
    }

    #[test]
    fn test_rank_by_likes_breaks_ties_by_id() {
        let records = vec![
            video("b", "x", 5, 0, 0),
            video("a", "x", 5, 0, 0),
            video("c", "x", 9, 0, 0),
        ];
        assert_eq!(rank_by_likes(&records), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_histograms_skip_undated_rows() {
        let fmt = "%Y-%m-%d %H:%M:%S";
        let mut a = VideoRecord::new("1");
        a.create_time = parse_timestamp("2025-04-04 08:37:00", fmt);
        let mut b = VideoRecord::new("2");
        b.create_time = parse_timestamp("2025-04-04 08:05:00", fmt);
        let mut c = VideoRecord::new("3");
        c.create_time = parse_timestamp("2025-04-05 23:00:00", fmt);
        let undated = VideoRecord::new("4");

        let records = vec![a, b, c, undated];
        let hourly = hourly_histogram(&records);
        assert_eq!(hourly.get(&8), Some(&2));
        assert_eq!(hourly.get(&23), Some(&1));
        assert_eq!(hourly.values().sum::<i64>(), 3);

        let daily = daily_histogram(&records);
        assert_eq!(daily.len(), 2);
        assert_eq!(daily.values().sum::<i64>(), 3);
    }

    #[test]
    fn test_pearson_edge_cases() {
        assert_eq!(pearson(&[1.0], &[2.0]), None);
        assert_eq!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]), None);
        let r = pearson(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]).unwrap();
        assert!((r - 1.0).abs() < 1e-9);
        let r = pearson(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]).unwrap();
        assert!((r + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_correlations_cover_three_pairs() {
        let records = vec![
            video("1", "a", 10, 1, 2),
            video("2", "a", 20, 2, 2),
            video("3", "a", 30, 3, 2),
        ];
        let corr = interaction_correlations(&records);
        assert_eq!(corr.len(), 3);
        assert_eq!(corr[0].metric1, "likes");
        assert_eq!(corr[0].metric2, "shares");
        assert!((corr[0].correlation.unwrap() - 1.0).abs() < 1e-9);
        // Constant collects
        assert_eq!(corr[1].correlation, None);
        assert_eq!(corr[2].correlation, None);
    }

    #[test]
    fn test_tag_frequencies_count_occurrences() {
        let mut a = VideoRecord::new("1");
        a.tags = ["x", "y"].iter().map(|s| s.to_string()).collect();
        let mut b = VideoRecord::new("2");
        b.tags = ["x"].iter().map(|s| s.to_string()).collect();
        let freq = tag_frequencies(&[a, b]);
        assert_eq!(freq.get("x"), Some(&2));
        assert_eq!(freq.get("y"), Some(&1));
    }

    #[test]
    fn test_empty_input_produces_empty_analysis() {
        let analysis = analyze(&[], 3, 5);
        assert!(analysis.accounts.is_empty());
        assert!(analysis.hourly.is_empty());
        assert!(analysis.similar_users.is_empty());
        assert!(analysis.correlations.iter().all(|c| c.correlation.is_none()));
    }
}
