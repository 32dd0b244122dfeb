//! Author similarity from posting habits and name spelling.
//!
//! Each eligible author gets two vectors:
//!
//! - a 24-bin posting-hour distribution, normalised to sum 1;
//! - a TF-IDF vector over lower-cased character 2- and 3-grams of the name,
//!   L2-normalised.
//!
//! The score for a pair is the plain average of the two cosine similarities,
//! so it always lies in `[0, 1]`.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::models::{SimilarUserEdge, VideoRecord};

type SparseVec = HashMap<String, f64>;

struct AuthorProfile {
    name: String,
    hours: [f64; 24],
    name_vec: SparseVec,
}

/// Builds the similar-user edges for every author with at least
/// `min_videos` videos. Each author keeps its `top_n` best matches.
pub fn similar_users(
    records: &[VideoRecord],
    min_videos: usize,
    top_n: usize,
) -> Vec<SimilarUserEdge> {
    let profiles = build_profiles(records, min_videos);
    let mut edges = Vec::new();

    for (i, me) in profiles.iter().enumerate() {
        let mut scored: Vec<(&str, f64)> = profiles
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, other)| (other.name.as_str(), pair_score(me, other)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        for (other, score) in scored.into_iter().take(top_n) {
            edges.push(SimilarUserEdge {
                original_account: me.name.clone(),
                similar_account: other.to_string(),
                similarity_score: score,
            });
        }
    }

    edges
}

fn build_profiles(records: &[VideoRecord], min_videos: usize) -> Vec<AuthorProfile> {
    // BTreeMap keeps author order stable between runs
    let mut by_author: BTreeMap<&str, (usize, [f64; 24])> = BTreeMap::new();
    for record in records {
        let Some(author) = record.author.as_deref() else {
            continue;
        };
        let entry = by_author.entry(author).or_insert((0, [0.0; 24]));
        entry.0 += 1;
        if let Some(hour) = record.hour_of_day() {
            entry.1[hour as usize] += 1.0;
        }
    }

    let eligible: Vec<(&str, [f64; 24])> = by_author
        .into_iter()
        .filter(|(_, (count, hours))| *count >= min_videos && hours.iter().sum::<f64>() > 0.0)
        .map(|(name, (_, mut hours))| {
            let total: f64 = hours.iter().sum();
            hours.iter_mut().for_each(|h| *h /= total);
            (name, hours)
        })
        .collect();

    let names: Vec<&str> = eligible.iter().map(|(n, _)| *n).collect();
    let name_vecs = tfidf_vectors(&names);

    eligible
        .into_iter()
        .zip(name_vecs)
        .map(|((name, hours), name_vec)| AuthorProfile {
            name: name.to_string(),
            hours,
            name_vec,
        })
        .collect()
}

fn pair_score(a: &AuthorProfile, b: &AuthorProfile) -> f64 {
    let time = cosine_dense(&a.hours, &b.hours);
    let name = cosine_sparse(&a.name_vec, &b.name_vec);
    ((time + name) / 2.0).clamp(0.0, 1.0)
}

/// Character 2- and 3-grams of a lower-cased, whitespace-collapsed name.
pub fn char_ngrams(name: &str) -> Vec<String> {
    let normalized = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let chars: Vec<char> = normalized.chars().collect();

    let mut grams = Vec::new();
    for n in 2..=3 {
        if chars.len() < n {
            continue;
        }
        for window in chars.windows(n) {
            grams.push(window.iter().collect());
        }
    }
    grams
}

fn tfidf_vectors(names: &[&str]) -> Vec<SparseVec> {
    let grams: Vec<Vec<String>> = names.iter().map(|n| char_ngrams(n)).collect();

    let mut df: HashMap<&str, usize> = HashMap::new();
    for doc in &grams {
        let unique: HashSet<&str> = doc.iter().map(String::as_str).collect();
        for term in unique {
            *df.entry(term).or_insert(0) += 1;
        }
    }

    let n = names.len() as f64;
    grams
        .iter()
        .map(|doc| {
            let mut vec: SparseVec = HashMap::new();
            for term in doc {
                *vec.entry(term.clone()).or_insert(0.0) += 1.0;
            }
            for (term, weight) in vec.iter_mut() {
                let d = df.get(term.as_str()).copied().unwrap_or(0) as f64;
                *weight *= ((1.0 + n) / (1.0 + d)).ln() + 1.0;
            }
            let norm = vec.values().map(|w| w * w).sum::<f64>().sqrt();
            if norm > 0.0 {
                vec.values_mut().for_each(|w| *w /= norm);
            }
            vec
        })
        .collect()
}

fn cosine_dense(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Inputs are already unit length (or empty).
fn cosine_sparse(a: &SparseVec, b: &SparseVec) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(term, w)| large.get(term).map(|v| w * v))
        .sum()
}
