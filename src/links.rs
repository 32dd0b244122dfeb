//! Video id extraction from free-form link text.
//!
//! Users paste share text such as
//! `"7.99 复制打开抖音 https://v.douyin.com/iAbCdEf/ 看看"`. Every platform URL
//! in the text is resolved (short links follow redirects) and the numeric id
//! is read from the `/video/<id>` path segment or the `modal_id` query
//! parameter. Links that yield neither contribute nothing.

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;
use url::Url;

static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>]*douyin\.com[^\s"'<>]*"#).expect("valid regex"));

static VIDEO_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/video/(\d+)").expect("valid regex"));

/// Turns a possibly shortened URL into its final location.
#[async_trait]
pub trait LinkResolver: Send + Sync {
    /// `None` when the link cannot be resolved.
    async fn resolve(&self, url: &str) -> Option<String>;
}

/// Follows redirects with `HEAD`, retrying with `GET` when the server
/// rejects the method.
pub struct HttpResolver {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpResolver {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn get_final_url(&self, url: &str) -> Option<String> {
        match self.client.get(url).timeout(self.timeout).send().await {
            Ok(resp) => Some(resp.url().to_string()),
            Err(e) => {
                debug!(url, error = %e, "GET resolve failed");
                None
            }
        }
    }
}

#[async_trait]
impl LinkResolver for HttpResolver {
    async fn resolve(&self, url: &str) -> Option<String> {
        match self.client.head(url).timeout(self.timeout).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status == reqwest::StatusCode::METHOD_NOT_ALLOWED
                    || status == reqwest::StatusCode::NOT_IMPLEMENTED
                {
                    self.get_final_url(url).await
                } else {
                    Some(resp.url().to_string())
                }
            }
            Err(e) => {
                debug!(url, error = %e, "HEAD resolve failed, retrying with GET");
                self.get_final_url(url).await
            }
        }
    }
}

/// Platform URLs found in `text`, in order of appearance, deduplicated.
pub fn find_links(text: &str) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    for m in LINK_RE.find_iter(text) {
        let link = m.as_str().trim_end_matches(['.', ',', ')', '，', '。']);
        if !links.iter().any(|l| l == link) {
            links.push(link.to_string());
        }
    }
    links
}

/// Reads the canonical id from a resolved URL.
pub fn extract_id_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;

    if let Some(caps) = VIDEO_PATH_RE.captures(parsed.path()) {
        return Some(caps[1].to_string());
    }

    parsed
        .query_pairs()
        .find(|(key, _)| key == "modal_id")
        .map(|(_, value)| value.into_owned())
        .filter(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()))
}

/// Finds, resolves and extracts every video id in `text`, deduplicated in
/// order of appearance.
pub async fn extract_video_ids(text: &str, resolver: &dyn LinkResolver) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for link in find_links(text) {
        // Canonical links need no network round trip
        let id = match extract_id_from_url(&link) {
            Some(id) => Some(id),
            None => match resolver.resolve(&link).await {
                Some(resolved) => extract_id_from_url(&resolved),
                None => None,
            },
        };
        match id {
            Some(id) if !ids.contains(&id) => ids.push(id),
            Some(_) => {}
            None => debug!(link, "no video id in link"),
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapResolver(HashMap<String, String>);

    #[async_trait]
    impl LinkResolver for MapResolver {
        async fn resolve(&self, url: &str) -> Option<String> {
            self.0.get(url).cloned()
        }
    }

    #[test]
    fn test_find_links_in_share_text() {
        let text = "7.99 复制打开抖音 https://v.douyin.com/iAbCdEf/ 看看 \
                    https://www.douyin.com/video/123, and https://example.com/x";
        let links = find_links(text);
        assert_eq!(
            links,
            vec![
                "https://v.douyin.com/iAbCdEf/".to_string(),
                "https://www.douyin.com/video/123".to_string(),
            ]
        );
    }

    #[test]
    fn test_extract_id_from_path_and_query() {
        assert_eq!(
            extract_id_from_url("https://www.douyin.com/video/7460657806849445120?previous_page=app"),
            Some("7460657806849445120".to_string())
        );
        assert_eq!(
            extract_id_from_url("https://www.douyin.com/discover?modal_id=998877"),
            Some("998877".to_string())
        );
        assert_eq!(extract_id_from_url("https://www.douyin.com/user/abc"), None);
        assert_eq!(extract_id_from_url("not a url"), None);
    }

    #[tokio::test]
    async fn test_short_links_are_resolved_and_bad_links_dropped() {
        let mut map = HashMap::new();
        map.insert(
            "https://v.douyin.com/short1/".to_string(),
            "https://www.douyin.com/video/111".to_string(),
        );
        map.insert(
            "https://v.douyin.com/dead/".to_string(),
            "https://www.douyin.com/".to_string(),
        );
        let resolver = MapResolver(map);

        let text = "https://v.douyin.com/short1/ https://v.douyin.com/dead/ \
                    https://v.douyin.com/unknown/ https://www.douyin.com/video/111";
        let ids = extract_video_ids(text, &resolver).await;
        assert_eq!(ids, vec!["111".to_string()]);
    }

    #[tokio::test]
    async fn test_text_without_links_yields_nothing() {
        let resolver = MapResolver(HashMap::new());
        assert!(extract_video_ids("just words", &resolver).await.is_empty());
    }
}
