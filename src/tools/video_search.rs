//! youtube_search：抓取 YouTube 搜索结果页，从内嵌的 ytInitialData 中提取 videoRenderer

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Map, Value};

use crate::tools::http::{build_client, get_text, str_arg, usize_arg};
use crate::tools::{Capability, CapabilityDescriptor, FieldSpec, FieldType, ValueKind};

const YOUTUBE_RESULTS_URL: &str = "https://www.youtube.com/results";

#[derive(Debug, Clone, PartialEq)]
pub struct VideoHit {
    pub video_id: String,
    pub title: String,
}

impl VideoHit {
    pub fn url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.video_id)
    }
}

fn video_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?s)"videoRenderer":\{"videoId":"([\w-]{11})".*?"title":\{"runs":\[\{"text":"((?:[^"\\]|\\.)*)""#,
        )
        .expect("static regex")
    })
}

/// 标题是 JSON 字符串字面量内容，按 JSON 规则反转义
fn unescape_json_str(raw: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", raw)).unwrap_or_else(|_| raw.to_string())
}

pub fn parse_videos(page: &str, max_results: usize) -> Vec<VideoHit> {
    let mut seen = HashSet::new();
    video_re()
        .captures_iter(page)
        .filter_map(|c| {
            let id = c[1].to_string();
            seen.insert(id.clone()).then(|| VideoHit {
                video_id: id,
                title: unescape_json_str(&c[2]),
            })
        })
        .take(max_results)
        .collect()
}

pub struct VideoSearchCapability {
    client: Client,
    default_max_results: usize,
}

impl VideoSearchCapability {
    pub fn new(timeout: Duration, user_agent: &str, default_max_results: usize) -> Self {
        Self {
            client: build_client(timeout, user_agent),
            default_max_results,
        }
    }
}

fn format_videos(query: &str, videos: &[VideoHit]) -> Result<Value, String> {
    if videos.is_empty() {
        return Err(format!("No videos found for '{}'.", query));
    }
    let summary = videos
        .iter()
        .enumerate()
        .map(|(i, v)| format!("{}. {} - {}", i + 1, v.title, v.url()))
        .collect::<Vec<_>>()
        .join("\n");
    let items: Vec<Value> = videos
        .iter()
        .map(|v| json!({"video_id": v.video_id, "title": v.title, "url": v.url()}))
        .collect();
    Ok(json!({
        "query": query,
        "videos": items,
        "summary": summary,
        "chain": videos[0].title,
    }))
}

#[async_trait]
impl Capability for VideoSearchCapability {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "youtube_search",
            "Search for YouTube videos on any topic. Useful for educational, entertainment or instructional videos.",
            ValueKind::Links,
        )
        .field(
            "query",
            FieldSpec::required(FieldType::String, "Search query for YouTube videos").accepts(ValueKind::Text),
        )
        .field(
            "max_results",
            FieldSpec::optional(
                FieldType::Integer,
                json!(self.default_max_results),
                "Maximum number of video results to return",
            ),
        )
    }

    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, String> {
        let query = str_arg(&args, "query")?;
        let max = usize_arg(&args, "max_results", self.default_max_results).clamp(1, 20);
        let page = get_text(
            &self.client,
            YOUTUBE_RESULTS_URL,
            &[("search_query", query.to_string()), ("hl", "en".to_string())],
        )
        .await?;
        format_videos(query, &parse_videos(&page, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"var ytInitialData = {"contents":[
        {"videoRenderer":{"videoId":"abcDEF12345","thumbnail":{},"title":{"runs":[{"text":"Rust in 100 Seconds & more"}]}}},
        {"videoRenderer":{"videoId":"abcDEF12345","thumbnail":{},"title":{"runs":[{"text":"duplicate"}]}}},
        {"videoRenderer":{"videoId":"zyx-987_654","title":{"runs":[{"text":"Async \"Rust\" explained"}]}}}
    ]};"#;

    #[test]
    fn test_parse_videos_dedupes_and_unescapes() {
        let videos = parse_videos(PAGE, 5);
        assert_eq!(videos.len(), 2);
        assert_eq!(videos[0].title, "Rust in 100 Seconds & more");
        assert_eq!(videos[1].title, "Async \"Rust\" explained");
        assert_eq!(videos[1].url(), "https://www.youtube.com/watch?v=zyx-987_654");
    }

    #[test]
    fn test_no_videos_is_error() {
        assert!(parse_videos("<html></html>", 5).is_empty());
        assert!(format_videos("x", &[]).unwrap_err().contains("No videos"));
    }
}
