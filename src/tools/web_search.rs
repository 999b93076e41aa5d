//! duckduckgo_search：抓取 DuckDuckGo HTML 结果页并提取标题 / 链接 / 摘要
//!
//! 结果链接是 //duckduckgo.com/l/?uddg=<真实地址> 形式的跳转，需解出 uddg 参数。

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Url};
use serde_json::{json, Map, Value};

use crate::tools::http::{build_client, get_text, str_arg, truncate, usize_arg};
use crate::tools::{Capability, CapabilityDescriptor, FieldSpec, FieldType, ValueKind};

const DDG_HTML_URL: &str = "https://html.duckduckgo.com/html/";
const SNIPPET_MAX_CHARS: usize = 300;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

fn result_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<a([^>]*class="[^"]*result__a[^"]*"[^>]*)>(.*?)</a>"#).expect("static regex")
    })
}

fn snippet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<(?:a|div|td)[^>]*class="[^"]*result__snippet[^"]*"[^>]*>(.*?)</(?:a|div|td)>"#)
            .expect("static regex")
    })
}

fn href_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"href="([^"]+)""#).expect("static regex"))
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("static regex"))
}

/// HTML 片段转纯文本：html2text 优先，失败时去标签
pub fn html_fragment_to_text(fragment: &str) -> String {
    let text = match html2text::from_read(fragment.as_bytes(), 10_000) {
        Ok(t) if !t.trim().is_empty() => t,
        _ => tag_re().replace_all(fragment, "").into_owned(),
    };
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 跳转链接解出真实地址；非跳转链接原样返回
fn resolve_redirect(href: &str) -> String {
    let href = href.replace("&amp;", "&");
    let absolute = if href.starts_with("//") {
        format!("https:{}", href)
    } else if href.starts_with('/') {
        format!("https://duckduckgo.com{}", href)
    } else {
        href.clone()
    };
    Url::parse(&absolute)
        .ok()
        .and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == "uddg")
                .map(|(_, v)| v.into_owned())
        })
        .unwrap_or(absolute)
}

pub fn parse_results(html: &str, max_results: usize) -> Vec<SearchHit> {
    let snippets: Vec<String> = snippet_re()
        .captures_iter(html)
        .map(|c| html_fragment_to_text(&c[1]))
        .collect();

    result_link_re()
        .captures_iter(html)
        .filter_map(|c| {
            let href = href_re().captures(&c[1])?.get(1)?.as_str().to_string();
            Some((resolve_redirect(&href), html_fragment_to_text(&c[2])))
        })
        // 广告结果走 y.js 跳转
        .filter(|(url, _)| !url.contains("duckduckgo.com/y.js"))
        .enumerate()
        .map(|(i, (url, title))| SearchHit {
            title,
            url,
            snippet: snippets
                .get(i)
                .map(|s| truncate(s, SNIPPET_MAX_CHARS))
                .unwrap_or_default(),
        })
        .take(max_results)
        .collect()
}

pub struct WebSearchCapability {
    client: Client,
    default_max_results: usize,
}

impl WebSearchCapability {
    pub fn new(timeout: Duration, user_agent: &str, default_max_results: usize) -> Self {
        Self {
            client: build_client(timeout, user_agent),
            default_max_results,
        }
    }
}

fn format_hits(query: &str, hits: &[SearchHit]) -> Result<Value, String> {
    if hits.is_empty() {
        return Err(format!("No search results found for '{}'.", query));
    }
    let summary = hits
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{}. {}\n   URL: {}\n   Summary: {}", i + 1, h.title, h.url, h.snippet))
        .collect::<Vec<_>>()
        .join("\n");
    let results: Vec<Value> = hits
        .iter()
        .map(|h| json!({"title": h.title, "url": h.url, "snippet": h.snippet}))
        .collect();
    Ok(json!({
        "query": query,
        "results": results,
        "summary": summary,
        "chain": hits[0].title,
    }))
}

#[async_trait]
impl Capability for WebSearchCapability {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "duckduckgo_search",
            "Search the web for current information using DuckDuckGo. Useful for recent news, facts and general information.",
            ValueKind::Links,
        )
        .field(
            "query",
            FieldSpec::required(FieldType::String, "Search query").accepts(ValueKind::Text),
        )
        .field(
            "max_results",
            FieldSpec::optional(
                FieldType::Integer,
                json!(self.default_max_results),
                "Maximum number of results to return",
            ),
        )
    }

    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, String> {
        let query = str_arg(&args, "query")?;
        let max = usize_arg(&args, "max_results", self.default_max_results).clamp(1, 20);
        tracing::debug!(query = %query, "duckduckgo search");
        let html = get_text(&self.client, DDG_HTML_URL, &[("q", query.to_string())]).await?;
        format_hits(query, &parse_results(&html, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
    <div class="result results_links">
      <h2 class="result__title">
        <a rel="nofollow" class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fwww.rust-lang.org%2F&amp;rut=abc">Rust <b>Programming</b> Language</a>
      </h2>
      <a class="result__snippet" href="//duckduckgo.com/l/?uddg=x">A language empowering <b>everyone</b>.</a>
    </div>
    <div class="result results_links">
      <a rel="nofollow" class="result__a" href="https://doc.rust-lang.org/book/">The Rust Book</a>
      <a class="result__snippet" href="x">Learn Rust.</a>
    </div>
    "#;

    #[test]
    fn test_parse_results_decodes_redirects() {
        let hits = parse_results(PAGE, 5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://www.rust-lang.org/");
        assert!(hits[0].title.contains("Programming"));
        assert!(hits[0].snippet.contains("everyone"));
        assert_eq!(hits[1].url, "https://doc.rust-lang.org/book/");
    }

    #[test]
    fn test_parse_results_respects_limit() {
        assert_eq!(parse_results(PAGE, 1).len(), 1);
        assert!(parse_results("<html></html>", 5).is_empty());
    }

    #[test]
    fn test_empty_results_is_error() {
        assert!(format_hits("nothing", &[]).is_err());
        let hits = parse_results(PAGE, 5);
        let out = format_hits("rust", &hits).unwrap();
        assert!(out["summary"].as_str().unwrap().starts_with("1. Rust"));
    }
}
