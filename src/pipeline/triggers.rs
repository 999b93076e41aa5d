//! 启发式意图打分与参数抽取
//!
//! 每个能力有一组触发短语（内置 + 配置追加）；KeywordScorer 按命中短语数与
//! 描述词重叠打分。IntentScorer 是可替换的打分函数，Planner 只依赖该 trait。

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::memory::tokenizer::{contains_cjk, overlap_score, tokenize_to_set};
use crate::memory::SessionState;
use crate::tools::{CapabilityDescriptor, FieldType};

/// 仅靠描述词重叠（无触发短语）时所需的最少重叠词数
const DESCRIPTION_ONLY_MIN_OVERLAP: usize = 3;
const DESCRIPTION_WEIGHT: f32 = 0.1;

/// 内置触发短语
fn builtin_triggers() -> BTreeMap<String, Vec<String>> {
    let table: &[(&str, &[&str])] = &[
        (
            "get_weather",
            &[
                "weather", "temperature", "forecast", "rain", "raining", "snow", "sunny", "humid",
                "humidity", "how hot", "how cold", "umbrella", "天气", "气温", "下雨",
            ],
        ),
        (
            "calculate_distance",
            &[
                "how far", "distance", "distance between", "km from", "miles from", "how many miles",
                "how many kilometers", "多远", "距离",
            ],
        ),
        (
            "location_search",
            &[
                "where is", "location of", "coordinates", "address of", "find location", "locate",
                "map of", "在哪",
            ],
        ),
        (
            "youtube_search",
            &[
                "youtube", "video", "videos", "videos about", "video on", "watch", "tutorial video",
                "视频",
            ],
        ),
        (
            "duckduckgo_search",
            &[
                "search for", "search the web", "look up", "google", "news", "latest", "current events",
                "who is", "what happened", "搜索", "新闻",
            ],
        ),
    ];
    table
        .iter()
        .map(|(cap, phrases)| (cap.to_string(), phrases.iter().map(|p| p.to_string()).collect()))
        .collect()
}

/// 能力名 -> 小写触发短语
#[derive(Debug, Clone)]
pub struct TriggerTable {
    phrases: BTreeMap<String, Vec<String>>,
}

impl Default for TriggerTable {
    fn default() -> Self {
        Self {
            phrases: builtin_triggers(),
        }
    }
}

impl TriggerTable {
    /// 追加配置中的触发短语
    pub fn with_extra(mut self, extra: &HashMap<String, Vec<String>>) -> Self {
        for (cap, phrases) in extra {
            let entry = self.phrases.entry(cap.clone()).or_default();
            for p in phrases {
                let p = p.trim().to_lowercase();
                if !p.is_empty() && !entry.contains(&p) {
                    entry.push(p);
                }
            }
        }
        self
    }

    pub fn phrases(&self, capability: &str) -> &[String] {
        self.phrases.get(capability).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// 短语在词边界上出现；含 CJK 的短语不做边界检查
pub fn contains_phrase(haystack_lower: &str, phrase: &str) -> bool {
    if contains_cjk(phrase) {
        return haystack_lower.contains(phrase);
    }
    haystack_lower.match_indices(phrase).any(|(start, _)| {
        let before = haystack_lower[..start].chars().next_back();
        let after = haystack_lower[start + phrase.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// 一个能力的匹配结果
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityMatch {
    pub capability: String,
    pub score: f32,
    /// 命中的最长触发短语（字符数），用于同分裁决
    pub trigger_len: usize,
    pub trigger: Option<String>,
}

/// 可替换的意图打分函数：未命中返回 None
pub trait IntentScorer: Send + Sync {
    fn score(&self, message: &str, descriptor: &CapabilityDescriptor) -> Option<CapabilityMatch>;
}

#[derive(Debug, Clone, Default)]
pub struct KeywordScorer {
    triggers: TriggerTable,
}

impl KeywordScorer {
    pub fn new(triggers: TriggerTable) -> Self {
        Self { triggers }
    }
}

impl IntentScorer for KeywordScorer {
    fn score(&self, message: &str, descriptor: &CapabilityDescriptor) -> Option<CapabilityMatch> {
        let lower = message.to_lowercase();
        let hits: Vec<&String> = self
            .triggers
            .phrases(&descriptor.name)
            .iter()
            .filter(|p| contains_phrase(&lower, p))
            .collect();
        let longest = hits.iter().max_by_key(|p| p.chars().count()).map(|p| p.to_string());
        let overlap = overlap_score(&tokenize_to_set(message), &tokenize_to_set(&descriptor.description));

        if hits.is_empty() && overlap < DESCRIPTION_ONLY_MIN_OVERLAP {
            return None;
        }
        let score = hits.len() as f32 + DESCRIPTION_WEIGHT * overlap as f32;
        tracing::debug!(
            capability = %descriptor.name,
            score,
            trigger = ?longest,
            overlap,
            "capability scored"
        );
        Some(CapabilityMatch {
            capability: descriptor.name.clone(),
            score,
            trigger_len: longest.as_ref().map(|p| p.chars().count()).unwrap_or(0),
            trigger: longest,
        })
    }
}

/// 互斥能力组：组内只保留最优者
pub const EXCLUSIVE_GROUPS: &[&[&str]] = &[
    &["duckduckgo_search", "youtube_search"],
    &["location_search", "calculate_distance"],
];

/// 排序键：分数，其次最长触发短语
fn better(a: &CapabilityMatch, b: &CapabilityMatch) -> bool {
    match a.score.total_cmp(&b.score) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => a.trigger_len > b.trigger_len,
    }
}

/// 互斥组内择优，返回保留的匹配（保持输入顺序）
pub fn resolve_exclusive(matches: Vec<CapabilityMatch>) -> Vec<CapabilityMatch> {
    let losers: Vec<String> = EXCLUSIVE_GROUPS
        .iter()
        .flat_map(|group| {
            let in_group: Vec<&CapabilityMatch> = matches
                .iter()
                .filter(|m| group.contains(&m.capability.as_str()))
                .collect();
            let winner = in_group
                .iter()
                .copied()
                .reduce(|best, m| if better(m, best) { m } else { best });
            in_group
                .iter()
                .filter(|m| Some(m.capability.as_str()) != winner.map(|w| w.capability.as_str()))
                .map(|m| m.capability.clone())
                .collect::<Vec<_>>()
        })
        .collect();
    matches
        .into_iter()
        .filter(|m| !losers.contains(&m.capability))
        .collect()
}

// ---------- 参数抽取 ----------

fn capitalized_place_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?i:in|at|for|of|near)\s+(\p{Lu}[\w'\-]*(?:\s+\p{Lu}[\w'\-]*)*)").expect("static regex")
    })
}

fn lowercase_place_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(?:in|at|for)\s+([a-z][\w'\-]+)").expect("static regex"))
}

fn pair_res() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"(?i)\bbetween\s+(.+?)\s+and\s+(.+?)\s*(?:[?.!,]|$)",
            r"(?i)\bhow far is\s+(.+?)\s+from\s+(.+?)\s*(?:[?.!,]|$)",
            r"(?i)\bfrom\s+(.+?)\s+to\s+(.+?)\s*(?:[?.!,]|$)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn search_segment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:search(?: the web)? for|look up|google|news about|videos? (?:about|on|of)|youtube videos? (?:about|on|of))\s+(.+?)\s*(?:[?.!]|\band\b|$)",
        )
        .expect("static regex")
    })
}

fn filler_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:please\s+|can you\s+|could you\s+|would you\s+|i want to\s+|i'd like to\s+)*(?:search(?: the web)? for|look up|find(?: me)?|show me|tell me about|google|watch)?\s*(?:some\s+)?(?:youtube\s+)?(?:videos?\s+(?:about|on|of)\s+)?",
        )
        .expect("static regex")
    })
}

/// 不能作为地名的词
const NOT_PLACES: &[&str] = &[
    "the", "a", "an", "my", "your", "there", "here", "general", "today", "tomorrow", "tonight",
    "now", "this", "that", "me", "it", "celsius", "fahrenheit", "km", "miles",
];

/// 从消息中取地名；取不到时退回会话中的 last_location
///
/// 给出 anchor（命中的触发短语）时先在其后的片段里找，混合请求中不会取到别的领域的词。
pub fn extract_location(message: &str, anchor: Option<&str>, session: &SessionState) -> Option<String> {
    anchor
        .and_then(|a| tail_after(message, a))
        .and_then(place_in)
        .or_else(|| place_in(message))
        .or_else(|| {
            session
                .get("last_location")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

fn place_in(text: &str) -> Option<String> {
    let from_caps = capitalized_place_re()
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
        .find(|p| !NOT_PLACES.contains(&p.to_lowercase().as_str()));
    from_caps.or_else(|| {
        lowercase_place_re()
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .find(|p| !NOT_PLACES.contains(&p.to_lowercase().as_str()))
    })
}

/// 触发短语首次出现（词边界）之后的片段
fn tail_after<'a>(message: &'a str, anchor: &str) -> Option<&'a str> {
    let pattern = if contains_cjk(anchor) {
        format!("(?i){}", regex::escape(anchor))
    } else {
        format!(r"(?i)\b{}\b", regex::escape(anchor))
    };
    let re = Regex::new(&pattern).ok()?;
    re.find(message).map(|m| &message[m.end()..])
}

fn trim_place(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .trim_start_matches("the ")
        .trim()
        .to_string()
}

/// 两个地名（距离计算）
pub fn extract_location_pair(message: &str) -> Option<(String, String)> {
    pair_res().iter().find_map(|re| {
        let caps = re.captures(message)?;
        let a = trim_place(caps.get(1)?.as_str());
        let b = trim_place(caps.get(2)?.as_str());
        (!a.is_empty() && !b.is_empty()).then_some((a, b))
    })
}

/// 搜索词：显式「search for X」片段优先，否则去掉客套前缀后的整句
pub fn extract_query(message: &str) -> Option<String> {
    if let Some(seg) = search_segment_re()
        .captures(message)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
    {
        return Some(seg);
    }
    let cleaned = filler_prefix_re().replace(message.trim(), "");
    let cleaned = cleaned
        .trim()
        .trim_end_matches(['?', '.', '!'])
        .replace(" on youtube", "")
        .trim()
        .to_string();
    if cleaned.is_empty() {
        let whole = message.trim().trim_end_matches(['?', '.', '!']).trim();
        (!whole.is_empty()).then(|| whole.to_string())
    } else {
        Some(cleaned)
    }
}

/// 按字段名为能力抽取必填参数；缺少任一必填参数时返回 Err(字段名)
pub fn extract_arguments(
    descriptor: &CapabilityDescriptor,
    message: &str,
    anchor: Option<&str>,
    session: &SessionState,
) -> Result<BTreeMap<String, Value>, String> {
    let mut args = BTreeMap::new();
    let pair = extract_location_pair(message);
    for (field, spec) in descriptor.input_shape.iter().filter(|(_, s)| s.required) {
        let value = match field.as_str() {
            "location" => extract_location(message, anchor, session),
            "location1" => pair.as_ref().map(|p| p.0.clone()),
            "location2" => pair.as_ref().map(|p| p.1.clone()),
            "query" => extract_query(message),
            _ if spec.field_type == FieldType::String => extract_query(message),
            _ => None,
        };
        match value {
            Some(v) => {
                args.insert(field.clone(), Value::String(v));
            }
            None => return Err(field.clone()),
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{FieldSpec, ValueKind};
    use serde_json::json;

    fn weather() -> CapabilityDescriptor {
        CapabilityDescriptor::new("get_weather", "Get current weather for a location", ValueKind::Weather)
            .field("location", FieldSpec::required(FieldType::String, "place"))
    }

    #[test]
    fn test_contains_phrase_word_boundary() {
        assert!(contains_phrase("will it rain today", "rain"));
        assert!(!contains_phrase("take the train", "rain"));
        assert!(contains_phrase("东京天气怎么样", "天气"));
    }

    #[test]
    fn test_keyword_scorer_matches_trigger() {
        let scorer = KeywordScorer::default();
        let m = scorer.score("What's the weather in Tokyo?", &weather()).unwrap();
        assert_eq!(m.capability, "get_weather");
        assert_eq!(m.trigger.as_deref(), Some("weather"));
        assert!(scorer.score("Tell me a joke", &weather()).is_none());
    }

    #[test]
    fn test_extract_location() {
        let empty = SessionState::new();
        assert_eq!(extract_location("What's the weather in Tokyo?", None, &empty).as_deref(), Some("Tokyo"));
        assert_eq!(
            extract_location("weather in New York City today", None, &empty).as_deref(),
            Some("New York City")
        );
        assert_eq!(extract_location("forecast for paris", None, &empty).as_deref(), Some("paris"));
        assert_eq!(extract_location("will it rain there?", None, &empty), None);

        let mut session = SessionState::new();
        session.insert("last_location".into(), json!("Osaka"));
        assert_eq!(extract_location("will it rain there?", None, &session).as_deref(), Some("Osaka"));
    }

    #[test]
    fn test_extract_location_follows_trigger() {
        let empty = SessionState::new();
        let msg = "Search for Rust news and the weather in Paris";
        assert_eq!(extract_location(msg, Some("weather"), &empty).as_deref(), Some("Paris"));
        // 触发短语之后没有地名时回到整句
        assert_eq!(
            extract_location("Forecast in Lisbon, is it the weather", Some("weather"), &empty).as_deref(),
            Some("Lisbon")
        );
        assert_eq!(extract_location("东京天气 in Tokyo", Some("天气"), &empty).as_deref(), Some("Tokyo"));
    }

    #[test]
    fn test_extract_location_pair() {
        assert_eq!(
            extract_location_pair("What's the distance between Paris and London?"),
            Some(("Paris".to_string(), "London".to_string()))
        );
        assert_eq!(
            extract_location_pair("How far is Kyoto from Tokyo"),
            Some(("Kyoto".to_string(), "Tokyo".to_string()))
        );
        assert_eq!(extract_location_pair("how far is it"), None);
    }

    #[test]
    fn test_extract_query() {
        assert_eq!(extract_query("Search for rust async runtimes").as_deref(), Some("rust async runtimes"));
        assert_eq!(
            extract_query("Can you find me some videos about sourdough baking?").as_deref(),
            Some("sourdough baking")
        );
        assert_eq!(extract_query("latest news on Mars rovers?").as_deref(), Some("latest news on Mars rovers"));
    }

    #[test]
    fn test_resolve_exclusive_prefers_score_then_trigger_len() {
        let m = |cap: &str, score: f32, len: usize| CapabilityMatch {
            capability: cap.to_string(),
            score,
            trigger_len: len,
            trigger: None,
        };
        let kept = resolve_exclusive(vec![
            m("get_weather", 1.0, 7),
            m("duckduckgo_search", 1.0, 10),
            m("youtube_search", 1.0, 6),
        ]);
        let names: Vec<_> = kept.iter().map(|k| k.capability.as_str()).collect();
        assert_eq!(names, vec!["get_weather", "duckduckgo_search"]);

        let kept = resolve_exclusive(vec![m("duckduckgo_search", 1.0, 10), m("youtube_search", 2.0, 6)]);
        assert_eq!(kept[0].capability, "youtube_search");
    }

    #[test]
    fn test_extract_arguments_reports_missing_field() {
        let err = extract_arguments(&weather(), "will it rain there?", None, &SessionState::new()).unwrap_err();
        assert_eq!(err, "location");
        let ok = extract_arguments(&weather(), "weather in Tokyo", Some("weather"), &SessionState::new()).unwrap();
        assert_eq!(ok.get("location"), Some(&json!("Tokyo")));
    }
}
