//! 分词模块
//!
//! 记忆检索用的中英文混合分词：含 CJK 字符时走 jieba（搜索引擎模式），
//! 否则按非字母数字字符切分；统一小写并去掉常见停用词。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

/// 英文停用词：不参与相关度打分
const STOPWORDS: &[&str] = &[
    "the", "is", "are", "was", "were", "what", "whats", "how", "can", "you", "me", "for", "and",
    "of", "to", "in", "on", "at", "it", "its", "my", "do", "does", "an", "be", "about", "please",
    "tell", "show", "find", "some", "any", "there", "this", "that", "with",
];

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

fn keep(token: &str) -> bool {
    let first = token.chars().next().unwrap_or(' ');
    if is_cjk(first) {
        return true;
    }
    token.chars().count() > 1 && !STOPWORDS.contains(&token)
}

/// 分词：小写、去标点、去停用词
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .flat_map(|s| split_latin(&s))
            .filter(|s| keep(s))
            .collect()
    } else {
        split_latin(&text.to_lowercase())
            .into_iter()
            .filter(|s| keep(s))
            .collect()
    }
}

/// 按非字母数字切分；撇号直接去掉（what's -> whats）
fn split_latin(text: &str) -> Vec<String> {
    text.replace(['\'', '’'], "")
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// 重叠分数：交集大小
pub fn overlap_score(set1: &HashSet<String>, set2: &HashSet<String>) -> usize {
    set1.intersection(set2).count()
}
