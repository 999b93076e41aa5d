//! Synthesizer：汇总调用记录与历史，交给 LLM 生成最终回复
//!
//! 成功结果原样放入上下文，失败结果换成致歉说明；LLM 调用失败时返回固定降级文案。
//! 只要流水线本身跑完，状态就是 success。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::llm::LlmClient;
use crate::memory::{history_messages, CallResult, ConversationTurn, Message, SessionState, ToolCallRecord};

pub const DEGRADED_RESPONSE: &str =
    "I'm sorry, I'm having trouble generating a response right now. Please try again in a moment.";

const SYSTEM_PROMPT: &str = "You are a friendly, concise assistant. Answer the user's latest message. \
When information gathered by tools is provided, base your answer on it and do not invent facts it does not contain. \
When a lookup failed, say so briefly and suggest an alternative.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Success,
    Error,
}

impl TurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnStatus::Success => "success",
            TurnStatus::Error => "error",
        }
    }
}

/// 一轮处理的结构化结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub response_text: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub status: TurnStatus,
}

/// 能力名的人类可读说明（用于失败致歉）
fn topic_of(capability: &str) -> &str {
    match capability {
        "get_weather" => "the weather information",
        "location_search" => "the location details",
        "calculate_distance" => "the distance",
        "duckduckgo_search" => "web search results",
        "youtube_search" => "video results",
        other => other,
    }
}

/// 把调用记录整理为上下文文本
pub fn tool_context(records: &[ToolCallRecord]) -> String {
    records
        .iter()
        .map(|r| match r.result.display_text() {
            Some(text) => format!("[{}] {}", r.capability_name, text),
            None => format!(
                "[{}] Sorry, I couldn't retrieve {} ({}).",
                r.capability_name,
                topic_of(&r.capability_name),
                r.result.error().unwrap_or("unknown error")
            ),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub struct Synthesizer {
    llm: Arc<dyn LlmClient>,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 后端累计 token 用量（规划与合成共用同一客户端）
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    pub async fn synthesize(
        &self,
        message: &str,
        records: &[ToolCallRecord],
        history: &[ConversationTurn],
        session: &SessionState,
    ) -> TurnOutcome {
        let mut system = SYSTEM_PROMPT.to_string();
        if !session.is_empty() {
            system.push_str(&format!(
                "\n\nSession hints: {}",
                serde_json::to_string(session).unwrap_or_default()
            ));
        }
        if !records.is_empty() {
            system.push_str("\n\nInformation gathered for this message:\n");
            system.push_str(&tool_context(records));
        }

        let mut messages = vec![Message::system(system)];
        messages.extend(history_messages(history));
        messages.push(Message::user(message));

        let response_text = match self.llm.complete(&messages).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "synthesis completion failed, using degraded response");
                DEGRADED_RESPONSE.to_string()
            }
        };

        TurnOutcome {
            response_text,
            tool_calls: records.to_vec(),
            status: TurnStatus::Success,
        }
    }
}

/// 本轮结束后要写入会话区的提示：last_location / last_intent / last_capabilities
pub fn session_updates(intent: &str, records: &[ToolCallRecord]) -> SessionState {
    let mut updates = SessionState::new();
    updates.insert("last_intent".into(), json!(intent));
    if !records.is_empty() {
        let caps: Vec<&str> = records.iter().map(|r| r.capability_name.as_str()).collect();
        updates.insert("last_capabilities".into(), json!(caps));
    }

    let location = records
        .iter()
        .rev()
        .filter(|r| r.is_ok())
        .find_map(|r| match r.capability_name.as_str() {
            "get_weather" => r
                .input
                .get("location")
                .and_then(Value::as_str)
                .map(str::to_string),
            "location_search" => match &r.result {
                CallResult::Success(v) => v.get("chain").and_then(Value::as_str).map(str::to_string),
                _ => None,
            },
            _ => None,
        });
    if let Some(loc) = location {
        updates.insert("last_location".into(), json!(loc));
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptedLlmClient, ScriptedReply};
    use serde_json::Map;

    fn weather_args(loc: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("location".into(), json!(loc));
        m
    }

    #[test]
    fn test_tool_context_mixes_success_and_apology() {
        let records = vec![
            ToolCallRecord::ok("get_weather", weather_args("Tokyo"), json!({"summary": "Sunny, 25°C"}), 10),
            ToolCallRecord::failed("duckduckgo_search", Map::new(), "HTTP 503", 5),
        ];
        let ctx = tool_context(&records);
        assert!(ctx.contains("[get_weather] Sunny, 25°C"));
        assert!(ctx.contains("couldn't retrieve web search results (HTTP 503)"));
    }

    #[tokio::test]
    async fn test_completion_failure_degrades_but_succeeds() {
        let llm = Arc::new(ScriptedLlmClient::always(ScriptedReply::Fail("quota".into())));
        let synth = Synthesizer::new(llm);
        let records = vec![ToolCallRecord::failed(
            "get_weather",
            weather_args("Zzzznotaplace"),
            "Location 'Zzzznotaplace' not found.",
            3,
        )];
        let out = synth.synthesize("weather?", &records, &[], &SessionState::new()).await;
        assert_eq!(out.status, TurnStatus::Success);
        assert_eq!(out.response_text, DEGRADED_RESPONSE);
        assert_eq!(out.tool_calls, records);
    }

    #[tokio::test]
    async fn test_prompt_carries_results_and_history() {
        let llm = Arc::new(ScriptedLlmClient::always(ScriptedReply::Text(" It is sunny. ".into())));
        let synth = Synthesizer::new(llm.clone());
        let history = vec![ConversationTurn::new("hi", "hello", Vec::new(), Map::new())];
        let records = vec![ToolCallRecord::ok("get_weather", weather_args("Tokyo"), json!("Sunny"), 1)];
        let out = synth.synthesize("weather in Tokyo?", &records, &history, &SessionState::new()).await;
        assert_eq!(out.response_text, "It is sunny.");

        let requests = llm.requests();
        let sent = &requests[0];
        assert!(sent[0].content.contains("[get_weather] Sunny"));
        assert_eq!(sent.len(), 4);
        assert_eq!(sent.last().unwrap().content, "weather in Tokyo?");
    }

    #[test]
    fn test_session_updates_track_location() {
        let records = vec![
            ToolCallRecord::ok("get_weather", weather_args("Tokyo"), json!("Sunny"), 1),
            ToolCallRecord::failed("get_weather", weather_args("Nowhere"), "not found", 1),
        ];
        let updates = session_updates("weather", &records);
        assert_eq!(updates.get("last_location"), Some(&json!("Tokyo")));
        assert_eq!(updates.get("last_intent"), Some(&json!("weather")));
        assert_eq!(updates.get("last_capabilities"), Some(&json!(["get_weather", "get_weather"])));
    }
}
