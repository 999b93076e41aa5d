//! 对话轮次与工具调用记录
//!
//! ConversationTurn 追加后不可变；ToolCallRecord 由执行协调器按计划步骤生成。
//! 反序列化兼容旧版记忆文件：无时区的 ISO 时间戳、缺失 id、`{tool, input, result}` 形式的调用记录。

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// 会话级键值区（跨轮的临时提示，如最近讨论的地点）
pub type SessionState = Map<String, Value>;

/// 一轮对话：用户消息 + 回复 + 该轮的工具调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub user_message: String,
    pub agent_response: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ConversationTurn {
    pub fn new(
        user_message: impl Into<String>,
        agent_response: impl Into<String>,
        tool_calls: Vec<ToolCallRecord>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            user_message: user_message.into(),
            agent_response: agent_response.into(),
            tool_calls,
            metadata,
        }
    }
}

/// 调用状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ok,
    Failed,
}

impl Default for CallStatus {
    fn default() -> Self {
        CallStatus::Ok
    }
}

/// 调用结果：成功值或错误描述
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallResult {
    Success(Value),
    Failure(String),
}

impl CallResult {
    /// 成功值的文本形式（字符串原样返回，其他 JSON 序列化）
    pub fn success_text(&self) -> Option<String> {
        match self {
            CallResult::Success(Value::String(s)) => Some(s.clone()),
            CallResult::Success(v) => Some(v.to_string()),
            CallResult::Failure(_) => None,
        }
    }

    /// 面向展示的文本：结构化结果优先取其 summary 字段
    pub fn display_text(&self) -> Option<String> {
        match self {
            CallResult::Success(Value::Object(obj)) => match obj.get("summary").and_then(|s| s.as_str()) {
                Some(summary) => Some(summary.to_string()),
                None => self.success_text(),
            },
            _ => self.success_text(),
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            CallResult::Failure(e) => Some(e),
            CallResult::Success(_) => None,
        }
    }
}

/// 单个计划步骤的执行记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    #[serde(alias = "tool")]
    pub capability_name: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(deserialize_with = "deserialize_result")]
    pub result: CallResult,
    #[serde(default)]
    pub status: CallStatus,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ToolCallRecord {
    pub fn ok(capability_name: impl Into<String>, input: Map<String, Value>, value: Value, duration_ms: u64) -> Self {
        Self {
            capability_name: capability_name.into(),
            input,
            result: CallResult::Success(value),
            status: CallStatus::Ok,
            duration_ms,
        }
    }

    pub fn failed(
        capability_name: impl Into<String>,
        input: Map<String, Value>,
        reason: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            capability_name: capability_name.into(),
            input,
            result: CallResult::Failure(reason.into()),
            status: CallStatus::Failed,
            duration_ms,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == CallStatus::Ok
    }
}

/// 先按 RFC 3339 解析；旧文件中无时区的时间按 UTC 处理
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|naive| naive.and_utc())
}

/// 结果字段：新格式 {"success": v} / {"failure": "..."}；旧格式为裸值，视为成功
fn deserialize_result<'de, D>(deserializer: D) -> Result<CallResult, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Tagged(CallResult),
        Bare(Value),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Tagged(r) => r,
        Repr::Bare(v) => CallResult::Success(v),
    })
}
