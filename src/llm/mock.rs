//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! - MockLlmClient：规划请求返回空计划（交给启发式规划），合成请求回显收集到的信息
//! - ScriptedLlmClient：按顺序返回预设响应或错误，并记录收到的全部请求

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::CompletionError;
use crate::llm::LlmClient;
use crate::memory::{Message, Role};

/// 规划 system prompt 中的标记，Mock 据此区分规划与合成请求
pub const PLANNING_MARKER: &str = "You are the planning component";

/// Mock 客户端：不调用任何外部服务
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, CompletionError> {
        let is_planning = messages
            .iter()
            .any(|m| m.role == Role::System && m.content.contains(PLANNING_MARKER));
        if is_planning {
            return Ok(r#"{"intent": "general", "rationale": "mock planner defers to heuristics", "steps": []}"#.to_string());
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {}", last_user))
    }
}

/// 预设响应：成功文本或失败原因
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Fail(String),
}

/// 脚本化客户端：依次弹出预设响应；耗尽后返回 fallback
#[derive(Debug)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<ScriptedReply>>,
    fallback: ScriptedReply,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: ScriptedReply::Fail("script exhausted".to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 所有请求都返回同一响应
    pub fn always(reply: ScriptedReply) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: reply,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 已收到的请求（按调用顺序）
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, CompletionError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            ScriptedReply::Text(t) => Ok(t),
            ScriptedReply::Fail(reason) => Err(CompletionError::new(reason)),
        }
    }
}
