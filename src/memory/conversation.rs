//! LLM 消息：角色 + 文本
//!
//! 历史轮次通过 history_messages 展开为 user/assistant 对，供规划与合成拼接上下文。

use serde::{Deserialize, Serialize};

use crate::memory::ConversationTurn;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 将历史轮次展开为 user/assistant 消息对（旧的在前）
pub fn history_messages(turns: &[ConversationTurn]) -> Vec<Message> {
    turns
        .iter()
        .flat_map(|t| {
            [
                Message::user(t.user_message.clone()),
                Message::assistant(t.agent_response.clone()),
            ]
        })
        .collect()
}
