//! LLM 客户端抽象
//!
//! 规划（一次结构化提案）与合成（最终回复）都通过 LlmClient::complete 完成；
//! 传输 / 配额失败统一为 CompletionError。

use async_trait::async_trait;

use crate::core::CompletionError;
use crate::memory::Message;

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, CompletionError>;

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
