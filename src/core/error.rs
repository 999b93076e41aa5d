//! 编排错误类型
//!
//! 能力级失败（超时、调用错误）在执行阶段就地记录为 failed，不会中断整轮；
//! 只有编排机制自身的故障（PipelineFault）才以 status="error" 暴露给调用方，且消息经过脱敏。

use thiserror::Error;

/// LLM 完成调用失败（传输 / 配额 / 空响应等）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Completion failed: {0}")]
pub struct CompletionError(pub String);

impl CompletionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// 编排过程中可能出现的错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// 规划期：步骤引用了未注册的能力，该步骤被丢弃
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    /// 启动注册期：能力名重复
    #[error("Duplicate capability: {0}")]
    DuplicateCapability(String),

    #[error("Invocation of {capability} timed out after {timeout_ms}ms")]
    InvocationTimeout { capability: String, timeout_ms: u64 },

    #[error("Invocation of {capability} failed: {reason}")]
    Invocation { capability: String, reason: String },

    #[error(transparent)]
    Completion(#[from] CompletionError),

    /// 记忆写盘失败；内存日志仍然保留该轮
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Planner / Coordinator / Synthesizer 自身的意外故障
    #[error("Pipeline fault: {0}")]
    PipelineFault(String),

    /// 调用方取消了本轮（如客户端断开）
    #[error("Turn cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

impl From<std::io::Error> for OrchestratorError {
    fn from(e: std::io::Error) -> Self {
        OrchestratorError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Persistence(format!("serialization: {}", e))
    }
}

impl From<config::ConfigError> for OrchestratorError {
    fn from(e: config::ConfigError) -> Self {
        OrchestratorError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_error_converts() {
        let err: OrchestratorError = CompletionError::new("quota exceeded").into();
        assert!(matches!(err, OrchestratorError::Completion(_)));
        assert_eq!(err.to_string(), "Completion failed: quota exceeded");
    }

    #[test]
    fn test_io_error_is_persistence() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err: OrchestratorError = io.into();
        assert!(matches!(err, OrchestratorError::Persistence(ref m) if m.contains("read-only")));
    }
}
