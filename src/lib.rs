//! Concierge - 对话助手编排与记忆子系统
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、编排器、构建装配与会话范围
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 对话轮次、检索、持久化记忆存储
//! - **observability**: 日志初始化
//! - **pipeline**: 规划、分阶段并发执行、结果合成
//! - **tools**: 能力描述、注册表、执行器与内置适配器

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod pipeline;
pub mod tools;

pub use crate::core::{Orchestrator, OrchestratorBuilder, OrchestratorError};
pub use crate::pipeline::{TurnOutcome, TurnStatus};
