//! 核心层：错误类型、编排器与构建装配

pub mod builder;
pub mod error;
pub mod orchestrator;

pub use builder::{build_registry, create_llm_from_config, ContextFactory, OrchestratorBuilder};
pub use error::{CompletionError, OrchestratorError};
pub use orchestrator::{ContextSettings, Orchestrator, PIPELINE_FAULT_RESPONSE};
