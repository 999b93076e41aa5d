//! 编排器：一轮消息的完整处理
//!
//! 检索上下文 -> Planner -> ExecutionCoordinator -> Synthesizer -> 写会话提示 -> 追加到记忆。
//! Orchestrator 是显式传递的上下文对象，可被多个客户端共享（Arc），不同轮次的计划执行完全并行，
//! 只有记忆写入在 MemoryStore 内部串行。
//!
//! 流水线自身的 panic 被捕获为 PipelineFault：用户只看到脱敏后的固定文案，原始信息只进日志。

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::core::OrchestratorError;
use crate::memory::{ConversationTurn, MemoryStore, MemorySummary};
use crate::pipeline::{
    session_updates, ExecutionCoordinator, Plan, Planner, Synthesizer, TurnOutcome, TurnStatus,
};

pub const PIPELINE_FAULT_RESPONSE: &str =
    "Sorry, something went wrong while handling your request. Please try again.";

/// 每轮带入的历史规模
#[derive(Debug, Clone, Copy)]
pub struct ContextSettings {
    /// 最近轮数
    pub context_turns: usize,
    /// 相关度检索条数
    pub search_results: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            context_turns: 5,
            search_results: 3,
        }
    }
}

pub struct Orchestrator {
    planner: Planner,
    coordinator: ExecutionCoordinator,
    synthesizer: Synthesizer,
    memory: Arc<MemoryStore>,
    context: ContextSettings,
}

impl Orchestrator {
    pub fn new(
        planner: Planner,
        coordinator: ExecutionCoordinator,
        synthesizer: Synthesizer,
        memory: Arc<MemoryStore>,
        context: ContextSettings,
    ) -> Self {
        Self {
            planner,
            coordinator,
            synthesizer,
            memory,
            context,
        }
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// 处理一条消息；不会失败，流水线故障以 status=error 返回
    pub async fn process_message(&self, text: &str) -> TurnOutcome {
        match self.process_message_with_cancel(text, &CancellationToken::new()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "turn ended without outcome");
                fault_outcome()
            }
        }
    }

    /// 可取消的处理：取消时返回 Cancelled，本轮不写入任何记忆
    pub async fn process_message_with_cancel(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, OrchestratorError> {
        let text = text.trim();
        tracing::info!(chars = text.chars().count(), "turn start");

        let pipeline = AssertUnwindSafe(self.run_pipeline(text, cancel)).catch_unwind();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
            caught = pipeline => match caught {
                Ok(r) => r,
                Err(panic) => Err(OrchestratorError::PipelineFault(panic_message(panic.as_ref()))),
            },
        };

        match result {
            Ok((outcome, plan)) => {
                self.finish_turn(text, &outcome, &plan).await;
                tracing::info!(
                    status = outcome.status.as_str(),
                    tool_calls = outcome.tool_calls.len(),
                    "turn complete"
                );
                Ok(outcome)
            }
            Err(OrchestratorError::Cancelled) => {
                tracing::info!("turn cancelled, nothing recorded");
                Err(OrchestratorError::Cancelled)
            }
            Err(e) => {
                tracing::error!(error = %e, "pipeline fault");
                let outcome = fault_outcome();
                let mut metadata = Map::new();
                metadata.insert("status".into(), json!(TurnStatus::Error.as_str()));
                metadata.insert("error".into(), json!("pipeline_fault"));
                self.record(ConversationTurn::new(text, outcome.response_text.clone(), Vec::new(), metadata))
                    .await;
                Ok(outcome)
            }
        }
    }

    async fn run_pipeline(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<(TurnOutcome, Plan), OrchestratorError> {
        let history = self.context_for(text);
        let session = self.memory.session();

        let plan = self.planner.plan(text, &history, &session).await;
        let records = self.coordinator.execute(&plan, cancel).await?;
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        let outcome = self.synthesizer.synthesize(text, &records, &history, &session).await;
        Ok((outcome, plan))
    }

    /// 相关历史（最相关在前，排除已在最近窗口中的）+ 最近 n 轮（按时间）
    fn context_for(&self, text: &str) -> Vec<ConversationTurn> {
        let recent = self.memory.recent(self.context.context_turns);
        let mut relevant: Vec<ConversationTurn> = self
            .memory
            .search(text, self.context.search_results)
            .into_iter()
            .filter(|t| !recent.iter().any(|r| r.id == t.id))
            .collect();
        relevant.extend(recent);
        relevant
    }

    /// 写会话提示并追加本轮；写盘失败只记录警告
    async fn finish_turn(&self, text: &str, outcome: &TurnOutcome, plan: &Plan) {
        let mut metadata = Map::new();
        metadata.insert("status".into(), json!(outcome.status.as_str()));
        metadata.insert("intent".into(), json!(plan.intent));
        metadata.insert("rationale".into(), json!(plan.rationale));
        metadata.insert("plan_source".into(), json!(plan.source.as_str()));
        if !plan.rejected.is_empty() {
            metadata.insert(
                "rejected_steps".into(),
                serde_json::to_value(&plan.rejected).unwrap_or(Value::Null),
            );
        }

        if let Err(e) = self
            .memory
            .update_session(session_updates(&plan.intent, &outcome.tool_calls))
            .await
        {
            tracing::warn!(error = %e, "session hints kept in process only");
        }
        self.record(ConversationTurn::new(
            text,
            outcome.response_text.clone(),
            outcome.tool_calls.clone(),
            metadata,
        ))
        .await;
    }

    async fn record(&self, turn: ConversationTurn) {
        if let Err(e) = self.memory.append(turn).await {
            tracing::warn!(error = %e, "turn kept in process only");
        }
    }

    pub fn get_memory_summary(&self) -> MemorySummary {
        self.memory.summary()
    }

    /// (prompt, completion, total)
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.synthesizer.token_usage()
    }

    pub async fn export_memory(&self, path: impl AsRef<Path>) -> Result<String, OrchestratorError> {
        let path = path.as_ref();
        let count = self.memory.export(path).await?;
        Ok(format!("Exported {} turns to {}", count, path.display()))
    }

    pub async fn import_memory(&self, path: impl AsRef<Path>) -> Result<String, OrchestratorError> {
        let path = path.as_ref();
        let count = self.memory.import(path).await?;
        Ok(format!("Imported {} turns from {}", count, path.display()))
    }

    pub async fn clear_memory(&self) -> Result<(), OrchestratorError> {
        self.memory.clear().await
    }

    pub async fn set_session_data(&self, key: impl Into<String>, value: Value) -> Result<(), OrchestratorError> {
        self.memory.set_session(key, value).await
    }

    pub fn get_session_data(&self, key: &str) -> Option<Value> {
        self.memory.session_get(key)
    }

    pub fn conversations_by_topic(&self, topic: &str, limit: usize) -> Vec<ConversationTurn> {
        self.memory.by_topic(topic, limit)
    }

    pub fn search_memory(&self, query: &str, max_results: usize) -> Vec<ConversationTurn> {
        self.memory.search(query, max_results)
    }
}

fn fault_outcome() -> TurnOutcome {
    TurnOutcome {
        response_text: PIPELINE_FAULT_RESPONSE.to_string(),
        tool_calls: Vec::new(),
        status: TurnStatus::Error,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string())
}
