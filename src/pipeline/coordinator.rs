//! 执行协调器
//!
//! 按阶段执行计划：阶段内每个步骤一个 tokio 任务（Semaphore 限制并发），全部结束后才进入下一阶段。
//! 每个步骤只写自己的记录槽位；依赖了失败步骤的步骤不调用，直接记为 blocked。
//! 取消令牌触发时中止在途任务并返回 Cancelled，已有结果全部丢弃。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::OrchestratorError;
use crate::memory::{CallResult, ToolCallRecord};
use crate::pipeline::plan::{ArgValue, InvocationPlanStep, Plan};
use crate::pipeline::stages::{chain_value, partition};
use crate::tools::CapabilityExecutor;

pub struct ExecutionCoordinator {
    executor: CapabilityExecutor,
    permits: Arc<Semaphore>,
}

impl ExecutionCoordinator {
    pub fn new(executor: CapabilityExecutor, max_concurrent_calls: usize) -> Self {
        Self {
            executor,
            permits: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
        }
    }

    /// 执行计划，返回与步骤一一对应的记录（按计划顺序）
    pub async fn execute(
        &self,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolCallRecord>, OrchestratorError> {
        let mut slots: Vec<Option<ToolCallRecord>> = vec![None; plan.steps.len()];

        for (stage_no, stage) in partition(&plan.steps).into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            tracing::debug!(stage = stage_no, steps = ?stage, "stage start");

            let mut set = JoinSet::new();
            for &idx in &stage {
                let step = &plan.steps[idx];
                match resolve_arguments(step, &slots) {
                    Ok(args) => {
                        let executor = self.executor.clone();
                        let permits = self.permits.clone();
                        let name = step.capability_name.clone();
                        // 崩溃时记录仍带上已代入的参数
                        let input = args.clone();
                        set.spawn(async move {
                            let record = AssertUnwindSafe(async {
                                match permits.acquire_owned().await {
                                    Ok(_permit) => executor.invoke(&name, args).await,
                                    Err(_) => ToolCallRecord::failed(name.clone(), input.clone(), "executor shut down", 0),
                                }
                            })
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                tracing::error!(capability = %name, "capability panicked");
                                ToolCallRecord::failed(name.clone(), input.clone(), "capability crashed", 0)
                            });
                            (idx, record)
                        });
                    }
                    Err(reason) => {
                        slots[idx] = Some(self.executor.blocked(&step.capability_name, step.literal_arguments(), reason));
                    }
                }
            }

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        set.abort_all();
                        tracing::info!(stage = stage_no, "turn cancelled, in-flight steps abandoned");
                        return Err(OrchestratorError::Cancelled);
                    }
                    joined = set.join_next() => match joined {
                        Some(Ok((idx, record))) => slots[idx] = Some(record),
                        Some(Err(e)) => tracing::warn!(error = %e, "step task ended abnormally"),
                        None => break,
                    }
                }
            }

            for &idx in &stage {
                if slots[idx].is_none() {
                    let step = &plan.steps[idx];
                    slots[idx] = Some(ToolCallRecord::failed(
                        step.capability_name.clone(),
                        step.literal_arguments(),
                        "step did not complete",
                        0,
                    ));
                }
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }
}

/// 代入前序结果；任一依赖失败时返回 blocked 原因
fn resolve_arguments(
    step: &InvocationPlanStep,
    slots: &[Option<ToolCallRecord>],
) -> Result<Map<String, Value>, String> {
    for dep in step.dependencies() {
        match slots.get(dep).and_then(Option::as_ref) {
            Some(rec) if rec.is_ok() => {}
            Some(rec) => {
                return Err(format!(
                    "blocked by dependency: step {} ({}) failed",
                    dep + 1,
                    rec.capability_name
                ))
            }
            None => return Err(format!("blocked by dependency: step {} has no result", dep + 1)),
        }
    }

    let mut args = Map::new();
    for (field, value) in &step.arguments {
        let resolved = match value {
            ArgValue::Literal(v) => v.clone(),
            ArgValue::FromStep(i) => match slots.get(*i).and_then(Option::as_ref).map(|r| &r.result) {
                Some(CallResult::Success(output)) => chain_value(output),
                _ => return Err(format!("blocked by dependency: step {} failed", i + 1)),
            },
        };
        args.insert(field.clone(), resolved);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::CallStatus;
    use crate::pipeline::plan::PlanSource;
    use crate::tools::{Capability, CapabilityDescriptor, CapabilityRegistry, FieldSpec, FieldType, ValueKind};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Lookup {
        name: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Capability for Lookup {
        fn descriptor(&self) -> CapabilityDescriptor {
            CapabilityDescriptor::new(self.name, "lookup", ValueKind::Location)
                .field("q", FieldSpec::required(FieldType::String, "q"))
        }

        async fn invoke(&self, args: Map<String, Value>) -> Result<Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let q = args.get("q").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            match q.as_str() {
                "fail" => Err(format!("Location '{}' not found.", q)),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(json!("late"))
                }
                "panic" => panic!("adapter bug"),
                _ => Ok(json!({"chain": q.to_uppercase(), "summary": format!("found {}", q)})),
            }
        }
    }

    fn coordinator(calls: Arc<AtomicUsize>) -> ExecutionCoordinator {
        let mut registry = CapabilityRegistry::new();
        registry
            .register_capability(Lookup {
                name: "lookup",
                calls: calls.clone(),
            })
            .unwrap();
        registry.register_capability(Lookup { name: "echo", calls }).unwrap();
        let executor = CapabilityExecutor::new(Arc::new(registry), Duration::from_millis(100));
        ExecutionCoordinator::new(executor, 4)
    }

    fn plan(steps: Vec<InvocationPlanStep>) -> Plan {
        Plan {
            steps,
            rationale: String::new(),
            intent: "test".into(),
            rejected: Vec::new(),
            source: PlanSource::Llm,
        }
    }

    #[tokio::test]
    async fn test_placeholder_substituted_with_prior_output() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = coordinator(calls.clone());
        let p = plan(vec![
            InvocationPlanStep::new("lookup").literal("q", "paris"),
            InvocationPlanStep::new("echo").from_step("q", 0),
        ]);
        let records = c.execute(&p, &CancellationToken::new()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].input.get("q"), Some(&json!("PARIS")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dependent_of_failed_step_is_blocked_not_invoked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = coordinator(calls.clone());
        let p = plan(vec![
            InvocationPlanStep::new("lookup").literal("q", "fail"),
            InvocationPlanStep::new("echo").from_step("q", 0),
            InvocationPlanStep::new("echo").literal("q", "independent"),
        ]);
        let records = c.execute(&p, &CancellationToken::new()).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].status, CallStatus::Failed);
        assert_eq!(records[1].status, CallStatus::Failed);
        assert!(records[1].result.error().unwrap().contains("blocked by dependency"));
        assert_eq!(records[2].status, CallStatus::Ok);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_and_panic_do_not_affect_siblings() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = coordinator(calls);
        let p = plan(vec![
            InvocationPlanStep::new("lookup").literal("q", "slow"),
            InvocationPlanStep::new("lookup").literal("q", "panic"),
            InvocationPlanStep::new("echo").literal("q", "tokyo"),
        ]);
        let records = c.execute(&p, &CancellationToken::new()).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[0].result.error().unwrap().contains("timed out"));
        assert_eq!(records[1].result.error(), Some("capability crashed"));
        assert_eq!(records[1].input.get("q"), Some(&json!("panic")));
        assert!(records[2].is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_returns_cancelled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = coordinator(calls);
        let p = plan(vec![InvocationPlanStep::new("lookup").literal("q", "slow")]);
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });
        let err = c.execute(&p, &token).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
    }
}
