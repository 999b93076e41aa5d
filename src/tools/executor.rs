//! 能力执行器
//!
//! 持有只读注册表与单次调用超时；invoke 解析能力、规范化参数、在超时内调用，
//! 任何失败都折叠为 Failed 记录而不是向上抛错。每次调用输出一行 JSON 审计日志。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::time::timeout;

use crate::core::OrchestratorError;
use crate::memory::ToolCallRecord;
use crate::tools::CapabilityRegistry;

const ARGS_PREVIEW_CHARS: usize = 200;

/// 审计结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Ok,
    Error,
    Timeout,
    Blocked,
}

impl AuditOutcome {
    fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Ok => "ok",
            AuditOutcome::Error => "error",
            AuditOutcome::Timeout => "timeout",
            AuditOutcome::Blocked => "blocked",
        }
    }
}

#[derive(Clone)]
pub struct CapabilityExecutor {
    registry: Arc<CapabilityRegistry>,
    timeout: Duration,
}

impl CapabilityExecutor {
    pub fn new(registry: Arc<CapabilityRegistry>, call_timeout: Duration) -> Self {
        Self {
            registry,
            timeout: call_timeout,
        }
    }

    /// 调用一个能力，结果总是一条记录
    pub async fn invoke(&self, capability: &str, args: Map<String, Value>) -> ToolCallRecord {
        let start = Instant::now();
        let elapsed = |s: Instant| s.elapsed().as_millis() as u64;

        let (descriptor, handle) = match self.registry.resolve(capability) {
            Ok(found) => found,
            Err(e) => {
                audit(capability, &args, AuditOutcome::Error, 0);
                return ToolCallRecord::failed(capability, args, e.to_string(), 0);
            }
        };

        let normalized = match descriptor.normalize(&args) {
            Ok(n) => n,
            Err(reason) => {
                audit(capability, &args, AuditOutcome::Error, elapsed(start));
                return ToolCallRecord::failed(
                    capability,
                    args,
                    format!("invalid arguments: {}", reason),
                    elapsed(start),
                );
            }
        };

        let result = timeout(self.timeout, handle.invoke(normalized.clone())).await;
        let duration_ms = elapsed(start);
        match result {
            Ok(Ok(value)) => {
                audit(capability, &normalized, AuditOutcome::Ok, duration_ms);
                ToolCallRecord::ok(capability, normalized, value, duration_ms)
            }
            Ok(Err(reason)) => {
                audit(capability, &normalized, AuditOutcome::Error, duration_ms);
                ToolCallRecord::failed(
                    capability,
                    normalized,
                    OrchestratorError::Invocation {
                        capability: capability.to_string(),
                        reason,
                    }
                    .to_string(),
                    duration_ms,
                )
            }
            Err(_) => {
                audit(capability, &normalized, AuditOutcome::Timeout, duration_ms);
                ToolCallRecord::failed(
                    capability,
                    normalized,
                    OrchestratorError::InvocationTimeout {
                        capability: capability.to_string(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                    .to_string(),
                    duration_ms,
                )
            }
        }
    }

    /// 依赖失败的步骤：不调用，直接记为失败
    pub fn blocked(&self, capability: &str, args: Map<String, Value>, reason: impl Into<String>) -> ToolCallRecord {
        audit(capability, &args, AuditOutcome::Blocked, 0);
        ToolCallRecord::failed(capability, args, reason, 0)
    }
}

pub(crate) fn audit(capability: &str, args: &Map<String, Value>, outcome: AuditOutcome, duration_ms: u64) {
    let audit = serde_json::json!({
        "event": "capability_audit",
        "capability": capability,
        "ok": outcome == AuditOutcome::Ok,
        "outcome": outcome.as_str(),
        "duration_ms": duration_ms,
        "args_preview": args_preview(args),
    });
    tracing::info!(audit = %audit, "capability");
}

fn args_preview(args: &Map<String, Value>) -> String {
    let s = Value::Object(args.clone()).to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}
