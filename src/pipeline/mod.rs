//! 单轮处理流水线：Planner -> ExecutionCoordinator -> Synthesizer

pub mod coordinator;
pub mod plan;
pub mod planner;
pub mod stages;
pub mod synthesizer;
pub mod triggers;

pub use coordinator::ExecutionCoordinator;
pub use plan::{ArgValue, InvocationPlanStep, Plan, PlanSource, RejectedStep};
pub use planner::{Planner, PlannerSettings};
pub use synthesizer::{session_updates, Synthesizer, TurnOutcome, TurnStatus, DEGRADED_RESPONSE};
pub use triggers::{CapabilityMatch, IntentScorer, KeywordScorer, TriggerTable};
