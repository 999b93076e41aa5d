//! Planner：启发式候选 + 一次 LLM 规划建议 + 校验修复
//!
//! - 启发式：IntentScorer 为每个已注册能力打分，互斥组内择优，再按字段名抽取参数
//! - LLM：拼入能力列表与输出 Schema，要求返回 ProposedPlan JSON；失败或不可解析时只用启发式结果
//! - 校验：未知能力、无法修复的参数、无处绑定的占位符都会让该步被丢弃并记入 rejected
//!
//! 合并顺序：LLM 步骤在前，随后是 LLM 未覆盖能力的启发式步骤，总数不超过 max_steps。

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::llm::{LlmClient, PLANNING_MARKER};
use crate::memory::{history_messages, ConversationTurn, Message, SessionState};
use crate::pipeline::plan::{
    parse_placeholder, parse_proposal, proposal_schema_json, ArgValue, InvocationPlanStep, Placeholder, Plan,
    PlanSource, ProposedPlan, ProposedStep, RejectedStep,
};
use crate::pipeline::triggers::{extract_arguments, resolve_exclusive, CapabilityMatch, IntentScorer};
use crate::tools::{is_blank, CapabilityDescriptor, CapabilityRegistry, ValueKind};

#[derive(Debug, Clone)]
pub struct PlannerSettings {
    pub use_llm: bool,
    pub max_steps: usize,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            use_llm: true,
            max_steps: 5,
        }
    }
}

/// 能力名对应的意图标签
fn intent_label(capability: &str) -> &'static str {
    match capability {
        "get_weather" => "weather",
        "location_search" => "location",
        "calculate_distance" => "distance",
        "duckduckgo_search" => "web_search",
        "youtube_search" => "video_search",
        _ => "capability",
    }
}

fn planning_system_prompt(capabilities: &str, schema: &str, session: &SessionState) -> String {
    let hints = if session.is_empty() {
        "(none)".to_string()
    } else {
        serde_json::to_string(session).unwrap_or_default()
    };
    format!(
        "{marker} of a conversational assistant. Decide which capabilities (if any) must be \
         invoked to answer the user's latest message.\n\n\
         Available capabilities:\n{capabilities}\n\n\
         Session hints: {hints}\n\n\
         Rules:\n\
         - Only use capability names from the list above.\n\
         - Use an empty steps array when no capability is needed.\n\
         - To use an earlier step's result as an argument, write \"{{{{previous}}}}\" or \"{{{{step_N}}}}\" (N starts at 1).\n\
         - Reply with a single JSON object matching this schema and nothing else:\n{schema}",
        marker = PLANNING_MARKER,
        capabilities = capabilities,
        hints = hints,
        schema = schema,
    )
}

/// 启发式候选
#[derive(Debug, Clone)]
struct Candidate {
    matched: CapabilityMatch,
    arguments: BTreeMap<String, Value>,
}

pub struct Planner {
    registry: Arc<CapabilityRegistry>,
    llm: Arc<dyn LlmClient>,
    scorer: Arc<dyn IntentScorer>,
    settings: PlannerSettings,
}

impl Planner {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        llm: Arc<dyn LlmClient>,
        scorer: Arc<dyn IntentScorer>,
        settings: PlannerSettings,
    ) -> Self {
        Self {
            registry,
            llm,
            scorer,
            settings,
        }
    }

    /// 生成本轮计划；不会失败，LLM 不可用时退化为纯启发式
    pub async fn plan(&self, message: &str, history: &[ConversationTurn], session: &SessionState) -> Plan {
        let (candidates, mut rejected) = self.heuristic_candidates(message, session);

        let proposal = if self.settings.use_llm && !self.registry.is_empty() {
            match self.propose(message, history, session).await {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!(error = %e, "llm plan proposal unavailable, using heuristics");
                    None
                }
            }
        } else {
            None
        };

        let (mut steps, proposal_meta) = match proposal {
            Some(p) => {
                let (steps, mut dropped) = self.validate_proposal(&p, message, session);
                rejected.append(&mut dropped);
                (steps, Some((p.intent, p.rationale)))
            }
            None => (Vec::new(), None),
        };
        let from_llm = steps.len();

        let covered: HashSet<String> = steps.iter().map(|s| s.capability_name.clone()).collect();
        let heuristic_intent = candidates
            .first()
            .map(|c| intent_label(&c.matched.capability).to_string());
        let heuristic_rationale = candidates
            .iter()
            .map(|c| match &c.matched.trigger {
                Some(t) => format!("'{}' -> {}", t, c.matched.capability),
                None => format!("description match -> {}", c.matched.capability),
            })
            .collect::<Vec<_>>()
            .join("; ");
        for c in candidates.into_iter().filter(|c| !covered.contains(&c.matched.capability)) {
            let mut step = InvocationPlanStep::new(c.matched.capability);
            for (k, v) in c.arguments {
                step = step.literal(k, v);
            }
            steps.push(step);
        }
        let from_heuristic = steps.len() - from_llm;

        if steps.len() > self.settings.max_steps {
            for dropped in steps.drain(self.settings.max_steps..) {
                tracing::warn!(capability = %dropped.capability_name, "plan step dropped: step limit reached");
                rejected.push(RejectedStep {
                    capability_name: dropped.capability_name,
                    reason: format!("plan exceeds {} steps", self.settings.max_steps),
                });
            }
        }

        let source = match (from_llm > 0, from_heuristic > 0 && steps.len() > from_llm) {
            (true, true) => PlanSource::Merged,
            (true, false) => PlanSource::Llm,
            (false, _) if !steps.is_empty() => PlanSource::Heuristic,
            _ => PlanSource::None,
        };

        let (llm_intent, llm_rationale) = proposal_meta.unwrap_or_default();
        let intent = if from_llm > 0 && !llm_intent.trim().is_empty() {
            llm_intent
        } else {
            heuristic_intent.unwrap_or_else(|| "general".to_string())
        };
        let rationale = match source {
            PlanSource::Llm => llm_rationale,
            PlanSource::Merged => format!("{} (heuristic: {})", llm_rationale, heuristic_rationale),
            PlanSource::Heuristic => format!("heuristic: {}", heuristic_rationale),
            PlanSource::None => "no capability needed".to_string(),
        };

        tracing::info!(
            intent = %intent,
            source = source.as_str(),
            steps = steps.len(),
            rejected = rejected.len(),
            "plan ready"
        );
        Plan {
            steps,
            rationale,
            intent,
            rejected,
            source,
        }
    }

    /// 启发式打分 -> 互斥择优 -> 参数抽取；按分数降序
    fn heuristic_candidates(&self, message: &str, session: &SessionState) -> (Vec<Candidate>, Vec<RejectedStep>) {
        let descriptors = self.registry.descriptors();
        let mut matches: Vec<CapabilityMatch> = descriptors
            .iter()
            .filter_map(|d| self.scorer.score(message, d))
            .collect();
        matches = resolve_exclusive(matches);
        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.trigger_len.cmp(&a.trigger_len))
                .then(a.capability.cmp(&b.capability))
        });

        let mut rejected = Vec::new();
        let candidates = matches
            .into_iter()
            .filter_map(|m| {
                let descriptor = descriptors.iter().find(|d| d.name == m.capability)?;
                match extract_arguments(descriptor, message, m.trigger.as_deref(), session) {
                    Ok(arguments) => Some(Candidate { matched: m, arguments }),
                    Err(field) => {
                        tracing::debug!(capability = %m.capability, field = %field, "heuristic match without argument");
                        rejected.push(RejectedStep {
                            capability_name: m.capability,
                            reason: format!("could not determine '{}'", field),
                        });
                        None
                    }
                }
            })
            .collect();
        (candidates, rejected)
    }

    async fn propose(
        &self,
        message: &str,
        history: &[ConversationTurn],
        session: &SessionState,
    ) -> Result<ProposedPlan, String> {
        let system = planning_system_prompt(&self.registry.to_schema_json(), &proposal_schema_json(), session);
        let mut messages = vec![Message::system(system)];
        messages.extend(history_messages(history));
        messages.push(Message::user(message));

        let output = self.llm.complete(&messages).await.map_err(|e| e.to_string())?;
        parse_proposal(&output)
    }

    /// 校验 LLM 步骤：丢弃未知能力与不可修复的步骤，占位符转为 FromStep
    fn validate_proposal(
        &self,
        proposal: &ProposedPlan,
        message: &str,
        session: &SessionState,
    ) -> (Vec<InvocationPlanStep>, Vec<RejectedStep>) {
        let mut kept: Vec<(InvocationPlanStep, ValueKind)> = Vec::new();
        // 建议下标 -> 保留后的下标
        let mut index_map: Vec<Option<usize>> = Vec::with_capacity(proposal.steps.len());
        let mut rejected = Vec::new();

        for (i, proposed) in proposal.steps.iter().enumerate() {
            let outcome = match self.registry.descriptor(&proposed.capability) {
                None => Err(format!("unknown capability '{}'", proposed.capability)),
                Some(descriptor) => self.validate_step(proposed, &descriptor, &kept, &index_map, message, session),
            };
            match outcome {
                Ok(step) => {
                    index_map.push(Some(kept.len()));
                    let kind = self
                        .registry
                        .descriptor(&step.capability_name)
                        .map(|d| d.output_kind)
                        .unwrap_or(ValueKind::Text);
                    kept.push((step, kind));
                }
                Err(reason) => {
                    tracing::warn!(step = i + 1, capability = %proposed.capability, reason = %reason, "plan step rejected");
                    index_map.push(None);
                    rejected.push(RejectedStep {
                        capability_name: proposed.capability.clone(),
                        reason,
                    });
                }
            }
        }
        (kept.into_iter().map(|(s, _)| s).collect(), rejected)
    }

    fn validate_step(
        &self,
        proposed: &ProposedStep,
        descriptor: &CapabilityDescriptor,
        kept: &[(InvocationPlanStep, ValueKind)],
        index_map: &[Option<usize>],
        message: &str,
        session: &SessionState,
    ) -> Result<InvocationPlanStep, String> {
        let mut step = InvocationPlanStep::new(descriptor.name.clone());

        for (field, value) in &proposed.arguments {
            let Some(spec) = descriptor.input_shape.get(field) else {
                tracing::debug!(capability = %descriptor.name, field = %field, "undeclared argument dropped");
                continue;
            };
            if is_blank(value) {
                continue;
            }
            let placeholder = value.as_str().and_then(parse_placeholder);
            match placeholder {
                Some(ph) => {
                    let target = bind_placeholder(ph, spec.accepts, kept, index_map)
                        .ok_or_else(|| format!("'{}' refers to a result no earlier step produces", field))?;
                    step = step.from_step(field.clone(), target);
                }
                None => {
                    let coerced = descriptor.coerce(field, value)?;
                    step = step.literal(field.clone(), coerced);
                }
            }
        }

        // 缺失的必填参数尝试用启发式抽取修复
        let missing: Vec<String> = descriptor
            .required_fields()
            .filter(|f| !step.arguments.contains_key(*f))
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            let anchor = self.scorer.score(message, descriptor).and_then(|m| m.trigger);
            let repaired = extract_arguments(descriptor, message, anchor.as_deref(), session)
                .map_err(|field| format!("missing required field '{}'", field))?;
            for field in missing {
                let value = repaired
                    .get(&field)
                    .cloned()
                    .ok_or_else(|| format!("missing required field '{}'", field))?;
                tracing::debug!(capability = %descriptor.name, field = %field, "argument repaired from message");
                step = step.literal(field, value);
            }
        }

        if let Some(dep) = proposed.depends_on {
            match dep
                .checked_sub(1)
                .and_then(|d| index_map.get(d).copied().flatten())
            {
                Some(target) => {
                    step.depends_on = Some(step.depends_on.map_or(target, |d| d.max(target)));
                }
                None => {
                    tracing::debug!(capability = %descriptor.name, depends_on = dep, "dangling dependency removed");
                }
            }
        }
        Ok(step)
    }
}

/// 占位符绑定：{{step_N}} 指向已保留的更早步骤时直接绑定；
/// 否则绑定最近一个产出种类与字段匹配的步骤，再否则最近的步骤
fn bind_placeholder(
    placeholder: Placeholder,
    accepts: Option<ValueKind>,
    kept: &[(InvocationPlanStep, ValueKind)],
    index_map: &[Option<usize>],
) -> Option<usize> {
    if let Placeholder::Step(n) = placeholder {
        if let Some(Some(target)) = index_map.get(n) {
            return Some(*target);
        }
    }
    accepts
        .and_then(|kind| kept.iter().rposition(|(_, k)| *k == kind))
        .or_else(|| kept.len().checked_sub(1))
}

/// 参数里是否有占位符
pub fn has_placeholder(step: &InvocationPlanStep) -> bool {
    step.arguments.values().any(|a| matches!(a, ArgValue::FromStep(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, ScriptedLlmClient, ScriptedReply};
    use crate::pipeline::triggers::KeywordScorer;
    use crate::tools::{Capability, FieldSpec, FieldType};
    use async_trait::async_trait;
    use serde_json::{json, Map};

    struct Fake(CapabilityDescriptor);

    #[async_trait]
    impl Capability for Fake {
        fn descriptor(&self) -> CapabilityDescriptor {
            self.0.clone()
        }

        async fn invoke(&self, _args: Map<String, Value>) -> Result<Value, String> {
            Ok(json!("ok"))
        }
    }

    fn registry() -> Arc<CapabilityRegistry> {
        let mut r = CapabilityRegistry::new();
        let caps = [
            CapabilityDescriptor::new("get_weather", "Get current weather for a location", ValueKind::Weather)
                .field(
                    "location",
                    FieldSpec::required(FieldType::String, "place").accepts(ValueKind::Location),
                ),
            CapabilityDescriptor::new("location_search", "Find a place", ValueKind::Location)
                .field("query", FieldSpec::required(FieldType::String, "query").accepts(ValueKind::Text)),
            CapabilityDescriptor::new("duckduckgo_search", "Search the web", ValueKind::Links)
                .field("query", FieldSpec::required(FieldType::String, "query").accepts(ValueKind::Text))
                .field("max_results", FieldSpec::optional(FieldType::Integer, json!(5), "limit")),
            CapabilityDescriptor::new("youtube_search", "Search videos", ValueKind::Links)
                .field("query", FieldSpec::required(FieldType::String, "query").accepts(ValueKind::Text)),
        ];
        for d in caps {
            r.register_capability(Fake(d)).unwrap();
        }
        Arc::new(r)
    }

    fn planner(llm: Arc<dyn LlmClient>) -> Planner {
        Planner::new(registry(), llm, Arc::new(KeywordScorer::default()), PlannerSettings::default())
    }

    #[tokio::test]
    async fn test_heuristic_weather_plan() {
        let plan = planner(Arc::new(MockLlmClient))
            .plan("What's the weather in Tokyo?", &[], &SessionState::new())
            .await;
        assert_eq!(plan.source, PlanSource::Heuristic);
        assert_eq!(plan.intent, "weather");
        assert_eq!(plan.capability_names(), vec!["get_weather"]);
        assert_eq!(
            plan.steps[0].arguments.get("location"),
            Some(&ArgValue::Literal(json!("Tokyo")))
        );
    }

    #[tokio::test]
    async fn test_mixed_request_takes_place_after_weather_trigger() {
        let plan = planner(Arc::new(MockLlmClient))
            .plan("Search for Rust news and the weather in Paris", &[], &SessionState::new())
            .await;
        let weather = plan
            .steps
            .iter()
            .find(|s| s.capability_name == "get_weather")
            .unwrap();
        assert_eq!(weather.arguments.get("location"), Some(&ArgValue::Literal(json!("Paris"))));
        let search = plan
            .steps
            .iter()
            .find(|s| s.capability_name == "duckduckgo_search")
            .unwrap();
        assert_eq!(search.arguments.get("query"), Some(&ArgValue::Literal(json!("Rust news"))));
    }

    #[tokio::test]
    async fn test_no_capability_needed() {
        let plan = planner(Arc::new(MockLlmClient))
            .plan("Tell me a joke", &[], &SessionState::new())
            .await;
        assert!(plan.is_empty());
        assert_eq!(plan.source, PlanSource::None);
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_to_heuristics() {
        let llm = Arc::new(ScriptedLlmClient::always(ScriptedReply::Fail("quota".into())));
        let plan = planner(llm)
            .plan("Search for rust news and the weather in Paris", &[], &SessionState::new())
            .await;
        let names = plan.capability_names();
        assert!(names.contains(&"get_weather"));
        assert!(names.contains(&"duckduckgo_search"));
        assert!(!names.contains(&"youtube_search"));
    }

    #[tokio::test]
    async fn test_unknown_capability_rejected_and_merged() {
        let llm = Arc::new(ScriptedLlmClient::always(ScriptedReply::Text(
            r#"{"intent":"travel","rationale":"r","steps":[
                {"capability":"teleport","arguments":{}},
                {"capability":"get_weather","arguments":{"location":"Tokyo","bogus":1}}
            ]}"#
            .into(),
        )));
        let plan = planner(llm)
            .plan("What's the weather in Tokyo? search for sushi", &[], &SessionState::new())
            .await;
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].capability_name, "teleport");
        assert_eq!(plan.source, PlanSource::Merged);
        assert_eq!(plan.capability_names(), vec!["get_weather", "duckduckgo_search"]);
        assert_eq!(plan.intent, "travel");
        assert!(!plan.steps[0].arguments.contains_key("bogus"));
    }

    #[tokio::test]
    async fn test_placeholder_binds_to_matching_kind() {
        let llm = Arc::new(ScriptedLlmClient::always(ScriptedReply::Text(
            r#"{"intent":"travel","rationale":"r","steps":[
                {"capability":"location_search","arguments":{"query":"Eiffel Tower"}},
                {"capability":"duckduckgo_search","arguments":{"query":"Eiffel Tower tickets"}},
                {"capability":"get_weather","arguments":{"location":"the previous result"}}
            ]}"#
            .into(),
        )));
        let plan = planner(llm).plan("plan my visit", &[], &SessionState::new()).await;
        assert_eq!(plan.source, PlanSource::Llm);
        let weather = &plan.steps[2];
        assert_eq!(weather.arguments.get("location"), Some(&ArgValue::FromStep(0)));
        assert_eq!(weather.depends_on, Some(0));
        assert!(has_placeholder(weather));
    }

    #[tokio::test]
    async fn test_placeholder_in_first_step_rejected() {
        let llm = Arc::new(ScriptedLlmClient::always(ScriptedReply::Text(
            r#"{"steps":[{"capability":"get_weather","arguments":{"location":"{{previous}}"}}]}"#.into(),
        )));
        let plan = planner(llm).plan("hmm", &[], &SessionState::new()).await;
        assert!(plan.is_empty());
        assert_eq!(plan.rejected.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_location_repaired_from_session() {
        let mut session = SessionState::new();
        session.insert("last_location".into(), json!("Osaka"));
        let plan = planner(Arc::new(MockLlmClient))
            .plan("Will it rain there tomorrow?", &[], &session)
            .await;
        assert_eq!(plan.capability_names(), vec!["get_weather"]);
        assert_eq!(
            plan.steps[0].arguments.get("location"),
            Some(&ArgValue::Literal(json!("Osaka")))
        );
    }

    #[tokio::test]
    async fn test_max_steps_enforced() {
        let mut p = planner(Arc::new(MockLlmClient));
        p.settings.max_steps = 1;
        let plan = p
            .plan("Search for rust news and the weather in Paris", &[], &SessionState::new())
            .await;
        assert_eq!(plan.len(), 1);
        assert!(plan.rejected.iter().any(|r| r.reason.contains("exceeds")));
    }
}
