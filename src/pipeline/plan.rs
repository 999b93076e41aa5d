//! 调用计划数据结构
//!
//! Plan 只存在于一轮处理中：Planner 产出，Coordinator 消费。
//! 参数值要么是字面量，要么引用前序步骤的产出（ArgValue::FromStep）。

use std::collections::{BTreeMap, BTreeSet};

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 步骤参数：字面量或「上一步结果」占位符（0 起始的步骤下标）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    Literal(Value),
    FromStep(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationPlanStep {
    pub capability_name: String,
    pub arguments: BTreeMap<String, ArgValue>,
    /// 最近的依赖步骤；依赖全集见 dependencies()
    pub depends_on: Option<usize>,
}

impl InvocationPlanStep {
    pub fn new(capability_name: impl Into<String>) -> Self {
        Self {
            capability_name: capability_name.into(),
            arguments: BTreeMap::new(),
            depends_on: None,
        }
    }

    pub fn literal(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(field.into(), ArgValue::Literal(value.into()));
        self
    }

    pub fn from_step(mut self, field: impl Into<String>, step: usize) -> Self {
        self.arguments.insert(field.into(), ArgValue::FromStep(step));
        self.depends_on = Some(self.depends_on.map_or(step, |d| d.max(step)));
        self
    }

    /// 依赖的全部步骤下标（depends_on 与参数占位符的并集）
    pub fn dependencies(&self) -> BTreeSet<usize> {
        self.arguments
            .values()
            .filter_map(|a| match a {
                ArgValue::FromStep(i) => Some(*i),
                ArgValue::Literal(_) => None,
            })
            .chain(self.depends_on)
            .collect()
    }

    /// 仅字面量参数（用于记录与审计）
    pub fn literal_arguments(&self) -> Map<String, Value> {
        self.arguments
            .iter()
            .filter_map(|(k, v)| match v {
                ArgValue::Literal(val) => Some((k.clone(), val.clone())),
                ArgValue::FromStep(_) => None,
            })
            .collect()
    }
}

/// 计划来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Heuristic,
    Llm,
    Merged,
    None,
}

impl PlanSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanSource::Heuristic => "heuristic",
            PlanSource::Llm => "llm",
            PlanSource::Merged => "merged",
            PlanSource::None => "none",
        }
    }
}

/// 校验阶段被丢弃的步骤，单独可观测
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedStep {
    pub capability_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<InvocationPlanStep>,
    pub rationale: String,
    pub intent: String,
    pub rejected: Vec<RejectedStep>,
    pub source: PlanSource,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn capability_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.capability_name.as_str()).collect()
    }
}

/// LLM 规划输出格式（也用于生成注入 prompt 的 JSON Schema）
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ProposedPlan {
    /// 简短意图标签，如 weather、travel、search、general
    #[serde(default)]
    pub intent: String,
    /// 一句话说明为什么选这些能力
    #[serde(default)]
    pub rationale: String,
    /// 有序步骤；不需要任何能力时为空数组
    #[serde(default)]
    pub steps: Vec<ProposedStep>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ProposedStep {
    /// 已注册的能力名
    #[serde(alias = "tool", alias = "name")]
    pub capability: String,
    /// 参数；可用 "{{previous}}" 或 "{{step_N}}"（N 从 1 开始）引用前序步骤结果
    #[serde(default, alias = "args", alias = "input")]
    pub arguments: Map<String, Value>,
    /// 依赖的步骤编号（从 1 开始）
    #[serde(default)]
    pub depends_on: Option<usize>,
}

pub fn proposal_schema_json() -> String {
    let schema = schema_for!(ProposedPlan);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 从 LLM 输出中取出 JSON：```json 代码块优先，否则取首个 { 到最后一个 }
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

pub fn parse_proposal(output: &str) -> Result<ProposedPlan, String> {
    let json = extract_json(output).ok_or_else(|| "no JSON object in planner output".to_string())?;
    serde_json::from_str(json).map_err(|e| format!("unparseable plan: {}", e))
}

/// 参数中的前序结果引用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Previous,
    /// 0 起始下标
    Step(usize),
}

/// 识别 {{previous}} / {{step_N}} / $previous / "the previous result"
pub fn parse_placeholder(text: &str) -> Option<Placeholder> {
    let lower = text.to_lowercase();
    if let Some(start) = lower.find("{{step_") {
        let digits: String = lower[start + 7..].chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(n) = digits.parse::<usize>() {
            if n >= 1 {
                return Some(Placeholder::Step(n - 1));
            }
        }
        return Some(Placeholder::Previous);
    }
    if lower.contains("{{previous}}") || lower.contains("$previous") || lower.contains("the previous result") {
        return Some(Placeholder::Previous);
    }
    None
}
