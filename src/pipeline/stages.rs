//! 计划分阶段
//!
//! 入度法拓扑分层：无依赖的步骤在第 0 阶段，其余步骤的阶段 = 所依赖步骤的最大阶段 + 1。
//! 同一阶段内步骤互不依赖，可并发执行；阶段内保持计划顺序。

use serde_json::Value;

use crate::pipeline::plan::InvocationPlanStep;

/// 返回各阶段包含的步骤下标。指向自身或之后步骤的依赖视为无效并忽略。
pub fn partition(steps: &[InvocationPlanStep]) -> Vec<Vec<usize>> {
    let mut level = vec![0usize; steps.len()];
    for (i, step) in steps.iter().enumerate() {
        level[i] = step
            .dependencies()
            .into_iter()
            .filter(|&d| d < i)
            .map(|d| level[d] + 1)
            .max()
            .unwrap_or(0);
    }

    let depth = level.iter().copied().max().map_or(0, |m| m + 1);
    let mut stages = vec![Vec::new(); depth];
    for (i, l) in level.into_iter().enumerate() {
        stages[l].push(i);
    }
    stages
}

/// 上游产出转为可代入参数的值：结构化结果优先取 chain，其次 summary
pub fn chain_value(output: &Value) -> Value {
    match output {
        Value::Object(obj) => obj
            .get("chain")
            .or_else(|| obj.get("summary"))
            .cloned()
            .unwrap_or_else(|| Value::String(output.to_string())),
        other => other.clone(),
    }
}
