//! 能力注册表
//!
//! 所有能力实现 Capability trait（descriptor / invoke），启动期按名注册，之后只读；
//! 注册表放入 Arc 共享后不再可变，并发查找无需加锁。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::core::OrchestratorError;
use crate::tools::CapabilityDescriptor;

/// 能力调用句柄：单次请求/响应，不得修改全局状态；失败返回适配器自己的错误描述
#[async_trait]
pub trait Capability: Send + Sync {
    fn descriptor(&self) -> CapabilityDescriptor;

    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, String>;
}

#[derive(Clone)]
struct Entry {
    descriptor: Arc<CapabilityDescriptor>,
    handle: Arc<dyn Capability>,
}

/// 能力注册表：按名称有序存储，便于规划时确定性遍历
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    entries: BTreeMap<String, Entry>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        descriptor: CapabilityDescriptor,
        handle: Arc<dyn Capability>,
    ) -> Result<(), OrchestratorError> {
        if self.entries.contains_key(&descriptor.name) {
            return Err(OrchestratorError::DuplicateCapability(descriptor.name));
        }
        tracing::debug!(capability = %descriptor.name, "capability registered");
        self.entries.insert(
            descriptor.name.clone(),
            Entry {
                descriptor: Arc::new(descriptor),
                handle,
            },
        );
        Ok(())
    }

    /// 以能力自带的描述符注册
    pub fn register_capability(&mut self, capability: impl Capability + 'static) -> Result<(), OrchestratorError> {
        let descriptor = capability.descriptor();
        self.register(descriptor, Arc::new(capability))
    }

    pub fn resolve(
        &self,
        name: &str,
    ) -> Result<(Arc<CapabilityDescriptor>, Arc<dyn Capability>), OrchestratorError> {
        self.entries
            .get(name)
            .map(|e| (e.descriptor.clone(), e.handle.clone()))
            .ok_or_else(|| OrchestratorError::UnknownCapability(name.to_string()))
    }

    pub fn descriptor(&self, name: &str) -> Option<Arc<CapabilityDescriptor>> {
        self.entries.get(name).map(|e| e.descriptor.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn descriptors(&self) -> Vec<Arc<CapabilityDescriptor>> {
        self.entries.values().map(|e| e.descriptor.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 生成能力列表 JSON（name / description / parameters），拼入规划 prompt
    pub fn to_schema_json(&self) -> String {
        let caps: Vec<Value> = self
            .entries
            .values()
            .map(|e| {
                serde_json::json!({
                    "name": e.descriptor.name,
                    "description": e.descriptor.description,
                    "parameters": e.descriptor.input_schema(),
                })
            })
            .collect();
        serde_json::to_string_pretty(&caps).unwrap_or_else(|_| "[]".to_string())
    }
}
