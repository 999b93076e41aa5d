//! 编排器构建：统一的初始化逻辑
//!
//! REPL、memory-check 与测试共用同一套装配：LLM 选择、能力注册、记忆存储、打分器。
//! 任一组件可用 with_* 替换（测试注入假能力与脚本化 LLM）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::{AppConfig, SessionScope};
use crate::core::orchestrator::{ContextSettings, Orchestrator};
use crate::core::OrchestratorError;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::{MemoryStore, SearchWeights};
use crate::pipeline::{ExecutionCoordinator, IntentScorer, KeywordScorer, Planner, PlannerSettings, Synthesizer, TriggerTable};
use crate::tools::{
    CapabilityExecutor, CapabilityRegistry, DistanceCapability, Geocoder, LocationSearchCapability,
    VideoSearchCapability, WeatherCapability, WebSearchCapability,
};

/// 根据配置与环境变量选择 LLM 后端；没有可用 Key 时退回 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let timeout = Duration::from_secs(cfg.llm.timeouts.request.max(1));
    let deepseek_key = env_key("DEEPSEEK_API_KEY");
    let openai_key = env_key("OPENAI_API_KEY");

    if provider == "mock" {
        tracing::info!("Using Mock LLM (configured)");
        return Arc::new(MockLlmClient);
    }

    // 配置为 deepseek 或只有 DeepSeek Key 时走 DeepSeek 兼容端点
    let deepseek = match (&deepseek_key, &openai_key) {
        (Some(k), _) if provider == "deepseek" || openai_key.is_none() => Some(k.clone()),
        (None, Some(k)) if provider == "deepseek" => Some(k.clone()),
        _ => None,
    };

    if let Some(key) = deepseek {
        let client = OpenAiClient::deepseek(cfg.llm.model.as_deref(), &key, timeout);
        tracing::info!(model = cfg.llm.model.as_deref().unwrap_or("deepseek-chat"), "Using DeepSeek LLM");
        Arc::new(client)
    } else if let Some(key) = openai_key {
        let model = cfg.llm.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
        tracing::info!(model = %model, "Using OpenAI LLM");
        Arc::new(OpenAiClient::new(cfg.llm.base_url.as_deref(), &model, &key, timeout))
    } else {
        tracing::warn!("No API key set, using Mock LLM");
        Arc::new(MockLlmClient)
    }
}

fn env_key(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|k| !k.trim().is_empty())
}

/// 注册五个内置能力
pub fn build_registry(cfg: &AppConfig) -> Result<CapabilityRegistry, OrchestratorError> {
    let search = &cfg.tools.search;
    let geocoder = Geocoder::new(search.timeout(), &search.user_agent);

    let mut registry = CapabilityRegistry::new();
    registry.register_capability(WeatherCapability::new(
        cfg.tools.weather.resolved_api_key(),
        &cfg.tools.weather.units,
        search.timeout(),
    ))?;
    registry.register_capability(LocationSearchCapability::new(geocoder.clone()))?;
    registry.register_capability(DistanceCapability::new(geocoder))?;
    registry.register_capability(WebSearchCapability::new(
        search.timeout(),
        &search.user_agent,
        search.max_results,
    ))?;
    registry.register_capability(VideoSearchCapability::new(
        search.timeout(),
        &search.user_agent,
        search.max_results,
    ))?;
    tracing::info!(capabilities = ?registry.names(), "capability registry ready");
    Ok(registry)
}

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    registry: Option<CapabilityRegistry>,
    scorer: Option<Arc<dyn IntentScorer>>,
    memory: Option<Arc<MemoryStore>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            registry: None,
            scorer: None,
            memory: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn IntentScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// 使用指定记忆文件（覆盖配置中的 memory.file）
    pub fn with_memory_file(self, path: impl AsRef<Path>) -> Self {
        let store = open_store(&self.config, path.as_ref());
        self.with_memory(Arc::new(store))
    }

    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let cfg = self.config;
        let llm = match self.llm {
            Some(llm) => llm,
            None => create_llm_from_config(&cfg),
        };
        let registry = Arc::new(match self.registry {
            Some(r) => r,
            None => build_registry(&cfg)?,
        });
        let scorer = self.scorer.unwrap_or_else(|| {
            Arc::new(KeywordScorer::new(TriggerTable::default().with_extra(&cfg.planner.triggers)))
        });
        let memory = match self.memory {
            Some(m) => m,
            None => Arc::new(open_store(&cfg, &cfg.memory.file)),
        };

        let planner = Planner::new(
            registry.clone(),
            llm.clone(),
            scorer,
            PlannerSettings {
                use_llm: cfg.planner.use_llm,
                max_steps: cfg.planner.max_steps.max(1),
            },
        );
        let executor = CapabilityExecutor::new(registry, cfg.tools.call_timeout());
        let coordinator = ExecutionCoordinator::new(executor, cfg.tools.max_concurrent_calls);
        let context = ContextSettings {
            context_turns: cfg.memory.context_turns,
            search_results: cfg.memory.search_results,
        };
        Ok(Orchestrator::new(planner, coordinator, Synthesizer::new(llm), memory, context))
    }
}

fn open_store(cfg: &AppConfig, path: &Path) -> MemoryStore {
    MemoryStore::open(path, SearchWeights::from(&cfg.memory.weights)).with_recent_topics(cfg.memory.recent_topics)
}

/// 按会话范围分发编排器
///
/// Shared：所有客户端拿到同一个实例。PerClient：每个客户端一个实例，记忆写入
/// `<stem>.<client>.json`，LLM 与能力注册表在客户端之间共享。
pub struct ContextFactory {
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    registry: CapabilityRegistry,
    shared: Option<Arc<Orchestrator>>,
    per_client: Mutex<HashMap<String, Arc<Orchestrator>>>,
}

impl ContextFactory {
    pub fn new(config: AppConfig) -> Result<Self, OrchestratorError> {
        let llm = create_llm_from_config(&config);
        let registry = build_registry(&config)?;
        Self::with_parts(config, llm, registry)
    }

    pub fn with_parts(
        config: AppConfig,
        llm: Arc<dyn LlmClient>,
        registry: CapabilityRegistry,
    ) -> Result<Self, OrchestratorError> {
        let shared = match config.memory.session_scope {
            SessionScope::Shared => Some(Arc::new(
                OrchestratorBuilder::new(config.clone())
                    .with_llm(llm.clone())
                    .with_registry(registry.clone())
                    .build()?,
            )),
            SessionScope::PerClient => None,
        };
        Ok(Self {
            config,
            llm,
            registry,
            shared,
            per_client: Mutex::new(HashMap::new()),
        })
    }

    pub fn scope(&self) -> SessionScope {
        self.config.memory.session_scope
    }

    /// 取得某客户端的编排器（PerClient 下首次访问时创建）
    ///
    /// 载入记忆文件在锁外进行；并发首次访问时以先插入者为准。
    pub fn for_client(&self, client_id: &str) -> Result<Arc<Orchestrator>, OrchestratorError> {
        if let Some(shared) = &self.shared {
            return Ok(shared.clone());
        }
        let key = sanitize_client_id(client_id);
        if let Some(existing) = self.clients().get(&key) {
            return Ok(existing.clone());
        }

        let path = client_memory_file(&self.config.memory.file, &key);
        let built = Arc::new(
            OrchestratorBuilder::new(self.config.clone())
                .with_llm(self.llm.clone())
                .with_registry(self.registry.clone())
                .with_memory_file(&path)
                .build()?,
        );
        let orchestrator = self
            .clients()
            .entry(key)
            .or_insert_with_key(|key| {
                tracing::info!(client = %key, file = %path.display(), "new client context");
                built
            })
            .clone();
        Ok(orchestrator)
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, Arc<Orchestrator>>> {
        self.per_client.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 客户端标识只保留字母数字、`-`、`_`，其余替换为 `_`
fn sanitize_client_id(id: &str) -> String {
    let cleaned: String = id
        .trim()
        .chars()
        .take(64)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

fn client_memory_file(base: &Path, client: &str) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("conversation_memory");
    let ext = base.extension().and_then(|s| s.to_str()).unwrap_or("json");
    base.with_file_name(format!("{}.{}.{}", stem, client, ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_config(dir: &Path, scope: SessionScope) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".into();
        cfg.memory.file = dir.join("conversation_memory.json");
        cfg.memory.session_scope = scope;
        cfg
    }

    #[test]
    fn test_registry_has_five_capabilities() {
        let registry = build_registry(&AppConfig::default()).unwrap();
        assert_eq!(
            registry.names(),
            vec![
                "calculate_distance",
                "duckduckgo_search",
                "get_weather",
                "location_search",
                "youtube_search"
            ]
        );
    }

    #[test]
    fn test_client_file_naming() {
        assert_eq!(sanitize_client_id("alice@example.com"), "alice_example_com");
        assert_eq!(sanitize_client_id("  "), "default");
        assert_eq!(
            client_memory_file(Path::new("data/conversation_memory.json"), "bob"),
            PathBuf::from("data/conversation_memory.bob.json")
        );
    }

    #[test]
    fn test_shared_scope_returns_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = mock_config(dir.path(), SessionScope::Shared);
        let factory = ContextFactory::with_parts(cfg, Arc::new(MockLlmClient), CapabilityRegistry::new()).unwrap();
        let a = factory.for_client("a").unwrap();
        let b = factory.for_client("b").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_concurrent_first_access_yields_one_context() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = mock_config(dir.path(), SessionScope::PerClient);
        let factory = Arc::new(
            ContextFactory::with_parts(cfg, Arc::new(MockLlmClient), CapabilityRegistry::new()).unwrap(),
        );
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let factory = factory.clone();
                std::thread::spawn(move || factory.for_client("carol").unwrap())
            })
            .collect();
        let got: Vec<Arc<Orchestrator>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(got.iter().all(|o| Arc::ptr_eq(o, &got[0])));
        assert!(Arc::ptr_eq(&got[0], &factory.for_client("carol").unwrap()));
    }

    #[tokio::test]
    async fn test_per_client_scope_isolates_memory() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = mock_config(dir.path(), SessionScope::PerClient);
        let factory = ContextFactory::with_parts(cfg, Arc::new(MockLlmClient), CapabilityRegistry::new()).unwrap();
        let a = factory.for_client("alice").unwrap();
        let b = factory.for_client("bob").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &factory.for_client("alice").unwrap()));

        a.process_message("hello from alice").await;
        assert_eq!(a.get_memory_summary().total_turns, 1);
        assert_eq!(b.get_memory_summary().total_turns, 0);
        assert!(dir.path().join("conversation_memory.alice.json").exists());
    }
}
