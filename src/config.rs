//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONCIERGE__*` 覆盖
//! （双下划线表示嵌套，如 `CONCIERGE__LLM__PROVIDER=openai`、`CONCIERGE__MEMORY__SESSION_SCOPE=per_client`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::memory::SearchWeights;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub planner: PlannerSection,
    pub memory: MemorySection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "concierge".to_string(),
        }
    }
}

/// [llm] 段：后端选择与超时。API Key 只从环境变量读取
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / deepseek / mock；对应 Key 缺失时退回 mock
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次补全请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [tools] 段：单次调用超时、并发上限与各适配器参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub call_timeout_secs: u64,
    pub max_concurrent_calls: usize,
    pub weather: WeatherSection,
    pub search: SearchSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            call_timeout_secs: 15,
            max_concurrent_calls: 4,
            weather: WeatherSection::default(),
            search: SearchSection::default(),
        }
    }
}

impl ToolsSection {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }
}

/// [tools.weather] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherSection {
    /// 未设置时读 OPENWEATHER_API_KEY
    pub api_key: Option<String>,
    pub units: String,
}

impl Default for WeatherSection {
    fn default() -> Self {
        Self {
            api_key: None,
            units: "metric".to_string(),
        }
    }
}

impl WeatherSection {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("OPENWEATHER_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// [tools.search] 段：HTTP 超时、默认结果数、User-Agent（Nominatim 要求可识别的 UA）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub timeout_secs: u64,
    pub max_results: usize,
    pub user_agent: String,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_results: 5,
            user_agent: crate::tools::http::DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl SearchSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// [planner] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    /// 是否请求 LLM 给出规划建议
    pub use_llm: bool,
    pub max_steps: usize,
    /// 能力名 -> 追加的触发短语
    pub triggers: HashMap<String, Vec<String>>,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            use_llm: true,
            max_steps: 5,
            triggers: HashMap::new(),
        }
    }
}

/// 会话区共享范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionScope {
    /// 所有客户端共用一个上下文
    #[default]
    Shared,
    /// 每个客户端独立的记忆文件与会话区
    PerClient,
}

/// [memory] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub file: PathBuf,
    /// 规划与合成时带入的相关历史轮数
    pub context_turns: usize,
    pub search_results: usize,
    /// 摘要中展示的最近话题数
    pub recent_topics: usize,
    pub session_scope: SessionScope,
    pub weights: WeightsSection,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            file: PathBuf::from("conversation_memory.json"),
            context_turns: 5,
            search_results: 3,
            recent_topics: 5,
            session_scope: SessionScope::Shared,
            weights: WeightsSection::default(),
        }
    }
}

/// [memory.weights] 段：检索打分权重
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeightsSection {
    pub user_message: f32,
    pub agent_response: f32,
    pub recency: f32,
}

impl Default for WeightsSection {
    fn default() -> Self {
        let w = SearchWeights::default();
        Self {
            user_message: w.user_message,
            agent_response: w.agent_response,
            recency: w.recency,
        }
    }
}

impl From<&WeightsSection> for SearchWeights {
    fn from(w: &WeightsSection) -> Self {
        SearchWeights {
            user_message: w.user_message,
            agent_response: w.agent_response,
            recency: w.recency,
        }
    }
}

/// 从 config 目录加载配置，环境变量 CONCIERGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CONCIERGE__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONCIERGE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
