//! 记忆状态检查：打印当前配置的记忆文件摘要
//!
//! 用法：`concierge-memory-check [config.toml]`

use std::path::PathBuf;

use concierge::config::{load_config, AppConfig};
use concierge::memory::{MemoryStore, SearchWeights};

fn main() -> anyhow::Result<()> {
    concierge::observability::init_with_default("warn");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let store = MemoryStore::open(&cfg.memory.file, SearchWeights::from(&cfg.memory.weights))
        .with_recent_topics(cfg.memory.recent_topics);
    let s = store.summary();
    let exists = cfg.memory.file.exists();

    println!("Conversation memory status");
    println!("{}", "=".repeat(50));
    println!("Total conversations: {}", s.total_turns);
    println!("Memory file exists: {}", exists);
    if exists {
        println!("File size: {:.2} KB", s.file_size_bytes as f64 / 1024.0);
    }

    if s.total_turns > 0 {
        let fmt = |t: Option<chrono::DateTime<chrono::Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_default();
        println!("Oldest conversation: {}", fmt(s.oldest_timestamp));
        println!("Newest conversation: {}", fmt(s.newest_timestamp));
        println!("Session data keys: {:?}", s.session_keys);
        println!("\nRecent conversation topics:");
        for (i, topic) in s.recent_topics.iter().enumerate() {
            println!("   {}. {}", i + 1, topic);
        }
    } else {
        println!("No conversations found in memory");
    }

    let location = std::fs::canonicalize(&cfg.memory.file).unwrap_or_else(|_| cfg.memory.file.clone());
    println!("\nMemory file location:\n   {}", location.display());
    Ok(())
}
