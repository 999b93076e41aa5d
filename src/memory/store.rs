//! 记忆存储：追加式对话日志 + 会话键值区
//!
//! 启动时整体载入内存，所有读写都针对内存表示，写操作随后写透到持久化文件。
//! 写盘失败不回滚内存（本进程内仍可见），由调用方记录日志后继续。
//! 所有写操作经由 write_lock 串行化：多个并发轮次的 append 互斥，磁盘写入顺序与内存一致。

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::core::OrchestratorError;
use crate::memory::persistence::{
    read_memory_file, read_memory_file_blocking, write_memory_file, MemoryFile,
};
use crate::memory::tokenizer::{overlap_score, tokenize_to_set};
use crate::memory::{ConversationTurn, SessionState};

/// 检索打分权重（见 [memory.weights]）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchWeights {
    pub user_message: f32,
    pub agent_response: f32,
    /// 位置越新加分越多；默认 0，仅靠排序规则在同分时让新的排前
    pub recency: f32,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            user_message: 1.0,
            agent_response: 0.5,
            recency: 0.0,
        }
    }
}

/// get_memory_summary 的返回
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemorySummary {
    pub total_turns: usize,
    pub oldest_timestamp: Option<DateTime<Utc>>,
    pub newest_timestamp: Option<DateTime<Utc>>,
    pub recent_topics: Vec<String>,
    pub session_keys: Vec<String>,
    pub memory_file: Option<PathBuf>,
    pub file_size_bytes: u64,
}

#[derive(Default)]
struct MemoryState {
    history: Vec<ConversationTurn>,
    session: SessionState,
}

impl MemoryState {
    fn snapshot(&self) -> MemoryFile {
        MemoryFile::new(self.history.clone(), self.session.clone())
    }
}

pub struct MemoryStore {
    path: Option<PathBuf>,
    state: RwLock<MemoryState>,
    write_lock: tokio::sync::Mutex<()>,
    weights: SearchWeights,
    recent_topics: usize,
}

/// 摘要中话题的最大字符数
const TOPIC_MAX_CHARS: usize = 50;

impl MemoryStore {
    /// 打开（或新建）持久化记忆；文件损坏时记录警告并以空记忆启动
    pub fn open(path: impl AsRef<Path>, weights: SearchWeights) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match read_memory_file_blocking(&path) {
            Ok(Some(file)) => {
                tracing::info!(
                    turns = file.conversation_history.len(),
                    path = %path.display(),
                    "memory loaded"
                );
                MemoryState {
                    history: chronological(file.conversation_history),
                    session: file.session_memory,
                }
            }
            Ok(None) => MemoryState::default(),
            Err(e) => {
                tracing::warn!(error = %e, "memory file unreadable, starting empty");
                MemoryState::default()
            }
        };
        Self::with_state(Some(path), state, weights)
    }

    /// 纯内存记忆（不落盘）
    pub fn in_memory(weights: SearchWeights) -> Self {
        Self::with_state(None, MemoryState::default(), weights)
    }

    fn with_state(path: Option<PathBuf>, state: MemoryState, weights: SearchWeights) -> Self {
        Self {
            path,
            state: RwLock::new(state),
            write_lock: tokio::sync::Mutex::new(()),
            weights,
            recent_topics: 5,
        }
    }

    pub fn with_recent_topics(mut self, n: usize) -> Self {
        self.recent_topics = n;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    async fn persist(&self, snapshot: MemoryFile) -> Result<(), OrchestratorError> {
        match &self.path {
            Some(path) => write_memory_file(path, &snapshot).await,
            None => Ok(()),
        }
    }

    /// 追加一轮；时间戳早于最新一轮时上调到最新时间，保证日志时间单调。
    /// 写盘失败返回 Persistence，但内存中已保留该轮。
    pub async fn append(&self, mut turn: ConversationTurn) -> Result<(), OrchestratorError> {
        let _guard = self.write_lock.lock().await;
        let snapshot = {
            let mut state = self.write();
            if let Some(last) = state.history.last() {
                if turn.timestamp < last.timestamp {
                    tracing::debug!(turn = %turn.id, "timestamp clamped to keep log monotonic");
                    turn.timestamp = last.timestamp;
                }
            }
            state.history.push(turn);
            state.snapshot()
        };
        self.persist(snapshot).await
    }

    /// 最近 n 轮，最新的在最后
    pub fn recent(&self, n: usize) -> Vec<ConversationTurn> {
        let state = self.read();
        let start = state.history.len().saturating_sub(n);
        state.history[start..].to_vec()
    }

    /// 全部轮次（按追加顺序）
    pub fn turns(&self) -> Vec<ConversationTurn> {
        self.read().history.clone()
    }

    pub fn len(&self) -> usize {
        self.read().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().history.is_empty()
    }

    /// 相关度检索：词重叠加权 + 可选新近度；0 分不返回；同分时新的在前。结果确定。
    pub fn search(&self, query: &str, max_results: usize) -> Vec<ConversationTurn> {
        let query_tokens = tokenize_to_set(query);
        if query_tokens.is_empty() || max_results == 0 {
            return Vec::new();
        }
        let state = self.read();
        let total = state.history.len().max(1) as f32;

        let mut scored: Vec<(f32, usize)> = state
            .history
            .iter()
            .enumerate()
            .filter_map(|(idx, turn)| {
                let lexical = self.lexical_score(&query_tokens, turn);
                if lexical <= 0.0 {
                    return None;
                }
                let recency = self.weights.recency * (idx as f32 + 1.0) / total;
                Some((lexical + recency, idx))
            })
            .collect();

        scored.sort_by(|a, b| match b.0.total_cmp(&a.0) {
            Ordering::Equal => b.1.cmp(&a.1),
            other => other,
        });

        scored
            .into_iter()
            .take(max_results)
            .map(|(_, idx)| state.history[idx].clone())
            .collect()
    }

    fn lexical_score(&self, query_tokens: &HashSet<String>, turn: &ConversationTurn) -> f32 {
        let user = overlap_score(query_tokens, &tokenize_to_set(&turn.user_message)) as f32;
        let response = overlap_score(query_tokens, &tokenize_to_set(&turn.agent_response)) as f32;
        self.weights.user_message * user + self.weights.agent_response * response
    }

    /// 按话题（大小写不敏感子串）查找，旧的在前
    pub fn by_topic(&self, topic: &str, limit: usize) -> Vec<ConversationTurn> {
        let needle = topic.to_lowercase();
        if needle.trim().is_empty() {
            return Vec::new();
        }
        self.read()
            .history
            .iter()
            .filter(|t| {
                t.user_message.to_lowercase().contains(&needle)
                    || t.agent_response.to_lowercase().contains(&needle)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// 清空对话与会话区，并截断持久化文件
    pub async fn clear(&self) -> Result<(), OrchestratorError> {
        let _guard = self.write_lock.lock().await;
        let snapshot = {
            let mut state = self.write();
            state.history.clear();
            state.session.clear();
            state.snapshot()
        };
        tracing::info!("memory cleared");
        self.persist(snapshot).await
    }

    /// 导出完整日志与会话区到指定文件，返回导出的轮数
    pub async fn export(&self, path: impl AsRef<Path>) -> Result<usize, OrchestratorError> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.read().snapshot();
        let count = snapshot.conversation_history.len();
        write_memory_file(path.as_ref(), &snapshot).await?;
        tracing::info!(turns = count, path = %path.as_ref().display(), "memory exported");
        Ok(count)
    }

    /// 从文件导入，整体替换当前日志与会话区，返回导入的轮数。
    /// 导入后写透到自身文件；写透失败仅记录警告。
    pub async fn import(&self, path: impl AsRef<Path>) -> Result<usize, OrchestratorError> {
        let path = path.as_ref();
        let file = read_memory_file(path).await?.ok_or_else(|| {
            OrchestratorError::Persistence(format!("{}: file not found", path.display()))
        })?;

        let _guard = self.write_lock.lock().await;
        let count = file.conversation_history.len();
        let snapshot = {
            let mut state = self.write();
            state.history = chronological(file.conversation_history);
            state.session = file.session_memory;
            state.snapshot()
        };
        if let Err(e) = self.persist(snapshot).await {
            tracing::warn!(error = %e, "imported memory kept in process only");
        }
        tracing::info!(turns = count, path = %path.display(), "memory imported");
        Ok(count)
    }

    pub fn session(&self) -> SessionState {
        self.read().session.clone()
    }

    pub fn session_get(&self, key: &str) -> Option<Value> {
        self.read().session.get(key).cloned()
    }

    pub async fn set_session(&self, key: impl Into<String>, value: Value) -> Result<(), OrchestratorError> {
        let mut updates = SessionState::new();
        updates.insert(key.into(), value);
        self.update_session(updates).await
    }

    /// 批量合并会话键值
    pub async fn update_session(&self, updates: SessionState) -> Result<(), OrchestratorError> {
        if updates.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let snapshot = {
            let mut state = self.write();
            state.session.extend(updates);
            state.snapshot()
        };
        self.persist(snapshot).await
    }

    pub fn summary(&self) -> MemorySummary {
        let state = self.read();
        let oldest_timestamp = state.history.iter().map(|t| t.timestamp).min();
        let newest_timestamp = state.history.iter().map(|t| t.timestamp).max();
        let start = state.history.len().saturating_sub(self.recent_topics);
        let recent_topics = state.history[start..]
            .iter()
            .map(|t| truncate_topic(&t.user_message))
            .collect();
        let file_size_bytes = self
            .path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0);

        MemorySummary {
            total_turns: state.history.len(),
            oldest_timestamp,
            newest_timestamp,
            recent_topics,
            session_keys: state.session.keys().cloned().collect(),
            memory_file: self.path.clone(),
            file_size_bytes,
        }
    }
}

/// 外部文件中的轮次按时间稳定排序，保证日志时间单调
fn chronological(mut history: Vec<ConversationTurn>) -> Vec<ConversationTurn> {
    if history.windows(2).any(|w| w[1].timestamp < w[0].timestamp) {
        tracing::debug!(turns = history.len(), "reordering turns by timestamp");
        history.sort_by_key(|t| t.timestamp);
    }
    history
}

fn truncate_topic(message: &str) -> String {
    if message.chars().count() > TOPIC_MAX_CHARS {
        format!("{}...", message.chars().take(TOPIC_MAX_CHARS).collect::<String>())
    } else {
        message.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    fn turn(user: &str, response: &str) -> ConversationTurn {
        ConversationTurn::new(user, response, vec![], Default::default())
    }

    #[tokio::test]
    async fn test_recent_returns_newest_last() {
        let store = MemoryStore::in_memory(SearchWeights::default());
        for i in 0..4 {
            store.append(turn(&format!("message {}", i), "ok")).await.unwrap();
        }
        let recent = store.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].user_message, "message 2");
        assert_eq!(recent[1].user_message, "message 3");
        assert_eq!(store.recent(10).len(), 4);
        assert!(store.recent(0).is_empty());
    }

    #[tokio::test]
    async fn test_append_clamps_timestamp() {
        let store = MemoryStore::in_memory(SearchWeights::default());
        let first = turn("first", "a");
        let first_ts = first.timestamp;
        store.append(first).await.unwrap();

        let mut late = turn("second", "b");
        late.timestamp = first_ts - Duration::seconds(30);
        store.append(late).await.unwrap();

        let turns = store.turns();
        assert!(turns[1].timestamp >= turns[0].timestamp);
    }

    #[tokio::test]
    async fn test_search_ranks_overlap_and_breaks_ties_by_recency() {
        let store = MemoryStore::in_memory(SearchWeights::default());
        store.append(turn("weather in Tokyo", "sunny")).await.unwrap();
        store.append(turn("videos about cooking", "here you go")).await.unwrap();
        store.append(turn("Tokyo weather again", "rainy")).await.unwrap();
        store.append(turn("Paris weather", "cloudy")).await.unwrap();

        let hits = store.search("weather Tokyo", 3);
        let users: Vec<_> = hits.iter().map(|t| t.user_message.as_str()).collect();
        // 两条都命中 2 个词，新的排前；Paris 只命中 1 个词
        assert_eq!(users, vec!["Tokyo weather again", "weather in Tokyo", "Paris weather"]);

        let again = store.search("weather Tokyo", 3);
        assert_eq!(hits, again);
    }

    #[tokio::test]
    async fn test_search_skips_zero_scores() {
        let store = MemoryStore::in_memory(SearchWeights::default());
        store.append(turn("hello there", "hi")).await.unwrap();
        assert!(store.search("distance between cities", 5).is_empty());
        assert!(store.search("", 5).is_empty());
    }

    #[tokio::test]
    async fn test_clear_empties_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memory.json");
        let store = MemoryStore::open(&path, SearchWeights::default());
        store.append(turn("a", "b")).await.unwrap();
        store.set_session("last_location", json!("Tokyo")).await.unwrap();

        store.clear().await.unwrap();
        for n in [0, 1, 10] {
            assert!(store.recent(n).is_empty());
        }
        assert!(store.session().is_empty());

        let reopened = MemoryStore::open(&path, SearchWeights::default());
        assert!(reopened.is_empty());
    }

    #[tokio::test]
    async fn test_write_through_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memory.json");
        {
            let store = MemoryStore::open(&path, SearchWeights::default());
            store.append(turn("remember me", "sure")).await.unwrap();
            store.set_session("last_intent", json!("chat")).await.unwrap();
        }
        let store = MemoryStore::open(&path, SearchWeights::default());
        assert_eq!(store.len(), 1);
        assert_eq!(store.session_get("last_intent"), Some(json!("chat")));
    }

    #[tokio::test]
    async fn test_append_keeps_turn_when_disk_unwritable() {
        let dir = TempDir::new().unwrap();
        // 以目录作为文件路径：rename 必然失败
        let path = dir.path().join("occupied");
        std::fs::create_dir_all(path.join("child")).unwrap();
        let store = MemoryStore::with_state(Some(path), MemoryState::default(), SearchWeights::default());

        let err = store.append(turn("still here", "yes")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Persistence(_)));
        assert_eq!(store.recent(1)[0].user_message, "still here");
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let dir = TempDir::new().unwrap();
        let source = MemoryStore::in_memory(SearchWeights::default());
        source.append(turn("one", "1")).await.unwrap();
        source.append(turn("two", "2")).await.unwrap();
        source.set_session("last_location", json!("Osaka")).await.unwrap();

        let export_path = dir.path().join("export.json");
        assert_eq!(source.export(&export_path).await.unwrap(), 2);

        let target = MemoryStore::open(dir.path().join("fresh.json"), SearchWeights::default());
        assert_eq!(target.import(&export_path).await.unwrap(), 2);
        assert_eq!(target.turns(), source.turns());
        assert_eq!(target.session(), source.session());
    }

    #[tokio::test]
    async fn test_import_restores_time_order() {
        let dir = TempDir::new().unwrap();
        let noon = "2024-03-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let mut later = turn("later", "b");
        later.timestamp = noon;
        let mut earlier = turn("earlier", "a");
        earlier.timestamp = noon - Duration::hours(2);
        let path = dir.path().join("unsorted.json");
        write_memory_file(&path, &MemoryFile::new(vec![later, earlier], SessionState::new()))
            .await
            .unwrap();

        let store = MemoryStore::in_memory(SearchWeights::default());
        assert_eq!(store.import(&path).await.unwrap(), 2);
        let turns = store.turns();
        assert_eq!(turns[0].user_message, "earlier");
        assert_eq!(turns[1].timestamp, noon);

        // 之后的追加以真正最新的一轮为准
        let mut next = turn("next", "c");
        next.timestamp = noon - Duration::hours(1);
        store.append(next).await.unwrap();
        let turns = store.turns();
        assert!(turns.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(turns[2].timestamp, noon);

        let reopened = MemoryStore::open(&path, SearchWeights::default());
        assert_eq!(reopened.turns()[0].user_message, "earlier");
    }

    #[tokio::test]
    async fn test_import_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::in_memory(SearchWeights::default());
        let err = store.import(dir.path().join("nope.json")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_summary_topics_and_bounds() {
        let store = MemoryStore::in_memory(SearchWeights::default()).with_recent_topics(2);
        let long = "x".repeat(80);
        store.append(turn("first topic", "a")).await.unwrap();
        store.append(turn(&long, "b")).await.unwrap();
        store.append(turn("third topic", "c")).await.unwrap();

        let summary = store.summary();
        assert_eq!(summary.total_turns, 3);
        assert_eq!(summary.recent_topics.len(), 2);
        assert_eq!(summary.recent_topics[0], format!("{}...", "x".repeat(50)));
        assert!(summary.oldest_timestamp <= summary.newest_timestamp);
    }

    #[tokio::test]
    async fn test_by_topic_is_case_insensitive() {
        let store = MemoryStore::in_memory(SearchWeights::default());
        store.append(turn("Singapore zoo", "fun")).await.unwrap();
        store.append(turn("weather", "It is hot in SINGAPORE")).await.unwrap();
        store.append(turn("Paris", "nice")).await.unwrap();
        assert_eq!(store.by_topic("singapore", 10).len(), 2);
        assert_eq!(store.by_topic("singapore", 1)[0].user_message, "Singapore zoo");
    }
}
