//! 记忆持久化
//!
//! 单文件 JSON：`{conversation_history, session_memory, last_updated}`。
//! 写入先落临时文件再 rename，避免进程中断留下半截文件；父目录不存在时自动创建。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::OrchestratorError;
use crate::memory::turn::parse_timestamp;
use crate::memory::{ConversationTurn, SessionState};

/// 持久化文件的完整结构
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryFile {
    #[serde(default)]
    pub conversation_history: Vec<ConversationTurn>,
    #[serde(default)]
    pub session_memory: SessionState,
    #[serde(default, deserialize_with = "deserialize_last_updated")]
    pub last_updated: Option<DateTime<Utc>>,
}

fn deserialize_last_updated<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|s| parse_timestamp(&s).map_err(serde::de::Error::custom))
        .transpose()
}

impl MemoryFile {
    pub fn new(history: Vec<ConversationTurn>, session: SessionState) -> Self {
        Self {
            conversation_history: history,
            session_memory: session,
            last_updated: Some(Utc::now()),
        }
    }
}

/// 从文件读取；文件不存在时返回 None
pub async fn read_memory_file(path: &Path) -> Result<Option<MemoryFile>, OrchestratorError> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    parse_memory_file(path, &data).map(Some)
}

/// 同步读取，供启动期加载使用
pub fn read_memory_file_blocking(path: &Path) -> Result<Option<MemoryFile>, OrchestratorError> {
    let data = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    parse_memory_file(path, &data).map(Some)
}

fn parse_memory_file(path: &Path, data: &str) -> Result<MemoryFile, OrchestratorError> {
    if data.trim().is_empty() {
        return Ok(MemoryFile::default());
    }
    serde_json::from_str(data)
        .map_err(|e| OrchestratorError::Persistence(format!("{}: {}", path.display(), e)))
}

/// 原子写入：同目录临时文件 + rename
pub async fn write_memory_file(path: &Path, file: &MemoryFile) -> Result<(), OrchestratorError> {
    let body = serde_json::to_string_pretty(file)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, body).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "memory".into());
    name.push(".tmp");
    path.with_file_name(name)
}
