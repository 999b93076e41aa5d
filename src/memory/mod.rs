//! 记忆层：对话轮次、检索分词、持久化文件、记忆存储

pub mod conversation;
pub mod persistence;
pub mod store;
pub mod tokenizer;
pub mod turn;

pub use conversation::{history_messages, Message, Role};
pub use persistence::MemoryFile;
pub use store::{MemoryStore, MemorySummary, SearchWeights};
pub use turn::{CallResult, CallStatus, ConversationTurn, SessionState, ToolCallRecord};
