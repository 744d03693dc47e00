//! Per-user conversational memory for chat assistants.
//!
//! Recent turns live in a bounded LRU cache, older turns are folded into a
//! running summary, and every user is snapshotted to disk as JSON.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod metrics;
pub mod store;
pub mod summarizer;
pub mod tokens;
pub mod types;

pub use config::{MemoryConfig, Settings, SummarizerConfig};
pub use error::{MemoryError, Result, StoreError, SummarizerError};
pub use lifecycle::run_maintenance;
pub use manager::MemoryManager;
pub use store::{FileSnapshotStore, SnapshotStore};
pub use summarizer::{LlmSummarizer, Summarizer};
pub use tokens::{TokenEstimator, WordEstimator};
pub use types::{ConversationState, MemoryStats, Role, Snapshot, Turn, UserId};
