use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Telegram-style numeric user identifier
pub type UserId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One role-tagged message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Complete memory of one user.
///
/// `summary` covers exactly the turns that were removed from the front of
/// `turns`; a turn never appears in both.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationState {
    pub user_id: UserId,

    /// Running summary of compacted turns (empty until the first summarization)
    pub summary: String,

    /// Chronological turns kept verbatim
    pub turns: Vec<Turn>,

    /// Recorded interactions, drives periodic autosave
    pub interaction_count: u64,

    pub last_access: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            summary: String::new(),
            turns: Vec::new(),
            interaction_count: 0,
            last_access: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_empty() && self.turns.is_empty()
    }

    pub fn touch(&mut self) {
        self.last_access = Utc::now();
    }

    /// Append a user/assistant pair and count the interaction.
    pub fn push_exchange(&mut self, user_text: &str, assistant_text: &str) {
        self.turns.push(Turn::user(user_text));
        self.turns.push(Turn::assistant(assistant_text));
        self.interaction_count += 1;
        self.touch();
    }
}

/// Persisted form of a [`ConversationState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub user_id: UserId,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub messages: Vec<Turn>,
    #[serde(with = "iso8601")]
    pub last_access: DateTime<Utc>,
    #[serde(default)]
    pub message_count: usize,
    #[serde(default)]
    pub interaction_count: u64,
}

impl From<&ConversationState> for Snapshot {
    fn from(state: &ConversationState) -> Self {
        Self {
            user_id: state.user_id,
            summary: state.summary.clone(),
            messages: state.turns.clone(),
            last_access: state.last_access,
            message_count: state.turns.len(),
            interaction_count: state.interaction_count,
        }
    }
}

impl From<Snapshot> for ConversationState {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            user_id: snapshot.user_id,
            summary: snapshot.summary,
            turns: snapshot.messages,
            interaction_count: snapshot.interaction_count,
            last_access: snapshot.last_access,
        }
    }
}

/// Directory entry of a persisted snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    pub user_id: UserId,
    /// File modification time, the source of truth for cleanup
    pub modified: SystemTime,
    pub size_bytes: u64,
}

/// Memory usage statistics for monitoring
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub users_in_ram: usize,
    pub total_users_on_disk: usize,
    pub estimated_tokens: usize,
    pub estimated_ram_bytes: u64,
    pub disk_bytes: u64,
    pub summarizations: u64,
    pub degraded_summarizations: u64,
    pub evictions: u64,
    pub persist_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub max_cached_users: usize,
}

/// RFC 3339 timestamps; naive `YYYY-MM-DDTHH:MM:SS[.f]` values are read as UTC.
mod iso8601 {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_exchange_appends_pair() {
        let mut state = ConversationState::new(7);
        state.push_exchange("hello", "hi there");

        assert_eq!(state.turns, vec![Turn::user("hello"), Turn::assistant("hi there")]);
        assert_eq!(state.interaction_count, 1);
        assert!(!state.is_empty());
    }

    #[test]
    fn test_snapshot_wire_format() {
        let mut state = ConversationState::new(123);
        state.summary = "User asked about RAG.".to_string();
        state.push_exchange("Ciao", "Ciao! Come posso aiutarti?");

        let json = serde_json::to_value(Snapshot::from(&state)).unwrap();
        assert_eq!(json["user_id"], 123);
        assert_eq!(json["summary"], "User asked about RAG.");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][1]["role"], "assistant");
        assert_eq!(json["message_count"], 2);
        assert!(json["last_access"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_snapshot_accepts_naive_timestamp() {
        let raw = r#"{
            "user_id": 5,
            "summary": "",
            "messages": [{"role": "user", "content": "hi"}],
            "last_access": "2025-01-06T15:30:00.123456",
            "message_count": 1
        }"#;
        let snapshot: Snapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snapshot.user_id, 5);
        assert_eq!(snapshot.interaction_count, 0);
        assert_eq!(snapshot.last_access.to_rfc3339(), "2025-01-06T15:30:00.123456+00:00");
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let raw = r#"{"user_id": 1, "messages": [{"role": "tool", "content": "x"}], "last_access": "2025-01-06T15:30:00Z"}"#;
        assert!(serde_json::from_str::<Snapshot>(raw).is_err());
    }
}
