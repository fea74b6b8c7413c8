use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tokio::time::Instant;

/// Speaker of a turn.
///
/// `user` and `assistant` are the two values the relay writes itself. Any other
/// value is stored verbatim; it is only normalized when the prompt is rendered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
    Other(String),
}

impl Role {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Other(raw) => raw,
        }
    }

    /// True for `assistant` in any case or padding.
    pub fn is_assistant(&self) -> bool {
        match self {
            Role::Assistant => true,
            Role::User => false,
            Role::Other(raw) => raw.trim().eq_ignore_ascii_case("assistant"),
        }
    }
}

impl From<String> for Role {
    fn from(raw: String) -> Self {
        Role::parse(&raw)
    }
}

impl From<&str> for Role {
    fn from(raw: &str) -> Self {
        Role::parse(raw)
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remembered message. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Stored state of a single conversation, private to the store.
#[derive(Debug)]
pub(crate) struct ConversationRecord {
    /// Oldest first, never longer than the store's `max_turns`
    pub turns: VecDeque<Turn>,
    pub last_activity: Instant,
    /// Store-wide access counter value at the last touch
    pub tick: u64,
}

impl ConversationRecord {
    pub fn new(max_turns: usize, now: Instant, tick: u64) -> Self {
        Self {
            turns: VecDeque::with_capacity(max_turns),
            last_activity: now,
            tick,
        }
    }

    pub fn touch(&mut self, now: Instant, tick: u64) {
        self.last_activity = now;
        self.tick = tick;
    }

    /// Appends at the tail and drops from the head until within `max_turns`.
    pub fn push(&mut self, turn: Turn, max_turns: usize) {
        self.turns.push_back(turn);
        while self.turns.len() > max_turns {
            self.turns.pop_front();
        }
    }

    pub fn is_expired(&self, now: Instant, ttl: Option<std::time::Duration>) -> bool {
        match ttl {
            Some(ttl) => now.saturating_duration_since(self.last_activity) > ttl,
            None => false,
        }
    }
}

/// Store bookkeeping, reported by the readiness endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub conversations: usize,
    pub turns: usize,
    pub max_conversations: usize,
    pub max_turns: usize,
    pub ttl_seconds: u64,
}
