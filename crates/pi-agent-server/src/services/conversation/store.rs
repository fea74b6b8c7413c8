use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::types::{ConversationRecord, Role, StoreStats, Turn};
use crate::config::MemoryConfig;

/// Limits applied by the store, already clamped to sane values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPolicy {
    pub max_turns: usize,
    pub max_conversations: usize,
    /// `None` disables idle expiry
    pub ttl: Option<Duration>,
}

impl MemoryPolicy {
    /// Zero or negative sizes become 1, a non-positive TTL disables expiry.
    pub fn new(max_turns: i64, ttl: Duration, max_conversations: i64) -> Self {
        Self {
            max_turns: clamp_capacity(max_turns),
            max_conversations: clamp_capacity(max_conversations),
            ttl: (!ttl.is_zero()).then_some(ttl),
        }
    }
}

impl From<&MemoryConfig> for MemoryPolicy {
    fn from(cfg: &MemoryConfig) -> Self {
        let ttl = Duration::from_secs(cfg.ttl_seconds.max(0).unsigned_abs());
        Self::new(cfg.max_turns, ttl, cfg.max_conversations)
    }
}

fn clamp_capacity(value: i64) -> usize {
    usize::try_from(value.max(1)).unwrap_or(usize::MAX)
}

/// Bounded in-memory conversation memory.
///
/// Keeps a sliding window of `max_turns` per conversation, drops conversations
/// idle for longer than the TTL when they are next accessed, and evicts the
/// least recently active conversation once more than `max_conversations` exist.
///
/// Every operation runs inside one short critical section; the lock is never
/// held across an `.await`.
pub struct ConversationStore {
    policy: MemoryPolicy,
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<String, ConversationRecord>,
    /// Bumped on every touch, orders records that share an `Instant`
    tick: u64,
}

impl StoreInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Removes `id` if it has been idle past the TTL. Returns true when removed.
    fn expire_if_idle(&mut self, id: &str, now: Instant, ttl: Option<Duration>) -> bool {
        let expired = self
            .records
            .get(id)
            .is_some_and(|record| record.is_expired(now, ttl));
        if expired {
            self.records.remove(id);
            debug!("Conversation {} expired, removed from memory", id);
        }
        expired
    }

    /// Evicts the least recently active record other than `keep`.
    fn evict_lru(&mut self, keep: &str) -> Option<String> {
        let victim = self
            .records
            .iter()
            .filter(|(id, _)| id.as_str() != keep)
            .min_by(|(a_id, a), (b_id, b)| {
                (a.last_activity, a.tick, a_id.as_str()).cmp(&(b.last_activity, b.tick, b_id.as_str()))
            })
            .map(|(id, _)| id.clone())?;
        self.records.remove(&victim);
        Some(victim)
    }
}

impl ConversationStore {
    pub fn new(policy: MemoryPolicy) -> Self {
        info!(
            "Initializing conversation store: max_turns={}, max_conversations={}, ttl={:?}",
            policy.max_turns, policy.max_conversations, policy.ttl
        );
        Self {
            policy,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    pub fn policy(&self) -> MemoryPolicy {
        self.policy
    }

    /// Snapshot of the turns of `id`, oldest first.
    ///
    /// Absent and expired conversations yield an empty history and are not
    /// created. A hit refreshes the conversation's recency.
    pub fn get(&self, id: &str) -> Vec<Turn> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.expire_if_idle(id, now, self.policy.ttl) {
            return Vec::new();
        }

        let tick = inner.next_tick();
        match inner.records.get_mut(id) {
            Some(record) => {
                record.touch(now, tick);
                record.turns.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Appends a turn to `id`, creating the conversation if needed.
    ///
    /// An expired conversation is dropped first so the append starts a fresh
    /// history. When the store grows past `max_conversations` the least
    /// recently active other conversation is evicted.
    pub fn append(&self, id: &str, role: impl Into<Role>, content: impl Into<String>) {
        let turn = Turn::new(role.into(), content);
        let now = Instant::now();
        let max_turns = self.policy.max_turns;

        let mut inner = self.inner.lock();
        inner.expire_if_idle(id, now, self.policy.ttl);

        let tick = inner.next_tick();
        let record = inner
            .records
            .entry(id.to_string())
            .or_insert_with(|| ConversationRecord::new(max_turns, now, tick));
        record.push(turn, max_turns);
        record.touch(now, tick);

        if inner.records.len() > self.policy.max_conversations {
            if let Some(evicted) = inner.evict_lru(id) {
                debug!("Conversation capacity reached, evicted {}", evicted);
            }
        }
    }

    /// Number of live conversations, expired ones included until next touched.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        StoreStats {
            conversations: inner.records.len(),
            turns: inner.records.values().map(|r| r.turns.len()).sum(),
            max_conversations: self.policy.max_conversations,
            max_turns: self.policy.max_turns,
            ttl_seconds: self.policy.ttl.map_or(0, |ttl| ttl.as_secs()),
        }
    }
}
