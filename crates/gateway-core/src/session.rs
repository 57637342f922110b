//! Session Persistence
//!
//! TTL-keyed blob store for per-tenant conversation state. The store
//! itself is tenant-agnostic; the caller stamps the authenticated
//! tenant into the record at save time and verifies it on load, so
//! state is observable only under the same tenant identity.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Opaque, unguessable session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One persisted session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,

    /// Owning tenant; verified by the caller on load
    pub tenant: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Opaque state blob
    pub state: serde_json::Value,

    /// Time-to-live, refreshed on every save
    pub ttl_secs: u64,
}

impl SessionRecord {
    pub fn new(tenant: impl Into<String>, state: serde_json::Value, ttl_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            tenant: tenant.into(),
            created_at: now,
            updated_at: now,
            state,
            ttl_secs,
        }
    }

    /// Refresh the activity timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Pluggable session store
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a record, refreshing its TTL
    async fn save(&self, record: &SessionRecord) -> Result<()>;

    /// Load a record; `None` when absent or expired
    async fn load(&self, id: &SessionId) -> Result<Option<SessionRecord>>;

    /// Remove a record (absent is not an error)
    async fn delete(&self, id: &SessionId) -> Result<()>;

    /// Whether a live record exists
    async fn exists(&self, id: &SessionId) -> Result<bool>;
}

#[derive(Clone, Debug)]
struct StoredSession {
    record: SessionRecord,
    expires_at: DateTime<Utc>,
}

const DEFAULT_MAX_SESSIONS: usize = 10_000;

/// In-memory session store with lazy expiry.
///
/// Expired entries are evicted on access rather than by a background
/// sweeper. Size is bounded: past `max_sessions`, the entries closest
/// to expiry are evicted first.
pub struct MemorySessionStore {
    entries: RwLock<HashMap<String, StoredSession>>,
    max_sessions: usize,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}

impl MemorySessionStore {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_sessions: max_sessions.max(1),
        }
    }

    fn evict_soonest_expiring(entries: &mut HashMap<String, StoredSession>) {
        if let Some(key) = entries
            .iter()
            .min_by_key(|(_, s)| s.expires_at)
            .map(|(k, _)| k.clone())
        {
            entries.remove(&key);
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, record: &SessionRecord) -> Result<()> {
        let expires_at = Utc::now() + ChronoDuration::seconds(record.ttl_secs as i64);
        let mut entries = self.entries.write().unwrap();
        let key = record.id.as_str().to_string();
        if !entries.contains_key(&key) && entries.len() >= self.max_sessions {
            Self::evict_soonest_expiring(&mut entries);
        }
        entries.insert(
            key,
            StoredSession {
                record: record.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn load(&self, id: &SessionId) -> Result<Option<SessionRecord>> {
        let now = Utc::now();
        {
            let entries = self.entries.read().unwrap();
            match entries.get(id.as_str()) {
                None => return Ok(None),
                Some(stored) if stored.expires_at > now => {
                    return Ok(Some(stored.record.clone()));
                }
                Some(_) => {}
            }
        }
        // Expired: evict lazily.
        self.entries.write().unwrap().remove(id.as_str());
        Ok(None)
    }

    async fn delete(&self, id: &SessionId) -> Result<()> {
        self.entries.write().unwrap().remove(id.as_str());
        Ok(())
    }

    async fn exists(&self, id: &SessionId) -> Result<bool> {
        Ok(self.load(id).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trip() {
        let store = MemorySessionStore::default();
        let record = SessionRecord::new("t1", json!({"k": 1}), 3600);
        let id = record.id.clone();

        store.save(&record).await.unwrap();
        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.state, json!({"k": 1}));
        assert_eq!(loaded.tenant, "t1");
        assert!(store.exists(&id).await.unwrap());

        store.delete(&id).await.unwrap();
        assert!(store.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_records_vanish() {
        let store = MemorySessionStore::default();
        let record = SessionRecord::new("t1", json!({"k": 1}), 0);
        let id = record.id.clone();

        store.save(&record).await.unwrap();
        assert!(store.load(&id).await.unwrap().is_none());
        assert!(!store.exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn overflow_evicts_soonest_expiring() {
        let store = MemorySessionStore::new(2);
        let short = SessionRecord::new("t1", json!(1), 10);
        let long_a = SessionRecord::new("t1", json!(2), 3600);
        let long_b = SessionRecord::new("t1", json!(3), 3600);

        store.save(&short).await.unwrap();
        store.save(&long_a).await.unwrap();
        store.save(&long_b).await.unwrap();

        assert!(store.load(&short.id).await.unwrap().is_none());
        assert!(store.load(&long_a.id).await.unwrap().is_some());
        assert!(store.load(&long_b.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn resaving_refreshes_ttl() {
        let store = MemorySessionStore::default();
        let mut record = SessionRecord::new("t1", json!({"turn": 1}), 3600);
        store.save(&record).await.unwrap();

        record.state = json!({"turn": 2});
        record.touch();
        store.save(&record).await.unwrap();

        let loaded = store.load(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, json!({"turn": 2}));
    }
}
