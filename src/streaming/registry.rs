use super::types::{SessionState, SessionStats};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default maximum concurrent device sessions
const DEFAULT_MAX_SESSIONS: usize = 1_000;

/// Registration result
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationResult {
    /// Successfully registered
    Ok,
    /// Registration superseded an existing session for the same pair
    Replaced,
    /// Server at capacity, registration rejected
    AtCapacity,
}

/// Public view of a live session, reported on `/status`
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub pair_id: String,
    pub session_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: SessionState,
    pub stats: SessionStats,
}

struct SessionEntry {
    info: SessionInfo,
    cancel: CancellationToken,
}

/// In-memory registry of live device sessions
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_SESSIONS)
    }

    /// Create registry with custom max sessions
    pub fn with_capacity(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
        }
    }

    /// Register a session for a device pair.
    ///
    /// A session already registered under the same pair is cancelled and
    /// replaced; its connection task drains and exits on its own.
    pub fn register(
        &self,
        pair_id: String,
        session_id: Uuid,
        cancel: CancellationToken,
    ) -> RegistrationResult {
        let now = Utc::now();
        let entry = SessionEntry {
            info: SessionInfo {
                pair_id: pair_id.clone(),
                session_id,
                connected_at: now,
                last_activity: now,
                state: SessionState::AwaitingFirstPacket,
                stats: SessionStats::default(),
            },
            cancel,
        };

        let mut sessions = self.sessions.write();

        if let Some(previous) = sessions.insert(pair_id.clone(), entry) {
            previous.cancel.cancel();
            return RegistrationResult::Replaced;
        }

        if sessions.len() > self.max_sessions {
            sessions.remove(&pair_id);
            return RegistrationResult::AtCapacity;
        }

        RegistrationResult::Ok
    }

    /// Record activity for a session. Returns false if the session is no
    /// longer the registered one for its pair.
    pub fn touch(
        &self,
        pair_id: &str,
        session_id: Uuid,
        state: SessionState,
        stats: &SessionStats,
    ) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(pair_id) {
            Some(entry) if entry.info.session_id == session_id => {
                entry.info.last_activity = Utc::now();
                entry.info.state = state;
                entry.info.stats = stats.clone();
                true
            }
            _ => false,
        }
    }

    /// Remove a session, unless the pair has since been taken over by a newer one
    pub fn remove(&self, pair_id: &str, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.write();
        let is_current = sessions
            .get(pair_id)
            .is_some_and(|entry| entry.info.session_id == session_id);
        if is_current {
            sessions.remove(pair_id);
        }
        is_current
    }

    /// Get session info for a pair
    pub fn get(&self, pair_id: &str) -> Option<SessionInfo> {
        self.sessions.read().get(pair_id).map(|e| e.info.clone())
    }

    /// Get all live sessions
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self
            .sessions
            .read()
            .values()
            .map(|e| e.info.clone())
            .collect();
        sessions.sort_by(|a, b| a.pair_id.cmp(&b.pair_id));
        sessions
    }

    /// Get the count of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Cancel and remove sessions with no activity in the last N seconds
    pub fn cleanup_stale(&self, timeout_seconds: i64) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        self.sessions.write().retain(|_, entry| {
            let is_stale = (now - entry.info.last_activity).num_seconds() >= timeout_seconds;
            if is_stale {
                entry.cancel.cancel();
                removed += 1;
            }
            !is_stale
        });
        removed
    }

    /// Cancel every live session (server shutdown)
    pub fn cancel_all(&self) {
        for entry in self.sessions.read().values() {
            entry.cancel.cancel();
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = SessionRegistry::new();
        let session_id = Uuid::new_v4();

        let result = registry.register("pcb_001".to_string(), session_id, CancellationToken::new());
        assert_eq!(result, RegistrationResult::Ok);

        let info = registry.get("pcb_001").unwrap();
        assert_eq!(info.session_id, session_id);
        assert_eq!(info.state, SessionState::AwaitingFirstPacket);
        assert!(registry.get("pcb_002").is_none());
    }

    #[test]
    fn test_reconnect_replaces_and_cancels_previous() {
        let registry = SessionRegistry::new();
        let first = Uuid::new_v4();
        let first_cancel = CancellationToken::new();
        registry.register("pcb_001".to_string(), first, first_cancel.clone());

        let second = Uuid::new_v4();
        let result = registry.register("pcb_001".to_string(), second, CancellationToken::new());
        assert_eq!(result, RegistrationResult::Replaced);
        assert!(first_cancel.is_cancelled());

        // The superseded task must not evict its replacement
        assert!(!registry.touch("pcb_001", first, SessionState::Active, &SessionStats::default()));
        assert!(!registry.remove("pcb_001", first));
        assert_eq!(registry.session_count(), 1);
        assert!(registry.remove("pcb_001", second));
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_capacity() {
        let registry = SessionRegistry::with_capacity(1);
        registry.register("a".to_string(), Uuid::new_v4(), CancellationToken::new());

        let result = registry.register("b".to_string(), Uuid::new_v4(), CancellationToken::new());
        assert_eq!(result, RegistrationResult::AtCapacity);
        assert_eq!(registry.session_count(), 1);
        assert!(registry.get("b").is_none());
    }

    #[test]
    fn test_touch_updates_state() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        registry.register("pcb_001".to_string(), id, CancellationToken::new());

        let stats = SessionStats {
            pairs_emitted: 3,
            ..Default::default()
        };
        assert!(registry.touch("pcb_001", id, SessionState::Active, &stats));

        let info = registry.get("pcb_001").unwrap();
        assert_eq!(info.state, SessionState::Active);
        assert_eq!(info.stats.pairs_emitted, 3);
    }

    #[test]
    fn test_cleanup_stale_cancels_sessions() {
        let registry = SessionRegistry::new();
        let cancel = CancellationToken::new();
        registry.register("pcb_001".to_string(), Uuid::new_v4(), cancel.clone());

        assert_eq!(registry.cleanup_stale(3600), 0);
        assert_eq!(registry.cleanup_stale(0), 1);
        assert!(cancel.is_cancelled());
        assert_eq!(registry.session_count(), 0);
    }
}
