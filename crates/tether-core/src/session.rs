use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ToolError;

/// Guarded state here is plain data that no panic can leave half-written,
/// so a poisoned lock is still safe to use.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A logical client session. Sessions are the identity used for lock
/// ownership and nothing more.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, name: impl Into<String>, metadata: Map<String, Value>) -> Session {
        let now = Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            created_at: now,
            last_seen: now,
            metadata,
        };
        tracing::info!(session_id = %session.id, name = %session.name, "Session created");
        lock(&self.sessions).insert(session.id.clone(), session.clone());
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        lock(&self.sessions).get(session_id).cloned()
    }

    /// Sessions ordered by creation time.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<_> = lock(&self.sessions).values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Record activity. Returns `false` for an unknown session.
    pub fn touch(&self, session_id: &str) -> bool {
        match lock(&self.sessions).get_mut(session_id) {
            Some(session) => {
                session.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Remove a session. Locks it owns are left in place until they expire
    /// or are released.
    pub fn close(&self, session_id: &str) -> bool {
        let removed = lock(&self.sessions).remove(session_id).is_some();
        if removed {
            tracing::info!(session_id = %session_id, "Session closed");
        }
        removed
    }
}

/// A live lease on a named resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub resource: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Per-resource mutual exclusion with time-bounded leases.
///
/// Expiry is detected lazily on the next `acquire` or `get` for a key; there
/// is no background sweep.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, LockInfo>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take or renew the lease on `resource` for `ttl`.
    ///
    /// Fails with `ResourceLocked` while another session holds a live lease.
    /// Re-acquiring one's own lease extends it.
    pub fn acquire(
        &self,
        resource: &str,
        session_id: &str,
        ttl: Duration,
    ) -> Result<LockInfo, ToolError> {
        let now = Utc::now();
        let mut locks = lock(&self.locks);

        if let Some(existing) = locks.get(resource)
            && existing.is_live(now)
            && existing.owner != session_id
        {
            tracing::warn!(
                resource = %resource,
                owner = %existing.owner,
                requester = %session_id,
                "Lock contention"
            );
            return Err(ToolError::ResourceLocked {
                resource: resource.to_string(),
                owner: existing.owner.clone(),
            });
        }

        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let info = LockInfo {
            resource: resource.to_string(),
            owner: session_id.to_string(),
            expires_at,
        };
        locks.insert(resource.to_string(), info.clone());

        tracing::debug!(resource = %resource, owner = %session_id, expires_at = %expires_at, "Lock acquired");
        Ok(info)
    }

    /// Give up a lease. `Ok(false)` when nothing is held on `resource`.
    pub fn release(&self, resource: &str, session_id: &str) -> Result<bool, ToolError> {
        let mut locks = lock(&self.locks);

        let Some(current) = locks.get(resource) else {
            return Ok(false);
        };
        if !current.is_live(Utc::now()) {
            locks.remove(resource);
            return Ok(false);
        }
        if current.owner != session_id {
            return Err(ToolError::ResourceLocked {
                resource: resource.to_string(),
                owner: current.owner.clone(),
            });
        }

        locks.remove(resource);
        tracing::debug!(resource = %resource, owner = %session_id, "Lock released");
        Ok(true)
    }

    /// The live lease on `resource`, clearing it first if it has expired.
    pub fn get(&self, resource: &str) -> Option<LockInfo> {
        let mut locks = lock(&self.locks);
        match locks.get(resource) {
            Some(info) if info.is_live(Utc::now()) => Some(info.clone()),
            Some(_) => {
                locks.remove(resource);
                None
            }
            None => None,
        }
    }

    /// Number of entries in the table, expired-but-unswept ones included.
    pub fn len(&self) -> usize {
        lock(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn session_create_list_close() {
        let sessions = SessionManager::new();
        let s = sessions.create("modeler", Map::new());
        assert!(!s.id.is_empty());
        assert_eq!(s.name, "modeler");
        assert_eq!(s.created_at, s.last_seen);

        assert!(sessions.list().iter().any(|x| x.id == s.id));
        assert!(sessions.get(&s.id).is_some());

        assert!(sessions.close(&s.id));
        assert!(sessions.get(&s.id).is_none());
        assert!(!sessions.close(&s.id));
    }

    #[test]
    fn touch_updates_last_seen() {
        let sessions = SessionManager::new();
        let s = sessions.create("a", Map::new());
        sleep(Duration::from_millis(5));
        assert!(sessions.touch(&s.id));
        let after = sessions.get(&s.id).unwrap();
        assert!(after.last_seen > s.last_seen);
        assert!(!sessions.touch("missing"));
    }

    #[test]
    fn lock_exclusivity_until_ttl() {
        let locks = LockManager::new();
        locks
            .acquire("object:Cube.001", "A", Duration::from_millis(50))
            .unwrap();

        let err = locks
            .acquire("object:Cube.001", "B", Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(
            err,
            ToolError::ResourceLocked {
                resource: "object:Cube.001".into(),
                owner: "A".into()
            }
        );

        sleep(Duration::from_millis(70));
        let info = locks
            .acquire("object:Cube.001", "B", Duration::from_secs(1))
            .unwrap();
        assert_eq!(info.owner, "B");
    }

    #[test]
    fn same_owner_renews() {
        let locks = LockManager::new();
        let first = locks.acquire("obj:1", "A", Duration::from_secs(1)).unwrap();
        let renewed = locks.acquire("obj:1", "A", Duration::from_secs(10)).unwrap();
        assert!(renewed.expires_at > first.expires_at);
    }

    #[test]
    fn release_checks_ownership() {
        let locks = LockManager::new();
        locks.acquire("obj:1", "A", Duration::from_secs(5)).unwrap();

        assert!(matches!(
            locks.release("obj:1", "B"),
            Err(ToolError::ResourceLocked { owner, .. }) if owner == "A"
        ));
        assert_eq!(locks.release("obj:1", "A"), Ok(true));
        assert!(locks.get("obj:1").is_none());
        assert_eq!(locks.release("obj:1", "A"), Ok(false));
    }

    #[test]
    fn get_clears_expired_entry() {
        let locks = LockManager::new();
        locks.acquire("obj:2", "A", Duration::from_millis(10)).unwrap();
        assert_eq!(locks.get("obj:2").unwrap().owner, "A");

        sleep(Duration::from_millis(30));
        assert_eq!(locks.len(), 1);
        assert!(locks.get("obj:2").is_none());
        assert!(locks.is_empty());
    }

    #[test]
    fn closing_session_keeps_its_locks() {
        let sessions = SessionManager::new();
        let locks = LockManager::new();
        let s = sessions.create("a", Map::new());
        locks.acquire("obj:3", &s.id, Duration::from_secs(5)).unwrap();

        sessions.close(&s.id);
        assert_eq!(locks.get("obj:3").unwrap().owner, s.id);
    }
}
