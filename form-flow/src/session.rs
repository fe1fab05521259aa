use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    error::{FormError, Result},
    event::OwnerId,
    fields::Fields,
    phase::PhaseId,
};

/// Server-held state of one in-progress form for one owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub owner_id: OwnerId,
    pub schema_id: String,
    pub phase: PhaseId,
    /// Shared field values
    pub fields: Fields,
    /// Repeating group the session is currently inside
    #[serde(default)]
    pub active_group: Option<String>,
    /// Completed items of the running group, in entry order
    #[serde(default)]
    pub pending_group: Vec<Fields>,
    /// Item being filled inside the running group
    #[serde(default)]
    pub current_item: Option<Fields>,
    /// Items folded out of a finished group, one record each on commit
    #[serde(default)]
    pub items: Vec<Fields>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped by every successful `put`; 0 means never stored
    #[serde(default)]
    pub version: u64,
    /// Records are written but the session could not be deleted afterwards
    #[serde(default)]
    pub committed: bool,
}

impl Session {
    pub fn new(owner_id: OwnerId, schema_id: impl Into<String>, phase: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            owner_id,
            schema_id: schema_id.into(),
            phase: phase.into(),
            fields: Fields::new(),
            active_group: None,
            pending_group: Vec::new(),
            current_item: None,
            items: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
            committed: false,
        }
    }

    pub fn in_group(&self) -> bool {
        self.active_group.is_some()
    }

    /// Shared fields overlaid with the item being filled, for prompts and branch rules
    pub fn visible_fields(&self) -> Fields {
        match &self.current_item {
            Some(item) => self.fields.merged(item),
            None => self.fields.clone(),
        }
    }

    pub fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.updated_at < cutoff
    }
}

/// Per-owner async mutexes serialising event handling for one owner
pub struct OwnerLocks {
    locks: DashMap<OwnerId, Arc<Mutex<()>>>,
}

impl OwnerLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    pub async fn acquire(&self, owner: OwnerId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.locks
                .entry(owner)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        lock.lock_owned().await
    }

    /// Drops the owner's lock if nobody holds or waits on it
    pub fn release(&self, owner: OwnerId) {
        self.locks
            .remove_if(&owner, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Drops locks nobody holds or waits on
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for OwnerLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable mapping from owner to session
///
/// `put` is a full overwrite guarded by the session version: it fails with
/// [`FormError::StaleSession`] when the stored version differs from the one
/// the caller read. Callers hold the guard from [`SessionStore::lock`] around
/// the whole read-modify-write.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, owner: OwnerId) -> Result<Option<Session>>;
    async fn put(&self, session: &mut Session) -> Result<()>;
    async fn delete(&self, owner: OwnerId) -> Result<()>;
    /// Deletes sessions not updated since `cutoff`, returning how many were removed
    async fn purge_idle(&self, cutoff: DateTime<Utc>) -> Result<usize>;
    async fn lock(&self, owner: OwnerId) -> OwnedMutexGuard<()>;
    /// Forgets the owner's lock once the conversation is over; call after dropping the guard
    fn release(&self, owner: OwnerId);
}

/// In-memory session store
pub struct InMemorySessionStore {
    sessions: Arc<DashMap<OwnerId, Session>>,
    locks: OwnerLocks,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            locks: OwnerLocks::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Owners with a live lock entry
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, owner: OwnerId) -> Result<Option<Session>> {
        Ok(self.sessions.get(&owner).map(|entry| entry.clone()))
    }

    async fn put(&self, session: &mut Session) -> Result<()> {
        match self.sessions.entry(session.owner_id) {
            Entry::Occupied(mut stored) => {
                if stored.get().version != session.version {
                    return Err(FormError::StaleSession(session.owner_id));
                }
                session.version += 1;
                session.updated_at = Utc::now();
                stored.insert(session.clone());
            }
            Entry::Vacant(slot) => {
                if session.version != 0 {
                    return Err(FormError::StaleSession(session.owner_id));
                }
                session.version = 1;
                session.updated_at = Utc::now();
                slot.insert(session.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, owner: OwnerId) -> Result<()> {
        self.sessions.remove(&owner);
        Ok(())
    }

    async fn purge_idle(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_idle_since(cutoff));
        self.locks.prune();
        Ok(before.saturating_sub(self.sessions.len()))
    }

    async fn lock(&self, owner: OwnerId) -> OwnedMutexGuard<()> {
        self.locks.acquire(owner).await
    }

    fn release(&self, owner: OwnerId) {
        self.locks.release(owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemorySessionStore::new();
        let mut session = Session::new(OwnerId(1), "contest_participation", "select_contest");
        store.put(&mut session).await.unwrap();
        assert_eq!(session.version, 1);

        let loaded = store.get(OwnerId(1)).await.unwrap().unwrap();
        assert_eq!(loaded.phase, "select_contest");

        store.delete(OwnerId(1)).await.unwrap();
        assert!(store.get(OwnerId(1)).await.unwrap().is_none());
        // deleting again is fine
        store.delete(OwnerId(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_put_is_rejected() {
        let store = InMemorySessionStore::new();
        let mut session = Session::new(OwnerId(2), "self_assessment", "select_event_type");
        store.put(&mut session).await.unwrap();

        let mut first = store.get(OwnerId(2)).await.unwrap().unwrap();
        let mut second = first.clone();

        first.phase = "enter_event_name".to_string();
        store.put(&mut first).await.unwrap();

        second.phase = "select_contest".to_string();
        let err = store.put(&mut second).await.unwrap_err();
        assert!(matches!(err, FormError::StaleSession(OwnerId(2))));

        let stored = store.get(OwnerId(2)).await.unwrap().unwrap();
        assert_eq!(stored.phase, "enter_event_name");
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_put_after_concurrent_delete_is_stale() {
        let store = InMemorySessionStore::new();
        let mut session = Session::new(OwnerId(3), "contest_admin", "enter_name");
        store.put(&mut session).await.unwrap();
        store.delete(OwnerId(3)).await.unwrap();

        let err = store.put(&mut session).await.unwrap_err();
        assert!(matches!(err, FormError::StaleSession(_)));
    }

    #[tokio::test]
    async fn test_purge_idle() {
        let store = InMemorySessionStore::new();
        let mut fresh = Session::new(OwnerId(4), "contest_admin", "enter_name");
        store.put(&mut fresh).await.unwrap();
        let mut stale = Session::new(OwnerId(5), "contest_admin", "enter_name");
        store.put(&mut stale).await.unwrap();
        if let Some(mut entry) = store.sessions.get_mut(&OwnerId(5)) {
            entry.updated_at = Utc::now() - Duration::hours(48);
        }

        let purged = store
            .purge_idle(Utc::now() - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(OwnerId(4)).await.unwrap().is_some());
        assert!(store.get(OwnerId(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_owner_lock_serialises() {
        let locks = Arc::new(OwnerLocks::new());
        let guard = locks.acquire(OwnerId(9)).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(OwnerId(9)).await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        // other owners are not blocked
        let _other = locks.acquire(OwnerId(10)).await;

        drop(guard);
        contender.await.unwrap();
        drop(_other);
        locks.prune();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_release_keeps_held_locks() {
        let locks = OwnerLocks::new();
        let held = locks.acquire(OwnerId(11)).await;
        drop(locks.acquire(OwnerId(12)).await);

        locks.release(OwnerId(11));
        locks.release(OwnerId(12));
        assert_eq!(locks.len(), 1);

        drop(held);
        locks.release(OwnerId(11));
        assert!(locks.is_empty());
    }
}
