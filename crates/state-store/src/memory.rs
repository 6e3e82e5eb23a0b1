use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::{CorrelationId, SessionId};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{
    Advance, CorrelationRegistry, Result, StateStoreError, TtlConfig, WorkflowState,
    WorkflowStateStore, mapping_key, status_key,
};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory transient store for tests and single-process runs.
///
/// Values are kept in their encoded string form, like a remote key-value
/// store would hold them. Expiry is evaluated lazily against tokio's clock,
/// so tests can drive it with a paused runtime.
#[derive(Clone, Default)]
pub struct InMemoryTransientStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    ttl: TtlConfig,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryTransientStore {
    /// Creates an empty store with the given TTLs.
    pub fn new(ttl: TtlConfig) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }

    /// Makes every subsequent call fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Removes a key outright, as an operator or eviction would.
    pub async fn evict(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    /// Stores a value verbatim under `key` with the state TTL, as another
    /// writer sharing the store would.
    pub async fn put_raw(&self, key: &str, value: &str) {
        self.entries.write().await.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + self.ttl.state_ttl,
            },
        );
    }

    /// Drops expired entries and returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    /// Returns the number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StateStoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    async fn get_live(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.is_live(Instant::now()))
            .map(|e| e.value.clone())
    }
}

#[async_trait]
impl WorkflowStateStore for InMemoryTransientStore {
    async fn get_state(&self, id: CorrelationId) -> Result<Option<WorkflowState>> {
        self.check_available()?;
        let key = status_key(id);
        Ok(self
            .get_live(&key)
            .await
            .and_then(|value| WorkflowState::decode_lenient(&key, &value)))
    }

    async fn advance(&self, id: CorrelationId, state: WorkflowState) -> Result<Advance> {
        self.check_available()?;
        let key = status_key(id);
        let now = Instant::now();

        // Read and write under one lock so the compare-and-advance is atomic.
        let mut entries = self.entries.write().await;
        let current = entries
            .get(&key)
            .filter(|e| e.is_live(now))
            .and_then(|e| WorkflowState::decode_lenient(&key, &e.value));
        if let Some(current) = current {
            if !current.status().can_advance_to(state.status()) {
                return Ok(Advance::Unchanged { current });
            }
        }

        entries.insert(
            key,
            Entry {
                value: state.encode(),
                expires_at: now + self.ttl.state_ttl,
            },
        );
        Ok(Advance::Applied)
    }
}

#[async_trait]
impl CorrelationRegistry for InMemoryTransientStore {
    async fn register(&self, id: CorrelationId, session: &SessionId) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        entries.insert(
            mapping_key(id),
            Entry {
                value: session.as_str().to_string(),
                expires_at: Instant::now() + self.ttl.mapping_ttl,
            },
        );
        Ok(())
    }

    async fn resolve(&self, id: CorrelationId) -> Result<Option<SessionId>> {
        self.check_available()?;
        Ok(self.get_live(&mapping_key(id)).await.map(SessionId::new))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::WorkflowStatus;

    fn store() -> InMemoryTransientStore {
        InMemoryTransientStore::new(TtlConfig {
            state_ttl: Duration::from_secs(60),
            mapping_ttl: Duration::from_secs(10),
        })
    }

    #[tokio::test]
    async fn advance_walks_the_lifecycle() {
        let store = store();
        let id = CorrelationId::new();

        assert!(store.get_state(id).await.unwrap().is_none());

        for state in [
            WorkflowState::accepted(),
            WorkflowState::processing(),
            WorkflowState::completed(42),
        ] {
            assert_eq!(store.advance(id, state).await.unwrap(), Advance::Applied);
            assert_eq!(store.get_state(id).await.unwrap(), Some(state));
        }
    }

    #[tokio::test]
    async fn advance_never_regresses() {
        let store = store();
        let id = CorrelationId::new();
        store.advance(id, WorkflowState::completed(7)).await.unwrap();

        let outcome = store.advance(id, WorkflowState::processing()).await.unwrap();
        assert_eq!(
            outcome,
            Advance::Unchanged {
                current: WorkflowState::completed(7)
            }
        );
        let state = store.get_state(id).await.unwrap().unwrap();
        assert_eq!(state.status(), WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn completed_order_id_is_never_replaced() {
        let store = store();
        let id = CorrelationId::new();
        store.advance(id, WorkflowState::completed(7)).await.unwrap();

        let outcome = store.advance(id, WorkflowState::completed(8)).await.unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(store.get_state(id).await.unwrap().unwrap().order_id(), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn state_expires_after_ttl() {
        let store = store();
        let id = CorrelationId::new();
        store.advance(id, WorkflowState::accepted()).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(store.get_state(id).await.unwrap().is_none());
        // An expired key behaves as absent for the next write.
        assert!(store
            .advance(id, WorkflowState::accepted())
            .await
            .unwrap()
            .is_applied());
    }

    #[tokio::test(start_paused = true)]
    async fn mapping_ttl_is_independent_of_state_ttl() {
        let store = store();
        let id = CorrelationId::new();
        store.register(id, &SessionId::new("s-1")).await.unwrap();
        store.advance(id, WorkflowState::accepted()).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(store.resolve(id).await.unwrap().is_none());
        assert!(store.get_state(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unreadable_state_is_absent_and_overwritten() {
        let store = store();
        let id = CorrelationId::new();
        store.put_raw(&status_key(id), "ARCHIVED|v9").await;

        assert!(store.get_state(id).await.unwrap().is_none());
        assert!(store
            .advance(id, WorkflowState::processing())
            .await
            .unwrap()
            .is_applied());
        assert_eq!(
            store.get_state(id).await.unwrap(),
            Some(WorkflowState::processing())
        );
    }

    #[tokio::test]
    async fn newer_suffixes_still_guard_the_advance() {
        let store = store();
        let id = CorrelationId::new();
        store.put_raw(&status_key(id), "COMPLETED|5|v2").await;

        let outcome = store.advance(id, WorkflowState::processing()).await.unwrap();
        assert_eq!(
            outcome,
            Advance::Unchanged {
                current: WorkflowState::completed(5)
            }
        );
    }

    #[tokio::test]
    async fn register_and_resolve_session() {
        let store = store();
        let id = CorrelationId::new();
        store.register(id, &SessionId::new("session-a")).await.unwrap();

        let session = store.resolve(id).await.unwrap();
        assert_eq!(session, Some(SessionId::new("session-a")));
        assert!(store.resolve(CorrelationId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unavailable_store_fails_transiently() {
        let store = store();
        store.set_unavailable(true);

        let err = store.get_state(CorrelationId::new()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.resolve(CorrelationId::new()).await.is_err());

        store.set_unavailable(false);
        assert!(store.get_state(CorrelationId::new()).await.is_ok());
    }

    #[tokio::test]
    async fn evicted_key_reads_as_absent() {
        let store = store();
        let id = CorrelationId::new();
        store.register(id, &SessionId::new("s")).await.unwrap();

        store.evict(&mapping_key(id)).await;

        assert!(store.resolve(id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_expired_entries() {
        let store = store();
        let id = CorrelationId::new();
        store.register(id, &SessionId::new("s")).await.unwrap();
        store.advance(id, WorkflowState::accepted()).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 1);
    }
}
