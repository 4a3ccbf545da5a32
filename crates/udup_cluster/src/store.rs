//! Job store contract and the in-memory store.

use crate::leader::LockClient;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use udup_core::{CoreError, CoreResult, Job};

/// Key of the leadership lock
pub const DEFAULT_LEADER_KEY: &str = "udup/leader";

const PINNED_LEASE: Duration = Duration::from_secs(365 * 24 * 3600);

/// Persistent job store shared by the servers
#[async_trait]
pub trait Store: Send + Sync {
    /// Every job definition
    async fn get_jobs(&self) -> CoreResult<Vec<Job>>;

    /// Name of the node currently holding leadership
    async fn get_leader(&self) -> CoreResult<Option<String>>;

    /// Key the leadership lock lives under
    fn leader_key(&self) -> String;

    /// Lock client the election campaign runs against
    fn lock_client(&self) -> Arc<dyn LockClient>;
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires: Instant,
}

#[derive(Default)]
struct StoreInner {
    jobs: RwLock<BTreeMap<String, Job>>,
    locks: RwLock<HashMap<String, Lease>>,
    unavailable: AtomicBool,
}

/// In-memory store; also the lock service for leader election
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
    leader_key: String,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner::default()),
            leader_key: DEFAULT_LEADER_KEY.to_string(),
        }
    }

    /// Use a different leadership key
    #[must_use]
    pub fn with_leader_key(mut self, key: impl Into<String>) -> Self {
        self.leader_key = key.into();
        self
    }

    /// Insert or replace a job
    pub async fn upsert_job(&self, job: Job) {
        self.inner.jobs.write().await.insert(job.name.clone(), job);
    }

    /// Remove a job; true if it existed
    pub async fn remove_job(&self, name: &str) -> bool {
        self.inner.jobs.write().await.remove(name).is_some()
    }

    /// Record `node` as leader without expiry
    pub async fn set_leader(&self, node: impl Into<String>) {
        let lease = Lease {
            holder: node.into(),
            expires: Instant::now() + PINNED_LEASE,
        };
        self.inner
            .locks
            .write()
            .await
            .insert(self.leader_key.clone(), lease);
    }

    /// Make every operation fail until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> CoreResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(CoreError::unavailable("store", "connection refused"));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_jobs(&self) -> CoreResult<Vec<Job>> {
        self.check_available()?;
        Ok(self.inner.jobs.read().await.values().cloned().collect())
    }

    async fn get_leader(&self) -> CoreResult<Option<String>> {
        self.holder(&self.leader_key).await
    }

    fn leader_key(&self) -> String {
        self.leader_key.clone()
    }

    fn lock_client(&self) -> Arc<dyn LockClient> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl LockClient for MemoryStore {
    async fn acquire_or_renew(&self, key: &str, holder: &str, ttl: Duration) -> CoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut locks = self.inner.locks.write().await;
        match locks.get_mut(key) {
            Some(lease) if lease.expires > now && lease.holder != holder => Ok(false),
            Some(lease) => {
                lease.holder = holder.to_string();
                lease.expires = now + ttl;
                Ok(true)
            }
            None => {
                locks.insert(
                    key.to_string(),
                    Lease {
                        holder: holder.to_string(),
                        expires: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, holder: &str) -> CoreResult<()> {
        self.check_available()?;
        let mut locks = self.inner.locks.write().await;
        if locks.get(key).is_some_and(|lease| lease.holder == holder) {
            locks.remove(key);
        }
        Ok(())
    }

    async fn holder(&self, key: &str) -> CoreResult<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .inner
            .locks
            .read()
            .await
            .get(key)
            .filter(|lease| lease.expires > now)
            .map(|lease| lease.holder.clone()))
    }
}
