//! Leader election for cluster coordination.
//!
//! Mutual exclusion comes from a TTL lock in the store. A [`Candidate`]
//! keeps trying to acquire or renew the lock and reports every change of
//! leadership on a channel; the [`LeaderElector`] reacts to those changes by
//! starting or stopping the scheduler.
//!
//! Stopping is the default on any doubt: a scheduler that is wrongly stopped
//! is preferred to two schedulers running at once.

use crate::agent::AgentError;
use crate::config::ElectionConfig;
use crate::scheduler::Scheduler;
use crate::store::Store;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use udup_core::CoreResult;

/// Lifetime of the leadership lock without renewal
pub const DEFAULT_LEADER_TTL: Duration = Duration::from_secs(20);
/// Pause before campaigning again after a failed campaign
pub const DEFAULT_RECOVER_INTERVAL: Duration = Duration::from_secs(10);

/// TTL lock service
#[async_trait]
pub trait LockClient: Send + Sync {
    /// Take `key` for `holder`, or extend it if `holder` already has it.
    ///
    /// Returns whether `holder` owns the lock afterwards.
    async fn acquire_or_renew(&self, key: &str, holder: &str, ttl: Duration) -> CoreResult<bool>;

    /// Give up `key` if `holder` owns it
    async fn release(&self, key: &str, holder: &str) -> CoreResult<()>;

    /// Current owner of `key`
    async fn holder(&self, key: &str) -> CoreResult<Option<String>>;
}

/// Election errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElectionError {
    /// The lock service failed
    #[error("Coordination store error: {0}")]
    Store(String),

    /// The campaign ended on its own
    #[error("Campaign channel closed")]
    Closed,
}

/// Leader election state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionState {
    /// No campaign running
    NotCampaigning,
    /// Campaign running, outcome not known yet
    Campaigning,
    /// This node holds leadership
    Leader,
    /// Another node holds leadership
    Follower,
}

/// Retry policy of the supervising loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between campaigns
    pub recover_interval: Duration,
    /// Give up after this many campaigns (never when absent)
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retry forever every `recover_interval`
    #[must_use]
    pub fn new(recover_interval: Duration) -> Self {
        Self {
            recover_interval,
            max_attempts: None,
        }
    }

    /// Limit the number of campaigns
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Policy configured by `config`
    #[must_use]
    pub fn from_config(config: &ElectionConfig) -> Self {
        Self {
            recover_interval: config.recover_interval(),
            max_attempts: config.max_attempts,
        }
    }

    /// Whether another campaign may start after `attempts` campaigns
    #[must_use]
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RECOVER_INTERVAL)
    }
}

/// A leadership campaign
#[async_trait]
pub trait Campaign: Send + Sync {
    /// Start campaigning.
    ///
    /// The first channel reports every change of leadership, the second
    /// reports the error that ended the campaign. Both close when the
    /// campaign ends.
    async fn run_for_election(&self) -> (mpsc::Receiver<bool>, mpsc::Receiver<ElectionError>);

    /// Stop campaigning and give up leadership if held
    async fn resign(&self);
}

/// Campaign over a [`LockClient`]
pub struct Candidate {
    client: Arc<dyn LockClient>,
    key: String,
    node: String,
    ttl: Duration,
    running: Mutex<Option<CancellationToken>>,
}

impl Candidate {
    /// Campaign for `key` as `node`
    #[must_use]
    pub fn new(
        client: Arc<dyn LockClient>,
        key: impl Into<String>,
        node: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            client,
            key: key.into(),
            node: node.into(),
            ttl,
            running: Mutex::new(None),
        }
    }

    /// Interval between lock renewals
    #[must_use]
    pub fn renew_interval(&self) -> Duration {
        (self.ttl / 3).max(Duration::from_millis(1))
    }
}

#[async_trait]
impl Campaign for Candidate {
    async fn run_for_election(&self) -> (mpsc::Receiver<bool>, mpsc::Receiver<ElectionError>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.running.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        let (elected_tx, elected_rx) = mpsc::channel(8);
        let (error_tx, error_rx) = mpsc::channel(1);
        let client = Arc::clone(&self.client);
        let key = self.key.clone();
        let node = self.node.clone();
        let ttl = self.ttl;
        let mut renew = tokio::time::interval(self.renew_interval());
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            let mut reported: Option<bool> = None;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        if reported == Some(true) {
                            if let Err(e) = client.release(&key, &node).await {
                                warn!(error = %e, "Failed to release leadership lock");
                            }
                        }
                        break;
                    }
                    _ = renew.tick() => {}
                }

                match client.acquire_or_renew(&key, &node, ttl).await {
                    Ok(held) => {
                        if reported != Some(held) {
                            reported = Some(held);
                            if elected_tx.send(held).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = error_tx.send(ElectionError::Store(e.to_string())).await;
                        break;
                    }
                }
            }
        });

        (elected_rx, error_rx)
    }

    async fn resign(&self) {
        if let Some(token) = self.running.lock().await.take() {
            token.cancel();
        }
    }
}

enum Attempt {
    Failed,
    Shutdown,
    Fatal,
}

/// Drives the scheduler from leadership changes
pub struct LeaderElector {
    node_name: String,
    campaign: Arc<dyn Campaign>,
    store: Arc<dyn Store>,
    scheduler: Arc<dyn Scheduler>,
    retry: RetryPolicy,
    state: RwLock<ElectionState>,
    fatal: mpsc::Sender<AgentError>,
}

impl LeaderElector {
    /// Create an elector
    #[must_use]
    pub fn new(
        node_name: impl Into<String>,
        campaign: Arc<dyn Campaign>,
        store: Arc<dyn Store>,
        scheduler: Arc<dyn Scheduler>,
        fatal: mpsc::Sender<AgentError>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            campaign,
            store,
            scheduler,
            retry: RetryPolicy::default(),
            state: RwLock::new(ElectionState::NotCampaigning),
            fatal,
        }
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Current state
    pub async fn state(&self) -> ElectionState {
        *self.state.read().await
    }

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        matches!(*self.state.read().await, ElectionState::Leader)
    }

    /// Start the supervising loop on `tasks`
    pub fn participate(self: &Arc<Self>, tasks: &TaskTracker, shutdown: CancellationToken) {
        let elector = Arc::clone(self);
        tasks.spawn(async move { elector.run(shutdown).await });
    }

    /// Campaign until `shutdown`, a fatal error or the retry limit
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut attempts = 0u32;
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            attempts += 1;
            match self.campaign_once(&shutdown).await {
                Attempt::Shutdown | Attempt::Fatal => break,
                Attempt::Failed => {}
            }

            if !self.retry.allows(attempts) {
                warn!(node = %self.node_name, attempts, "Giving up leadership campaign");
                break;
            }
            debug!(retry_in = ?self.retry.recover_interval, "Retrying election");
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.retry.recover_interval) => {}
            }
        }

        self.campaign.resign().await;
        if self.state().await == ElectionState::Leader {
            self.scheduler.stop().await;
        }
        self.set_state(ElectionState::NotCampaigning).await;
    }

    async fn campaign_once(&self, shutdown: &CancellationToken) -> Attempt {
        info!(node = %self.node_name, "Running for election");
        self.set_state(ElectionState::Campaigning).await;
        let (mut elected, mut errors) = self.campaign.run_for_election().await;
        let mut elected_open = true;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Attempt::Shutdown,
                event = elected.recv(), if elected_open => match event {
                    Some(true) => {
                        info!(node = %self.node_name, "Cluster leadership acquired");
                        self.set_state(ElectionState::Leader).await;
                        debug!("Restarting scheduler");
                        match self.store.get_jobs().await {
                            Ok(jobs) => self.scheduler.restart(jobs).await,
                            Err(e) => {
                                error!(error = %e, "Failed to load jobs after election");
                                if let Err(dropped) = self.fatal.send(AgentError::SchedulerState(e)).await {
                                    error!(error = %dropped.0, "Fatal error has no listener");
                                }
                                return Attempt::Fatal;
                            }
                        }
                    }
                    Some(false) => {
                        info!(node = %self.node_name, "Cluster leadership lost");
                        self.set_state(ElectionState::Follower).await;
                        self.scheduler.stop().await;
                    }
                    None => elected_open = false,
                },
                err = errors.recv() => {
                    let err = err.unwrap_or(ElectionError::Closed);
                    error!(error = %err, "Leader election failed, channel is probably closed");
                    self.scheduler.stop().await;
                    self.set_state(ElectionState::NotCampaigning).await;
                    return Attempt::Failed;
                }
            }
        }
    }

    async fn set_state(&self, state: ElectionState) {
        *self.state.write().await = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::LocalScheduler;
    use crate::store::MemoryStore;
    use udup_core::Job;

    /// Campaign whose channels are driven by the test
    struct ScriptedCampaign {
        runs: Mutex<mpsc::UnboundedSender<(mpsc::Sender<bool>, mpsc::Sender<ElectionError>)>>,
        resigned: Mutex<bool>,
    }

    #[async_trait]
    impl Campaign for ScriptedCampaign {
        async fn run_for_election(&self) -> (mpsc::Receiver<bool>, mpsc::Receiver<ElectionError>) {
            let (elected_tx, elected_rx) = mpsc::channel(8);
            let (error_tx, error_rx) = mpsc::channel(1);
            let _ = self.runs.lock().await.send((elected_tx, error_tx));
            (elected_rx, error_rx)
        }

        async fn resign(&self) {
            *self.resigned.lock().await = true;
        }
    }

    type Runs = mpsc::UnboundedReceiver<(mpsc::Sender<bool>, mpsc::Sender<ElectionError>)>;

    fn scripted() -> (Arc<ScriptedCampaign>, Runs) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ScriptedCampaign {
                runs: Mutex::new(tx),
                resigned: Mutex::new(false),
            }),
            rx,
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_retry_policy() {
        let unbounded = RetryPolicy::default();
        assert_eq!(unbounded.recover_interval, Duration::from_secs(10));
        assert!(unbounded.allows(u32::MAX - 1));

        let bounded = RetryPolicy::new(Duration::from_millis(5)).with_max_attempts(2);
        assert!(bounded.allows(1));
        assert!(!bounded.allows(2));

        let config = ElectionConfig {
            max_attempts: Some(3),
            ..ElectionConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).max_attempts, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elected_restarts_and_lost_stops() {
        let store = MemoryStore::new();
        store.upsert_job(Job::new("j1")).await;
        store.upsert_job(Job::new("j2")).await;
        let scheduler = LocalScheduler::new();
        let (campaign, mut runs) = scripted();
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);

        let elector = Arc::new(LeaderElector::new(
            "n1",
            campaign.clone(),
            Arc::new(store),
            Arc::new(scheduler.clone()),
            fatal_tx,
        ));
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        elector.participate(&tasks, shutdown.clone());

        let (elected, errors) = runs.recv().await.unwrap();
        assert_eq!(elector.state().await, ElectionState::Campaigning);

        elected.send(true).await.unwrap();
        settle().await;
        let status = scheduler.status().await;
        assert!(status.running);
        assert_eq!(status.jobs, vec!["j1".to_string(), "j2".to_string()]);
        assert_eq!(elector.state().await, ElectionState::Leader);

        elected.send(false).await.unwrap();
        settle().await;
        assert!(!scheduler.is_running().await);
        assert_eq!(elector.state().await, ElectionState::Follower);

        errors.send(ElectionError::Store("lost session".to_string())).await.unwrap();
        settle().await;
        assert_eq!(scheduler.status().await.stops, 2);
        assert_eq!(elector.state().await, ElectionState::NotCampaigning);

        // a new campaign starts after the recovery interval
        tokio::time::advance(DEFAULT_RECOVER_INTERVAL).await;
        let (elected, _errors) = runs.recv().await.unwrap();
        elected.send(true).await.unwrap();
        settle().await;
        assert_eq!(scheduler.status().await.restarts, 2);

        shutdown.cancel();
        tasks.close();
        tasks.wait().await;
        assert!(*campaign.resigned.lock().await);
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_on_election_is_fatal() {
        let store = MemoryStore::new();
        let scheduler = LocalScheduler::new();
        let (campaign, mut runs) = scripted();
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let elector = LeaderElector::new(
            "n1",
            campaign,
            Arc::new(store.clone()),
            Arc::new(scheduler.clone()),
            fatal_tx,
        );
        let handle = tokio::spawn(async move { elector.run(CancellationToken::new()).await });

        let (elected, _errors) = runs.recv().await.unwrap();
        store.set_unavailable(true);
        elected.send(true).await.unwrap();

        assert!(matches!(fatal_rx.recv().await, Some(AgentError::SchedulerState(_))));
        handle.await.unwrap();
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn test_store_failure_without_listener_still_stops() {
        let store = MemoryStore::new();
        let scheduler = LocalScheduler::new();
        let (campaign, mut runs) = scripted();
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        drop(fatal_rx);
        let elector = LeaderElector::new(
            "n1",
            campaign,
            Arc::new(store.clone()),
            Arc::new(scheduler.clone()),
            fatal_tx,
        );
        let handle = tokio::spawn(async move { elector.run(CancellationToken::new()).await });

        let (elected, _errors) = runs.recv().await.unwrap();
        store.set_unavailable(true);
        elected.send(true).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_limit_stops_campaigning() {
        let scheduler = LocalScheduler::new();
        let (campaign, mut runs) = scripted();
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let elector = LeaderElector::new(
            "n1",
            campaign,
            Arc::new(MemoryStore::new()),
            Arc::new(scheduler.clone()),
            fatal_tx,
        )
        .with_retry(RetryPolicy::new(Duration::from_secs(1)).with_max_attempts(2));
        let handle = tokio::spawn(async move { elector.run(CancellationToken::new()).await });

        for _ in 0..2 {
            let (_elected, errors) = runs.recv().await.unwrap();
            drop(errors);
        }
        handle.await.unwrap();
        assert_eq!(scheduler.status().await.stops, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidates_share_one_lock() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(3);
        let c1 = Candidate::new(store.lock_client(), store.leader_key(), "n1", ttl);
        let c2 = Candidate::new(store.lock_client(), store.leader_key(), "n2", ttl);
        assert_eq!(c1.renew_interval(), Duration::from_secs(1));

        let (mut e1, _err1) = c1.run_for_election().await;
        assert_eq!(e1.recv().await, Some(true));
        let (mut e2, _err2) = c2.run_for_election().await;
        assert_eq!(e2.recv().await, Some(false));
        assert_eq!(store.get_leader().await.unwrap().as_deref(), Some("n1"));

        c1.resign().await;
        assert_eq!(e2.recv().await, Some(true));
        assert_eq!(store.get_leader().await.unwrap().as_deref(), Some("n2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidate_reports_store_error() {
        let store = MemoryStore::new();
        let candidate = Candidate::new(store.lock_client(), store.leader_key(), "n1", DEFAULT_LEADER_TTL);
        store.set_unavailable(true);
        let (mut elected, mut errors) = candidate.run_for_election().await;
        assert!(matches!(errors.recv().await, Some(ElectionError::Store(_))));
        assert_eq!(elected.recv().await, None);
    }
}
