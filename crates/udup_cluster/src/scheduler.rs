//! Scheduler contract and the local scheduler.
//!
//! Only the elected leader runs the scheduler. `restart` and `stop` may be
//! called redundantly and concurrently by the event loop and the elector.

use crate::remote::JobHandler;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use udup_core::{CoreResult, Job};

/// Job scheduler driven by leadership transitions
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Replace the scheduled job set and (re)start scheduling
    async fn restart(&self, jobs: Vec<Job>);

    /// Stop scheduling
    async fn stop(&self);
}

/// Observable scheduler state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    /// Whether the scheduler is running
    pub running: bool,
    /// Names of the scheduled jobs
    pub jobs: Vec<String>,
    /// Names of jobs started on this node over RPC
    pub active: BTreeSet<String>,
    /// Number of `restart` calls
    pub restarts: u64,
    /// Number of `stop` calls
    pub stops: u64,
}

/// In-process scheduler
#[derive(Clone, Default)]
pub struct LocalScheduler {
    status: Arc<RwLock<SchedulerStatus>>,
}

impl LocalScheduler {
    /// Create a stopped scheduler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current state
    pub async fn status(&self) -> SchedulerStatus {
        self.status.read().await.clone()
    }

    /// Whether the scheduler is running
    pub async fn is_running(&self) -> bool {
        self.status.read().await.running
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    async fn restart(&self, jobs: Vec<Job>) {
        let mut status = self.status.write().await;
        status.running = true;
        status.jobs = jobs.into_iter().map(|job| job.name).collect();
        status.restarts += 1;
        info!(jobs = status.jobs.len(), "Scheduler restarted");
    }

    async fn stop(&self) {
        let mut status = self.status.write().await;
        status.stops += 1;
        if status.running {
            status.running = false;
            info!("Scheduler stopped");
        }
    }
}

#[async_trait]
impl JobHandler for LocalScheduler {
    async fn run_job(&self, job: Job) -> CoreResult<()> {
        debug!(job = %job.name, node = %job.node_name, "Job started");
        self.status.write().await.active.insert(job.name);
        Ok(())
    }

    async fn stop_job(&self, job: Job) -> CoreResult<()> {
        debug!(job = %job.name, node = %job.node_name, "Job stopped");
        self.status.write().await.active.remove(&job.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_restart_and_stop() {
        let scheduler = LocalScheduler::new();
        assert!(!scheduler.is_running().await);

        scheduler.restart(vec![Job::new("a"), Job::new("b")]).await;
        let status = scheduler.status().await;
        assert!(status.running);
        assert_eq!(status.jobs, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(status.restarts, 1);

        scheduler.stop().await;
        scheduler.stop().await;
        let status = scheduler.status().await;
        assert!(!status.running);
        assert_eq!(status.stops, 2);
    }

    #[tokio::test]
    async fn test_job_handler_tracks_active_jobs() {
        let scheduler = LocalScheduler::new();
        scheduler.run_job(Job::new("j1").with_node("n1")).await.unwrap();
        scheduler.run_job(Job::new("j2")).await.unwrap();
        scheduler.stop_job(Job::new("j1")).await.unwrap();

        let active = scheduler.status().await.active;
        assert_eq!(active.into_iter().collect::<Vec<_>>(), vec!["j2".to_string()]);
    }
}
