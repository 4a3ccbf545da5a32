//! Multi-agent scenarios on an in-process mesh.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use udup_cluster::{
    Agent, AgentConfig, AgentState, LocalMesh, LocalScheduler, MemoryStore, Membership,
    MembershipError, QueryParams, ServerDeps, Store, Transport,
};
use udup_core::{Job, RunQueryParam};

const WAIT: Duration = Duration::from_secs(5);

fn config(name: &str, port: u16, dir: &Path) -> AgentConfig {
    let mut config = AgentConfig::new(name)
        .with_bind_addr(format!("127.0.0.1:{}", port))
        .with_rpc_port(0);
    config.snapshot_path = dir.join(name).join("snapshot");
    config.election.leader_ttl_ms = 300;
    config.election.recover_interval_ms = 100;
    config
}

fn server(
    config: AgentConfig,
    mesh: &Arc<LocalMesh>,
    store: &MemoryStore,
    scheduler: &LocalScheduler,
) -> Agent {
    Agent::builder(config.with_server(true))
        .with_transport(Transport::Mesh(Arc::clone(mesh)))
        .with_server(ServerDeps::new(
            Arc::new(store.clone()),
            Arc::new(scheduler.clone()),
            Arc::new(scheduler.clone()),
        ))
        .build()
}

fn client(config: AgentConfig, mesh: &Arc<LocalMesh>) -> Agent {
    Agent::builder(config)
        .with_transport(Transport::Mesh(Arc::clone(mesh)))
        .build()
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn membership(agent: &Agent) -> Membership {
    agent.membership().await.unwrap()
}

#[tokio::test]
async fn test_run_job_reaches_scheduler_over_rpc() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = LocalMesh::new();
    let store = MemoryStore::new();
    let scheduler = LocalScheduler::new();

    let s1 = server(config("s1", 7601, dir.path()), &mesh, &store, &scheduler);
    s1.start().await.unwrap();
    let c1 = client(config("c1", 7602, dir.path()).with_join("127.0.0.1:7601"), &mesh);
    c1.start().await.unwrap();

    let payload = RunQueryParam::new(Job::new("backup")).encode().unwrap();
    let mut responses = membership(&c1)
        .await
        .query("run-job", payload, QueryParams::node("s1", WAIT))
        .await
        .unwrap();
    let ack = responses.recv().await.unwrap();
    let job = Job::from_json(&ack.payload).unwrap();
    assert_eq!(job.name, "backup");
    assert_eq!(job.node_name, "s1");

    eventually(|| async { scheduler.status().await.active.contains("backup") }).await;

    let payload = RunQueryParam::new(Job::new("backup")).encode().unwrap();
    let mut responses = membership(&c1)
        .await
        .query("stop-job", payload, QueryParams::node("s1", WAIT))
        .await
        .unwrap();
    assert!(responses.recv().await.is_some());
    eventually(|| async { scheduler.status().await.active.is_empty() }).await;

    c1.shutdown().await.unwrap();
    s1.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unrecognized_query_does_not_stop_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = LocalMesh::new();
    let store = MemoryStore::new();
    let scheduler = LocalScheduler::new();

    let s1 = server(config("s1", 7611, dir.path()), &mesh, &store, &scheduler);
    s1.start().await.unwrap();
    let c1 = client(config("c1", 7612, dir.path()).with_join("127.0.0.1:7611"), &mesh);
    c1.start().await.unwrap();
    let m = membership(&c1).await;

    let mut ignored = m
        .query("defragment", Vec::new(), QueryParams::node("s1", Duration::from_millis(200)))
        .await
        .unwrap();
    assert!(ignored.recv().await.is_none());

    let mut responses = m
        .query("rpc-config", Vec::new(), QueryParams::node("s1", WAIT))
        .await
        .unwrap();
    let address = String::from_utf8(responses.recv().await.unwrap().payload).unwrap();
    assert_eq!(address, s1.rpc_addr().await.unwrap().to_string());

    s1.shutdown().await.unwrap();
    c1.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_scheduler_restart_query_reloads_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = LocalMesh::new();
    let store = MemoryStore::new();
    let scheduler = LocalScheduler::new();
    store.upsert_job(Job::new("nightly")).await;

    let s1 = server(config("s1", 7621, dir.path()), &mesh, &store, &scheduler);
    s1.start().await.unwrap();
    eventually(|| async { scheduler.status().await.restarts >= 1 }).await;
    let before = scheduler.status().await.restarts;

    store.upsert_job(Job::new("hourly")).await;
    let _ = membership(&s1)
        .await
        .query("scheduler-restart", Vec::new(), QueryParams::broadcast(Duration::from_millis(100)))
        .await
        .unwrap();

    eventually(|| async { scheduler.status().await.restarts > before }).await;
    assert_eq!(
        scheduler.status().await.jobs,
        vec!["hourly".to_string(), "nightly".to_string()]
    );
    s1.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_single_leader_and_failover() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = LocalMesh::new();
    let store = MemoryStore::new();
    let sched1 = LocalScheduler::new();
    let sched2 = LocalScheduler::new();

    let s1 = server(config("s1", 7631, dir.path()), &mesh, &store, &sched1);
    s1.start().await.unwrap();
    eventually(|| async { sched1.is_running().await }).await;

    let s2 = server(config("s2", 7632, dir.path()).with_join("127.0.0.1:7631"), &mesh, &store, &sched2);
    s2.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sched1.is_running().await);
    assert!(!sched2.is_running().await);
    assert_eq!(store.get_leader().await.unwrap().as_deref(), Some("s1"));
    let leader = membership(&s2).await.leader_member(&store).await.unwrap();
    assert_eq!(leader.name, "s1");

    s1.shutdown().await.unwrap();
    assert!(!sched1.is_running().await);
    eventually(|| async { sched2.is_running().await }).await;
    assert_eq!(store.get_leader().await.unwrap().as_deref(), Some("s2"));

    s2.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_leader_outside_member_list() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = LocalMesh::new();
    let c1 = client(config("c1", 7641, dir.path()), &mesh);
    c1.start().await.unwrap();

    let store = MemoryStore::new();
    store.set_leader("s9").await;
    assert!(matches!(
        membership(&c1).await.leader_member(&store).await,
        Err(MembershipError::LeaderNotFound)
    ));
    c1.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = LocalMesh::new();
    let c1 = client(config("c1", 7651, dir.path()), &mesh);
    let c2 = client(config("c2", 7652, dir.path()).with_join("127.0.0.1:7651"), &mesh);
    c1.start().await.unwrap();
    c2.start().await.unwrap();
    let m1 = membership(&c1).await;

    c2.shutdown().await.unwrap();
    c2.shutdown().await.unwrap();
    assert_eq!(c2.state(), AgentState::ShutDown);

    let peers = m1.members().await;
    let left = peers.iter().find(|m| m.name == "c2").unwrap();
    assert!(!left.is_alive());
    c1.shutdown().await.unwrap();
}
