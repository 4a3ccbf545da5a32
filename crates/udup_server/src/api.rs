//! HTTP surface.
//!
//! Read-only endpoints over a running agent:
//!
//! - `GET /v1/members`: every known member
//! - `GET /v1/leader`: the current leader, `404` when it is not a member
//! - `GET /v1/health`: node name, lifecycle state and election state

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use udup_cluster::{AgentState, ClusterView, ElectionState, MembershipError, Surface};

/// Health document
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    /// Local node name
    pub node: String,
    /// Lifecycle state
    pub state: AgentState,
    /// Election state, absent on client nodes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub election: Option<ElectionState>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

/// Routes over `view`
pub fn router(view: ClusterView) -> Router {
    Router::new()
        .route("/v1/members", get(members))
        .route("/v1/leader", get(leader))
        .route("/v1/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(view)
}

async fn members(State(view): State<ClusterView>) -> Response {
    Json(view.members().await).into_response()
}

async fn leader(State(view): State<ClusterView>) -> Response {
    match view.leader().await {
        Ok(Some(member)) => Json(member).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "node has no store"),
        Err(e @ MembershipError::LeaderNotFound) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

async fn health(State(view): State<ClusterView>) -> Response {
    let state = view.agent_state();
    let health = Health {
        node: view.node_name().to_string(),
        state,
        election: view.election_state().await,
    };
    let status = if state == AgentState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

/// HTTP API server
#[derive(Debug, Clone)]
pub struct ApiServer {
    bind: String,
}

impl ApiServer {
    /// Create a server listening on `bind`
    #[must_use]
    pub fn new(bind: impl Into<String>) -> Self {
        Self { bind: bind.into() }
    }
}

#[async_trait]
impl Surface for ApiServer {
    async fn start(
        &self,
        view: ClusterView,
        shutdown: CancellationToken,
        tasks: &TaskTracker,
    ) -> Result<SocketAddr, std::io::Error> {
        let listener = TcpListener::bind(&self.bind).await?;
        let addr = listener.local_addr()?;
        info!(addr = %addr, "HTTP API listening");

        let app = router(view);
        tasks.spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await;
            if let Err(e) = served {
                error!(error = %e, "HTTP API stopped with error");
            }
        });
        Ok(addr)
    }
}
