use axum::{Json, Router, extract::Extension, http::StatusCode, routing::get};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;

use super::state::ClusterState;
use super::status::{NodeStatus, StatusHandle};
use crate::client::processor::RequestProcessor;
use crate::election::types::NodeRole;
use crate::membership::types::NodeId;
use crate::partition::table::PartitionTable;
use crate::partition::types::SlotRange;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub controller: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotsResponse {
    pub primary: Vec<SlotRange>,
    pub replica: Vec<SlotRange>,
    pub replica_node_id: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServersResponse {
    pub servers: Vec<String>,
}

pub fn router(
    state: Arc<ClusterState>,
    table: Arc<PartitionTable>,
    processor: Arc<RequestProcessor>,
) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/slots", get(handle_slots))
        .route("/servers", get(handle_servers))
        .layer(Extension(state))
        .layer(Extension(table))
        .layer(Extension(processor))
}

/// Serves `app` until the node stops.
pub async fn serve(listener: TcpListener, app: Router, status: StatusHandle) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("HTTP status server listening on {}", addr);
    }

    let shutdown = async move {
        status.terminated().await;
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("HTTP status server failed: {}", e);
    }
}

pub async fn handle_status(
    Extension(state): Extension<Arc<ClusterState>>,
) -> (StatusCode, Json<StatusResponse>) {
    (
        StatusCode::OK,
        Json(StatusResponse {
            node_id: state.node_id(),
            role: state.role(),
            status: state.status(),
            controller: state.controller(),
        }),
    )
}

pub async fn handle_slots(
    Extension(table): Extension<Arc<PartitionTable>>,
) -> (StatusCode, Json<SlotsResponse>) {
    if !table.is_initialized() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(SlotsResponse {
                primary: Vec::new(),
                replica: Vec::new(),
                replica_node_id: None,
            }),
        );
    }

    (
        StatusCode::OK,
        Json(SlotsResponse {
            primary: table.primary_ranges(),
            replica: table.replica_ranges(),
            replica_node_id: table.replica_node_id(),
        }),
    )
}

pub async fn handle_servers(
    Extension(processor): Extension<Arc<RequestProcessor>>,
) -> (StatusCode, Json<ServersResponse>) {
    (
        StatusCode::OK,
        Json(ServersResponse {
            servers: processor.server_addresses(),
        }),
    )
}
