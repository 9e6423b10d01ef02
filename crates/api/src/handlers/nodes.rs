use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;

use orchestrator_core::models::NodeRegistration;

use crate::error::ApiResult;
use crate::response::success;
use crate::routes::AppState;

/// HTTP节点走REST注册（MQTT节点通过connection主题上线）
pub async fn register_node(
    State(state): State<AppState>,
    Json(registration): Json<NodeRegistration>,
) -> ApiResult<Response> {
    let node = state.registry.register(registration).await?;
    Ok(success(node))
}

pub async fn list_nodes(State(state): State<AppState>) -> ApiResult<Response> {
    let nodes = state.registry.list_nodes().await?;
    Ok(success(nodes))
}

pub async fn get_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<Response> {
    let node = state.registry.get_node(&node_id).await?.ok_or(
        orchestrator_core::OrchestratorError::NodeNotFound {
            id: node_id.clone(),
        },
    )?;
    Ok(success(node))
}

pub async fn deregister_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<Response> {
    state.registry.deregister(&node_id).await?;
    Ok(success(node_id))
}
