use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use orchestrator_dispatcher::{NodeRegistry, TaskController};

use crate::handlers;

/// 各handler共享的应用状态
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<TaskController>,
    pub registry: Arc<NodeRegistry>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route(
            "/api/tasks",
            post(handlers::tasks::create_task).get(handlers::tasks::list_tasks),
        )
        .route(
            "/api/tasks/{id}",
            get(handlers::tasks::get_task).delete(handlers::tasks::delete_task),
        )
        .route("/api/tasks/{id}/start", post(handlers::tasks::start_task))
        .route("/api/tasks/{id}/stop", post(handlers::tasks::stop_task))
        .route(
            "/api/tasks/{id}/migrate",
            post(handlers::tasks::migrate_task),
        )
        .route(
            "/api/nodes",
            post(handlers::nodes::register_node).get(handlers::nodes::list_nodes),
        )
        .route(
            "/api/nodes/{id}",
            get(handlers::nodes::get_node).delete(handlers::nodes::deregister_node),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
