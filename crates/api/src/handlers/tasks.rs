use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;

use orchestrator_dispatcher::CreateTaskSpec;

use crate::error::ApiResult;
use crate::response::{success, success_with_message};
use crate::routes::AppState;

/// 创建任务。部分组合缺失时返回"N of M"口径的说明
pub async fn create_task(
    State(state): State<AppState>,
    Json(spec): Json<CreateTaskSpec>,
) -> ApiResult<Response> {
    let report = state.controller.create_task(spec).await?;
    let message = format!(
        "{} of {} sub-tasks created",
        report.created_subtasks, report.requested_combinations
    );
    Ok(success_with_message(report, message))
}

pub async fn list_tasks(State(state): State<AppState>) -> ApiResult<Response> {
    let tasks = state.controller.list_tasks().await?;
    Ok(success(tasks))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Response> {
    let report = state.controller.get_task_status(task_id).await?;
    Ok(success(report))
}

pub async fn start_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Response> {
    let report = state.controller.start_task(task_id).await?;
    let message = format!(
        "{} of {} sub-tasks scheduled",
        report.eligible_subtasks, report.total_subtasks
    );
    Ok(success_with_message(report, message))
}

pub async fn stop_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Response> {
    let report = state.controller.stop_task(task_id).await?;
    Ok(success(report))
}

pub async fn migrate_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Response> {
    let report = state.controller.migrate_task(task_id).await?;
    Ok(success(report))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Response> {
    state.controller.delete_task(task_id).await?;
    Ok(success(task_id))
}
