use axum::response::Response;
use serde_json::json;

use crate::error::ApiResult;
use crate::response::success;

pub async fn health_check() -> ApiResult<Response> {
    Ok(success(json!({
        "status": "up",
        "service": "orchestrator",
    })))
}
