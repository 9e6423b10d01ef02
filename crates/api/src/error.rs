use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use orchestrator_core::OrchestratorError;

/// API层错误包装：把领域错误映射到HTTP状态码
pub struct ApiError(pub OrchestratorError);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::TaskNotFound { .. }
            | OrchestratorError::SubTaskNotFound { .. }
            | OrchestratorError::NodeNotFound { .. } => StatusCode::NOT_FOUND,
            OrchestratorError::Validation(_) | OrchestratorError::InvalidStateTransition { .. } => {
                StatusCode::BAD_REQUEST
            }
            // 背压对外表现为暂不可用，客户端应稍后重试
            OrchestratorError::NoAvailableNode => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("API内部错误: {}", self.0);
        }

        let body = Json(json!({
            "code": status.as_u16(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
