use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// 统一响应信封
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// 成功响应
pub fn success<T: Serialize>(data: T) -> Response {
    Json(ApiResponse {
        code: 0,
        message: "ok".to_string(),
        data: Some(data),
    })
    .into_response()
}

/// 带说明的成功响应
pub fn success_with_message<T: Serialize>(data: T, message: impl Into<String>) -> Response {
    Json(ApiResponse {
        code: 0,
        message: message.into(),
        data: Some(data),
    })
    .into_response()
}
