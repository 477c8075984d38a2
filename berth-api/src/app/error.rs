use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use berth_core::ContainerError;
use serde_json::json;

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
}

impl ApiError {
    pub fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            status,
            message: message.into(),
        }
    }
}

impl From<ContainerError> for ApiError {
    fn from(err: ContainerError) -> Self {
        let message = err.to_string();
        match err {
            ContainerError::NotFound(_) => ApiError::new("NotFound", StatusCode::NOT_FOUND, message),
            ContainerError::Ambiguous(_) => {
                ApiError::new("Ambiguous", StatusCode::BAD_REQUEST, message)
            }
            ContainerError::AlreadyExists(_) => {
                ApiError::new("AlreadyExists", StatusCode::CONFLICT, message)
            }
            ContainerError::InvalidId => {
                ApiError::new("InvalidId", StatusCode::BAD_REQUEST, message)
            }
            ContainerError::InvalidState(_) => {
                ApiError::new("InvalidState", StatusCode::CONFLICT, message)
            }
            ContainerError::StartFailed { .. } => {
                ApiError::new("StartFailed", StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            ContainerError::TaskUnavailable(_) => {
                ApiError::new("TaskUnavailable", StatusCode::SERVICE_UNAVAILABLE, message)
            }
            ContainerError::AttachBusy(_) => {
                ApiError::new("AttachBusy", StatusCode::CONFLICT, message)
            }
            ContainerError::InvalidRequest(_) => {
                ApiError::new("InvalidRequest", StatusCode::BAD_REQUEST, message)
            }
            ContainerError::InvalidToken => {
                ApiError::new("InvalidToken", StatusCode::NOT_FOUND, message)
            }
            ContainerError::Io(_) => {
                ApiError::new("IoError", StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            ContainerError::Other(_) => {
                ApiError::new("Error", StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "code": self.code,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}
