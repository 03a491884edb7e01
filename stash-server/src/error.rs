//! Mapping from library errors to HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use stash::StashError;
use tracing::error;

/// Handler error; renders as `{error, kind}` with a status derived from the kind.
#[derive(Debug)]
pub struct ApiError(pub StashError);

impl From<StashError> for ApiError {
    fn from(err: StashError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            StashError::NotFound { .. } => StatusCode::NOT_FOUND,
            StashError::Conflict(_) => StatusCode::CONFLICT,
            StashError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            StashError::Sql(_) | StashError::Io(_) | StashError::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(err = %self.0, "request failed");
        }
        let body = json!({ "error": self.0.to_string(), "kind": self.0.kind() });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
