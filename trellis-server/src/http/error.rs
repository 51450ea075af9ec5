use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use trellis_core::Error;

/// A [`trellis_core::Error`] rendered as `{error, code[, leader]}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

pub fn status_of(err: &Error) -> StatusCode {
    match err {
        Error::UnknownSession(_)
        | Error::UnknownResource(_)
        | Error::UnknownOperation(_)
        | Error::NoSuchElement => StatusCode::NOT_FOUND,
        Error::BadRequest(_) | Error::WrongResourceType(_) => StatusCode::BAD_REQUEST,
        Error::DuplicateResource(_) | Error::DuplicateMember(_) | Error::IllegalUnlock(_) => {
            StatusCode::CONFLICT
        }
        Error::SessionExpired(_) | Error::SessionClosed(_) => StatusCode::GONE,
        Error::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
        Error::ReadStale(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
        Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// JSON body shared by the HTTP and WebSocket front-ends.
pub fn error_body(err: &Error) -> serde_json::Value {
    let mut body = json!({ "error": err.to_string(), "code": err.code() });
    if let Error::NotLeader {
        leader: Some(leader),
    } = err
    {
        body["leader"] = json!(leader);
    }
    body
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_of(&self.0);
        if status.is_server_error() {
            warn!(code = self.0.code(), error = %self.0, "request failed");
        }
        (status, Json(error_body(&self.0))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
