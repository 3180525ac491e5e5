use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),

    #[error("rate limited")]
    RateLimited,
}

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        match self {
            CaptureError::RequestParsingError(_) => {
                (StatusCode::BAD_REQUEST, "Invalid event data")
            }
            CaptureError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "Too many requests"),
        }
        .into_response()
    }
}
