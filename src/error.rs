use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::stream::StreamError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad offer: {0}")]
    BadOffer(String),

    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Stream allocation failed: {0}")]
    Allocation(String),

    #[error("No active stream")]
    NoActiveStream,

    #[error("Control already assigned")]
    AlreadyAssigned,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StreamError> for AppError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Allocation(reason) => AppError::Allocation(reason),
        }
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NoActiveStream | AppError::AlreadyAssigned => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::BadOffer(_)
            | AppError::PeerConnection(_)
            | AppError::Negotiation(_)
            | AppError::Allocation(_)
            | AppError::Internal(_)
            | AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short description sent to the client; the cause stays in the log
    pub fn public_message(&self) -> &'static str {
        match self {
            AppError::BadOffer(_) => "bad offer",
            AppError::PeerConnection(_) => "failed to create peer connection",
            AppError::Negotiation(_) => "failed to negotiate session",
            AppError::Allocation(_) => "failed to allocate stream",
            AppError::NoActiveStream => "no active stream",
            AppError::AlreadyAssigned => "control already assigned",
            AppError::NotFound(_) => "not found",
            AppError::BadRequest(_) => "bad request",
            AppError::Internal(_) | AppError::Io(_) => "internal error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error_message = %self, "Request failed");
        } else {
            tracing::debug!(error_message = %self, "Request rejected");
        }

        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.public_message(),
        )
            .into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::NoActiveStream.status_code(), StatusCode::CONFLICT);
        assert_eq!(AppError::AlreadyAssigned.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::BadOffer("empty".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::BadRequest("segment".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(StreamError::Allocation("ffmpeg".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_body_hides_cause() {
        let err = AppError::Negotiation("ice agent exploded at 10.0.0.3".into());
        assert_eq!(err.public_message(), "failed to negotiate session");
    }
}
