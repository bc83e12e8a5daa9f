//! HTTP mapping of relay failures.

use actix_web::http::{header, StatusCode};
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use sl_core::RelayError;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("missing or invalid operator key")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Relay(e) => match e {
                RelayError::NotFound(..) => StatusCode::NOT_FOUND,
                RelayError::Validation(_) => StatusCode::BAD_REQUEST,
                RelayError::ThreadClosed(_) => StatusCode::CONFLICT,
                // Retrying will not reach the recipient; the operator was told.
                RelayError::Undeliverable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                RelayError::NotReady | RelayError::StoreUnavailable(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                RelayError::Transport(_) => StatusCode::BAD_GATEWAY,
                RelayError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        let mut response = HttpResponse::build(status);
        if matches!(self, ApiError::Relay(RelayError::NotReady)) {
            response.insert_header((header::RETRY_AFTER, "1"));
        }
        response.json(json!({ "error": message }))
    }
}
