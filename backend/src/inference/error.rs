use actix_web::http::StatusCode;
use actix_web::http::header::RETRY_AFTER;
use actix_web::{HttpResponse, ResponseError};
use shared::ErrorResponse;

use super::resilient::InvokeError;

pub const RETRY_AFTER_SECS: u64 = 10;

/// Failure kinds surfaced at the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("Upstream returned empty predictions")]
    EmptyPredictions,
    #[error("Upstream timeout: {0}")]
    Timeout(String),
    #[error("Upstream inference failed: {0}")]
    Upstream(String),
}

impl From<InvokeError> for PredictError {
    fn from(err: InvokeError) -> Self {
        if err.is_timeout() {
            PredictError::Timeout(err.to_string())
        } else {
            PredictError::Upstream(err.to_string())
        }
    }
}

impl ResponseError for PredictError {
    fn status_code(&self) -> StatusCode {
        match self {
            PredictError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PredictError::EmptyPredictions | PredictError::Upstream(_) => StatusCode::BAD_GATEWAY,
            PredictError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        // Transport detail stays in the logs.
        let body = match self {
            PredictError::Timeout(_) => {
                builder.insert_header((RETRY_AFTER, RETRY_AFTER_SECS.to_string()));
                ErrorResponse {
                    error: "Upstream timeout".to_string(),
                    retry_after: Some(RETRY_AFTER_SECS),
                }
            }
            PredictError::Upstream(_) => ErrorResponse::new("Upstream inference failed"),
            other => ErrorResponse::new(other.to_string()),
        };
        builder.json(body)
    }
}
