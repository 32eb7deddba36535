use actix_web::http::StatusCode;
use actix_web::ResponseError;
use thiserror::Error;

/// Rejected limiter configuration or request identity.
///
/// These are programmer or caller errors; they are never silently replaced by a default.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum ValidationError {
    #[error("max_requests must be greater than zero")]
    ZeroMaxRequests,
    #[error("window_ms must be greater than zero")]
    ZeroWindow,
    #[error("a rate limit identity must not be empty")]
    EmptyIdentity,
}

impl ResponseError for ValidationError {
    fn status_code(&self) -> StatusCode {
        match self {
            ValidationError::EmptyIdentity => StatusCode::BAD_REQUEST,
            ValidationError::ZeroMaxRequests | ValidationError::ZeroWindow => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
