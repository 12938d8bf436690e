use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Not acceptable: {0}")]
    NotAcceptable(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Entity too large: {0}")]
    EntityTooLarge(String),

    #[error("Range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    #[error("Expectation failed: {0}")]
    ExpectationFailed(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ServerError::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            ServerError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            ServerError::EntityTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ServerError::ExpectationFailed(_) => StatusCode::EXPECTATION_FAILED,
            ServerError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            ServerError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ServerError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::Json(_) => StatusCode::BAD_REQUEST,
            ServerError::Http(_) => StatusCode::BAD_GATEWAY,
            ServerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ServerError::BadRequest(_) => "BAD_REQUEST",
            ServerError::Unauthorized(_) => "UNAUTHORIZED",
            ServerError::Forbidden(_) => "FORBIDDEN",
            ServerError::NotFound(_) => "NOT_FOUND",
            ServerError::MethodNotAllowed(_) => "METHOD_NOT_ALLOWED",
            ServerError::NotAcceptable(_) => "NOT_ACCEPTABLE",
            ServerError::PreconditionFailed(_) => "PRECONDITION_FAILED",
            ServerError::EntityTooLarge(_) => "ENTITY_TOO_LARGE",
            ServerError::RangeNotSatisfiable(_) => "RANGE_NOT_SATISFIABLE",
            ServerError::ExpectationFailed(_) => "EXPECTATION_FAILED",
            ServerError::NotImplemented(_) => "NOT_IMPLEMENTED",
            ServerError::Upstream(_) => "UPSTREAM_ERROR",
            ServerError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ServerError::Config(_) => "CONFIG_ERROR",
            ServerError::Internal(_) => "INTERNAL_ERROR",
            ServerError::Json(_) => "JSON_ERROR",
            ServerError::Http(_) => "HTTP_ERROR",
            ServerError::Io(_) => "IO_ERROR",
        }
    }

    /// Build an error for a bare status code.
    pub fn from_status(status: StatusCode) -> Self {
        let reason = status.canonical_reason().unwrap_or("Unknown").to_string();
        match status {
            StatusCode::BAD_REQUEST => ServerError::BadRequest(reason),
            StatusCode::UNAUTHORIZED => ServerError::Unauthorized(reason),
            StatusCode::FORBIDDEN => ServerError::Forbidden(reason),
            StatusCode::NOT_FOUND => ServerError::NotFound(reason),
            StatusCode::METHOD_NOT_ALLOWED => ServerError::MethodNotAllowed(reason),
            StatusCode::NOT_ACCEPTABLE => ServerError::NotAcceptable(reason),
            StatusCode::PRECONDITION_FAILED => ServerError::PreconditionFailed(reason),
            StatusCode::PAYLOAD_TOO_LARGE => ServerError::EntityTooLarge(reason),
            StatusCode::RANGE_NOT_SATISFIABLE => ServerError::RangeNotSatisfiable(reason),
            StatusCode::EXPECTATION_FAILED => ServerError::ExpectationFailed(reason),
            StatusCode::NOT_IMPLEMENTED => ServerError::NotImplemented(reason),
            StatusCode::BAD_GATEWAY => ServerError::Upstream(reason),
            StatusCode::SERVICE_UNAVAILABLE => ServerError::ServiceUnavailable(reason),
            _ => ServerError::Internal(reason),
        }
    }

    /// Recover the wire status from an error message.
    ///
    /// Handlers frequently fail with a bare reason phrase ("Not Found") or a
    /// numeric code ("404"); anything else maps to 500.
    pub fn status_from_message(message: &str) -> StatusCode {
        let trimmed = message.trim();
        if let Ok(code) = trimmed.parse::<u16>() {
            if let Ok(status) = StatusCode::from_u16(code) {
                return status;
            }
        }
        for code in 400u16..=511 {
            if let Ok(status) = StatusCode::from_u16(code) {
                if let Some(reason) = status.canonical_reason() {
                    if reason.eq_ignore_ascii_case(trimmed) {
                        return status;
                    }
                }
            }
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_client_errors() {
        assert_eq!(
            ServerError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServerError::EntityTooLarge("x".into()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ServerError::RangeNotSatisfiable("x".into()).status_code(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
    }

    #[test]
    fn message_parses_back_to_status() {
        assert_eq!(
            ServerError::status_from_message("Not Found"),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ServerError::status_from_message("404"), StatusCode::NOT_FOUND);
        assert_eq!(
            ServerError::status_from_message("precondition failed"),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            ServerError::status_from_message("boom"),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn from_status_round_trips() {
        let err = ServerError::from_status(StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(err.status_code(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
