//! Unified API error handling.
//!
//! Every handler returns `Result<_, ApiError>`. Errors render as
//! `{"error": {"code", "message", "details"?}}` with a matching status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::engine::EngineError;
use crate::runtime::is_unavailable;

type FieldErrors = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    ValidationError,
    Unauthorized,
    NotFound,
    Conflict,
    ServiceUnavailable,
    InternalError,
    DatabaseError,
}

impl ErrorCode {
    pub fn status(self) -> StatusCode {
        use ErrorCode::*;
        match self {
            BadRequest | ValidationError => StatusCode::BAD_REQUEST,
            Unauthorized => StatusCode::UNAUTHORIZED,
            NotFound => StatusCode::NOT_FOUND,
            Conflict => StatusCode::CONFLICT,
            ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            InternalError | DatabaseError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: ErrorCode,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a FieldErrors>,
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    error: ErrorBody<'a>,
}

#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
    details: Option<FieldErrors>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    /// A single field error uses its own text as the message.
    pub fn validation(details: FieldErrors) -> Self {
        let message = match details.values().flatten().next() {
            Some(only) if details.len() == 1 => only.clone(),
            _ => format!("Validation failed for {} fields", details.len()),
        };
        Self {
            code: ErrorCode::ValidationError,
            message,
            details: Some(details),
        }
    }

    pub fn validation_field(field: &str, message: impl Into<String>) -> Self {
        Self::validation(HashMap::from([(field.to_string(), vec![message.into()])]))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope {
            error: ErrorBody {
                code: self.code,
                message: &self.message,
                details: self.details.as_ref(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::not_found("Resource not found"),
            sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed") => {
                Self::conflict("Record already exists")
            }
            _ => {
                tracing::error!("Database failure: {}", err);
                Self::new(ErrorCode::DatabaseError, "Database operation failed")
            }
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(message) => Self::bad_request(message),
            EngineError::AppNotFound(_) | EngineError::ContainerNotFound(_) => {
                Self::not_found(err.to_string())
            }
            EngineError::BuildInProgress
            | EngineError::NoPortsAvailable { .. }
            | EngineError::PortUnavailable(_)
            | EngineError::DuplicateSlug(_) => Self::conflict(err.to_string()),
            EngineError::Runtime(ref inner) if is_unavailable(inner) => {
                Self::service_unavailable(err.to_string())
            }
            EngineError::Database(db) => db.into(),
            EngineError::Runtime(_) | EngineError::SourceControl(_) | EngineError::Io(_) => {
                tracing::error!("{}", err);
                Self::internal(err.to_string())
            }
        }
    }
}

/// Accumulates per-field messages for request validation.
#[derive(Debug, Default)]
pub struct ValidationErrorBuilder {
    fields: FieldErrors,
}

impl ValidationErrorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields.entry(field.into()).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn finish(self) -> Result<(), ApiError> {
        match self.is_empty() {
            true => Ok(()),
            false => Err(ApiError::validation(self.fields)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeUnavailable;

    #[test]
    fn test_engine_errors_map_to_status_classes() {
        let cases = [
            (EngineError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (EngineError::AppNotFound("a1".into()), StatusCode::NOT_FOUND),
            (EngineError::ContainerNotFound("c1".into()), StatusCode::NOT_FOUND),
            (EngineError::BuildInProgress, StatusCode::CONFLICT),
            (
                EngineError::NoPortsAvailable {
                    start: 13001,
                    end: 13002,
                },
                StatusCode::CONFLICT,
            ),
            (EngineError::PortUnavailable(13001), StatusCode::CONFLICT),
            (EngineError::DuplicateSlug("blog".into()), StatusCode::CONFLICT),
            (
                EngineError::Runtime(RuntimeUnavailable.into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                EngineError::Runtime(anyhow::anyhow!("daemon said no")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                EngineError::SourceControl(anyhow::anyhow!("network unreachable")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                EngineError::Database(sqlx::Error::RowNotFound),
                StatusCode::NOT_FOUND,
            ),
        ];
        for (err, status) in cases {
            let label = err.to_string();
            assert_eq!(ApiError::from(err).status(), status, "{}", label);
        }
    }

    #[test]
    fn test_conflict_keeps_engine_message() {
        let err = ApiError::from(EngineError::DuplicateSlug("blog".into()));
        assert_eq!(err.code(), ErrorCode::Conflict);
        assert!(err.message().contains("'blog'"));
    }

    #[test]
    fn test_validation_builder() {
        let mut builder = ValidationErrorBuilder::new();
        assert!(builder.is_empty());
        builder.add("branch", "Branch name contains invalid characters");
        builder.add("env", "Invalid variable name: 1X");
        builder.add("branch", "Branch name is too long");

        let err = builder.finish().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.details.as_ref().unwrap()["branch"].len(), 2);
        assert!(err.message().contains("2 fields"));

        let single = ApiError::validation_field("repoUrl", "Repository URL is required");
        assert_eq!(single.message(), "Repository URL is required");
    }

    #[test]
    fn test_error_envelope_shape() {
        let err = ApiError::validation_field("branch", "Invalid branch name format");
        let body = serde_json::to_value(Envelope {
            error: ErrorBody {
                code: err.code,
                message: &err.message,
                details: err.details.as_ref(),
            },
        })
        .unwrap();
        assert_eq!(body["error"]["code"], "validation_error");
        assert_eq!(body["error"]["details"]["branch"][0], "Invalid branch name format");

        let plain = serde_json::to_value(ErrorBody {
            code: ErrorCode::NotFound,
            message: "gone",
            details: None,
        })
        .unwrap();
        assert!(plain.get("details").is_none());
    }
}
