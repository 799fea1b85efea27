use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::credentials::CredentialError;
use crate::identity::IdentityError;
use crate::storage::changes::{PushError, PushValidationError};
use crate::storage::StorageError;

/// The error half of every handler: an HTTP status and the `{ "error": … }`
/// envelope, with structured diagnostics for batch validation failures.
#[derive(Debug)]
pub enum ApiError {
    Batch(PushValidationError),
    Status(StatusCode, String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::Status(StatusCode::BAD_REQUEST, message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Status(StatusCode::UNAUTHORIZED, message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Status(StatusCode::FORBIDDEN, message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::Status(StatusCode::NOT_FOUND, message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Status(StatusCode::CONFLICT, message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        ApiError::Status(StatusCode::SERVICE_UNAVAILABLE, message.into())
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        ApiError::Status(StatusCode::BAD_GATEWAY, message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Status(StatusCode::INTERNAL_SERVER_ERROR, message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Status(status, message) => {
                if status.is_server_error() {
                    tracing::error!(status = %status, error = %message, "Request failed");
                }
                (status, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Batch(err) => {
                let mut body = json!({ "error": err.to_string() });
                let fields = body.as_object_mut().expect("object literal");
                match &err {
                    PushValidationError::MissingSequences {
                        batch_id,
                        expected,
                        missing,
                        received,
                    } => {
                        fields.insert("batchId".into(), json!(batch_id));
                        fields.insert("missingSequences".into(), json!(missing));
                        fields.insert("expected".into(), json!(expected));
                        fields.insert("received".into(), json!(received));
                    }
                    PushValidationError::DuplicateSequences { batch_id }
                    | PushValidationError::IncompleteMetadata { batch_id } => {
                        fields.insert("batchId".into(), json!(batch_id));
                    }
                    PushValidationError::ConflictingTotals {
                        batch_id,
                        expected,
                        received,
                    } => {
                        fields.insert("batchId".into(), json!(batch_id));
                        fields.insert("expected".into(), json!(expected));
                        fields.insert("received".into(), json!(received));
                    }
                    PushValidationError::InvalidTotal { batch_id, total } => {
                        fields.insert("batchId".into(), json!(batch_id));
                        fields.insert("received".into(), json!(total));
                    }
                    PushValidationError::SequenceOutOfRange { batch_id, sequence } => {
                        fields.insert("batchId".into(), json!(batch_id));
                        fields.insert("sequence".into(), json!(sequence));
                    }
                }
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Duplicate => ApiError::conflict("Resource already exists"),
            StorageError::Sqlx(e) => ApiError::internal(format!("Database error: {e}")),
        }
    }
}

impl From<PushError> for ApiError {
    fn from(err: PushError) -> Self {
        match err {
            PushError::Validation(e) => ApiError::Batch(e),
            PushError::Storage(e) => e.into(),
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Unauthorized => ApiError::unauthorized(err.to_string()),
            IdentityError::InvalidCredentials => ApiError::unauthorized(err.to_string()),
            IdentityError::AlreadyExists => ApiError::conflict(err.to_string()),
            IdentityError::Upstream(e) => ApiError::bad_gateway(format!("Identity provider unreachable: {e}")),
            IdentityError::Status(s) => ApiError::bad_gateway(format!("Identity provider returned status {s}")),
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::KeyUnavailable => {
                ApiError::unavailable("Storage credentials are not configured")
            }
            CredentialError::Storage(e) => e.into(),
            CredentialError::Decrypt | CredentialError::Encrypt => {
                ApiError::internal(err.to_string())
            }
        }
    }
}
