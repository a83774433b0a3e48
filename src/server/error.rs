use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::pipeline::PipelineError;

/// Server error type that provides automatic logging and clean error responses.
///
/// This type:
/// - Logs 5xx errors with their source chain when converted to a response
/// - Allows attaching structured context (org, app, revision)
/// - Returns `{"error": message}` to clients
///
/// # Example
///
/// ```rust,ignore
/// use crate::server::error::{ServerError, ServerErrorExt};
///
/// let err = ServerError::bad_request("You must specify an org name");
///
/// let images = backend
///     .list_images(&filters)
///     .await
///     .server_err(StatusCode::BAD_GATEWAY, "Unable to list images")?;
/// ```
#[derive(Debug)]
pub struct ServerError {
    /// HTTP status code to return
    pub status: StatusCode,
    /// User-facing error message (returned in response)
    pub message: String,
    /// Internal error with full chain (logged but not exposed to client)
    pub source: Option<anyhow::Error>,
    /// Structured context for logging (key-value pairs)
    pub context: Vec<(&'static str, String)>,
}

impl ServerError {
    /// Create a new error with just status and message (no source error)
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            source: None,
            context: Vec::new(),
        }
    }

    /// Create an error from an anyhow::Error with full error chain
    pub fn from_anyhow(
        source: anyhow::Error,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            source: Some(source),
            context: Vec::new(),
        }
    }

    /// Add a context field for logging (chainable)
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Create a 500 Internal Server Error from an anyhow::Error
    pub fn internal_anyhow(source: anyhow::Error, message: impl Into<String>) -> Self {
        Self::from_anyhow(source, StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Create a 400 Bad Request error
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Create a 503 Service Unavailable error
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        // Log server errors (5xx) with full context using structured fields
        if self.status.is_server_error() {
            if let Some(source) = &self.source {
                tracing::error!(
                    status = self.status.as_u16(),
                    message = %self.message,
                    context = ?self.context,
                    error = ?source,
                    "Server error"
                );
            } else {
                tracing::error!(
                    status = self.status.as_u16(),
                    message = %self.message,
                    context = ?self.context,
                    "Server error"
                );
            }
        }

        let body = Json(json!({
            "error": self.message,
        }));

        (self.status, body).into_response()
    }
}

impl From<PipelineError> for ServerError {
    fn from(err: PipelineError) -> Self {
        use PipelineError::*;

        let (status, message) = match &err {
            InvalidIdentity(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            PayloadTooLarge { .. } | IngestIo(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Unable to accept zip file".to_string(),
            ),
            MalformedUpload(_) => (
                StatusCode::BAD_REQUEST,
                "Unable to accept zip file".to_string(),
            ),
            CorruptArchive(_) => (
                StatusCode::BAD_REQUEST,
                "Unable to extract zip file.  Ensure you have a valid zip file.".to_string(),
            ),
            ManifestUnreadable { .. } | ManifestMissingRunCommand => (
                StatusCode::BAD_REQUEST,
                format!("Unable to validate node application. {}", err),
            ),
            BuildContextError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Unable to create docker container. {}", err),
            ),
            ImageBuildError(detail) => (
                StatusCode::BAD_REQUEST,
                format!("Unable to create docker container. {}", detail),
            ),
            ImageNotFound(_) | TagError(_) | PushError(_) => (
                StatusCode::BAD_GATEWAY,
                format!("Unable to tag and push the docker container. {}", err),
            ),
            StageTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, err.to_string()),
            // Nobody is listening for this response anymore
            Cancelled { .. } => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };

        let stage = err.stage().to_string();
        Self::from_anyhow(err.into(), status, message).with_context("stage", stage)
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal_anyhow(err, "Internal server error")
    }
}

/// Extension trait for Result types to easily convert to ServerError
pub trait ServerErrorExt<T> {
    /// Convert error to ServerError with custom status and message
    fn server_err(self, status: StatusCode, message: impl Into<String>) -> Result<T, ServerError>;

    /// Convert error to internal server error (500)
    fn internal_err(self, message: impl Into<String>) -> Result<T, ServerError>;
}

impl<T, E> ServerErrorExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn server_err(self, status: StatusCode, message: impl Into<String>) -> Result<T, ServerError> {
        self.map_err(|e| ServerError::from_anyhow(e.into(), status, message))
    }

    fn internal_err(self, message: impl Into<String>) -> Result<T, ServerError> {
        self.map_err(|e| ServerError::internal_anyhow(e.into(), message))
    }
}
