//! Error types for the gitspace server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of concurrent feature downloads, kept in the order they finished
#[derive(Debug)]
pub struct FeatureErrors(pub Vec<Error>);

impl std::fmt::Display for FeatureErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for FeatureErrors {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.first().map(|err| err as &(dyn std::error::Error + 'static))
    }
}

/// Main error type for the gitspace server
#[derive(Debug, Error)]
pub enum Error {
    // Gitspace errors (2000-2999)
    #[error("Gitspace not found: {0}")]
    GitspaceNotFound(String),

    #[error("Gitspace instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Gitspace already exists: {0}")]
    GitspaceAlreadyExists(String),

    #[error("Gitspace {identifier} is busy in state {state}, try again later")]
    GitspaceBusy { identifier: String, state: String },

    #[error("Gitspace instance in invalid state: expected {expected}, got {actual}")]
    InvalidInstanceState { expected: String, actual: String },

    #[error("Invalid gitspace instance transition from {from} to {to}")]
    InvalidInstanceTransition { from: String, to: String },

    // Container errors (3000-3999)
    #[error("Gitspace {container} is in an unhandled state: {state}")]
    UnhandledContainerState { container: String, state: String },

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Command failed with exit code {exit_code}: {stderr}")]
    CommandFailed { exit_code: i64, stderr: String },

    #[error("Image not found locally and pull policy is never: {0}")]
    ImageNotPresent(String),

    #[error("Operating system not supported: {0}")]
    UnsupportedOs(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Feature errors (4000-4999)
    #[error("Error downloading features: {0}")]
    FeatureDownload(String),

    #[error("Error downloading features: {0}")]
    FeatureDownloads(#[source] FeatureErrors),

    #[error("Error resolving features: {0}")]
    FeatureResolution(String),

    #[error("Invalid value for option {option} of feature {feature}: {reason}")]
    InvalidFeatureOption {
        feature: String,
        option: String,
        reason: String,
    },

    #[error("Error sorting features: {0}")]
    FeatureSort(String),

    // Run argument errors (5000-5999)
    #[error("Invalid value {value:?} for run arg {arg}: {reason}")]
    InvalidRunArg {
        arg: String,
        value: String,
        reason: String,
    },

    // Infrastructure errors (6000-6999)
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Docker error: {0}")]
    DockerError(String),

    #[error("Infrastructure not found: {0}")]
    InfraNotFound(String),

    #[error("Expected infra state in {expected}, actual state is: {actual}")]
    UnexpectedInfraStatus { expected: String, actual: String },

    #[error("Infrastructure unreachable: {0}")]
    InfraUnreachable(String),

    #[error("Provisioning error: {0}")]
    ProvisioningError(String),

    #[error("SCM error: {0}")]
    ScmError(String),

    #[error("Secret error: {0}")]
    SecretError(String),

    #[error("Connector error: {0}")]
    ConnectorError(String),

    // Template and IDE errors (7000-7999)
    #[error("Script template not found: {0}")]
    TemplateNotFound(String),

    #[error("Failed to render script template {name}: {reason}")]
    TemplateRender { name: String, reason: String },

    #[error("Unsupported IDE type: {0}")]
    UnsupportedIde(String),

    // General errors (1000-1999)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap this error with additional context, keeping it as the source
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error of a wrapped chain
    pub fn root(&self) -> &Error {
        match self {
            Error::Wrapped { source, .. } => source.root(),
            other => other,
        }
    }

    /// Get the error code
    pub fn code(&self) -> u32 {
        match self {
            // Gitspace errors (2000-2999)
            Error::GitspaceNotFound(_) => 2001,
            Error::InstanceNotFound(_) => 2002,
            Error::GitspaceAlreadyExists(_) => 2003,
            Error::GitspaceBusy { .. } => 2004,
            Error::InvalidInstanceState { .. } => 2005,
            Error::InvalidInstanceTransition { .. } => 2006,

            // Container errors (3000-3999)
            Error::UnhandledContainerState { .. } => 3001,
            Error::ContainerNotFound(_) => 3002,
            Error::CommandFailed { .. } => 3003,
            Error::ImageNotPresent(_) => 3004,
            Error::UnsupportedOs(_) => 3005,
            Error::Cancelled => 3006,

            // Feature errors (4000-4999)
            Error::FeatureDownload(_) | Error::FeatureDownloads(_) => 4001,
            Error::FeatureResolution(_) => 4002,
            Error::InvalidFeatureOption { .. } => 4003,
            Error::FeatureSort(_) => 4004,

            // Run argument errors (5000-5999)
            Error::InvalidRunArg { .. } => 5001,

            // Infrastructure errors (6000-6999)
            Error::DatabaseError(_) => 6001,
            Error::DockerError(_) => 6002,
            Error::InfraNotFound(_) => 6003,
            Error::UnexpectedInfraStatus { .. } => 6004,
            Error::InfraUnreachable(_) => 6005,
            Error::ProvisioningError(_) => 6006,
            Error::ScmError(_) => 6007,
            Error::SecretError(_) => 6008,
            Error::ConnectorError(_) => 6009,

            // Template and IDE errors (7000-7999)
            Error::TemplateNotFound(_) => 7001,
            Error::TemplateRender { .. } => 7002,
            Error::UnsupportedIde(_) => 7003,

            // General errors (1000-1999)
            Error::InvalidRequest(_) => 1001,
            Error::InvalidParameter(_) => 1002,
            Error::Timeout(_) => 1003,
            Error::Internal(_) => 1004,

            Error::Wrapped { source, .. } => source.code(),
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::GitspaceNotFound(_)
            | Error::InstanceNotFound(_)
            | Error::ContainerNotFound(_)
            | Error::InfraNotFound(_)
            | Error::TemplateNotFound(_) => StatusCode::NOT_FOUND,

            Error::GitspaceAlreadyExists(_) => StatusCode::CONFLICT,

            Error::GitspaceBusy { .. } => StatusCode::FORBIDDEN,

            Error::InvalidRequest(_)
            | Error::InvalidParameter(_)
            | Error::InvalidInstanceState { .. }
            | Error::InvalidInstanceTransition { .. }
            | Error::InvalidRunArg { .. }
            | Error::InvalidFeatureOption { .. }
            | Error::UnsupportedIde(_) => StatusCode::BAD_REQUEST,

            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,

            Error::InfraUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,

            Error::Wrapped { source, .. } => source.status_code(),

            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Extension for attaching context to fallible results
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }
}

/// Orchestrator-level failure: the wrapped error chain plus the message shown to users
#[derive(Debug)]
pub struct GitspaceError {
    pub error: Error,
    pub error_message: Option<String>,
}

impl GitspaceError {
    /// Build a failure whose user-facing message is the error's own text
    pub fn new(error: Error) -> Self {
        let error_message = Some(error.to_string());
        Self {
            error,
            error_message,
        }
    }

    /// Build a failure with a user-facing message that differs from the internal chain
    pub fn with_message(error: Error, message: impl Into<String>) -> Self {
        Self {
            error,
            error_message: Some(message.into()),
        }
    }

    /// The message to store on the instance
    pub fn message(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| self.error.to_string())
    }
}

impl std::fmt::Display for GitspaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl From<Error> for GitspaceError {
    fn from(error: Error) -> Self {
        GitspaceError::new(error)
    }
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let details = match &self {
            Error::Wrapped { source, .. } => Some(source.root().to_string()),
            _ => None,
        };
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

// Implement From for common error types
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::DockerError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::FeatureDownload(err.to_string())
    }
}

impl From<tera::Error> for Error {
    fn from(err: tera::Error) -> Self {
        let reason = match std::error::Error::source(&err) {
            Some(source) => format!("{}: {}", err, source),
            None => err.to_string(),
        };
        Error::TemplateRender {
            name: String::new(),
            reason,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_error_renders_chain() {
        let err = Error::CommandFailed {
            exit_code: 1,
            stderr: "boom".to_string(),
        }
        .context("error executing step Install Git");

        assert_eq!(
            err.to_string(),
            "error executing step Install Git: Command failed with exit code 1: boom"
        );
        assert_eq!(err.code(), 3003);
    }

    #[test]
    fn test_busy_maps_to_forbidden() {
        let err = Error::GitspaceBusy {
            identifier: "gs".to_string(),
            state: "starting".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.context("start").status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_result_ext_context() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        let err = result.context("reading feature").unwrap_err();
        assert!(err.to_string().starts_with("reading feature: "));
    }

    #[test]
    fn test_gitspace_error_message() {
        let err = GitspaceError::with_message(
            Error::Internal("low level".to_string()),
            "Failed to set up Gitspace",
        );
        assert_eq!(err.message(), "Failed to set up Gitspace");
        assert_eq!(GitspaceError::new(Error::Cancelled).message(), "Operation cancelled");
    }
}
