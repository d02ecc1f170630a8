//! Error types and JSON error responses for the admin API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a container lifecycle provider (docker, agent or Proxmox).
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("container {0} not found")]
    NotFound(String),

    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("unexpected container status {0:?}")]
    UnexpectedStatus(String),

    #[error("cannot connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("api: {0}")]
    Api(String),
}

impl ProviderError {
    /// Short stable label for log fields.
    pub fn as_label(&self) -> &'static str {
        match self {
            ProviderError::Docker(_) => "provider_docker",
            ProviderError::Http(_) => "provider_http",
            ProviderError::NotFound(_) => "provider_not_found",
            ProviderError::Timeout { .. } => "provider_timeout",
            ProviderError::UnexpectedStatus(_) => "provider_unexpected_status",
            ProviderError::Connect { .. } => "provider_connect",
            ProviderError::Api(_) => "provider_api",
        }
    }
}

/// Errors raised while probing a backend. An unreachable backend is not an
/// error; it is an unhealthy [`crate::health::HealthCheckResult`].
#[derive(Error, Debug)]
pub enum HealthError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("health check timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent relay: {0}")]
    Relay(#[from] reqwest::Error),

    #[error("invalid health check url {0:?}")]
    InvalidUrl(String),
}

/// Errors surfaced by an idle watcher to its callers.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Health(#[from] HealthError),

    /// The watcher's event loop has exited; the watcher is gone.
    #[error("watcher for {0} has stopped")]
    Stopped(String),

    #[error("no idle watcher for {0}")]
    NotFound(String),

    #[error("{name} did not become ready within {timeout:?}")]
    WakeTimeout { name: String, timeout: Duration },

    #[error("{name} failed: {detail}")]
    Unhealthy { name: String, detail: String },

    #[error("{name}: dependency {dependency} failed: {source}")]
    Dependency {
        name: String,
        dependency: String,
        source: Box<WatcherError>,
    },
}

/// Errors produced while shutting the task tree down.
#[derive(Error, Debug)]
pub enum ShutdownError {
    /// The tree did not drain before the operator deadline.
    #[error("graceful shutdown exceeded {deadline:?}; pending: {pending:?}")]
    DeadlineExceeded {
        deadline: Duration,
        pending: Vec<String>,
    },
}

/// Error codes for admin API responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// No route with that name is configured
    UnknownRoute,
    /// Route exists but has no idle watcher (disabled or stopped)
    WatcherNotFound,
    /// Provider call failed while waking the container
    WakeFailed,
    /// Container did not become healthy in time
    WakeTimeout,
    /// Unknown endpoint
    NotFound,
    /// Internal admin error
    InternalError,
}

impl ApiErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::UnknownRoute => StatusCode::NOT_FOUND,
            ApiErrorCode::WatcherNotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::WakeFailed => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::WakeTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Napgate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ApiErrorCode::Unauthorized => "UNAUTHORIZED",
            ApiErrorCode::UnknownRoute => "UNKNOWN_ROUTE",
            ApiErrorCode::WatcherNotFound => "WATCHER_NOT_FOUND",
            ApiErrorCode::WakeFailed => "WAKE_FAILED",
            ApiErrorCode::WakeTimeout => "WAKE_TIMEOUT",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&WatcherError> for ApiErrorCode {
    fn from(err: &WatcherError) -> Self {
        match err {
            WatcherError::Provider(_)
            | WatcherError::Health(_)
            | WatcherError::Unhealthy { .. }
            | WatcherError::Dependency { .. } => ApiErrorCode::WakeFailed,
            WatcherError::Stopped(_) | WatcherError::NotFound(_) => ApiErrorCode::WatcherNotFound,
            WatcherError::WakeTimeout { .. } => ApiErrorCode::WakeTimeout,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ApiErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Napgate-Error header
pub fn json_error_response(code: ApiErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Napgate-Error", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ApiErrorCode::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiErrorCode::UnknownRoute.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiErrorCode::WakeFailed.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiErrorCode::WakeTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ApiErrorCode::UnknownRoute, "no route named whoami");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_ROUTE\""));
        assert!(json.contains("\"message\":\"no route named whoami\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ApiErrorCode::WakeTimeout, "timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Napgate-Error").unwrap(),
            "WAKE_TIMEOUT"
        );
    }

    #[test]
    fn test_watcher_error_maps_to_api_code() {
        let stopped = WatcherError::Stopped("whoami".to_string());
        assert_eq!(ApiErrorCode::from(&stopped), ApiErrorCode::WatcherNotFound);

        let timeout = WatcherError::WakeTimeout {
            name: "whoami".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(ApiErrorCode::from(&timeout), ApiErrorCode::WakeTimeout);

        let provider = WatcherError::Provider(ProviderError::NotFound("abc".to_string()));
        assert_eq!(ApiErrorCode::from(&provider), ApiErrorCode::WakeFailed);

        let dependency = WatcherError::Dependency {
            name: "whoami".to_string(),
            dependency: "db".to_string(),
            source: Box::new(WatcherError::Stopped("db".to_string())),
        };
        assert_eq!(ApiErrorCode::from(&dependency), ApiErrorCode::WakeFailed);
        assert_eq!(
            dependency.to_string(),
            "whoami: dependency db failed: watcher for db has stopped"
        );
    }

    #[test]
    fn test_shutdown_error_lists_pending() {
        let err = ShutdownError::DeadlineExceeded {
            deadline: Duration::from_millis(1),
            pending: vec!["root.slow".to_string()],
        };
        assert!(err.to_string().contains("root.slow"));
    }
}
