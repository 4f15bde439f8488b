//! Error taxonomy for calls to external backends.
//!
//! Every request to the embedding backend, the vector store, or the
//! generation backend returns a [`BackendError`] on failure. The
//! classification drives [`RetryPolicy`](crate::retry::RetryPolicy):
//!
//! | Variant | Retried | Typical cause |
//! |---------|---------|---------------|
//! | `Timeout` | yes | per-call deadline elapsed |
//! | `Transport` | yes | connection refused, reset, DNS |
//! | `Status` 429 / 5xx | yes | rate limit, overloaded backend |
//! | `Status` other 4xx | no | malformed input, auth |
//! | `Protocol` | no | unparseable or inconsistent response |
//! | `Dimension` | no | embedding space mismatch (configuration error) |
//! | `Model` | no | collection indexed with another model (configuration error) |

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("{backend} call timed out after {elapsed:?}")]
    Timeout {
        backend: &'static str,
        elapsed: Duration,
    },

    #[error("{backend} transport error: {message}")]
    Transport {
        backend: &'static str,
        message: String,
    },

    #[error("{backend} returned HTTP {status}: {body}")]
    Status {
        backend: &'static str,
        status: u16,
        body: String,
    },

    #[error("{backend} protocol error: {message}")]
    Protocol {
        backend: &'static str,
        message: String,
    },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },

    #[error("collection was indexed with embedding model '{indexed}', but the configured model is '{configured}'")]
    Model { indexed: String, configured: String },
}

impl BackendError {
    pub fn transport(backend: &'static str, err: impl std::fmt::Display) -> Self {
        BackendError::Transport {
            backend,
            message: err.to_string(),
        }
    }

    pub fn protocol(backend: &'static str, message: impl Into<String>) -> Self {
        BackendError::Protocol {
            backend,
            message: message.into(),
        }
    }

    /// Map a `reqwest` failure onto the taxonomy. Client-side timeouts are
    /// reported as [`BackendError::Timeout`] so they are retried.
    pub fn from_reqwest(backend: &'static str, err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            BackendError::Timeout {
                backend,
                elapsed: timeout,
            }
        } else if err.is_decode() {
            BackendError::protocol(backend, err.to_string())
        } else {
            BackendError::transport(backend, err)
        }
    }

    /// Timeouts, transport failures, HTTP 429 and 5xx are transient.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Timeout { .. } | BackendError::Transport { .. } => true,
            BackendError::Status { status, .. } => *status == 429 || *status >= 500,
            BackendError::Protocol { .. }
            | BackendError::Dimension { .. }
            | BackendError::Model { .. } => false,
        }
    }

    /// Errors that mean the deployment is misconfigured rather than that one
    /// request went wrong. These abort a run instead of being skipped.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BackendError::Dimension { .. } | BackendError::Model { .. }
        )
    }
}

/// Read a failed HTTP response into a [`BackendError::Status`].
pub async fn status_error(backend: &'static str, response: reqwest::Response) -> BackendError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    BackendError::Status {
        backend,
        status,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> BackendError {
        BackendError::Status {
            backend: "test",
            status: code,
            body: String::new(),
        }
    }

    #[test]
    fn test_rate_limit_and_server_errors_are_transient() {
        assert!(status(429).is_transient());
        assert!(status(500).is_transient());
        assert!(status(503).is_transient());
    }

    #[test]
    fn test_client_errors_are_not_transient() {
        assert!(!status(400).is_transient());
        assert!(!status(404).is_transient());
        assert!(!BackendError::protocol("test", "bad json").is_transient());
    }

    #[test]
    fn test_dimension_mismatch_is_configuration() {
        let err = BackendError::Dimension {
            expected: 384,
            actual: 768,
        };
        assert!(err.is_configuration());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("384"));
    }

    #[test]
    fn test_model_mismatch_is_configuration() {
        let err = BackendError::Model {
            indexed: "model-a".to_string(),
            configured: "model-b".to_string(),
        };
        assert!(err.is_configuration());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("'model-a'"));
    }
}
