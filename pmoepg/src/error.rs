//! Error types for the guide synchronisation pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pmoepg operations
pub type Result<T> = std::result::Result<T, EpgError>;

/// Errors that can occur while talking to Schedules Direct or maintaining the cache
#[derive(Error, Debug)]
pub enum EpgError {
    /// Network or timeout error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Connection dropped or timed out while reading the response body
    #[error("Incomplete response body: {0}")]
    Body(#[source] reqwest::Error),

    /// Remote rejected the request with an HTTP status
    #[error("HTTP status {code}: {message}")]
    Status { code: u16, message: String },

    /// Missing or refused credentials/token
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Remote API answered with a structured error payload
    #[error("Schedules Direct API error (code {code}): {message}")]
    Api { code: i64, message: String },

    /// Malformed JSON or compressed payload
    #[error("Failed to decode {context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Gzip payload that cannot be inflated
    #[error("Failed to inflate {context}: {source}")]
    Inflate {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Disk I/O during snapshot or restore
    #[error("Cache persistence error on {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Every attempt failed with a retryable error
    #[error("All {attempts} attempts failed: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<EpgError>,
    },

    /// Configuration error (pmoconfig/anyhow)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("{0}")]
    Other(String),
}

impl EpgError {
    /// Builds an error from a non-2xx HTTP status and its body
    pub fn from_status_code(code: u16, message: impl Into<String>) -> Self {
        match code {
            401 | 403 => Self::Unauthorized(message.into()),
            _ => Self::Status {
                code,
                message: message.into(),
            },
        }
    }

    pub(crate) fn decode(context: &'static str, source: serde_json::Error) -> Self {
        Self::Decode { context, source }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    /// Transport failures and 429/500/502/503/504 are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            EpgError::Http(e) => !e.is_builder() && !e.is_decode() && !e.is_redirect(),
            EpgError::Body(_) => true,
            EpgError::Status { code, .. } => matches!(code, 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }

    /// Whether the session token must be renewed
    pub fn is_auth_error(&self) -> bool {
        match self {
            EpgError::Unauthorized(_) => true,
            // 4001..4009 : token/compte refusés par Schedules Direct
            EpgError::Api { code, .. } => (4001..=4009).contains(code),
            EpgError::RetriesExhausted { source, .. } => source.is_auth_error(),
            _ => false,
        }
    }

    /// Body received but unusable: fails the batch instead of skipping it
    pub fn is_malformed_payload(&self) -> bool {
        matches!(self, EpgError::Decode { .. } | EpgError::Inflate { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EpgError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(EpgError::from_status_code(429, "slow down").is_retryable());
        assert!(EpgError::from_status_code(503, "maintenance").is_retryable());
        assert!(!EpgError::from_status_code(404, "missing").is_retryable());
        assert!(!EpgError::from_status_code(400, "bad").is_retryable());

        let auth = EpgError::from_status_code(403, "denied");
        assert!(auth.is_auth_error());
        assert!(!auth.is_retryable());
    }

    #[test]
    fn test_application_errors_are_final() {
        let err = EpgError::Api {
            code: 4003,
            message: "Invalid user".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.is_auth_error());

        let wrapped = EpgError::RetriesExhausted {
            attempts: 3,
            source: Box::new(EpgError::Unauthorized("token".into())),
        };
        assert!(wrapped.is_auth_error());
        assert!(!wrapped.is_retryable());
    }

    #[test]
    fn test_decode_is_not_retryable() {
        let source = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err = EpgError::decode("schedules", source);
        assert!(!err.is_retryable());
        assert!(err.is_malformed_payload());
        assert!(err.to_string().contains("schedules"));

        let err = EpgError::Inflate {
            context: "programs",
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "corrupt deflate stream"),
        };
        assert!(!err.is_retryable());
        assert!(err.is_malformed_payload());

        assert!(!EpgError::from_status_code(503, "busy").is_malformed_payload());
        assert!(
            !EpgError::Api {
                code: 4102,
                message: "Too many IDs".into()
            }
            .is_malformed_payload()
        );
    }
}
