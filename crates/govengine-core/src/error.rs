use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GovError {
    #[error("not initialized: run 'govengine init'")]
    NotInitialized,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("user '{user}' is not authorized to {action}")]
    NotAuthorized { user: String, action: String },

    #[error("property server error: {0}")]
    PropertyServer(String),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("engine action {guid} was modified concurrently (expected version {expected}, found {found})")]
    Conflict {
        guid: String,
        expected: u64,
        found: u64,
    },

    #[error("{method} failed with {error_type}: {message}")]
    UnexpectedHandlerFailure {
        error_type: String,
        message: String,
        method: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GovError>;

/// The four failure classes callers are expected to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidParameter,
    NotAuthorized,
    PropertyServer,
    UnexpectedHandlerFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidParameter => "invalid_parameter",
            ErrorKind::NotAuthorized => "not_authorized",
            ErrorKind::PropertyServer => "property_server",
            ErrorKind::UnexpectedHandlerFailure => "unexpected_handler_failure",
        };
        f.write_str(s)
    }
}

impl GovError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        GovError::InvalidParameter(msg.into())
    }

    pub fn property_server(msg: impl fmt::Display) -> Self {
        GovError::PropertyServer(msg.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GovError::InvalidParameter(_) | GovError::InvalidTransition { .. } => {
                ErrorKind::InvalidParameter
            }
            GovError::NotAuthorized { .. } => ErrorKind::NotAuthorized,
            GovError::UnexpectedHandlerFailure { .. } => ErrorKind::UnexpectedHandlerFailure,
            GovError::NotInitialized
            | GovError::PropertyServer(_)
            | GovError::Conflict { .. }
            | GovError::Io(_)
            | GovError::Yaml(_)
            | GovError::Json(_) => ErrorKind::PropertyServer,
        }
    }

    /// A dispatch that failed this way may be attempted again on the next tick.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::PropertyServer
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_errors_classify_as_invalid_parameter() {
        let err = GovError::InvalidTransition {
            from: "actioned".into(),
            to: "failed".into(),
            reason: "terminal".into(),
        };
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert!(!err.is_retryable());
    }

    #[test]
    fn conflicts_are_retryable() {
        let err = GovError::Conflict {
            guid: "a".into(),
            expected: 1,
            found: 2,
        };
        assert_eq!(err.kind(), ErrorKind::PropertyServer);
        assert!(err.is_retryable());
    }

    #[test]
    fn handler_failure_message_names_method() {
        let err = GovError::UnexpectedHandlerFailure {
            error_type: "std::io::Error".into(),
            message: "disk full".into(),
            method: "start".into(),
        };
        assert_eq!(err.to_string(), "start failed with std::io::Error: disk full");
    }
}
