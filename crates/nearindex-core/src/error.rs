//! Error types for the nearindex pipeline.

use thiserror::Error;

/// Coarse classification of an [`IndexerError`], used as the structured
/// `kind` field when errors are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    UnknownHandlerKind,
    UnsupportedAction,
    Decode,
    Connection,
    Timeout,
    RateLimit,
    ForkIntegrity,
    HandlerExecution,
    Storage,
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::UnknownHandlerKind => "unknown-handler-kind",
            Self::UnsupportedAction => "unsupported-action",
            Self::Decode => "decode",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate-limit",
            Self::ForkIntegrity => "fork-integrity",
            Self::HandlerExecution => "handler-execution",
            Self::Storage => "storage",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// What went wrong while decoding a raw block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The action's type tag is not one this indexer understands.
    UnsupportedAction(String),
    /// The payload for a known action type is malformed.
    MalformedAction(String),
    /// The receipt body is neither an `Action` nor a `Data` receipt.
    UnsupportedReceipt(String),
}

impl std::fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedAction(t) => write!(f, "unsupported action type '{t}'"),
            Self::MalformedAction(t) => write!(f, "malformed {t} action"),
            Self::UnsupportedReceipt(r) => write!(f, "unsupported receipt shape: {r}"),
        }
    }
}

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Handler kind '{kind}' not found in processor for datasource kind '{ds_kind}'")]
    UnknownHandlerKind { kind: String, ds_kind: String },

    #[error("Decode error at block {height}: {kind}")]
    Decode { height: u64, kind: DecodeErrorKind },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Fork integrity error: {0}")]
    ForkIntegrity(String),

    #[error("Handler error in '{handler}': {reason}")]
    HandlerExecution { handler: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns the structured classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::UnknownHandlerKind { .. } => ErrorKind::UnknownHandlerKind,
            Self::Decode {
                kind: DecodeErrorKind::UnsupportedAction(_),
                ..
            } => ErrorKind::UnsupportedAction,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RateLimited(_) => ErrorKind::RateLimit,
            Self::ForkIntegrity(_) => ErrorKind::ForkIntegrity,
            Self::HandlerExecution { .. } => ErrorKind::HandlerExecution,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Returns `true` if the error is a transient network condition that the
    /// fetch boundary may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout { .. } | Self::RateLimited(_)
        )
    }

    /// Returns `true` if the process must stop rather than continue.
    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
    }

    pub fn handler(handler: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::HandlerExecution {
            handler: handler.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Other(format!("JSON error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_action_has_its_own_kind() {
        let err = IndexerError::Decode {
            height: 10,
            kind: DecodeErrorKind::UnsupportedAction("Teleport".into()),
        };
        assert_eq!(err.kind(), ErrorKind::UnsupportedAction);
        assert!(err.is_fatal());
        assert!(err.to_string().contains("Teleport"));
    }

    #[test]
    fn network_errors_are_transient() {
        assert!(IndexerError::Timeout { ms: 100 }.is_transient());
        assert!(IndexerError::RateLimited("429".into()).is_transient());
        assert!(IndexerError::Connection("refused".into()).is_transient());
        assert!(!IndexerError::ForkIntegrity("gap".into()).is_transient());
    }
}
