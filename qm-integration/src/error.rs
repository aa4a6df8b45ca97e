use std::time::Duration;
use thiserror::Error;

/// Error taxonomy shared by every crate in the workspace (spec.md §7).
///
/// Each component that can fail returns `Result<T, QualityError>`, or a
/// narrower local error type that `From`-converts into this one -
/// analogous to how the teacher's execution crates each define a local
/// error before folding it into a shared socket-level error.
#[derive(Debug, Error)]
pub enum QualityError {
    /// Invalid numeric bounds, malformed credentials - fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// WebSocket dial/read/write failure, protocol malformation - recoverable,
    /// triggers a reconnect.
    #[error("connection error: {0}")]
    Connection(String),

    /// Explicit `auth_failed` from the streaming provider - fatal, the
    /// client enters a terminal failed state and does not reconnect.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Provider signalled rate limiting. Carries an optional `Retry-After`
    /// duration so the caller can honour it exactly.
    #[error("rate limited{}", retry_after.map(|d| format!(" (retry after {d:?})")).unwrap_or_default())]
    RateLimit { retry_after: Option<Duration> },

    /// Other network or 5xx-class provider error - retried within the
    /// backfill retry budget.
    #[error("transient provider error: {0}")]
    TransientProvider(String),

    /// Malformed frame, invalid OHLC - the offending event is dropped and
    /// counted, but the stream continues.
    #[error("data validation error: {0}")]
    DataValidation(String),

    /// Never expected to occur; surfaces via a fatal log and propagates.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    /// The operation was cancelled by its caller; propagates unchanged.
    #[error("operation cancelled")]
    Cancelled,
}

impl QualityError {
    /// Whether a caller should retry (backfill worker) or reconnect
    /// (streaming client) after this error, as opposed to surfacing it as
    /// fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            QualityError::Connection(_)
                | QualityError::RateLimit { .. }
                | QualityError::TransientProvider(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            QualityError::RateLimit { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl crate::channel::Unrecoverable for QualityError {
    fn is_unrecoverable(&self) -> bool {
        !self.is_recoverable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(QualityError::Connection("reset".into()).is_recoverable());
        assert!(
            QualityError::RateLimit {
                retry_after: Some(Duration::from_secs(1))
            }
            .is_recoverable()
        );
        assert!(!QualityError::Authentication("bad key".into()).is_recoverable());
        assert!(!QualityError::Configuration("bad bound".into()).is_recoverable());
        assert!(!QualityError::Internal("unreachable".into()).is_recoverable());
    }

    #[test]
    fn test_retry_after_extraction() {
        let err = QualityError::RateLimit {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(QualityError::Cancelled.retry_after(), None);
    }
}
