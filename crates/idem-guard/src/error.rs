use idem_store::StoreError;

/// Stable machine-readable codes carried in every error body.
pub mod codes {
    pub const MISSING_IDEMPOTENCY_KEY: &str = "MISSING_IDEMPOTENCY_KEY";
    pub const INVALID_IDEMPOTENCY_KEY: &str = "INVALID_IDEMPOTENCY_KEY";
    pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const IDEMPOTENCY_KEY_REUSED: &str = "IDEMPOTENCY_KEY_REUSED";
    pub const IDEMPOTENCY_REQUEST_IN_PROGRESS: &str = "IDEMPOTENCY_REQUEST_IN_PROGRESS";
    pub const IDEMPOTENCY_STORE_UNAVAILABLE: &str = "IDEMPOTENCY_STORE_UNAVAILABLE";
    pub const UNREGISTERED_OPERATION: &str = "UNREGISTERED_OPERATION";
    pub const HANDLER_FAILED: &str = "HANDLER_FAILED";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
}

/// Error returned by a wrapped handler. Propagated to the caller unchanged.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub status_code: u16,
    pub code: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(status_code: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, codes::HANDLER_FAILED, message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("invalid idempotency key: {0}")]
    InvalidKey(String),
    #[error("idempotency key was already used with a different payload")]
    Conflict,
    #[error("another request with this idempotency key is still executing")]
    InProgress,
    #[error("idempotency store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    #[error("operation '{0}' is not registered")]
    Unregistered(String),
    #[error(transparent)]
    Execution(HandlerError),
}

impl GuardError {
    pub fn code(&self) -> &str {
        match self {
            GuardError::InvalidKey(_) => codes::INVALID_IDEMPOTENCY_KEY,
            GuardError::Conflict => codes::IDEMPOTENCY_KEY_REUSED,
            GuardError::InProgress => codes::IDEMPOTENCY_REQUEST_IN_PROGRESS,
            GuardError::StoreUnavailable(_) => codes::IDEMPOTENCY_STORE_UNAVAILABLE,
            GuardError::Unregistered(_) => codes::UNREGISTERED_OPERATION,
            GuardError::Execution(err) => &err.code,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            GuardError::InvalidKey(_) => 400,
            GuardError::Conflict | GuardError::InProgress => 409,
            GuardError::StoreUnavailable(_) => 503,
            GuardError::Unregistered(_) => 500,
            GuardError::Execution(err) => err.status_code,
        }
    }

    /// Whether resending the same request with the same key can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GuardError::InProgress | GuardError::StoreUnavailable(_) | GuardError::Execution(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_follow_taxonomy() {
        assert_eq!(GuardError::Conflict.status_code(), 409);
        assert_eq!(GuardError::Conflict.code(), "IDEMPOTENCY_KEY_REUSED");
        assert!(!GuardError::Conflict.is_retryable());

        let unavailable = GuardError::StoreUnavailable(StoreError::Unavailable("down".into()));
        assert_eq!(unavailable.status_code(), 503);
        assert!(unavailable.is_retryable());

        let unregistered = GuardError::Unregistered("x".into());
        assert_eq!(unregistered.code(), "UNREGISTERED_OPERATION");
        assert_eq!(unregistered.status_code(), 500);
    }

    #[test]
    fn handler_errors_pass_through() {
        let err = GuardError::Execution(HandlerError::new(422, "INSUFFICIENT_FUNDS", "nope"));
        assert_eq!(err.status_code(), 422);
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(err.to_string(), "INSUFFICIENT_FUNDS: nope");
    }
}
