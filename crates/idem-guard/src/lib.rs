//! At-most-once execution of registered mutating operations.

pub mod config;
pub mod error;
pub mod guard;
pub mod metrics;

pub use config::{ConfigError, GuardConfig};
pub use error::{GuardError, HandlerError, codes};
pub use guard::{
    ExecutionGuard, HandlerResponse, HandlerResult, RejectedAttempt, WriteContext, WriteResult,
    validate_idempotency_key,
};
pub use metrics::{MetricsError, WriteMetrics};
