//! HTTP enforcement in front of mutating endpoints.
//!
//! [`RouteGate`] builds axum routes whose handlers only ever run through the
//! execution guard. [`admin_router`] serves metrics and the audit
//! reconciliation query. [`Sweeper`] runs purge and stale-claim recovery in the
//! background, and [`spawn_server`] hosts the assembled router.

pub mod access;
pub mod admin;
pub mod error;
pub mod gate;
pub mod server;
pub mod sweeper;

pub use access::{AccessControl, Caller, HeaderAccessControl};
pub use admin::admin_router;
pub use error::{ApiError, GateError, GateResult};
pub use gate::{
    CORRELATION_HEADER, GatedRequest, IDEMPOTENCY_KEY_HEADER, REPLAY_HEADER, RouteGate,
};
pub use server::spawn_server;
pub use sweeper::{SweepReport, Sweeper};
