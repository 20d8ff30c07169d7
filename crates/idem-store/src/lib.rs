//! Persistence for idempotent writes: the tenant-scoped key store that decides
//! claim races, and the append-only audit ledger.

mod clock;
mod fingerprint;
mod mem_store;
mod sqlite_store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use fingerprint::{FINGERPRINT_PREFIX, fingerprint};
pub use mem_store::MemStore;
pub use sqlite_store::SqliteStore;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Failure reason recorded when the sweeper releases a claim whose lease lapsed.
pub const STALE_CLAIM_REASON: &str = "stale_claim_abandoned";

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynKeyStore = Arc<dyn KeyStore>;
pub type DynAuditLog = Arc<dyn AuditLog>;

/// Composite identity of an idempotency record. Unique per store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub tenant_id: String,
    pub operation_name: String,
    pub idempotency_key: String,
}

impl RecordKey {
    pub fn new(
        tenant_id: impl Into<String>,
        operation_name: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            operation_name: operation_name.into(),
            idempotency_key: idempotency_key.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.tenant_id, self.operation_name, self.idempotency_key
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Pending,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Pending => "PENDING",
            RecordStatus::Completed => "COMPLETED",
            RecordStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RecordStatus::Pending),
            "COMPLETED" => Ok(RecordStatus::Completed),
            "FAILED" => Ok(RecordStatus::Failed),
            other => Err(StoreError::Corrupt(format!("unknown record status '{other}'"))),
        }
    }
}

/// Response captured from the first successful execution, replayed verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResult {
    pub status_code: u16,
    pub payload: String,
}

/// Ownership proof handed out by a successful claim. `complete`, `fail` and
/// `renew_lease` only act on the claim that still carries the same token.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(String);

impl ClaimToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ClaimToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: RecordKey,
    pub request_fingerprint: String,
    pub status: RecordStatus,
    pub claim_token: ClaimToken,
    pub result: Option<StoredResult>,
    pub failure_reason: Option<String>,
    pub created_at_ms: i64,
    pub completed_at_ms: Option<i64>,
    pub expires_at_ms: i64,
    /// A PENDING claim whose lease has lapsed may be released by the sweeper.
    pub lease_expires_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct ClaimRequest {
    pub key: RecordKey,
    pub fingerprint: String,
    pub now_ms: i64,
    pub expires_at_ms: i64,
    pub lease_until_ms: i64,
}

/// Result of the single atomic claim attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(ClaimToken),
    AlreadyPending,
    AlreadyCompleted(StoredResult),
    FingerprintConflict,
}

/// Tenant-scoped idempotency records.
///
/// `try_claim` is the only place a race between callers is decided and must
/// be atomic across every process sharing the backing store. A FAILED record,
/// or a COMPLETED one past its expiry, is taken over by the next claim.
///
/// Every transition after the claim names the token it was issued. A record
/// that has been released and re-claimed since answers `NotPending`, so a late
/// owner can never overwrite its successor.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn try_claim(&self, claim: &ClaimRequest) -> StoreResult<ClaimOutcome>;

    /// PENDING -> COMPLETED. Errors with `NotPending` on any other state or a
    /// token mismatch.
    async fn complete(
        &self,
        key: &RecordKey,
        token: &ClaimToken,
        result: &StoredResult,
        now_ms: i64,
    ) -> StoreResult<()>;

    /// PENDING -> FAILED, releasing the claim for a later retry.
    async fn fail(
        &self,
        key: &RecordKey,
        token: &ClaimToken,
        reason: &str,
        now_ms: i64,
    ) -> StoreResult<()>;

    /// Push the lease of a claim the caller still owns out to `lease_until_ms`.
    async fn renew_lease(
        &self,
        key: &RecordKey,
        token: &ClaimToken,
        lease_until_ms: i64,
    ) -> StoreResult<()>;

    async fn get(&self, key: &RecordKey) -> StoreResult<Option<IdempotencyRecord>>;

    /// Delete COMPLETED/FAILED records whose expiry has passed. PENDING rows
    /// are left alone so a purge never races an in-flight claim.
    async fn purge_expired(&self, now_ms: i64) -> StoreResult<u64>;

    /// Mark PENDING claims whose lease ended at or before `now_ms` as FAILED.
    async fn abandon_stale(&self, now_ms: i64) -> StoreResult<u64>;

    async fn record_count(&self) -> StoreResult<u64>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Executed,
    Deduplicated,
    Conflict,
    Rejected,
    Failed,
}

impl AuditOutcome {
    pub const ALL: [AuditOutcome; 5] = [
        AuditOutcome::Executed,
        AuditOutcome::Deduplicated,
        AuditOutcome::Conflict,
        AuditOutcome::Rejected,
        AuditOutcome::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Executed => "EXECUTED",
            AuditOutcome::Deduplicated => "DEDUPLICATED",
            AuditOutcome::Conflict => "CONFLICT",
            AuditOutcome::Rejected => "REJECTED",
            AuditOutcome::Failed => "FAILED",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditOutcome {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditOutcome::ALL
            .into_iter()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown audit outcome '{s}'")))
    }
}

/// One row per inbound attempt, whether or not the handler ran.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub tenant_id: Option<String>,
    pub operation_name: String,
    pub idempotency_key: Option<String>,
    pub outcome: AuditOutcome,
    pub actor_id: Option<String>,
    pub correlation_id: String,
    pub timestamp_ms: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub executed: u64,
    pub deduplicated: u64,
    pub conflict: u64,
    pub rejected: u64,
    pub failed: u64,
}

impl AuditSummary {
    pub fn add(&mut self, outcome: AuditOutcome, count: u64) {
        match outcome {
            AuditOutcome::Executed => self.executed += count,
            AuditOutcome::Deduplicated => self.deduplicated += count,
            AuditOutcome::Conflict => self.conflict += count,
            AuditOutcome::Rejected => self.rejected += count,
            AuditOutcome::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.executed + self.deduplicated + self.conflict + self.rejected + self.failed
    }
}

/// Append-only attempt ledger. Exposes no update or delete.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> StoreResult<()>;

    /// Per-outcome counts for `tenant_id` since `since_ms`, optionally
    /// narrowed to one operation.
    async fn summarize(
        &self,
        tenant_id: &str,
        operation_name: Option<&str>,
        since_ms: i64,
    ) -> StoreResult<AuditSummary>;
}

/// Compliance-window pruning. Only the background sweeper holds this.
#[async_trait]
pub trait AuditRetention: Send + Sync {
    async fn prune_before(&self, cutoff_ms: i64) -> StoreResult<u64>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("record {0} is not pending")]
    NotPending(RecordKey),
    #[error("record {0} not found")]
    NotFound(RecordKey),
    #[error("corrupt store data: {0}")]
    Corrupt(String),
}
