//! The execution guard: runs a handler at most once per
//! (tenant, operation, idempotency key) and replays the recorded result on
//! every later attempt.
//!
//! Each attempt goes through four steps:
//! 1. Fingerprint the payload (canonical JSON, SHA-256).
//! 2. Make one atomic `try_claim` against the shared key store.
//! 3. Act on the claim outcome:
//!    - conflict: reject;
//!    - completed: replay;
//!    - pending: wait and poll;
//!    - claimed: execute.
//! 4. Append one audit entry and one metrics observation before returning.
//!
//! Claim, handler and complete/fail run in a spawned task. A caller that goes
//! away mid-request therefore cannot leave its claim stranded in PENDING.
//! While the handler runs the guard keeps renewing the claim's lease, so only
//! claims whose owner stopped renewing are released by stale-claim recovery.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use idem_registry::{MutationDescriptor, Registry};
use idem_store::{
    AuditEntry, AuditOutcome, ClaimOutcome, ClaimRequest, ClaimToken, Clock, DynAuditLog,
    DynKeyStore, RecordKey, StoreError, StoredResult, SystemClock, fingerprint,
};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::GuardConfig;
use crate::error::{GuardError, HandlerError};
use crate::metrics::WriteMetrics;

const COMPLETE_ATTEMPTS: u32 = 3;

type Execution = Result<HandlerResult, Box<dyn std::any::Any + Send>>;

enum ClaimStep {
    Owned(ClaimToken),
    Replay(WriteResult),
}

/// Identity of one inbound write attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteContext {
    pub tenant_id: String,
    pub operation_name: String,
    pub idempotency_key: String,
    pub actor_id: Option<String>,
    pub correlation_id: String,
}

impl WriteContext {
    fn record_key(&self) -> RecordKey {
        RecordKey::new(
            self.tenant_id.clone(),
            self.operation_name.clone(),
            self.idempotency_key.clone(),
        )
    }
}

/// An attempt turned away before reaching the key store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RejectedAttempt {
    pub operation_name: String,
    pub tenant_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub actor_id: Option<String>,
    pub correlation_id: String,
}

/// Successful handler output.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerResponse {
    pub status_code: u16,
    pub body: serde_json::Value,
}

impl HandlerResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self {
            status_code: 200,
            body,
        }
    }

    pub fn created(body: serde_json::Value) -> Self {
        Self {
            status_code: 201,
            body,
        }
    }
}

pub type HandlerResult = Result<HandlerResponse, HandlerError>;

/// What the caller sees. `payload` is byte-identical between the original
/// execution and every replay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteResult {
    pub status_code: u16,
    pub payload: String,
    pub replayed: bool,
}

impl WriteResult {
    fn from_stored(stored: StoredResult, replayed: bool) -> Self {
        Self {
            status_code: stored.status_code,
            payload: stored.payload,
            replayed,
        }
    }
}

/// Validate a client-supplied idempotency key: 1..=`max_len` bytes of visible
/// ASCII.
pub fn validate_idempotency_key(key: &str, max_len: usize) -> Result<(), GuardError> {
    if key.is_empty() {
        return Err(GuardError::InvalidKey("key is empty".into()));
    }
    if key.len() > max_len {
        return Err(GuardError::InvalidKey(format!(
            "key is {} bytes, limit is {max_len}",
            key.len()
        )));
    }
    if !key.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(GuardError::InvalidKey(
            "key must be visible ASCII without spaces".into(),
        ));
    }
    Ok(())
}

struct GuardInner {
    registry: Arc<Registry>,
    store: DynKeyStore,
    audit: DynAuditLog,
    metrics: WriteMetrics,
    config: GuardConfig,
    clock: Arc<dyn Clock>,
}

/// Cheap to clone; clones share the store, ledger and metrics.
#[derive(Clone)]
pub struct ExecutionGuard {
    inner: Arc<GuardInner>,
}

impl std::fmt::Debug for ExecutionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGuard")
            .field("operations", &self.inner.registry.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl ExecutionGuard {
    pub fn new(
        registry: Arc<Registry>,
        store: DynKeyStore,
        audit: DynAuditLog,
        metrics: WriteMetrics,
        config: GuardConfig,
    ) -> Self {
        Self::with_clock(registry, store, audit, metrics, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        registry: Arc<Registry>,
        store: DynKeyStore,
        audit: DynAuditLog,
        metrics: WriteMetrics,
        config: GuardConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                registry,
                store,
                audit,
                metrics,
                config,
                clock,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &GuardConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &WriteMetrics {
        &self.inner.metrics
    }

    pub fn store(&self) -> &DynKeyStore {
        &self.inner.store
    }

    pub fn audit(&self) -> &DynAuditLog {
        &self.inner.audit
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Run `handler` at most once for the attempt's record key.
    pub async fn with_idempotent_write<F, Fut>(
        &self,
        ctx: WriteContext,
        raw_payload: Vec<u8>,
        handler: F,
    ) -> Result<WriteResult, GuardError>
    where
        F: FnOnce(Vec<u8>) -> Fut + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let guard = self.clone();
        let started = Instant::now();
        let task = tokio::spawn(async move { guard.run(ctx, raw_payload, handler, started).await });
        match task.await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(error = %err, "idempotent write task did not finish");
                Err(GuardError::Execution(HandlerError::internal(
                    "idempotent write task did not finish",
                )))
            }
        }
    }

    /// Ledger and metrics for an attempt rejected before the claim step.
    pub async fn record_rejection(&self, attempt: RejectedAttempt, started: Instant) {
        let entry = AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: attempt.tenant_id,
            operation_name: attempt.operation_name,
            idempotency_key: attempt.idempotency_key,
            outcome: AuditOutcome::Rejected,
            actor_id: attempt.actor_id,
            correlation_id: attempt.correlation_id,
            timestamp_ms: self.inner.clock.now_ms(),
        };
        self.emit(entry, started).await;
    }

    async fn run<F, Fut>(
        &self,
        ctx: WriteContext,
        raw_payload: Vec<u8>,
        handler: F,
        started: Instant,
    ) -> Result<WriteResult, GuardError>
    where
        F: FnOnce(Vec<u8>) -> Fut + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if let Err(err) = self.lookup(&ctx.operation_name) {
            self.finish(&ctx, AuditOutcome::Rejected, started).await;
            return Err(err);
        }
        if let Err(err) = validate_idempotency_key(&ctx.idempotency_key, self.inner.config.max_key_len)
        {
            self.finish(&ctx, AuditOutcome::Rejected, started).await;
            return Err(err);
        }

        let request_fingerprint = fingerprint(&raw_payload);
        let token = match self.claim(&ctx, &request_fingerprint).await {
            Ok(ClaimStep::Owned(token)) => token,
            Ok(ClaimStep::Replay(replayed)) => {
                self.finish(&ctx, AuditOutcome::Deduplicated, started).await;
                return Ok(replayed);
            }
            Err(err) => {
                let outcome = match err {
                    GuardError::Conflict | GuardError::InProgress => AuditOutcome::Conflict,
                    _ => AuditOutcome::Rejected,
                };
                self.finish(&ctx, outcome, started).await;
                return Err(err);
            }
        };

        let key = ctx.record_key();
        let executed = self.execute_leased(&key, &token, handler(raw_payload)).await;
        match executed {
            Ok(Ok(response)) => {
                let stored = StoredResult {
                    status_code: response.status_code,
                    payload: response.body.to_string(),
                };
                self.complete(&key, &token, &stored).await;
                self.finish(&ctx, AuditOutcome::Executed, started).await;
                Ok(WriteResult::from_stored(stored, false))
            }
            Ok(Err(err)) => {
                self.release(&key, &token, &err.to_string()).await;
                self.finish(&ctx, AuditOutcome::Failed, started).await;
                Err(GuardError::Execution(err))
            }
            Err(_) => {
                tracing::error!(key = %key, "handler panicked");
                self.release(&key, &token, "handler panicked").await;
                self.finish(&ctx, AuditOutcome::Failed, started).await;
                Err(GuardError::Execution(HandlerError::internal("handler panicked")))
            }
        }
    }

    fn lookup(&self, operation_name: &str) -> Result<&MutationDescriptor, GuardError> {
        self.inner.registry.lookup(operation_name).map_err(|_| {
            tracing::error!(
                operation = operation_name,
                "write reached the guard for an unregistered operation"
            );
            GuardError::Unregistered(operation_name.to_string())
        })
    }

    async fn claim(
        &self,
        ctx: &WriteContext,
        request_fingerprint: &str,
    ) -> Result<ClaimStep, GuardError> {
        let config = &self.inner.config;
        let ttl_ms = millis(config.record_ttl);
        let lease_ms = millis(config.claim_lease);
        let deadline = Instant::now() + config.pending_wait_timeout;
        let mut delay = config.pending_poll_interval;
        loop {
            let now_ms = self.inner.clock.now_ms();
            let request = ClaimRequest {
                key: ctx.record_key(),
                fingerprint: request_fingerprint.to_string(),
                now_ms,
                expires_at_ms: now_ms.saturating_add(ttl_ms),
                lease_until_ms: now_ms.saturating_add(lease_ms),
            };
            let outcome = self.inner.store.try_claim(&request).await.map_err(|err| {
                tracing::warn!(key = %request.key, error = %err, "claim failed; refusing to execute");
                GuardError::StoreUnavailable(err)
            })?;
            match outcome {
                ClaimOutcome::Claimed(token) => return Ok(ClaimStep::Owned(token)),
                ClaimOutcome::AlreadyCompleted(stored) => {
                    return Ok(ClaimStep::Replay(WriteResult::from_stored(stored, true)));
                }
                ClaimOutcome::FingerprintConflict => return Err(GuardError::Conflict),
                ClaimOutcome::AlreadyPending => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(GuardError::InProgress);
                    }
                    tokio::time::sleep(delay.min(deadline - now)).await;
                    delay = (delay * 2).min(config.pending_max_poll_interval);
                }
            }
        }
    }

    /// Drive the handler to completion, renewing the claim's lease every
    /// `lease_renew_interval` until it finishes.
    async fn execute_leased<Fut>(
        &self,
        key: &RecordKey,
        token: &ClaimToken,
        handler: Fut,
    ) -> Execution
    where
        Fut: Future<Output = HandlerResult>,
    {
        let execution = AssertUnwindSafe(handler).catch_unwind();
        tokio::pin!(execution);
        let every = self
            .inner
            .config
            .lease_renew_interval
            .max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                executed = &mut execution => return executed,
                _ = ticker.tick() => self.renew_lease(key, token).await,
            }
        }
    }

    async fn renew_lease(&self, key: &RecordKey, token: &ClaimToken) {
        let lease_until_ms = self
            .inner
            .clock
            .now_ms()
            .saturating_add(millis(self.inner.config.claim_lease));
        match self.inner.store.renew_lease(key, token, lease_until_ms).await {
            Ok(()) => tracing::trace!(key = %key, lease_until_ms, "claim lease renewed"),
            Err(err @ (StoreError::NotPending(_) | StoreError::NotFound(_))) => {
                tracing::error!(
                    key = %key,
                    error = %err,
                    "claim lease lost while the handler was running"
                );
            }
            Err(err) => tracing::warn!(key = %key, error = %err, "renewing claim lease failed"),
        }
    }

    async fn complete(&self, key: &RecordKey, token: &ClaimToken, stored: &StoredResult) {
        let mut backoff = Duration::from_millis(10);
        for attempt in 1..=COMPLETE_ATTEMPTS {
            let now_ms = self.inner.clock.now_ms();
            match self.inner.store.complete(key, token, stored, now_ms).await {
                Ok(()) => return,
                Err(err @ (StoreError::NotPending(_) | StoreError::NotFound(_))) => {
                    tracing::error!(
                        key = %key,
                        error = %err,
                        "claim was released before the handler finished; result not recorded"
                    );
                    return;
                }
                Err(err) if attempt < COMPLETE_ATTEMPTS => {
                    tracing::warn!(key = %key, attempt, error = %err, "completing record failed; retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => {
                    tracing::error!(
                        key = %key,
                        error = %err,
                        "handler succeeded but its result could not be recorded; \
                         claim stays pending until its lease lapses"
                    );
                }
            }
        }
    }

    async fn release(&self, key: &RecordKey, token: &ClaimToken, reason: &str) {
        let now_ms = self.inner.clock.now_ms();
        if let Err(err) = self.inner.store.fail(key, token, reason, now_ms).await {
            tracing::warn!(key = %key, error = %err, "releasing claim failed");
        }
    }

    async fn finish(&self, ctx: &WriteContext, outcome: AuditOutcome, started: Instant) {
        let entry = AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: Some(ctx.tenant_id.clone()),
            operation_name: ctx.operation_name.clone(),
            idempotency_key: Some(ctx.idempotency_key.clone()),
            outcome,
            actor_id: ctx.actor_id.clone(),
            correlation_id: ctx.correlation_id.clone(),
            timestamp_ms: self.inner.clock.now_ms(),
        };
        self.emit(entry, started).await;
    }

    async fn emit(&self, entry: AuditEntry, started: Instant) {
        let latency = started.elapsed();
        self.inner
            .metrics
            .record_outcome(&entry.operation_name, entry.outcome, latency);
        tracing::info!(
            tenant = entry.tenant_id.as_deref().unwrap_or("-"),
            operation = %entry.operation_name,
            key = entry.idempotency_key.as_deref().unwrap_or("-"),
            outcome = %entry.outcome,
            correlation_id = %entry.correlation_id,
            latency_ms = latency.as_millis() as u64,
            "idempotent write attempt"
        );
        if let Err(err) = self.inner.audit.append(&entry).await {
            tracing::warn!(error = %err, "audit append failed");
        }
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(validate_idempotency_key("abc123", 255).is_ok());
        assert!(validate_idempotency_key("load-test-1", 255).is_ok());
        assert!(matches!(
            validate_idempotency_key("", 255),
            Err(GuardError::InvalidKey(_))
        ));
        assert!(validate_idempotency_key("has space", 255).is_err());
        assert!(validate_idempotency_key("ключ", 255).is_err());
        assert!(validate_idempotency_key(&"k".repeat(9), 8).is_err());
        assert!(validate_idempotency_key(&"k".repeat(8), 8).is_ok());
    }
}
