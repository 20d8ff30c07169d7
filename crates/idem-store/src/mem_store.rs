use crate::{
    AuditEntry, AuditLog, AuditRetention, AuditSummary, ClaimOutcome, ClaimRequest, ClaimToken,
    IdempotencyRecord, KeyStore, RecordKey, RecordStatus, StoreError, StoreResult, StoredResult,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

#[derive(Default)]
struct MemState {
    records: HashMap<RecordKey, IdempotencyRecord>,
    audit: Vec<AuditEntry>,
}

/// In-process store. One mutex makes `try_claim` atomic within the process;
/// it does not coordinate separate processes.
#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<MemState>>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("MemStore");
        if let Ok(state) = self.state.lock() {
            dbg.field("records", &state.records.len())
                .field("audit", &state.audit.len());
        }
        dbg.finish()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    /// Snapshot of the audit ledger in append order.
    pub fn audit_entries(&self) -> StoreResult<Vec<AuditEntry>> {
        Ok(self.lock()?.audit.clone())
    }
}

fn claimable(record: &IdempotencyRecord, now_ms: i64) -> bool {
    match record.status {
        RecordStatus::Failed => true,
        RecordStatus::Completed => record.expires_at_ms <= now_ms,
        RecordStatus::Pending => false,
    }
}

/// The PENDING record still held under `token`.
fn owned_claim<'a>(
    state: &'a mut MemState,
    key: &RecordKey,
    token: &ClaimToken,
) -> StoreResult<&'a mut IdempotencyRecord> {
    match state.records.get_mut(key) {
        Some(record) if record.status == RecordStatus::Pending && &record.claim_token == token => {
            Ok(record)
        }
        Some(_) => Err(StoreError::NotPending(key.clone())),
        None => Err(StoreError::NotFound(key.clone())),
    }
}

#[async_trait]
impl KeyStore for MemStore {
    async fn try_claim(&self, claim: &ClaimRequest) -> StoreResult<ClaimOutcome> {
        let mut state = self.lock()?;
        if let Some(existing) = state.records.get(&claim.key) {
            if !claimable(existing, claim.now_ms) {
                if existing.request_fingerprint != claim.fingerprint {
                    return Ok(ClaimOutcome::FingerprintConflict);
                }
                return match (&existing.status, &existing.result) {
                    (RecordStatus::Completed, Some(result)) => {
                        Ok(ClaimOutcome::AlreadyCompleted(result.clone()))
                    }
                    (RecordStatus::Completed, None) => Err(StoreError::Corrupt(format!(
                        "completed record {} has no result",
                        claim.key
                    ))),
                    _ => Ok(ClaimOutcome::AlreadyPending),
                };
            }
        }
        let token = ClaimToken::generate();
        state.records.insert(
            claim.key.clone(),
            IdempotencyRecord {
                key: claim.key.clone(),
                request_fingerprint: claim.fingerprint.clone(),
                status: RecordStatus::Pending,
                claim_token: token.clone(),
                result: None,
                failure_reason: None,
                created_at_ms: claim.now_ms,
                completed_at_ms: None,
                expires_at_ms: claim.expires_at_ms,
                lease_expires_at_ms: claim.lease_until_ms,
            },
        );
        Ok(ClaimOutcome::Claimed(token))
    }

    async fn complete(
        &self,
        key: &RecordKey,
        token: &ClaimToken,
        result: &StoredResult,
        now_ms: i64,
    ) -> StoreResult<()> {
        let mut state = self.lock()?;
        let record = owned_claim(&mut state, key, token)?;
        record.status = RecordStatus::Completed;
        record.result = Some(result.clone());
        record.completed_at_ms = Some(now_ms);
        Ok(())
    }

    async fn fail(
        &self,
        key: &RecordKey,
        token: &ClaimToken,
        reason: &str,
        now_ms: i64,
    ) -> StoreResult<()> {
        let mut state = self.lock()?;
        let record = owned_claim(&mut state, key, token)?;
        record.status = RecordStatus::Failed;
        record.failure_reason = Some(reason.to_string());
        record.completed_at_ms = Some(now_ms);
        Ok(())
    }

    async fn renew_lease(
        &self,
        key: &RecordKey,
        token: &ClaimToken,
        lease_until_ms: i64,
    ) -> StoreResult<()> {
        let mut state = self.lock()?;
        let record = owned_claim(&mut state, key, token)?;
        record.lease_expires_at_ms = record.lease_expires_at_ms.max(lease_until_ms);
        Ok(())
    }

    async fn get(&self, key: &RecordKey) -> StoreResult<Option<IdempotencyRecord>> {
        Ok(self.lock()?.records.get(key).cloned())
    }

    async fn purge_expired(&self, now_ms: i64) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let before = state.records.len();
        state
            .records
            .retain(|_, r| r.status == RecordStatus::Pending || r.expires_at_ms > now_ms);
        Ok((before - state.records.len()) as u64)
    }

    async fn abandon_stale(&self, now_ms: i64) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let mut count = 0;
        for record in state.records.values_mut() {
            if record.status == RecordStatus::Pending && record.lease_expires_at_ms <= now_ms {
                record.status = RecordStatus::Failed;
                record.failure_reason = Some(crate::STALE_CLAIM_REASON.into());
                record.completed_at_ms = Some(now_ms);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn record_count(&self) -> StoreResult<u64> {
        Ok(self.lock()?.records.len() as u64)
    }
}

#[async_trait]
impl AuditLog for MemStore {
    async fn append(&self, entry: &AuditEntry) -> StoreResult<()> {
        self.lock()?.audit.push(entry.clone());
        Ok(())
    }

    async fn summarize(
        &self,
        tenant_id: &str,
        operation_name: Option<&str>,
        since_ms: i64,
    ) -> StoreResult<AuditSummary> {
        let state = self.lock()?;
        let mut summary = AuditSummary::default();
        for entry in state.audit.iter().filter(|e| {
            e.tenant_id.as_deref() == Some(tenant_id)
                && e.timestamp_ms >= since_ms
                && operation_name.is_none_or(|op| e.operation_name == op)
        }) {
            summary.add(entry.outcome, 1);
        }
        Ok(summary)
    }
}

#[async_trait]
impl AuditRetention for MemStore {
    async fn prune_before(&self, cutoff_ms: i64) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let before = state.audit.len();
        state.audit.retain(|e| e.timestamp_ms >= cutoff_ms);
        Ok((before - state.audit.len()) as u64)
    }
}
