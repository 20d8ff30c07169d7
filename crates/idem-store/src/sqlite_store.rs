//! SQLite backend shared by every worker process pointing at the same file.
//!
//! Claims are decided by one upsert against the composite primary key of
//! `idempotency_records`. The statement's change count says whether this
//! caller won; the follow-up read runs inside the same IMMEDIATE transaction.
//! Later transitions match on the claim token as well as the status, so a
//! released claim's owner cannot write over the record's next owner.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use crate::{
    AuditEntry, AuditLog, AuditOutcome, AuditRetention, AuditSummary, ClaimOutcome,
    ClaimRequest, ClaimToken, IdempotencyRecord, KeyStore, RecordKey, RecordStatus, STALE_CLAIM_REASON,
    StoreError, StoreResult, StoredResult,
};

const SCHEMA_VERSION: i64 = 2;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const RECORD_COLUMNS: &str = "tenant_id, operation_name, idempotency_key, request_fingerprint, \
     status, result_payload, result_status_code, failure_reason, created_at_ms, \
     completed_at_ms, expires_at_ms, claim_token, lease_expires_at_ms";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    location: PathBuf,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("location", &self.location)
            .finish()
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            StoreError::Unavailable(format!("open sqlite store {}: {e}", path.display()))
        })?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::init(conn, path.to_path_buf())
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(format!("open in-memory sqlite store: {e}")))?;
        Self::init(conn, PathBuf::from(":memory:"))
    }

    fn init(mut conn: Connection, location: PathBuf) -> StoreResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrate(&mut conn)?;
        tracing::debug!(location = %location.display(), "sqlite idempotency store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            location,
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite store lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("sqlite task failed: {e}")))?
    }
}

fn migrate(conn: &mut Connection) -> StoreResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
             version INTEGER PRIMARY KEY,
             name TEXT NOT NULL
         )",
    )?;
    let current: i64 = tx.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::Corrupt(format!(
            "sqlite schema version {current} is newer than supported {SCHEMA_VERSION}"
        )));
    }
    if current < 1 {
        tx.execute_batch(
            "CREATE TABLE idempotency_records (
                 tenant_id TEXT NOT NULL,
                 operation_name TEXT NOT NULL,
                 idempotency_key TEXT NOT NULL,
                 request_fingerprint TEXT NOT NULL,
                 status TEXT NOT NULL,
                 result_payload TEXT,
                 result_status_code INTEGER,
                 failure_reason TEXT,
                 created_at_ms INTEGER NOT NULL,
                 completed_at_ms INTEGER,
                 expires_at_ms INTEGER NOT NULL,
                 PRIMARY KEY (tenant_id, operation_name, idempotency_key)
             );
             CREATE INDEX idx_idempotency_records_expiry
                 ON idempotency_records (status, expires_at_ms);
             CREATE TABLE idempotent_write_audit_log (
                 id TEXT PRIMARY KEY,
                 tenant_id TEXT,
                 operation_name TEXT NOT NULL,
                 idempotency_key TEXT,
                 outcome TEXT NOT NULL,
                 actor_id TEXT,
                 correlation_id TEXT NOT NULL,
                 timestamp_ms INTEGER NOT NULL
             );
             CREATE INDEX idx_audit_tenant_time
                 ON idempotent_write_audit_log (tenant_id, timestamp_ms);",
        )?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (1, 'baseline')",
            [],
        )?;
    }
    if current < 2 {
        tx.execute_batch(
            "ALTER TABLE idempotency_records ADD COLUMN claim_token TEXT NOT NULL DEFAULT '';
             ALTER TABLE idempotency_records
                 ADD COLUMN lease_expires_at_ms INTEGER NOT NULL DEFAULT 0;
             CREATE INDEX idx_idempotency_records_lease
                 ON idempotency_records (status, lease_expires_at_ms);",
        )?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (2, 'claim_lease')",
            [],
        )?;
    }
    tx.commit()?;
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<(IdempotencyRecord, String, Option<i64>)> {
    let status: String = row.get(4)?;
    let payload: Option<String> = row.get(5)?;
    let status_code: Option<i64> = row.get(6)?;
    let record = IdempotencyRecord {
        key: RecordKey::new(
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ),
        request_fingerprint: row.get(3)?,
        status: RecordStatus::Pending,
        claim_token: ClaimToken::from(row.get::<_, String>(11)?),
        result: payload.map(|payload| StoredResult {
            status_code: 0,
            payload,
        }),
        failure_reason: row.get(7)?,
        created_at_ms: row.get(8)?,
        completed_at_ms: row.get(9)?,
        expires_at_ms: row.get(10)?,
        lease_expires_at_ms: row.get(12)?,
    };
    Ok((record, status, status_code))
}

/// Finish decoding the columns rusqlite cannot map on its own.
fn finish_record(
    (mut record, status, status_code): (IdempotencyRecord, String, Option<i64>),
) -> StoreResult<IdempotencyRecord> {
    record.status = status.parse()?;
    if let Some(result) = record.result.as_mut() {
        let code = status_code.ok_or_else(|| {
            StoreError::Corrupt(format!("record {} has a payload but no status", record.key))
        })?;
        result.status_code = u16::try_from(code)
            .map_err(|_| StoreError::Corrupt(format!("invalid status code {code}")))?;
    }
    Ok(record)
}

fn load_record(conn: &Connection, key: &RecordKey) -> StoreResult<Option<IdempotencyRecord>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM idempotency_records
         WHERE tenant_id = ?1 AND operation_name = ?2 AND idempotency_key = ?3"
    );
    conn.query_row(
        &sql,
        params![key.tenant_id, key.operation_name, key.idempotency_key],
        record_from_row,
    )
    .optional()?
    .map(finish_record)
    .transpose()
}

fn not_updated(conn: &Connection, key: &RecordKey) -> StoreError {
    match load_record(conn, key) {
        Ok(Some(_)) => StoreError::NotPending(key.clone()),
        Ok(None) => StoreError::NotFound(key.clone()),
        Err(err) => err,
    }
}

#[async_trait]
impl KeyStore for SqliteStore {
    async fn try_claim(&self, claim: &ClaimRequest) -> StoreResult<ClaimOutcome> {
        let claim = claim.clone();
        let token = ClaimToken::generate();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = tx.execute(
                "INSERT INTO idempotency_records
                     (tenant_id, operation_name, idempotency_key, request_fingerprint, status,
                      result_payload, result_status_code, failure_reason, created_at_ms,
                      completed_at_ms, expires_at_ms, claim_token, lease_expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4, 'PENDING', NULL, NULL, NULL, ?5, NULL, ?6, ?7, ?8)
                 ON CONFLICT (tenant_id, operation_name, idempotency_key) DO UPDATE SET
                     request_fingerprint = excluded.request_fingerprint,
                     status = 'PENDING',
                     result_payload = NULL,
                     result_status_code = NULL,
                     failure_reason = NULL,
                     created_at_ms = excluded.created_at_ms,
                     completed_at_ms = NULL,
                     expires_at_ms = excluded.expires_at_ms,
                     claim_token = excluded.claim_token,
                     lease_expires_at_ms = excluded.lease_expires_at_ms
                 WHERE idempotency_records.status = 'FAILED'
                    OR (idempotency_records.status = 'COMPLETED'
                        AND idempotency_records.expires_at_ms <= excluded.created_at_ms)",
                params![
                    claim.key.tenant_id,
                    claim.key.operation_name,
                    claim.key.idempotency_key,
                    claim.fingerprint,
                    claim.now_ms,
                    claim.expires_at_ms,
                    token.as_str(),
                    claim.lease_until_ms,
                ],
            )?;
            let outcome = if changed == 1 {
                ClaimOutcome::Claimed(token)
            } else {
                let existing = load_record(&tx, &claim.key)?.ok_or_else(|| {
                    StoreError::Corrupt(format!("claim lost record {}", claim.key))
                })?;
                if existing.request_fingerprint != claim.fingerprint {
                    ClaimOutcome::FingerprintConflict
                } else {
                    match (existing.status, existing.result) {
                        (RecordStatus::Completed, Some(result)) => {
                            ClaimOutcome::AlreadyCompleted(result)
                        }
                        (RecordStatus::Completed, None) => {
                            return Err(StoreError::Corrupt(format!(
                                "completed record {} has no result",
                                claim.key
                            )));
                        }
                        _ => ClaimOutcome::AlreadyPending,
                    }
                }
            };
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn complete(
        &self,
        key: &RecordKey,
        token: &ClaimToken,
        result: &StoredResult,
        now_ms: i64,
    ) -> StoreResult<()> {
        let key = key.clone();
        let token = token.clone();
        let result = result.clone();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE idempotency_records
                 SET status = 'COMPLETED', result_payload = ?5, result_status_code = ?6,
                     completed_at_ms = ?7
                 WHERE tenant_id = ?1 AND operation_name = ?2 AND idempotency_key = ?3
                   AND status = 'PENDING' AND claim_token = ?4",
                params![
                    key.tenant_id,
                    key.operation_name,
                    key.idempotency_key,
                    token.as_str(),
                    result.payload,
                    i64::from(result.status_code),
                    now_ms,
                ],
            )?;
            if updated == 0 {
                return Err(not_updated(conn, &key));
            }
            Ok(())
        })
        .await
    }

    async fn fail(
        &self,
        key: &RecordKey,
        token: &ClaimToken,
        reason: &str,
        now_ms: i64,
    ) -> StoreResult<()> {
        let key = key.clone();
        let token = token.clone();
        let reason = reason.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE idempotency_records
                 SET status = 'FAILED', failure_reason = ?5, completed_at_ms = ?6
                 WHERE tenant_id = ?1 AND operation_name = ?2 AND idempotency_key = ?3
                   AND status = 'PENDING' AND claim_token = ?4",
                params![
                    key.tenant_id,
                    key.operation_name,
                    key.idempotency_key,
                    token.as_str(),
                    reason,
                    now_ms,
                ],
            )?;
            if updated == 0 {
                return Err(not_updated(conn, &key));
            }
            Ok(())
        })
        .await
    }

    async fn renew_lease(
        &self,
        key: &RecordKey,
        token: &ClaimToken,
        lease_until_ms: i64,
    ) -> StoreResult<()> {
        let key = key.clone();
        let token = token.clone();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE idempotency_records
                 SET lease_expires_at_ms = MAX(lease_expires_at_ms, ?5)
                 WHERE tenant_id = ?1 AND operation_name = ?2 AND idempotency_key = ?3
                   AND status = 'PENDING' AND claim_token = ?4",
                params![
                    key.tenant_id,
                    key.operation_name,
                    key.idempotency_key,
                    token.as_str(),
                    lease_until_ms,
                ],
            )?;
            if updated == 0 {
                return Err(not_updated(conn, &key));
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &RecordKey) -> StoreResult<Option<IdempotencyRecord>> {
        let key = key.clone();
        self.with_conn(move |conn| load_record(conn, &key)).await
    }

    async fn purge_expired(&self, now_ms: i64) -> StoreResult<u64> {
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM idempotency_records
                 WHERE status IN ('COMPLETED', 'FAILED') AND expires_at_ms <= ?1",
                params![now_ms],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn abandon_stale(&self, now_ms: i64) -> StoreResult<u64> {
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE idempotency_records
                 SET status = 'FAILED', failure_reason = ?2, completed_at_ms = ?1
                 WHERE status = 'PENDING' AND lease_expires_at_ms <= ?1",
                params![now_ms, STALE_CLAIM_REASON],
            )?;
            Ok(updated as u64)
        })
        .await
    }

    async fn record_count(&self) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM idempotency_records", [], |row| {
                    row.get(0)
                })?;
            Ok(count as u64)
        })
        .await
    }
}

#[async_trait]
impl AuditLog for SqliteStore {
    async fn append(&self, entry: &AuditEntry) -> StoreResult<()> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO idempotent_write_audit_log
                     (id, tenant_id, operation_name, idempotency_key, outcome, actor_id,
                      correlation_id, timestamp_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.id,
                    entry.tenant_id,
                    entry.operation_name,
                    entry.idempotency_key,
                    entry.outcome.as_str(),
                    entry.actor_id,
                    entry.correlation_id,
                    entry.timestamp_ms,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn summarize(
        &self,
        tenant_id: &str,
        operation_name: Option<&str>,
        since_ms: i64,
    ) -> StoreResult<AuditSummary> {
        let tenant_id = tenant_id.to_string();
        let operation_name = operation_name.map(str::to_string);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT outcome, COUNT(*) FROM idempotent_write_audit_log
                 WHERE tenant_id = ?1 AND timestamp_ms >= ?2
                   AND (?3 IS NULL OR operation_name = ?3)
                 GROUP BY outcome",
            )?;
            let rows = stmt.query_map(params![tenant_id, since_ms, operation_name], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut summary = AuditSummary::default();
            for row in rows {
                let (outcome, count) = row?;
                summary.add(outcome.parse::<AuditOutcome>()?, count as u64);
            }
            Ok(summary)
        })
        .await
    }
}

#[async_trait]
impl AuditRetention for SqliteStore {
    async fn prune_before(&self, cutoff_ms: i64) -> StoreResult<u64> {
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM idempotent_write_audit_log WHERE timestamp_ms < ?1",
                params![cutoff_ms],
            )?;
            Ok(deleted as u64)
        })
        .await
    }
}
