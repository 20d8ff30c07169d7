//! Background maintenance for the key store and audit log.
//!
//! Each pass releases PENDING claims whose lease lapsed without renewal,
//! deletes settled records past their expiry, and prunes audit entries older
//! than the retention window.

use std::sync::Arc;
use std::time::Duration;

use idem_guard::{ExecutionGuard, GuardConfig};
use idem_store::{AuditRetention, Clock, DynKeyStore, StoreResult};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub abandoned: u64,
    pub purged: u64,
    pub pruned: u64,
}

pub struct Sweeper {
    store: DynKeyStore,
    retention: Arc<dyn AuditRetention>,
    clock: Arc<dyn Clock>,
    config: GuardConfig,
}

impl Sweeper {
    pub fn new(guard: &ExecutionGuard, retention: Arc<dyn AuditRetention>) -> Self {
        Self {
            store: guard.store().clone(),
            retention,
            clock: guard.clock().clone(),
            config: guard.config().clone(),
        }
    }

    pub async fn sweep_once(&self) -> StoreResult<SweepReport> {
        let now_ms = self.clock.now_ms();
        let abandoned = self.store.abandon_stale(now_ms).await?;
        if abandoned > 0 {
            tracing::warn!(abandoned, "released stale idempotency claims");
        }
        let purged = self.store.purge_expired(now_ms).await?;
        let pruned = self
            .retention
            .prune_before(now_ms - millis(self.config.audit_retention))
            .await?;
        let report = SweepReport {
            abandoned,
            purged,
            pruned,
        };
        tracing::debug!(?report, "idempotency sweep finished");
        Ok(report)
    }

    /// Run passes every `sweep_interval` until `shutdown` fires.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep_once().await {
                            tracing::warn!(error = %err, "idempotency sweep failed");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use idem_guard::WriteMetrics;
    use idem_registry::Registry;
    use idem_store::{
        AuditEntry, AuditLog, AuditOutcome, ClaimOutcome, ClaimRequest, KeyStore, ManualClock, MemStore,
        RecordKey, RecordStatus, STALE_CLAIM_REASON, StoredResult,
    };

    const HOUR_MS: i64 = 3_600_000;

    fn sweeper(store: &MemStore, clock: &ManualClock) -> Sweeper {
        let config = GuardConfig {
            record_ttl: Duration::from_secs(2 * 3600),
            audit_retention: Duration::from_secs(24 * 3600),
            ..GuardConfig::default()
        };
        let guard = ExecutionGuard::with_clock(
            Arc::new(Registry::default()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            WriteMetrics::new().expect("metrics"),
            config,
            Arc::new(clock.clone()),
        );
        Sweeper::new(&guard, Arc::new(store.clone()))
    }

    fn claim(key: &str, now_ms: i64) -> ClaimRequest {
        ClaimRequest {
            key: RecordKey::new("acme", "createInvoice", key),
            fingerprint: "sha256:00".into(),
            now_ms,
            expires_at_ms: now_ms + 2 * HOUR_MS,
            lease_until_ms: now_ms + HOUR_MS,
        }
    }

    fn audit(timestamp_ms: i64) -> AuditEntry {
        AuditEntry {
            id: format!("a-{timestamp_ms}"),
            tenant_id: Some("acme".into()),
            operation_name: "createInvoice".into(),
            idempotency_key: Some("k".into()),
            outcome: AuditOutcome::Executed,
            actor_id: None,
            correlation_id: "c".into(),
            timestamp_ms,
        }
    }

    #[tokio::test]
    async fn sweep_releases_purges_and_prunes() {
        let store = MemStore::new();
        let clock = ManualClock::new(100 * HOUR_MS);
        let start = 100 * HOUR_MS;

        store.try_claim(&claim("stuck", start)).await.expect("claim stuck");
        let ClaimOutcome::Claimed(token) =
            store.try_claim(&claim("done", start)).await.expect("claim done")
        else {
            panic!("expected a fresh claim");
        };
        store
            .complete(
                &RecordKey::new("acme", "createInvoice", "done"),
                &token,
                &StoredResult {
                    status_code: 201,
                    payload: "{}".into(),
                },
                start,
            )
            .await
            .expect("complete");
        store.append(&audit(start - 48 * HOUR_MS)).await.expect("old audit");
        store.append(&audit(start)).await.expect("fresh audit");

        clock.advance(Duration::from_secs(90 * 60));
        let report = sweeper(&store, &clock).sweep_once().await.expect("sweep");
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.purged, 0);
        assert_eq!(report.pruned, 1);

        let stuck = store
            .get(&RecordKey::new("acme", "createInvoice", "stuck"))
            .await
            .expect("get")
            .expect("record");
        assert_eq!(stuck.status, RecordStatus::Failed);
        assert_eq!(stuck.failure_reason.as_deref(), Some(STALE_CLAIM_REASON));

        clock.advance(Duration::from_secs(3600));
        let report = sweeper(&store, &clock).sweep_once().await.expect("sweep");
        assert_eq!(report.purged, 2);
        assert_eq!(store.record_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn spawned_sweeper_stops_on_shutdown() {
        let store = MemStore::new();
        let clock = ManualClock::new(0);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = sweeper(&store, &clock).spawn(shutdown_rx);
        shutdown_tx.send(()).expect("shutdown");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper stopped")
            .expect("join");
    }
}
