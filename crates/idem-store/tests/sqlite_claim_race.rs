//! Two store handles on one database file stand in for two worker processes.

use futures::future::join_all;
use idem_store::{ClaimOutcome, ClaimRequest, KeyStore, RecordKey, SqliteStore, fingerprint};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_winner_across_handles_sharing_a_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("idempotency.db");
    let replica_a = SqliteStore::open(&path).expect("open a");
    let replica_b = SqliteStore::open(&path).expect("open b");

    let fp = fingerprint(br#"{"amount":100}"#);
    let attempts = (0..64).map(|i| {
        let store = if i % 2 == 0 {
            replica_a.clone()
        } else {
            replica_b.clone()
        };
        let claim = ClaimRequest {
            key: RecordKey::new("acme", "createInvoice", "load-test-1"),
            fingerprint: fp.clone(),
            now_ms: 1_000,
            expires_at_ms: 1_000 + 86_400_000,
            lease_until_ms: 1_000 + 60_000,
        };
        tokio::spawn(async move { store.try_claim(&claim).await })
    });

    let outcomes: Vec<ClaimOutcome> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.expect("join").expect("claim"))
        .collect();

    let winners = outcomes
        .iter()
        .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
        .count();
    assert_eq!(winners, 1);
    assert!(
        outcomes
            .iter()
            .all(|o| matches!(o, ClaimOutcome::Claimed(_) | ClaimOutcome::AlreadyPending))
    );
    assert_eq!(replica_a.record_count().await.expect("count"), 1);
    assert_eq!(replica_b.record_count().await.expect("count"), 1);
}

#[tokio::test]
async fn reopening_keeps_schema_and_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("idempotency.db");
    let claim = ClaimRequest {
        key: RecordKey::new("acme", "runPayroll", uuid::Uuid::new_v4().to_string()),
        fingerprint: fingerprint(b"{}"),
        now_ms: 0,
        expires_at_ms: 10,
        lease_until_ms: 10,
    };
    {
        let store = SqliteStore::open(&path).expect("open");
        assert!(matches!(
            store.try_claim(&claim).await.expect("claim"),
            ClaimOutcome::Claimed(_)
        ));
    }
    let store = SqliteStore::open(&path).expect("reopen");
    assert_eq!(
        store.try_claim(&claim).await.expect("claim"),
        ClaimOutcome::AlreadyPending
    );
}
