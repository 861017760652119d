//! SQLite-specific durability and multi-connection behaviour.

use std::sync::Arc;

use chrono::{TimeDelta, TimeZone, Utc};
use tokio::sync::Barrier;

use outflow_core::app::{ClaimDispatcher, TickOutcome};
use outflow_core::impls::SqliteStore;
use outflow_core::ports::{Clock, CustomerStore, FixedClock, OutboxStore};
use outflow_core::{CustomerUpdate, EventStatus, NewCustomer, OutflowError, RelayConfig};

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
    ))
}

#[tokio::test]
async fn outbox_insert_failure_rolls_back_the_entity_write() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("outflow.db"), clock()).unwrap();
    {
        let conn = store.connection().lock().unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_outbox BEFORE INSERT ON outbox
             BEGIN SELECT RAISE(ABORT, 'outbox unavailable'); END;",
        )
        .unwrap();
    }

    let err = store
        .create(NewCustomer::new("John Doe", "john@example.com"))
        .await
        .unwrap_err();
    assert!(matches!(&err, OutflowError::Transaction(msg) if msg.contains("outbox unavailable")));
    assert!(store.list(true).await.unwrap().is_empty());
    assert!(store
        .find_by_email("john@example.com", true)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn failed_update_keeps_the_previous_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("outflow.db"), clock()).unwrap();
    let customer = store
        .create(NewCustomer::new("John Doe", "john@example.com"))
        .await
        .unwrap();
    {
        let conn = store.connection().lock().unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_outbox BEFORE INSERT ON outbox
             BEGIN SELECT RAISE(ABORT, 'outbox unavailable'); END;",
        )
        .unwrap();
    }

    let err = store
        .update(CustomerUpdate::new(customer.id, "Jane Doe", "jane@example.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, OutflowError::Transaction(_)));
    assert_eq!(
        store.find_by_id(customer.id, false).await.unwrap(),
        Some(customer)
    );
    assert_eq!(store.list_events().await.unwrap().len(), 1);
}

#[tokio::test]
async fn watermark_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outflow.db");
    let clock = clock();

    let (first_id, second_id) = {
        let store = SqliteStore::open(&path, clock.clone()).unwrap();
        store
            .create(NewCustomer::new("A", "a@example.com"))
            .await
            .unwrap();
        store
            .create(NewCustomer::new("B", "b@example.com"))
            .await
            .unwrap();
        let events = store.list_events().await.unwrap();
        let lease = store
            .try_claim(&events[0].guard(), clock.now())
            .await
            .unwrap();
        store.mark_processed(&lease.guard(), clock.now()).await.unwrap();
        (events[0].id, events[1].id)
    };

    let reopened = Arc::new(SqliteStore::open(&path, clock.clone()).unwrap());
    assert_eq!(
        reopened.get_event(first_id).await.unwrap().unwrap().status,
        EventStatus::Processed
    );
    let dispatcher = ClaimDispatcher::new(reopened.clone(), clock.clone(), RelayConfig::default());
    match dispatcher.run_once().await.unwrap() {
        TickOutcome::Claimed(event) => assert_eq!(event.id, second_id),
        other => panic!("expected the second event, got {other:?}"),
    }
}

#[tokio::test]
async fn stored_values_use_the_documented_names() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("outflow.db"), clock()).unwrap();
    let customer = store
        .create(NewCustomer::new("John Doe", "john@example.com"))
        .await
        .unwrap();
    store.soft_delete(customer.id).await.unwrap();

    let conn = store.connection().lock().unwrap();
    let mut stmt = conn
        .prepare("SELECT event_type, status, json_extract(payload, '$.email') FROM outbox ORDER BY created_at")
        .unwrap();
    let rows: Vec<(String, String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        rows,
        vec![
            ("CustomerCreated".into(), "pending".into(), "john@example.com".into()),
            ("CustomerDeleted".into(), "pending".into(), "john@example.com".into()),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn separate_connections_race_for_one_claim() {
    const CONNECTIONS: usize = 4;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outflow.db");
    let clock = clock();

    let stores: Vec<Arc<SqliteStore>> = (0..CONNECTIONS)
        .map(|_| Arc::new(SqliteStore::open(&path, clock.clone()).unwrap()))
        .collect();
    stores[0]
        .create(NewCustomer::new("A", "a@example.com"))
        .await
        .unwrap();
    let head = stores[0].head_of_line(None).await.unwrap().unwrap();
    let guard = head.guard();
    let now = clock.now() + TimeDelta::seconds(1);

    let barrier = Arc::new(Barrier::new(CONNECTIONS));
    let mut joins = Vec::new();
    for store in &stores {
        let store = store.clone();
        let barrier = barrier.clone();
        joins.push(tokio::spawn(async move {
            barrier.wait().await;
            store.try_claim(&guard, now).await
        }));
    }

    let mut winners = 0;
    for join in joins {
        match join.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert!(e.is_conflict(), "unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
    let stored = stores[1].get_event(head.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Processing);
    assert_eq!(stored.updated_at, now);
}
