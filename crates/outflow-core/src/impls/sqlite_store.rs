//! SQLite customer store + outbox.
//!
//! Entity writes and their outbox append share one `BEGIN IMMEDIATE`
//! transaction. Outbox transitions are single guarded `UPDATE`s; the changed
//! row count decides between success and `Conflict`, so several processes can
//! share the database file.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Params, Row, Transaction, TransactionBehavior, params};

use super::sqlite_db::{ENTITY_SCHEMA, SqliteDb, from_micros, to_micros};
use crate::domain::{
    Customer, CustomerId, CustomerUpdate, EventGuard, EventId, EventStatus, EventType,
    NewCustomer, OutboxEvent, OutflowError, Result,
};
use crate::observability::OutboxCounts;
use crate::ports::{Clock, CustomerStore, IdGenerator, OutboxStore, SharedClock, UlidGenerator};

const CUSTOMER_COLUMNS: &str = "id, name, email, deleted, created_at, updated_at";
const EVENT_COLUMNS: &str = "id, event_type, payload, status, retry_count, error, \
                             created_at, updated_at, last_retry_at, processed_up_to";

pub struct SqliteStore {
    db: SqliteDb,
    clock: SharedClock,
    ids: UlidGenerator<SharedClock>,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: impl AsRef<Path>, clock: SharedClock) -> Result<Self> {
        Ok(Self::with_db(SqliteDb::open(path.as_ref(), ENTITY_SCHEMA)?, clock))
    }

    pub fn open_in_memory(clock: SharedClock) -> Result<Self> {
        Ok(Self::with_db(SqliteDb::open_in_memory(ENTITY_SCHEMA)?, clock))
    }

    fn with_db(db: SqliteDb, clock: SharedClock) -> Self {
        Self {
            db,
            ids: UlidGenerator::new(clock.clone()),
            clock,
        }
    }

    /// The raw connection, for migrations and ad-hoc queries.
    pub fn connection(&self) -> &Arc<Mutex<Connection>> {
        self.db.connection()
    }
}

struct CustomerRow {
    id: String,
    name: String,
    email: String,
    deleted: bool,
    created_at: i64,
    updated_at: i64,
}

impl CustomerRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            deleted: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }
}

impl TryFrom<CustomerRow> for Customer {
    type Error = OutflowError;

    fn try_from(row: CustomerRow) -> Result<Self> {
        Ok(Customer {
            id: row
                .id
                .parse()
                .map_err(|e| OutflowError::Store(format!("customer id {:?}: {e}", row.id)))?,
            name: row.name,
            email: row.email,
            deleted: row.deleted,
            created_at: from_micros(row.created_at)?,
            updated_at: from_micros(row.updated_at)?,
        })
    }
}

struct EventRow {
    id: String,
    event_type: String,
    payload: String,
    status: String,
    retry_count: u32,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
    last_retry_at: Option<i64>,
    processed_up_to: Option<i64>,
}

impl EventRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_type: row.get(1)?,
            payload: row.get(2)?,
            status: row.get(3)?,
            retry_count: row.get(4)?,
            error: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            last_retry_at: row.get(8)?,
            processed_up_to: row.get(9)?,
        })
    }
}

impl TryFrom<EventRow> for OutboxEvent {
    type Error = OutflowError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(OutboxEvent {
            id: row
                .id
                .parse()
                .map_err(|e| OutflowError::Store(format!("event id {:?}: {e}", row.id)))?,
            event_type: row.event_type.parse()?,
            payload: serde_json::from_str(&row.payload)?,
            status: row.status.parse()?,
            retry_count: row.retry_count,
            error: row.error,
            created_at: from_micros(row.created_at)?,
            updated_at: from_micros(row.updated_at)?,
            last_retry_at: row.last_retry_at.map(from_micros).transpose()?,
            processed_up_to: row.processed_up_to.map(from_micros).transpose()?,
        })
    }
}

fn query_customers<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Customer>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, CustomerRow::read)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(Customer::try_from).collect()
}

fn query_events<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<OutboxEvent>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, EventRow::read)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(OutboxEvent::try_from).collect()
}

fn load_event(conn: &Connection, id: EventId) -> Result<Option<OutboxEvent>> {
    let row = conn
        .query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM outbox WHERE id = ?1"),
            params![id.to_storage()],
            EventRow::read,
        )
        .optional()?;
    row.map(OutboxEvent::try_from).transpose()
}

fn load_customer(tx: &Transaction<'_>, id: CustomerId) -> Result<Option<Customer>> {
    let row = tx
        .query_row(
            &format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = ?1"),
            params![id.to_storage()],
            CustomerRow::read,
        )
        .optional()
        .map_err(tx_error)?;
    row.map(Customer::try_from).transpose()
}

fn tx_error(err: rusqlite::Error) -> OutflowError {
    OutflowError::Transaction(err.to_string())
}

fn conflict_unless_changed(changed: usize, id: EventId) -> Result<()> {
    if changed == 0 {
        Err(OutflowError::Conflict(id.to_string()))
    } else {
        Ok(())
    }
}

/// Append one event inside the caller's transaction. `created_at` is bumped
/// past the newest existing event so the stream stays strictly ordered.
fn append_event(
    tx: &Transaction<'_>,
    id: EventId,
    event_type: EventType,
    customer: &Customer,
    now: DateTime<Utc>,
) -> Result<()> {
    let newest: Option<i64> = tx
        .query_row("SELECT MAX(created_at) FROM outbox", [], |row| row.get(0))
        .map_err(tx_error)?;
    let created_at = match newest {
        Some(newest) if newest >= to_micros(now) => newest + 1,
        _ => to_micros(now),
    };
    let payload = serde_json::to_string(customer)
        .map_err(|e| OutflowError::Transaction(format!("payload encode: {e}")))?;

    tx.execute(
        "INSERT INTO outbox (id, event_type, payload, status, retry_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
        params![
            id.to_storage(),
            event_type.as_str(),
            payload,
            EventStatus::Pending.as_str(),
            created_at,
        ],
    )
    .map_err(tx_error)?;
    Ok(())
}

#[async_trait]
impl CustomerStore for SqliteStore {
    async fn create(&self, input: NewCustomer) -> Result<Customer> {
        let input = input.validated()?;
        let now = self.clock.now();
        let customer = Customer {
            id: input.id.unwrap_or_else(|| self.ids.customer_id()),
            name: input.name,
            email: input.email,
            deleted: false,
            created_at: now,
            updated_at: now,
        };
        let event_id = self.ids.event_id();

        self.db
            .call(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(tx_error)?;
                tx.execute(
                    &format!(
                        "INSERT INTO customers ({CUSTOMER_COLUMNS}) VALUES (?1, ?2, ?3, 0, ?4, ?4)"
                    ),
                    params![
                        customer.id.to_storage(),
                        customer.name,
                        customer.email,
                        to_micros(now),
                    ],
                )
                .map_err(tx_error)?;
                append_event(&tx, event_id, EventType::Created, &customer, now)?;
                tx.commit().map_err(tx_error)?;
                Ok(customer)
            })
            .await
    }

    async fn update(&self, input: CustomerUpdate) -> Result<Customer> {
        let input = input.validated()?;
        let now = self.clock.now();
        let event_id = self.ids.event_id();

        self.db
            .call(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(tx_error)?;
                let existing = match load_customer(&tx, input.id)? {
                    Some(c) if !c.deleted => c,
                    _ => return Err(OutflowError::not_found("customer", input.id)),
                };
                let customer = Customer {
                    name: input.name,
                    email: input.email,
                    updated_at: now,
                    ..existing
                };
                tx.execute(
                    "UPDATE customers SET name = ?1, email = ?2, updated_at = ?3
                     WHERE id = ?4 AND deleted = 0",
                    params![
                        customer.name,
                        customer.email,
                        to_micros(now),
                        customer.id.to_storage(),
                    ],
                )
                .map_err(tx_error)?;
                append_event(&tx, event_id, EventType::Updated, &customer, now)?;
                tx.commit().map_err(tx_error)?;
                Ok(customer)
            })
            .await
    }

    async fn soft_delete(&self, id: CustomerId) -> Result<Customer> {
        let now = self.clock.now();
        let event_id = self.ids.event_id();

        self.db
            .call(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(tx_error)?;
                let changed = tx
                    .execute(
                        "UPDATE customers SET deleted = 1, updated_at = ?1 WHERE id = ?2",
                        params![to_micros(now), id.to_storage()],
                    )
                    .map_err(tx_error)?;
                if changed == 0 {
                    return Err(OutflowError::not_found("customer", id));
                }
                let customer = load_customer(&tx, id)?
                    .ok_or_else(|| OutflowError::not_found("customer", id))?;
                append_event(&tx, event_id, EventType::Deleted, &customer, now)?;
                tx.commit().map_err(tx_error)?;
                Ok(customer)
            })
            .await
    }

    async fn find_by_id(&self, id: CustomerId, include_deleted: bool) -> Result<Option<Customer>> {
        self.db
            .call(move |conn| {
                let found = query_customers(
                    conn,
                    &format!(
                        "SELECT {CUSTOMER_COLUMNS} FROM customers
                         WHERE id = ?1 AND (?2 OR deleted = 0)"
                    ),
                    params![id.to_storage(), include_deleted],
                )?;
                Ok(found.into_iter().next())
            })
            .await
    }

    async fn find_by_email(
        &self,
        email: &str,
        include_deleted: bool,
    ) -> Result<Option<Customer>> {
        let email = email.trim().to_string();
        self.db
            .call(move |conn| {
                let found = query_customers(
                    conn,
                    &format!(
                        "SELECT {CUSTOMER_COLUMNS} FROM customers
                         WHERE email = ?1 AND (?2 OR deleted = 0)
                         ORDER BY created_at LIMIT 1"
                    ),
                    params![email, include_deleted],
                )?;
                Ok(found.into_iter().next())
            })
            .await
    }

    async fn list(&self, include_deleted: bool) -> Result<Vec<Customer>> {
        self.db
            .call(move |conn| {
                query_customers(
                    conn,
                    &format!(
                        "SELECT {CUSTOMER_COLUMNS} FROM customers
                         WHERE ?1 OR deleted = 0 ORDER BY created_at, id"
                    ),
                    params![include_deleted],
                )
            })
            .await
    }
}

#[async_trait]
impl OutboxStore for SqliteStore {
    async fn watermark(&self) -> Result<Option<DateTime<Utc>>> {
        self.db
            .call(|conn| {
                let max: Option<i64> =
                    conn.query_row("SELECT MAX(processed_up_to) FROM outbox", [], |row| {
                        row.get(0)
                    })?;
                max.map(from_micros).transpose()
            })
            .await
    }

    async fn head_of_line(
        &self,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Option<OutboxEvent>> {
        let watermark = watermark.map(to_micros);
        self.db
            .call(move |conn| {
                let head = query_events(
                    conn,
                    &format!(
                        "SELECT {EVENT_COLUMNS} FROM outbox
                         WHERE status != ?1 AND (?2 IS NULL OR created_at > ?2)
                         ORDER BY created_at LIMIT 1"
                    ),
                    params![EventStatus::Processed.as_str(), watermark],
                )?;
                Ok(head.into_iter().next())
            })
            .await
    }

    async fn try_claim(&self, guard: &EventGuard, now: DateTime<Utc>) -> Result<OutboxEvent> {
        let guard = *guard;
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let changed = tx.execute(
                    "UPDATE outbox SET status = ?1, updated_at = ?2
                     WHERE id = ?3 AND status = ?4 AND updated_at = ?5",
                    params![
                        EventStatus::Processing.as_str(),
                        to_micros(now),
                        guard.id.to_storage(),
                        guard.status.as_str(),
                        to_micros(guard.updated_at),
                    ],
                )?;
                conflict_unless_changed(changed, guard.id)?;
                let claimed = load_event(&tx, guard.id)?
                    .ok_or_else(|| OutflowError::not_found("event", guard.id))?;
                tx.commit()?;
                Ok(claimed)
            })
            .await
    }

    async fn mark_processed(&self, lease: &EventGuard, now: DateTime<Utc>) -> Result<()> {
        let lease = *lease;
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE outbox SET status = ?1, processed_up_to = created_at, updated_at = ?2
                     WHERE id = ?3 AND status = ?4 AND updated_at = ?5",
                    params![
                        EventStatus::Processed.as_str(),
                        to_micros(now),
                        lease.id.to_storage(),
                        lease.status.as_str(),
                        to_micros(lease.updated_at),
                    ],
                )?;
                conflict_unless_changed(changed, lease.id)
            })
            .await
    }

    async fn mark_failed(
        &self,
        lease: &EventGuard,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let lease = *lease;
        let error = error.to_string();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE outbox SET status = ?1, error = ?2, last_retry_at = ?3, updated_at = ?3
                     WHERE id = ?4 AND status = ?5 AND updated_at = ?6",
                    params![
                        EventStatus::Failed.as_str(),
                        error,
                        to_micros(now),
                        lease.id.to_storage(),
                        lease.status.as_str(),
                        to_micros(lease.updated_at),
                    ],
                )?;
                conflict_unless_changed(changed, lease.id)
            })
            .await
    }

    async fn retryable(
        &self,
        max_retries: u32,
        cooled_before: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>> {
        self.db
            .call(move |conn| {
                query_events(
                    conn,
                    &format!(
                        "SELECT {EVENT_COLUMNS} FROM outbox
                         WHERE status = ?1 AND retry_count < ?2
                           AND (last_retry_at IS NULL OR last_retry_at <= ?3)
                         ORDER BY created_at"
                    ),
                    params![
                        EventStatus::Failed.as_str(),
                        max_retries,
                        to_micros(cooled_before),
                    ],
                )
            })
            .await
    }

    async fn requeue(
        &self,
        id: EventId,
        expected_retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE outbox
                     SET status = ?1, retry_count = retry_count + 1,
                         last_retry_at = ?2, updated_at = ?2
                     WHERE id = ?3 AND status = ?4 AND retry_count = ?5",
                    params![
                        EventStatus::Pending.as_str(),
                        to_micros(now),
                        id.to_storage(),
                        EventStatus::Failed.as_str(),
                        expected_retry_count,
                    ],
                )?;
                conflict_unless_changed(changed, id)
            })
            .await
    }

    async fn dead_letters(&self, max_retries: u32) -> Result<Vec<OutboxEvent>> {
        self.db
            .call(move |conn| {
                query_events(
                    conn,
                    &format!(
                        "SELECT {EVENT_COLUMNS} FROM outbox
                         WHERE status = ?1 AND retry_count >= ?2
                         ORDER BY created_at"
                    ),
                    params![EventStatus::Failed.as_str(), max_retries],
                )
            })
            .await
    }

    async fn replay_dead_letter(
        &self,
        id: EventId,
        expected_retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<OutboxEvent> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let changed = tx.execute(
                    "UPDATE outbox
                     SET status = ?1, retry_count = 0, error = NULL,
                         last_retry_at = ?2, updated_at = ?2
                     WHERE id = ?3 AND status = ?4 AND retry_count = ?5",
                    params![
                        EventStatus::Pending.as_str(),
                        to_micros(now),
                        id.to_storage(),
                        EventStatus::Failed.as_str(),
                        expected_retry_count,
                    ],
                )?;
                conflict_unless_changed(changed, id)?;
                let replayed =
                    load_event(&tx, id)?.ok_or_else(|| OutflowError::not_found("event", id))?;
                tx.commit()?;
                Ok(replayed)
            })
            .await
    }

    async fn get_event(&self, id: EventId) -> Result<Option<OutboxEvent>> {
        self.db.call(move |conn| load_event(conn, id)).await
    }

    async fn list_events(&self) -> Result<Vec<OutboxEvent>> {
        self.db
            .call(|conn| {
                query_events(
                    conn,
                    &format!("SELECT {EVENT_COLUMNS} FROM outbox ORDER BY created_at"),
                    [],
                )
            })
            .await
    }

    async fn counts(&self, max_retries: u32) -> Result<OutboxCounts> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT status, retry_count >= ?1, COUNT(*) FROM outbox GROUP BY 1, 2",
                )?;
                let rows = stmt
                    .query_map(params![max_retries], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, bool>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let mut counts = OutboxCounts::default();
                for (status, exhausted, n) in rows {
                    let n = usize::try_from(n).unwrap_or(0);
                    match status.parse::<EventStatus>()? {
                        EventStatus::Pending => counts.pending += n,
                        EventStatus::Processing => counts.processing += n,
                        EventStatus::Processed => counts.processed += n,
                        EventStatus::Failed if exhausted => counts.dead += n,
                        EventStatus::Failed => counts.failed += n,
                    }
                }
                Ok(counts)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::{TimeDelta, TimeZone};

    fn store() -> (Arc<FixedClock>, SqliteStore) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = SqliteStore::open_in_memory(clock.clone()).unwrap();
        (clock, store)
    }

    #[tokio::test]
    async fn create_writes_row_and_event_together() {
        let (_, store) = store();
        let customer = store
            .create(NewCustomer::new(" John Doe ", "john@example.com"))
            .await
            .unwrap();
        assert_eq!(customer.name, "John Doe");

        let events = store.list_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Created);
        assert_eq!(events[0].status, EventStatus::Pending);
        let payload: Customer = serde_json::from_value(events[0].payload.clone()).unwrap();
        assert_eq!(payload, customer);
        assert_eq!(
            store.find_by_id(customer.id, false).await.unwrap(),
            Some(customer)
        );
    }

    #[tokio::test]
    async fn timestamps_round_trip_exactly() {
        let (clock, store) = store();
        clock.set(Utc.timestamp_opt(1_700_000_000, 123_456_000).unwrap());
        store
            .create(NewCustomer::new("A", "a@example.com"))
            .await
            .unwrap();
        let event = store.head_of_line(None).await.unwrap().unwrap();
        assert_eq!(event.created_at, clock.now());

        let claimed = store.try_claim(&event.guard(), clock.now()).await.unwrap();
        store.mark_processed(&claimed.guard(), clock.now()).await.unwrap();
        assert_eq!(store.watermark().await.unwrap(), Some(event.created_at));
    }

    #[tokio::test]
    async fn soft_delete_of_unknown_id_is_not_found() {
        let (_, store) = store();
        let err = store
            .soft_delete(CustomerId::from_ulid(ulid::Ulid::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, OutflowError::NotFound { .. }));
        assert!(store.list_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completion_after_reclaim_is_a_conflict() {
        let (clock, store) = store();
        store
            .create(NewCustomer::new("A", "a@example.com"))
            .await
            .unwrap();
        let head = store.head_of_line(None).await.unwrap().unwrap();
        let first = store.try_claim(&head.guard(), clock.now()).await.unwrap();

        clock.advance(TimeDelta::minutes(6));
        let second = store.try_claim(&first.guard(), clock.now()).await.unwrap();

        let err = store
            .mark_processed(&first.guard(), clock.now())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        store.mark_processed(&second.guard(), clock.now()).await.unwrap();
    }

    #[tokio::test]
    async fn counts_split_failed_and_dead() {
        let (clock, store) = store();
        for i in 0..3 {
            store
                .create(NewCustomer::new("A", format!("a{i}@example.com")))
                .await
                .unwrap();
        }
        let events = store.list_events().await.unwrap();
        for event in &events[..2] {
            let lease = store.try_claim(&event.guard(), clock.now()).await.unwrap();
            store
                .mark_failed(&lease.guard(), "boom", clock.now())
                .await
                .unwrap();
        }
        store.requeue(events[0].id, 0, clock.now()).await.unwrap();
        let requeued = store.get_event(events[0].id).await.unwrap().unwrap();
        let lease = store.try_claim(&requeued.guard(), clock.now()).await.unwrap();
        store
            .mark_failed(&lease.guard(), "boom", clock.now())
            .await
            .unwrap();

        let counts = store.counts(1).await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.dead, 1);
        assert_eq!(store.dead_letters(1).await.unwrap()[0].id, events[0].id);
    }
}
