//! OutboxStore port: the durable event queue.
//!
//! Every transition is a compare-and-swap. An implementation must apply the
//! write only when the stored row still matches the caller's expectation and
//! must return `OutflowError::Conflict` when it does not. There is no other
//! coordination between relay instances.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{EventGuard, EventId, EventStatus, OutboxEvent, Result};
use crate::observability::OutboxCounts;

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// `created_at` of the newest processed event, read from storage.
    /// `None` until the first event is processed.
    async fn watermark(&self) -> Result<Option<DateTime<Utc>>>;

    /// The earliest event that is not processed and was created after
    /// `watermark` (any event when `watermark` is `None`).
    async fn head_of_line(&self, watermark: Option<DateTime<Utc>>)
    -> Result<Option<OutboxEvent>>;

    /// Move the guarded row to `processing`, stamping `updated_at = now`.
    /// Returns the claimed record, whose guard is the lease token.
    async fn try_claim(&self, guard: &EventGuard, now: DateTime<Utc>) -> Result<OutboxEvent>;

    /// `processing -> processed`, recording `processed_up_to = created_at`.
    async fn mark_processed(&self, lease: &EventGuard, now: DateTime<Utc>) -> Result<()>;

    /// `processing -> failed`, recording the error and `last_retry_at = now`.
    async fn mark_failed(&self, lease: &EventGuard, error: &str, now: DateTime<Utc>)
    -> Result<()>;

    /// Failed events with retries left whose `last_retry_at` is at or before
    /// `cooled_before`, oldest first.
    async fn retryable(
        &self,
        max_retries: u32,
        cooled_before: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>>;

    /// `failed -> pending` with `retry_count + 1`, guarded by the
    /// `retry_count` the caller read.
    async fn requeue(&self, id: EventId, expected_retry_count: u32, now: DateTime<Utc>)
    -> Result<()>;

    /// Failed events that used up their retries, oldest first.
    async fn dead_letters(&self, max_retries: u32) -> Result<Vec<OutboxEvent>>;

    /// Put a dead letter back to `pending` with a zero retry count and no
    /// error, guarded like `requeue`.
    async fn replay_dead_letter(
        &self,
        id: EventId,
        expected_retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<OutboxEvent>;

    async fn get_event(&self, id: EventId) -> Result<Option<OutboxEvent>>;

    /// The whole stream ordered by `created_at`.
    async fn list_events(&self) -> Result<Vec<OutboxEvent>>;

    async fn counts(&self, max_retries: u32) -> Result<OutboxCounts> {
        let events = self.list_events().await?;
        let mut counts = OutboxCounts::default();
        for event in &events {
            match event.status {
                EventStatus::Pending => counts.pending += 1,
                EventStatus::Processing => counts.processing += 1,
                EventStatus::Processed => counts.processed += 1,
                EventStatus::Failed if event.retry_count >= max_retries => counts.dead += 1,
                EventStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
