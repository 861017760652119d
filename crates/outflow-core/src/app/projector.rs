//! Projector: applies claimed events and records the result on the outbox.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::domain::{CustomerEvent, CustomerProjection, OutboxEvent, OutflowError, Result};
use crate::ports::{Clock, OutboxStore, ProjectionStore, SharedClock};

/// Applies one claimed event downstream.
///
/// Any error is recorded on the event as a handler failure and left to the
/// retry scheduler.
#[async_trait]
pub trait EventApplier: Send + Sync {
    async fn apply(&self, event: &OutboxEvent) -> Result<()>;
}

/// Keeps `projection_customers` in step with the customer stream.
pub struct ProjectionApplier {
    projection: Arc<dyn ProjectionStore>,
}

impl ProjectionApplier {
    pub fn new(projection: Arc<dyn ProjectionStore>) -> Self {
        Self { projection }
    }
}

#[async_trait]
impl EventApplier for ProjectionApplier {
    async fn apply(&self, event: &OutboxEvent) -> Result<()> {
        match CustomerEvent::decode(event)? {
            CustomerEvent::Created(customer) => {
                if !self.projection.insert(CustomerProjection::from(&customer)).await? {
                    return Err(OutflowError::Handler(format!(
                        "customer {} is already projected",
                        customer.id
                    )));
                }
            }
            CustomerEvent::Updated(customer) => {
                if !self.projection.update(CustomerProjection::from(&customer)).await? {
                    return Err(OutflowError::Handler(format!(
                        "projection drift: customer {} has no projected row",
                        customer.id
                    )));
                }
            }
            CustomerEvent::Deleted(customer) => {
                self.projection
                    .mark_deleted(CustomerProjection::from(&customer))
                    .await?;
            }
        }
        Ok(())
    }
}

/// How a claimed event ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Processed,
    /// The applier failed; the message is stored on the event.
    Failed(String),
    /// The lease was lost before completion; nothing was recorded.
    Dropped,
}

pub struct Projector {
    outbox: Arc<dyn OutboxStore>,
    applier: Arc<dyn EventApplier>,
    clock: SharedClock,
}

impl Projector {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        applier: Arc<dyn EventApplier>,
        clock: SharedClock,
    ) -> Self {
        Self {
            outbox,
            applier,
            clock,
        }
    }

    /// Apply a claimed event and complete it under its lease.
    pub async fn process(&self, event: &OutboxEvent) -> Result<Completion> {
        let lease = event.guard();
        // a claim that waited in the hand-off queue may have been reclaimed
        match self.outbox.get_event(event.id).await? {
            Some(current) if lease.matches(&current) => {}
            _ => {
                warn!(event_id = %event.id, "lease expired before apply, dropping claim");
                return Ok(Completion::Dropped);
            }
        }
        let applied = self.applier.apply(event).await;
        let now = self.clock.now();

        let (recorded, completion) = match applied {
            Ok(()) => (
                self.outbox.mark_processed(&lease, now).await,
                Completion::Processed,
            ),
            Err(e) => {
                let message = e.to_string();
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    retry_count = event.retry_count,
                    error = %message,
                    "handler failed"
                );
                (
                    self.outbox.mark_failed(&lease, &message, now).await,
                    Completion::Failed(message),
                )
            }
        };

        match recorded {
            Ok(()) => {
                if completion == Completion::Processed {
                    info!(event_id = %event.id, event_type = %event.event_type, "processed event");
                }
                Ok(completion)
            }
            Err(OutflowError::Conflict(_)) => {
                warn!(event_id = %event.id, "lease lost before completion, dropping result");
                Ok(Completion::Dropped)
            }
            Err(e) => Err(e),
        }
    }

    /// Consume claims sequentially until shutdown or until the dispatcher
    /// side of the channel closes.
    pub async fn run(self, mut rx: mpsc::Receiver<OutboxEvent>, mut shutdown: watch::Receiver<bool>) {
        let span = info_span!("projector");
        async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let event = tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    event = rx.recv() => event,
                };
                let Some(event) = event else {
                    break;
                };
                if let Err(e) = self.process(&event).await {
                    error!(event_id = %event.id, error = %e, "failed to record completion");
                }
            }
            debug!("projector stopped");
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CustomerUpdate, EventStatus, NewCustomer};
    use crate::impls::{InMemoryProjectionStore, InMemoryStore};
    use crate::ports::{CustomerStore, FixedClock};
    use chrono::{TimeDelta, TimeZone, Utc};

    struct Fixture {
        clock: Arc<FixedClock>,
        store: Arc<InMemoryStore>,
        projection: Arc<InMemoryProjectionStore>,
        projector: Projector,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let projection = Arc::new(InMemoryProjectionStore::new());
        let projector = Projector::new(
            store.clone(),
            Arc::new(ProjectionApplier::new(projection.clone())),
            clock.clone(),
        );
        Fixture {
            clock,
            store,
            projection,
            projector,
        }
    }

    async fn claim_head(f: &Fixture) -> OutboxEvent {
        let watermark = f.store.watermark().await.unwrap();
        let head = f.store.head_of_line(watermark).await.unwrap().unwrap();
        f.store.try_claim(&head.guard(), f.clock.now()).await.unwrap()
    }

    #[tokio::test]
    async fn created_event_lands_in_projection() {
        let f = fixture();
        let customer = f
            .store
            .create(NewCustomer::new("John Doe", "john@example.com"))
            .await
            .unwrap();
        let event = claim_head(&f).await;

        let done = f.projector.process(&event).await.unwrap();
        assert_eq!(done, Completion::Processed);

        let row = f.projection.get(customer.id).await.unwrap().unwrap();
        assert_eq!(row.name, "John Doe");
        assert!(!row.deleted);
        let stored = f.store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Processed);
        assert_eq!(stored.processed_up_to, Some(stored.created_at));
    }

    #[tokio::test]
    async fn update_without_projected_row_is_recorded_as_failure() {
        let f = fixture();
        let customer = f
            .store
            .create(NewCustomer::new("A", "a@example.com"))
            .await
            .unwrap();
        f.store
            .update(CustomerUpdate::new(customer.id, "B", "b@example.com"))
            .await
            .unwrap();
        let events = f.store.list_events().await.unwrap();
        let update = f
            .store
            .try_claim(&events[1].guard(), f.clock.now())
            .await
            .unwrap();

        let done = f.projector.process(&update).await.unwrap();
        assert!(matches!(done, Completion::Failed(msg) if msg.contains("drift")));

        let stored = f.store.get_event(update.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.error.unwrap().contains("drift"));
        assert_eq!(stored.last_retry_at, Some(f.clock.now()));
    }

    #[tokio::test]
    async fn duplicate_create_is_a_handler_failure() {
        let f = fixture();
        let customer = f
            .store
            .create(NewCustomer::new("A", "a@example.com"))
            .await
            .unwrap();
        f.projection
            .insert(CustomerProjection::from(&customer))
            .await
            .unwrap();
        let event = claim_head(&f).await;

        let done = f.projector.process(&event).await.unwrap();
        assert!(matches!(done, Completion::Failed(_)));
    }

    #[tokio::test]
    async fn reapplying_delete_is_harmless() {
        let f = fixture();
        let customer = f
            .store
            .create(NewCustomer::new("A", "a@example.com"))
            .await
            .unwrap();
        f.store.soft_delete(customer.id).await.unwrap();
        let applier = ProjectionApplier::new(f.projection.clone());
        let events = f.store.list_events().await.unwrap();

        applier.apply(&events[0]).await.unwrap();
        applier.apply(&events[1]).await.unwrap();
        let once = f.projection.get(customer.id).await.unwrap();
        applier.apply(&events[1]).await.unwrap();
        assert_eq!(f.projection.get(customer.id).await.unwrap(), once);
        assert!(once.unwrap().deleted);
    }

    #[tokio::test]
    async fn completion_after_reclaim_is_dropped() {
        let f = fixture();
        f.store
            .create(NewCustomer::new("A", "a@example.com"))
            .await
            .unwrap();
        let stale = claim_head(&f).await;

        f.clock.advance(TimeDelta::minutes(10));
        f.store
            .try_claim(&stale.guard(), f.clock.now())
            .await
            .unwrap();

        assert_eq!(f.projector.process(&stale).await.unwrap(), Completion::Dropped);
        let stored = f.store.get_event(stale.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Processing);
    }

    #[tokio::test]
    async fn expired_claim_is_dropped_before_touching_the_projection() {
        let f = fixture();
        let customer = f
            .store
            .create(NewCustomer::new("A", "a@example.com"))
            .await
            .unwrap();
        let stale = claim_head(&f).await;

        f.clock.advance(TimeDelta::minutes(6));
        let fresh = f
            .store
            .try_claim(&stale.guard(), f.clock.now())
            .await
            .unwrap();

        assert_eq!(f.projector.process(&stale).await.unwrap(), Completion::Dropped);
        assert!(f.projection.get(customer.id).await.unwrap().is_none());

        assert_eq!(f.projector.process(&fresh).await.unwrap(), Completion::Processed);
        let stored = f.store.get_event(fresh.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Processed);
        assert!(f.projection.get(customer.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn undecodable_payload_fails_the_event() {
        let f = fixture();
        f.store
            .create(NewCustomer::new("A", "a@example.com"))
            .await
            .unwrap();
        let mut event = claim_head(&f).await;
        event.payload = serde_json::json!("garbage");

        let done = f.projector.process(&event).await.unwrap();
        assert!(matches!(done, Completion::Failed(msg) if msg.contains("undecodable")));
    }
}
