//! Relay runtime: the dispatcher, projector and retry scheduler running
//! together under one shutdown signal.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::dispatcher::ClaimDispatcher;
use super::projector::{EventApplier, Projector};
use super::retry_scheduler::RetryScheduler;
use crate::config::RelayConfig;
use crate::domain::{EventId, OutboxEvent, OutflowError, Result};
use crate::observability::OutboxCounts;
use crate::ports::{Clock, OutboxStore, SharedClock};

/// Running relay handle.
/// - the dispatcher, projector and retry scheduler run as separate tasks
/// - dropping the handle drops the shutdown sender, which stops every loop
///   without waiting for it
/// - in-flight leases are not released on shutdown; they expire after the
///   lock timeout
pub struct Relay {
    outbox: Arc<dyn OutboxStore>,
    clock: SharedClock,
    config: RelayConfig,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl Relay {
    /// Start the three loops. Fails with `OutflowError::Config` before
    /// spawning anything if `config` does not validate.
    pub fn spawn(
        outbox: Arc<dyn OutboxStore>,
        applier: Arc<dyn EventApplier>,
        clock: SharedClock,
        config: RelayConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(config.queue_capacity);

        let dispatcher = ClaimDispatcher::new(outbox.clone(), clock.clone(), config.clone());
        let projector = Projector::new(outbox.clone(), applier, clock.clone());
        let scheduler = RetryScheduler::new(outbox.clone(), clock.clone(), config.clone());

        let joins = vec![
            tokio::spawn(dispatcher.run(tx, shutdown_rx.clone())),
            tokio::spawn(projector.run(rx, shutdown_rx.clone())),
            tokio::spawn(scheduler.run(shutdown_rx)),
        ];
        info!(
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            max_retries = config.max_retries,
            "relay started"
        );

        Ok(Self {
            outbox,
            clock,
            config,
            shutdown_tx,
            joins,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub async fn counts(&self) -> Result<OutboxCounts> {
        self.outbox.counts(self.config.max_retries).await
    }

    pub async fn dead_letters(&self) -> Result<Vec<OutboxEvent>> {
        self.outbox.dead_letters(self.config.max_retries).await
    }

    pub async fn replay_dead_letter(&self, id: EventId) -> Result<OutboxEvent> {
        replay_dead_letter(
            self.outbox.as_ref(),
            self.clock.as_ref(),
            id,
            self.config.max_retries,
        )
        .await
    }

    /// Ask every loop to stop after its current step.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(error = %e, "relay task ended abnormally");
            }
        }
        info!("relay stopped");
    }
}

/// Put one dead letter back on the queue with a fresh retry budget.
pub async fn replay_dead_letter(
    outbox: &dyn OutboxStore,
    clock: &dyn Clock,
    id: EventId,
    max_retries: u32,
) -> Result<OutboxEvent> {
    let event = outbox
        .get_event(id)
        .await?
        .ok_or_else(|| OutflowError::not_found("event", id))?;
    if !event.is_dead_letter(max_retries) {
        return Err(OutflowError::Validation(format!(
            "event {id} is not a dead letter (status {}, retry_count {})",
            event.status, event.retry_count
        )));
    }
    let replayed = outbox
        .replay_dead_letter(id, event.retry_count, clock.now())
        .await?;
    info!(event_id = %id, "replayed dead letter");
    Ok(replayed)
}
