//! Retry scheduler: returns cooled-down failures to the queue and reports
//! dead letters.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::RelayConfig;
use crate::domain::{EventId, OutflowError, Result};
use crate::ports::{Clock, OutboxStore, SharedClock};

/// Result of one scheduler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub requeued: Vec<EventId>,
    /// Requeues another scheduler got to first.
    pub lost_races: Vec<EventId>,
    pub dead_letters: Vec<EventId>,
}

pub struct RetryScheduler {
    outbox: Arc<dyn OutboxStore>,
    clock: SharedClock,
    config: RelayConfig,
}

impl RetryScheduler {
    pub fn new(outbox: Arc<dyn OutboxStore>, clock: SharedClock, config: RelayConfig) -> Self {
        Self {
            outbox,
            clock,
            config,
        }
    }

    pub async fn run_once(&self) -> Result<RetryReport> {
        let now = self.clock.now();
        let cooled_before = now
            .checked_sub_signed(self.config.retry_cooldown_delta())
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let mut report = RetryReport::default();

        for event in self
            .outbox
            .retryable(self.config.max_retries, cooled_before)
            .await?
        {
            match self.outbox.requeue(event.id, event.retry_count, now).await {
                Ok(()) => {
                    info!(
                        event_id = %event.id,
                        retry_count = event.retry_count + 1,
                        max_retries = self.config.max_retries,
                        "requeued failed event"
                    );
                    report.requeued.push(event.id);
                }
                Err(OutflowError::Conflict(_)) => {
                    debug!(event_id = %event.id, "requeue lost to another scheduler");
                    report.lost_races.push(event.id);
                }
                Err(e) => return Err(e),
            }
        }

        for event in self.outbox.dead_letters(self.config.max_retries).await? {
            let dead = OutflowError::DeadLetter {
                event_id: event.id,
                retry_count: event.retry_count,
            };
            warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = event.error.as_deref().unwrap_or_default(),
                "{dead}"
            );
            report.dead_letters.push(event.id);
        }

        Ok(report)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let span = info_span!("retry_scheduler");
        async move {
            let mut ticker = tokio::time::interval(self.config.retry_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.run_once().await {
                    error!(error = %e, "retry pass failed");
                }
            }
            debug!("retry scheduler stopped");
        }
        .instrument(span)
        .await
    }
}
