//! Claim dispatcher.
//!
//! Each tick re-reads the watermark, looks at the head of the line and tries
//! to lease it. Only the head is ever claimed: if it is failed or under a live
//! lease, the tick ends without a claim and everything behind it waits.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span};

use crate::config::RelayConfig;
use crate::domain::{EventId, EventStatus, OutboxEvent, OutflowError, Result};
use crate::ports::{Clock, OutboxStore, SharedClock};

/// What one dispatcher tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The head was leased; the record carries the new lease.
    Claimed(OutboxEvent),
    /// Nothing after the watermark.
    Idle,
    /// The head exists but cannot be claimed yet.
    Blocked { event_id: EventId, status: EventStatus },
    /// Another dispatcher changed the head between read and claim.
    LostRace(EventId),
}

pub struct ClaimDispatcher {
    outbox: Arc<dyn OutboxStore>,
    clock: SharedClock,
    config: RelayConfig,
}

impl ClaimDispatcher {
    pub fn new(outbox: Arc<dyn OutboxStore>, clock: SharedClock, config: RelayConfig) -> Self {
        Self {
            outbox,
            clock,
            config,
        }
    }

    /// One claim attempt.
    pub async fn run_once(&self) -> Result<TickOutcome> {
        let watermark = self.outbox.watermark().await?;
        let Some(head) = self.outbox.head_of_line(watermark).await? else {
            return Ok(TickOutcome::Idle);
        };

        let now = self.clock.now();
        let claimable = match head.status {
            EventStatus::Pending => true,
            EventStatus::Processing => {
                let stale_before = now
                    .checked_sub_signed(self.config.lock_timeout_delta())
                    .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
                head.updated_at <= stale_before
            }
            EventStatus::Failed | EventStatus::Processed => false,
        };
        if !claimable {
            debug!(event_id = %head.id, status = %head.status, "head of line blocked");
            return Ok(TickOutcome::Blocked {
                event_id: head.id,
                status: head.status,
            });
        }

        match self.outbox.try_claim(&head.guard(), now).await {
            Ok(claimed) => {
                if head.status == EventStatus::Processing {
                    info!(event_id = %claimed.id, "reclaimed expired lease");
                } else {
                    info!(
                        event_id = %claimed.id,
                        event_type = %claimed.event_type,
                        retry_count = claimed.retry_count,
                        "claimed event"
                    );
                }
                Ok(TickOutcome::Claimed(claimed))
            }
            Err(OutflowError::Conflict(_)) => {
                debug!(event_id = %head.id, "claim lost to another dispatcher");
                Ok(TickOutcome::LostRace(head.id))
            }
            Err(e) => Err(e),
        }
    }

    /// Poll until shutdown, handing each claim to `tx`. A full channel
    /// blocks the loop.
    pub async fn run(self, tx: mpsc::Sender<OutboxEvent>, mut shutdown: watch::Receiver<bool>) {
        let span = info_span!("dispatcher");
        async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
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

                let claimed = match self.run_once().await {
                    Ok(TickOutcome::Claimed(event)) => event,
                    Ok(_) => continue,
                    Err(e) => {
                        error!(error = %e, "dispatcher tick failed");
                        continue;
                    }
                };

                let event_id = claimed.id;
                tokio::select! {
                    _ = shutdown.changed() => {
                        // the lease stays and expires after the lock timeout
                        debug!(event_id = %event_id, "shutdown while handing off");
                        break;
                    }
                    sent = tx.send(claimed) => {
                        if sent.is_err() {
                            debug!("projector gone, stopping");
                            break;
                        }
                    }
                }
            }
            debug!("dispatcher stopped");
        }
        .instrument(span)
        .await
    }
}
