//! Outbox event record and its state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::customer::Customer;
use super::errors::{OutflowError, Result};
use super::ids::EventId;

/// Lifecycle of an outbox event.
///
/// Transitions:
/// - Pending -> Processing -> Processed
/// - Processing -> Failed (handler error)
/// - Failed -> Pending (retry, bounded by max_retries)
/// - Processing -> Processing (reclaim after the lock timeout)
///
/// A Failed event whose retry_count reached max_retries is a dead letter.
/// The serialized names are the stored values and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = OutflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processing" => Ok(EventStatus::Processing),
            "processed" => Ok(EventStatus::Processed),
            "failed" => Ok(EventStatus::Failed),
            other => Err(OutflowError::Store(format!("unknown event status {other:?}"))),
        }
    }
}

/// Which mutation produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "CustomerCreated")]
    Created,
    #[serde(rename = "CustomerUpdated")]
    Updated,
    #[serde(rename = "CustomerDeleted")]
    Deleted,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Created => "CustomerCreated",
            EventType::Updated => "CustomerUpdated",
            EventType::Deleted => "CustomerDeleted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = OutflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CustomerCreated" => Ok(EventType::Created),
            "CustomerUpdated" => Ok(EventType::Updated),
            "CustomerDeleted" => Ok(EventType::Deleted),
            other => Err(OutflowError::Store(format!("unknown event type {other:?}"))),
        }
    }
}

/// One row of the outbox.
///
/// `created_at` is the ordering key of the whole stream and never changes
/// after the append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub event_type: EventType,

    /// Snapshot of the customer at mutation time.
    pub payload: serde_json::Value,

    pub status: EventStatus,
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,

    /// Set to `created_at` once processed. The watermark is the max of these.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_up_to: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// A fresh pending event carrying `customer` as its payload.
    pub fn for_customer(
        id: EventId,
        event_type: EventType,
        customer: &Customer,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            id,
            event_type,
            payload: serde_json::to_value(customer)?,
            status: EventStatus::Pending,
            retry_count: 0,
            error: None,
            created_at,
            updated_at: created_at,
            last_retry_at: None,
            processed_up_to: None,
        })
    }

    /// The precondition a conditional update on this record must match.
    pub fn guard(&self) -> EventGuard {
        EventGuard {
            id: self.id,
            status: self.status,
            updated_at: self.updated_at,
        }
    }

    pub fn is_dead_letter(&self, max_retries: u32) -> bool {
        self.status == EventStatus::Failed && self.retry_count >= max_retries
    }

    /// Take the lease.
    pub fn claim(&mut self, now: DateTime<Utc>) {
        self.status = EventStatus::Processing;
        self.updated_at = now;
    }

    pub fn mark_processed(&mut self, now: DateTime<Utc>) {
        self.status = EventStatus::Processed;
        self.processed_up_to = Some(self.created_at);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = EventStatus::Failed;
        self.error = Some(error.into());
        self.last_retry_at = Some(now);
        self.updated_at = now;
    }

    /// Failed -> Pending, consuming one retry.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = EventStatus::Pending;
        self.retry_count += 1;
        self.last_retry_at = Some(now);
        self.updated_at = now;
    }

    /// Operator replay of a dead letter: back to pending with a fresh budget.
    pub fn replay(&mut self, now: DateTime<Utc>) {
        self.status = EventStatus::Pending;
        self.retry_count = 0;
        self.error = None;
        self.last_retry_at = Some(now);
        self.updated_at = now;
    }
}

/// Expected state for a compare-and-swap on an outbox row.
///
/// `updated_at` doubles as the lease token: every claim restamps it, so a
/// worker whose lease was reclaimed no longer matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventGuard {
    pub id: EventId,
    pub status: EventStatus,
    pub updated_at: DateTime<Utc>,
}

impl EventGuard {
    pub fn matches(&self, event: &OutboxEvent) -> bool {
        event.id == self.id && event.status == self.status && event.updated_at == self.updated_at
    }
}

/// Decoded payload, keyed by event type.
///
/// Only the projector decodes; everything upstream carries the raw JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomerEvent {
    Created(Customer),
    Updated(Customer),
    Deleted(Customer),
}

impl CustomerEvent {
    pub fn decode(event: &OutboxEvent) -> Result<Self> {
        let customer: Customer = serde_json::from_value(event.payload.clone()).map_err(|e| {
            OutflowError::Handler(format!("undecodable {} payload: {e}", event.event_type))
        })?;
        Ok(match event.event_type {
            EventType::Created => CustomerEvent::Created(customer),
            EventType::Updated => CustomerEvent::Updated(customer),
            EventType::Deleted => CustomerEvent::Deleted(customer),
        })
    }

    pub fn customer(&self) -> &Customer {
        match self {
            CustomerEvent::Created(c) | CustomerEvent::Updated(c) | CustomerEvent::Deleted(c) => c,
        }
    }
}
