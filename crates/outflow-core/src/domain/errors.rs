//! Error taxonomy shared by the stores and the relay loops.

use thiserror::Error;

use super::ids::EventId;
use crate::config::ConfigError;

/// Every fallible operation in the crate returns this error.
///
/// Propagation rules:
/// - `Conflict` is expected under concurrency. Loops swallow it and try again
///   on the next tick.
/// - `Transaction` reaches the entity-write caller. Nothing was persisted.
/// - `Handler` is recorded on the outbox event and never reaches the writer.
#[derive(Debug, Error)]
pub enum OutflowError {
    /// Malformed create/update input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing entity or projection target.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A conditional update matched zero rows: another worker got there first.
    #[error("conflict on {0}: record changed concurrently")]
    Conflict(String),

    /// The entity write and its outbox append were rolled back together.
    #[error("transaction rolled back: {0}")]
    Transaction(String),

    /// The projector could not apply a claimed event.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The event exhausted its retry budget.
    #[error("event {event_id} is dead-lettered after {retry_count} retries")]
    DeadLetter { event_id: EventId, retry_count: u32 },

    /// Storage infrastructure failure (connection, stored row decode, ...).
    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl OutflowError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for OutflowError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for OutflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(format!("json: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, OutflowError>;
