//! outflow-core
//!
//! Transactional outbox relay for customer records.
//!
//! Every customer write appends an outbox event in the same transaction. The
//! relay leases events strictly in creation order, applies them to a separate
//! projection store and retries failures a bounded number of times.
//!
//! # Modules
//! - **domain**: ids, customer, outbox event state machine, projection row, errors
//! - **config**: relay timing and sizing
//! - **ports**: store, clock and id traits
//! - **impls**: in-memory and SQLite stores
//! - **app**: dispatcher, projector, retry scheduler, relay
//! - **observability**: outbox status counts

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;

pub use app::{
    ClaimDispatcher, Completion, EventApplier, ProjectionApplier, Projector, Relay, RetryReport,
    RetryScheduler, TickOutcome,
};
pub use config::{ConfigError, RelayConfig};
pub use domain::{
    Customer, CustomerEvent, CustomerId, CustomerProjection, CustomerUpdate, EventId, EventStatus,
    EventType, NewCustomer, OutboxEvent, OutflowError, Result,
};
pub use observability::OutboxCounts;
