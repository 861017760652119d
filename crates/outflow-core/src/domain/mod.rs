//! Domain model (IDs, customer entity, outbox events, projection rows, errors).

pub mod customer;
pub mod errors;
pub mod event;
pub mod ids;
pub mod projection;

pub use customer::{Customer, CustomerUpdate, NewCustomer};
pub use errors::{OutflowError, Result};
pub use event::{CustomerEvent, EventGuard, EventStatus, EventType, OutboxEvent};
pub use ids::{CustomerId, EventId};
pub use projection::CustomerProjection;
