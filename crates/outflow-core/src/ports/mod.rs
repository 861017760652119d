//! Ports: the traits the relay loops are written against.
//!
//! The entity store and the outbox are separate traits even though both are
//! usually backed by the same database, because the relay only ever needs
//! the outbox half.

pub mod clock;
pub mod customer_store;
pub mod id_generator;
pub mod outbox_store;
pub mod projection_store;

pub use self::clock::{Clock, FixedClock, SharedClock, SystemClock};
pub use self::customer_store::CustomerStore;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::outbox_store::OutboxStore;
pub use self::projection_store::ProjectionStore;
