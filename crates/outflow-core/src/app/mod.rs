//! Relay loops and the runtime that wires them together.
//!
//! - **dispatcher**: leases the head of the line
//! - **projector**: applies claims and records the outcome
//! - **retry_scheduler**: requeues cooled-down failures, reports dead letters
//! - **relay**: spawns the three loops with a shared shutdown signal

pub mod dispatcher;
pub mod projector;
pub mod relay;
pub mod retry_scheduler;

pub use dispatcher::{ClaimDispatcher, TickOutcome};
pub use projector::{Completion, EventApplier, ProjectionApplier, Projector};
pub use relay::{Relay, replay_dead_letter};
pub use retry_scheduler::{RetryReport, RetryScheduler};
