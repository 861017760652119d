//! ProjectionStore port: the read model.
//!
//! Only the projector writes here. Each call is one atomic write and
//! reports "nothing matched" as `Ok(false)` so the caller decides whether that
//! is a failure.

use async_trait::async_trait;

use crate::domain::{CustomerId, CustomerProjection, Result};

#[async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Insert a new row. `Ok(false)` if the id already exists.
    async fn insert(&self, row: CustomerProjection) -> Result<bool>;

    /// Overwrite an existing row. `Ok(false)` if the id is unknown.
    async fn update(&self, row: CustomerProjection) -> Result<bool>;

    /// Upsert `row` with `deleted = true`.
    async fn mark_deleted(&self, row: CustomerProjection) -> Result<()>;

    async fn get(&self, id: CustomerId) -> Result<Option<CustomerProjection>>;

    async fn list(&self) -> Result<Vec<CustomerProjection>>;
}
