//! CustomerStore port: the system of record.
//!
//! Every mutating call writes the customer row and appends exactly one outbox
//! event in the same atomic unit. If either write fails neither is visible
//! and the caller gets `OutflowError::Transaction`.

use async_trait::async_trait;

use crate::domain::{Customer, CustomerId, CustomerUpdate, NewCustomer, Result};

#[async_trait]
pub trait CustomerStore: Send + Sync {
    /// Insert a customer and its `CustomerCreated` event.
    async fn create(&self, input: NewCustomer) -> Result<Customer>;

    /// Overwrite name and email of a live customer and append
    /// `CustomerUpdated`. `NotFound` if the row is missing or soft-deleted.
    async fn update(&self, input: CustomerUpdate) -> Result<Customer>;

    /// Set `deleted` and append `CustomerDeleted` with the post-delete
    /// snapshot. `NotFound` if no row has this id.
    async fn soft_delete(&self, id: CustomerId) -> Result<Customer>;

    async fn find_by_id(&self, id: CustomerId, include_deleted: bool) -> Result<Option<Customer>>;

    async fn find_by_email(&self, email: &str, include_deleted: bool)
    -> Result<Option<Customer>>;

    /// All customers, oldest first.
    async fn list(&self, include_deleted: bool) -> Result<Vec<Customer>>;
}
