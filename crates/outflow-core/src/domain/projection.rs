//! Read-side copy of a customer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::customer::Customer;
use super::ids::CustomerId;

/// Row of the projection store. Written only by the projector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerProjection {
    pub id: CustomerId,
    pub name: String,
    pub email: String,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Customer> for CustomerProjection {
    fn from(customer: &Customer) -> Self {
        Self {
            id: customer.id,
            name: customer.name.clone(),
            email: customer.email.clone(),
            deleted: customer.deleted,
            created_at: customer.created_at,
            updated_at: customer.updated_at,
        }
    }
}
