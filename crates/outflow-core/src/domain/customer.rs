//! Customer entity: the system-of-record row and its write inputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{OutflowError, Result};
use super::ids::CustomerId;

const MAX_NAME_LEN: usize = 200;
const MAX_EMAIL_LEN: usize = 254;

/// Source-of-truth customer record.
///
/// Owned by the entity store. The same shape is serialized into every outbox
/// payload, so field names are part of the stored format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for `create`. The store assigns an id when none is given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCustomer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CustomerId>,
    pub name: String,
    pub email: String,
}

impl NewCustomer {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            email: email.into(),
        }
    }

    pub fn with_id(mut self, id: CustomerId) -> Self {
        self.id = Some(id);
        self
    }

    /// Trim and validate. Stores call this before opening a transaction.
    pub fn validated(self) -> Result<Self> {
        let (name, email) = validate_fields(&self.name, &self.email)?;
        Ok(Self {
            id: self.id,
            name,
            email,
        })
    }
}

/// Input for `update`: the full new state of the mutable fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerUpdate {
    pub id: CustomerId,
    pub name: String,
    pub email: String,
}

impl CustomerUpdate {
    pub fn new(id: CustomerId, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            email: email.into(),
        }
    }

    pub fn validated(self) -> Result<Self> {
        let (name, email) = validate_fields(&self.name, &self.email)?;
        Ok(Self {
            id: self.id,
            name,
            email,
        })
    }
}

fn validate_fields(name: &str, email: &str) -> Result<(String, String)> {
    let name = name.trim();
    if name.is_empty() {
        return Err(OutflowError::Validation("name must not be blank".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(OutflowError::Validation(format!(
            "name exceeds {MAX_NAME_LEN} characters"
        )));
    }

    let email = email.trim();
    if email.is_empty() {
        return Err(OutflowError::Validation("email must not be blank".into()));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(OutflowError::Validation(format!(
            "email exceeds {MAX_EMAIL_LEN} characters"
        )));
    }
    let valid_shape = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    };
    if !valid_shape || email.chars().any(char::is_whitespace) {
        return Err(OutflowError::Validation(format!(
            "email {email:?} is not a valid address"
        )));
    }

    Ok((name.to_string(), email.to_string()))
}
