//! In-memory projection store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{CustomerId, CustomerProjection, Result};
use crate::ports::ProjectionStore;

#[derive(Default)]
pub struct InMemoryProjectionStore {
    rows: Mutex<HashMap<CustomerId, CustomerProjection>>,
}

impl InMemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectionStore for InMemoryProjectionStore {
    async fn insert(&self, row: CustomerProjection) -> Result<bool> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&row.id) {
            return Ok(false);
        }
        rows.insert(row.id, row);
        Ok(true)
    }

    async fn update(&self, row: CustomerProjection) -> Result<bool> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&row.id) {
            Some(existing) => {
                *existing = row;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_deleted(&self, row: CustomerProjection) -> Result<()> {
        let mut rows = self.rows.lock().await;
        rows.insert(
            row.id,
            CustomerProjection {
                deleted: true,
                ..row
            },
        );
        Ok(())
    }

    async fn get(&self, id: CustomerId) -> Result<Option<CustomerProjection>> {
        Ok(self.rows.lock().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<CustomerProjection>> {
        let rows = self.rows.lock().await;
        let mut all: Vec<CustomerProjection> = rows.values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ulid::Ulid;

    fn row() -> CustomerProjection {
        let now = Utc::now();
        CustomerProjection {
            id: CustomerId::from_ulid(Ulid::new()),
            name: "John Doe".into(),
            email: "john@example.com".into(),
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_refuses_duplicates() {
        let store = InMemoryProjectionStore::new();
        let r = row();
        assert!(store.insert(r.clone()).await.unwrap());
        assert!(!store.insert(r).await.unwrap());
    }

    #[tokio::test]
    async fn update_of_unknown_row_reports_false() {
        let store = InMemoryProjectionStore::new();
        assert!(!store.update(row()).await.unwrap());
    }

    #[tokio::test]
    async fn mark_deleted_upserts() {
        let store = InMemoryProjectionStore::new();
        let r = row();
        store.mark_deleted(r.clone()).await.unwrap();
        store.mark_deleted(r.clone()).await.unwrap();
        let stored = store.get(r.id).await.unwrap().unwrap();
        assert!(stored.deleted);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
