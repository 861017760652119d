//! SQLite projection store (`projection_customers`).
//!
//! Lives in its own database file: the projection is a separate store and is
//! never written inside an entity transaction.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::params;

use super::sqlite_db::{PROJECTION_SCHEMA, SqliteDb, from_micros, to_micros};
use crate::domain::{CustomerId, CustomerProjection, OutflowError, Result};
use crate::ports::ProjectionStore;

const COLUMNS: &str = "id, name, email, deleted, created_at, updated_at";

pub struct SqliteProjectionStore {
    db: SqliteDb,
}

impl SqliteProjectionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: SqliteDb::open(path.as_ref(), PROJECTION_SCHEMA)?,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: SqliteDb::open_in_memory(PROJECTION_SCHEMA)?,
        })
    }
}

type RawRow = (String, String, String, bool, i64, i64);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode((id, name, email, deleted, created_at, updated_at): RawRow) -> Result<CustomerProjection> {
    Ok(CustomerProjection {
        id: id
            .parse()
            .map_err(|e| OutflowError::Store(format!("projection id {id:?}: {e}")))?,
        name,
        email,
        deleted,
        created_at: from_micros(created_at)?,
        updated_at: from_micros(updated_at)?,
    })
}

#[async_trait]
impl ProjectionStore for SqliteProjectionStore {
    async fn insert(&self, row: CustomerProjection) -> Result<bool> {
        self.db
            .call(move |conn| {
                let inserted = conn.execute(
                    &format!(
                        "INSERT INTO projection_customers ({COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT (id) DO NOTHING"
                    ),
                    params![
                        row.id.to_storage(),
                        row.name,
                        row.email,
                        row.deleted,
                        to_micros(row.created_at),
                        to_micros(row.updated_at),
                    ],
                )?;
                Ok(inserted == 1)
            })
            .await
    }

    async fn update(&self, row: CustomerProjection) -> Result<bool> {
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE projection_customers
                     SET name = ?1, email = ?2, deleted = ?3, created_at = ?4, updated_at = ?5
                     WHERE id = ?6",
                    params![
                        row.name,
                        row.email,
                        row.deleted,
                        to_micros(row.created_at),
                        to_micros(row.updated_at),
                        row.id.to_storage(),
                    ],
                )?;
                Ok(changed == 1)
            })
            .await
    }

    async fn mark_deleted(&self, row: CustomerProjection) -> Result<()> {
        self.db
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO projection_customers ({COLUMNS})
                         VALUES (?1, ?2, ?3, 1, ?4, ?5)
                         ON CONFLICT (id) DO UPDATE SET
                             name = excluded.name,
                             email = excluded.email,
                             deleted = 1,
                             updated_at = excluded.updated_at"
                    ),
                    params![
                        row.id.to_storage(),
                        row.name,
                        row.email,
                        to_micros(row.created_at),
                        to_micros(row.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn get(&self, id: CustomerId) -> Result<Option<CustomerProjection>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM projection_customers WHERE id = ?1"
                ))?;
                let mut rows = stmt
                    .query_map(params![id.to_storage()], read_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.pop().map(decode).transpose()
            })
            .await
    }

    async fn list(&self) -> Result<Vec<CustomerProjection>> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM projection_customers ORDER BY created_at, id"
                ))?;
                let rows = stmt
                    .query_map([], read_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(decode).collect()
            })
            .await
    }
}
