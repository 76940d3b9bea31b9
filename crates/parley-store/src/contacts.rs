//! Contact relation: a symmetric edge stored as two directed rows so
//! either side can be queried independently. Both directions are written
//! or deleted inside one transaction — a half-applied edge is corruption.

use chrono::Utc;
use tracing::instrument;

use parley_core::ids::ContactId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct ContactRepo {
    db: Database,
}

impl ContactRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert both directions of the edge atomically. An existing edge in
    /// either direction fails the whole operation with Conflict.
    #[instrument(skip(self))]
    pub fn add_edge(&self, a: &str, b: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO contacts (id, user_email, contact_email, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![ContactId::new().as_str(), a, b, now],
            )?;
            tx.execute(
                "INSERT INTO contacts (id, user_email, contact_email, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![ContactId::new().as_str(), b, a, now],
            )?;
            Ok(())
        })
    }

    /// Delete both directions of the edge atomically.
    #[instrument(skip(self))]
    pub fn remove_edge(&self, a: &str, b: &str) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            tx.execute(
                "DELETE FROM contacts
                 WHERE (user_email = ?1 AND contact_email = ?2)
                    OR (user_email = ?2 AND contact_email = ?1)",
                rusqlite::params![a, b],
            )?;
            Ok(())
        })
    }

    /// Contact emails for an identity, ordered for stable output.
    #[instrument(skip(self))]
    pub fn list(&self, email: &str) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT contact_email FROM contacts
                 WHERE user_email = ?1 ORDER BY contact_email",
            )?;
            let mut rows = stmt.query([email])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_helpers::get(row, 0, "contacts", "contact_email")?);
            }
            Ok(results)
        })
    }
}
