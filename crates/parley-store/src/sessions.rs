//! Durable chat sessions: one row per unordered participant pair.
//!
//! Uniqueness is enforced by the store — `UNIQUE(participant_a,
//! participant_b)` over the normalized pair — so a racing insert from the
//! other end of the conversation degrades into a lookup, never a second
//! row.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::ids::ChatId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: ChatId,
    pub participant_a: String,
    pub participant_b: String,
    pub created_at: String,
}

impl SessionRow {
    pub fn is_participant(&self, email: &str) -> bool {
        self.participant_a == email || self.participant_b == email
    }
}

/// Normalize an unordered pair so (A,B) and (B,A) key the same row.
fn normalize<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Per-pair creation lock. The UNIQUE constraint is the authoritative
/// guard; the lock just keeps the common case down to one insert attempt.
struct PairLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl PairLocks {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    fn get(&mut self, low: &str, high: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(format!("{low}\u{1f}{high}"))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct SessionRepo {
    db: Database,
    pair_locks: Mutex<PairLocks>,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            pair_locks: Mutex::new(PairLocks::new()),
        }
    }

    /// Find the session for an unordered pair, if one exists.
    #[instrument(skip(self))]
    pub fn find(&self, a: &str, b: &str) -> Result<Option<SessionRow>, StoreError> {
        let (low, high) = normalize(a, b);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, participant_a, participant_b, created_at
                 FROM chat_sessions WHERE participant_a = ?1 AND participant_b = ?2",
            )?;
            let mut rows = stmt.query([low, high])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Idempotent session creation: returns the existing row for the pair
    /// or inserts a new one. Safe under concurrent calls from both ends —
    /// a losing insert re-reads the winner's row.
    #[instrument(skip(self))]
    pub fn create_or_get(&self, a: &str, b: &str) -> Result<SessionRow, StoreError> {
        let (low, high) = normalize(a, b);
        let lock = self.pair_locks.lock().get(low, high);
        let _guard = lock.lock();

        if let Some(existing) = self.find(low, high)? {
            return Ok(existing);
        }

        let id = ChatId::new();
        let now = Utc::now().to_rfc3339();
        let inserted = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_sessions (id, participant_a, participant_b, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.as_str(), low, high, now],
            )?;
            Ok(SessionRow {
                id: id.clone(),
                participant_a: low.to_string(),
                participant_b: high.to_string(),
                created_at: now.clone(),
            })
        });

        match inserted {
            Ok(row) => Ok(row),
            Err(e) if e.is_unique_violation() => self
                .find(low, high)?
                .ok_or_else(|| StoreError::Database("session vanished after conflict".into())),
            Err(e) => Err(e),
        }
    }

    /// Get a session by chat id.
    #[instrument(skip(self), fields(chat_id = %id))]
    pub fn get(&self, id: &ChatId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, participant_a, participant_b, created_at
                 FROM chat_sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("chat {id}"))),
            }
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    Ok(SessionRow {
        id: ChatId::from_raw(row_helpers::get::<String>(row, 0, "chat_sessions", "id")?),
        participant_a: row_helpers::get(row, 1, "chat_sessions", "participant_a")?,
        participant_b: row_helpers::get(row, 2, "chat_sessions", "participant_b")?,
        created_at: row_helpers::get(row, 3, "chat_sessions", "created_at")?,
    })
}
