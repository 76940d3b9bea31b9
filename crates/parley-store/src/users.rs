//! Identity directory: email → profile. Read-only from the router's
//! perspective; profile mutation is exposed for the management surface.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::ids::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRow {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub profile_image: Option<String>,
    pub created_at: String,
}

/// Fields of a profile update. `None` fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub email: Option<String>,
    pub profile_image: Option<String>,
}

pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new user. Emails are unique; a duplicate insert fails
    /// with Conflict.
    #[instrument(skip(self, profile_image), fields(email))]
    pub fn create(
        &self,
        username: &str,
        email: &str,
        profile_image: Option<&str>,
    ) -> Result<UserRow, StoreError> {
        let id = UserId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, email, profile_image, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), username, email, profile_image, now],
            )?;

            Ok(UserRow {
                id,
                username: username.to_string(),
                email: email.to_string(),
                profile_image: profile_image.map(str::to_string),
                created_at: now,
            })
        })
    }

    /// Look up a user by email. Absent is not an error.
    #[instrument(skip(self))]
    pub fn find_by_email(&self, email: &str) -> Result<Option<UserRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, email, profile_image, created_at
                 FROM users WHERE email = ?1",
            )?;
            let mut rows = stmt.query([email])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_user(row)?)),
                None => Ok(None),
            }
        })
    }

    /// List all users, ordered by username.
    pub fn list(&self) -> Result<Vec<UserRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, email, profile_image, created_at
                 FROM users ORDER BY username",
            )?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_user(row)?);
            }
            Ok(results)
        })
    }

    /// Apply a partial profile update to the user identified by email.
    /// Changing the email to one already taken fails with Conflict.
    #[instrument(skip(self, update), fields(email))]
    pub fn update_profile(&self, email: &str, update: &ProfileUpdate) -> Result<UserRow, StoreError> {
        let mut fields = Vec::new();
        let mut values: Vec<&dyn rusqlite::types::ToSql> = Vec::new();

        if let Some(ref username) = update.username {
            fields.push("username = ?");
            values.push(username);
        }
        if let Some(ref new_email) = update.email {
            fields.push("email = ?");
            values.push(new_email);
        }
        if let Some(ref image) = update.profile_image {
            fields.push("profile_image = ?");
            values.push(image);
        }

        if fields.is_empty() {
            return self
                .find_by_email(email)?
                .ok_or_else(|| StoreError::NotFound(format!("user {email}")));
        }

        let target_email = update.email.as_deref().unwrap_or(email).to_string();

        self.db.with_conn(|conn| {
            let sql = format!("UPDATE users SET {} WHERE email = ?", fields.join(", "));
            values.push(&email);
            let updated = conn.execute(&sql, values.as_slice())?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("user {email}")));
            }
            Ok(())
        })?;

        self.find_by_email(&target_email)?
            .ok_or_else(|| StoreError::NotFound(format!("user {target_email}")))
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> Result<UserRow, StoreError> {
    Ok(UserRow {
        id: UserId::from_raw(row_helpers::get::<String>(row, 0, "users", "id")?),
        username: row_helpers::get(row, 1, "users", "username")?,
        email: row_helpers::get(row, 2, "users", "email")?,
        profile_image: row_helpers::get_opt(row, 3, "users", "profile_image")?,
        created_at: row_helpers::get(row, 4, "users", "created_at")?,
    })
}
