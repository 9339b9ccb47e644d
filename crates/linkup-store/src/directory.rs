use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use linkup_core::ids::UserId;

use crate::database::Database;
use crate::error::StoreError;

/// A platform user as known to the directory. Authentication and profile
/// management live elsewhere; this is the read model the realtime layer
/// resolves identities against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRow {
    pub id: UserId,
    pub full_name: String,
    pub role: String,
    pub location: Option<String>,
    pub created_at: String,
}

pub struct DirectoryRepo {
    db: Database,
}

impl DirectoryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or update a user record.
    #[instrument(skip(self), fields(user_id = %id))]
    pub fn upsert(
        &self,
        id: &UserId,
        full_name: &str,
        role: &str,
        location: Option<&str>,
    ) -> Result<UserRow, StoreError> {
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, full_name, role, location, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     full_name = excluded.full_name,
                     role = excluded.role,
                     location = excluded.location",
                rusqlite::params![id.as_str(), full_name, role, location, now],
            )?;

            conn.query_row(
                "SELECT id, full_name, role, location, created_at FROM users WHERE id = ?1",
                [id.as_str()],
                row_to_user,
            )
            .map_err(|e| StoreError::Database(e.to_string()))
        })
    }

    /// Get a user by ID.
    #[instrument(skip(self), fields(user_id = %id))]
    pub fn get(&self, id: &UserId) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, full_name, role, location, created_at FROM users WHERE id = ?1",
                [id.as_str()],
                row_to_user,
            )
            .map_err(|_| StoreError::NotFound(format!("user {id}")))
        })
    }

    /// List users, newest first.
    pub fn list(&self, limit: u32, offset: u32) -> Result<Vec<UserRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, full_name, role, location, created_at FROM users
                 ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![limit, offset], row_to_user)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Count all users.
    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
                .map_err(|e| StoreError::Database(e.to_string()))
        })
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> Result<UserRow, rusqlite::Error> {
    Ok(UserRow {
        id: UserId::from_raw(row.get::<_, String>(0)?),
        full_name: row.get(1)?,
        role: row.get(2)?,
        location: row.get(3)?,
        created_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> DirectoryRepo {
        DirectoryRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn upsert_and_get() {
        let repo = setup();
        let id = UserId::from_raw("u1");
        repo.upsert(&id, "Ada Verma", "investor", Some("Pune")).unwrap();

        let user = repo.get(&id).unwrap();
        assert_eq!(user.full_name, "Ada Verma");
        assert_eq!(user.role, "investor");
        assert_eq!(user.location.as_deref(), Some("Pune"));
    }

    #[test]
    fn upsert_updates_existing() {
        let repo = setup();
        let id = UserId::from_raw("u1");
        repo.upsert(&id, "Ada Verma", "investor", None).unwrap();
        repo.upsert(&id, "Ada Verma", "entrepreneur", Some("Mumbai")).unwrap();

        let user = repo.get(&id).unwrap();
        assert_eq!(user.role, "entrepreneur");
        assert_eq!(user.location.as_deref(), Some("Mumbai"));
        assert_eq!(repo.count().unwrap(), 1);
    }

    #[test]
    fn get_missing_is_not_found() {
        let repo = setup();
        let err = repo.get(&UserId::from_raw("ghost")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn list_and_count() {
        let repo = setup();
        repo.upsert(&UserId::from_raw("a"), "A", "realtor", None).unwrap();
        repo.upsert(&UserId::from_raw("b"), "B", "supplier", None).unwrap();
        repo.upsert(&UserId::from_raw("c"), "C", "admin", None).unwrap();

        assert_eq!(repo.count().unwrap(), 3);
        assert_eq!(repo.list(2, 0).unwrap().len(), 2);
        assert_eq!(repo.list(100, 2).unwrap().len(), 1);
    }
}
