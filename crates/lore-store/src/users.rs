use std::sync::Mutex;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use rusqlite::Connection;
use tracing::{info, instrument};

use crate::error::{Result, StoreError};
use crate::types::User;

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| StoreError::Crypto(e.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Thread-safe manager for user rows.
pub struct UserStore {
    db: Mutex<Connection>,
}

impl UserStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    #[instrument(skip(self, password))]
    pub fn create(&self, username: &str, email: &str, password: &str) -> Result<User> {
        if username.trim().is_empty() || email.trim().is_empty() {
            return Err(StoreError::Validation(
                "username and email must not be empty".to_string(),
            ));
        }
        if password.len() < 8 {
            return Err(StoreError::Validation(
                "password must be at least 8 characters".to_string(),
            ));
        }

        let hash = hash_password(password)?;
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();

        let taken: i64 = db.query_row(
            "SELECT COUNT(*) FROM users WHERE username = ?1 OR email = ?2",
            rusqlite::params![username, email],
            |r| r.get(0),
        )?;
        if taken > 0 {
            return Err(StoreError::Precondition(
                "username or email already registered".to_string(),
            ));
        }

        db.execute(
            "INSERT INTO users (username, email, password_hash, role, status, created_at)
             VALUES (?1, ?2, ?3, 'user', 1, ?4)",
            rusqlite::params![username, email, hash, now],
        )?;
        let id = db.last_insert_rowid();
        info!(user_id = id, username, "created user");
        Self::get_with(&db, id)
    }

    #[instrument(skip(self))]
    pub fn get(&self, id: i64) -> Result<User> {
        let db = self.db.lock().unwrap();
        Self::get_with(&db, id)
    }

    fn get_with(db: &Connection, id: i64) -> Result<User> {
        db.query_row(
            "SELECT id, username, email, password_hash, role, status,
                    password_changed_at, created_at
             FROM users WHERE id = ?1",
            rusqlite::params![id],
            row_to_user,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                entity: "user",
                id: id.to_string(),
            },
            other => StoreError::Database(other),
        })
    }

    #[instrument(skip(self))]
    pub fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, username, email, password_hash, role, status,
                    password_changed_at, created_at
             FROM users WHERE username = ?1",
            rusqlite::params![username],
            row_to_user,
        ) {
            Ok(u) => Ok(Some(u)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Admin listing, newest first.
    pub fn list(&self, skip: usize, limit: usize) -> Result<Vec<User>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, username, email, password_hash, role, status,
                    password_changed_at, created_at
             FROM users ORDER BY id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![limit as i64, skip as i64], row_to_user)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Set a new password and stamp `password_changed_at`, which revokes
    /// every token issued before this instant.
    #[instrument(skip(self, new_password))]
    pub fn update_password(&self, id: i64, new_password: &str) -> Result<()> {
        if new_password.len() < 8 {
            return Err(StoreError::Validation(
                "password must be at least 8 characters".to_string(),
            ));
        }
        let hash = hash_password(new_password)?;
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE users SET password_hash = ?1, password_changed_at = ?2 WHERE id = ?3",
            rusqlite::params![hash, now, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "user",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        role: row.get(4)?,
        status: row.get(5)?,
        password_changed_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    #[test]
    fn create_and_authenticate() {
        let store = UserStore::new(test_conn());
        let user = store.create("alice", "a@x.io", "Abcd1234").unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.role, "user");
        assert!(verify_password("Abcd1234", &user.password_hash));
        assert!(!verify_password("wrong", &user.password_hash));
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let store = UserStore::new(test_conn());
        store.create("alice", "a@x.io", "Abcd1234").unwrap();
        let err = store.create("alice", "b@x.io", "Abcd1234").unwrap_err();
        assert!(matches!(err, StoreError::Precondition(_)));
    }

    #[test]
    fn short_password_is_rejected() {
        let store = UserStore::new(test_conn());
        let err = store.create("bob", "b@x.io", "short").unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn password_change_stamps_revocation_time() {
        let store = UserStore::new(test_conn());
        let user = store.create("alice", "a@x.io", "Abcd1234").unwrap();
        assert!(user.password_changed_at.is_none());

        store.update_password(user.id, "NewPass99").unwrap();
        let updated = store.get(user.id).unwrap();
        assert!(updated.password_changed_at.is_some());
        assert!(verify_password("NewPass99", &updated.password_hash));
    }
}
