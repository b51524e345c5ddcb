use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{info, instrument};

use crate::crypto::{mask_api_key, KeyCrypto};
use crate::error::{Result, StoreError};
use crate::types::{ApiKey, Llm};

/// Manager for configured LLMs and their encrypted API keys.
pub struct LlmStore {
    db: Mutex<Connection>,
    crypto: KeyCrypto,
}

impl LlmStore {
    pub fn new(conn: Connection, crypto: KeyCrypto) -> Self {
        Self {
            db: Mutex::new(conn),
            crypto,
        }
    }

    #[instrument(skip(self))]
    pub fn create(
        &self,
        name: &str,
        model_type: &str,
        provider: &str,
        model_name: &str,
        base_url: Option<&str>,
        api_version: Option<&str>,
    ) -> Result<Llm> {
        if !matches!(model_type, "chat" | "embedding" | "rerank") {
            return Err(StoreError::Validation(format!(
                "unknown model_type: {}",
                model_type
            )));
        }
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO llms (name, model_type, provider, model_name, base_url, api_version, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
            rusqlite::params![name, model_type, provider, model_name, base_url, api_version, now],
        )?;
        let id = db.last_insert_rowid();
        info!(llm_id = id, name, "registered LLM");
        Self::get_with(&db, id)
    }

    pub fn get(&self, id: i64) -> Result<Llm> {
        let db = self.db.lock().unwrap();
        Self::get_with(&db, id)
    }

    fn get_with(db: &Connection, id: i64) -> Result<Llm> {
        db.query_row(
            "SELECT id, name, model_type, provider, model_name, base_url, api_version, status, created_at
             FROM llms WHERE id = ?1",
            rusqlite::params![id],
            row_to_llm,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                entity: "llm",
                id: id.to_string(),
            },
            other => StoreError::Database(other),
        })
    }

    /// Get an enabled LLM or fail with a precondition error; callers on the
    /// chat path need the distinction from plain not-found.
    pub fn get_active(&self, id: i64) -> Result<Llm> {
        let llm = self.get(id)?;
        if llm.status != 1 {
            return Err(StoreError::Precondition(format!(
                "LLM {} is disabled",
                llm.name
            )));
        }
        Ok(llm)
    }

    pub fn list(&self, model_type: Option<&str>) -> Result<Vec<Llm>> {
        let db = self.db.lock().unwrap();
        let mut out = Vec::new();
        match model_type {
            Some(t) => {
                let mut stmt = db.prepare(
                    "SELECT id, name, model_type, provider, model_name, base_url, api_version, status, created_at
                     FROM llms WHERE model_type = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(rusqlite::params![t], row_to_llm)?;
                out.extend(rows.filter_map(|r| r.ok()));
            }
            None => {
                let mut stmt = db.prepare(
                    "SELECT id, name, model_type, provider, model_name, base_url, api_version, status, created_at
                     FROM llms ORDER BY id",
                )?;
                let rows = stmt.query_map([], row_to_llm)?;
                out.extend(rows.filter_map(|r| r.ok()));
            }
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    pub fn update_status(&self, id: i64, status: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE llms SET status = ?1 WHERE id = ?2",
            rusqlite::params![status, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "llm",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn delete(&self, id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM api_keys WHERE llm_id = ?1", rusqlite::params![id])?;
        let changed = db.execute("DELETE FROM llms WHERE id = ?1", rusqlite::params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "llm",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Store a key encrypted; the plaintext never touches the database.
    #[instrument(skip(self, plaintext))]
    pub fn add_api_key(&self, llm_id: i64, alias: &str, plaintext: &str) -> Result<ApiKey> {
        let db = self.db.lock().unwrap();
        // llm must exist
        Self::get_with(&db, llm_id)?;

        let encrypted = self.crypto.encrypt(plaintext)?;
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO api_keys (llm_id, alias, api_key_encrypted, status, created_at)
             VALUES (?1, ?2, ?3, 1, ?4)",
            rusqlite::params![llm_id, alias, encrypted, now],
        )?;
        let id = db.last_insert_rowid();
        db.query_row(
            "SELECT id, llm_id, alias, api_key_encrypted, status, created_at
             FROM api_keys WHERE id = ?1",
            rusqlite::params![id],
            |row| self.row_to_api_key(row),
        )
        .map_err(StoreError::Database)
    }

    /// Decrypted key of the first enabled credential for an LLM.
    #[instrument(skip(self))]
    pub fn active_api_key(&self, llm_id: i64) -> Result<Option<String>> {
        let db = self.db.lock().unwrap();
        let encrypted: Option<String> = match db.query_row(
            "SELECT api_key_encrypted FROM api_keys
             WHERE llm_id = ?1 AND status = 1 ORDER BY id LIMIT 1",
            rusqlite::params![llm_id],
            |r| r.get(0),
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(StoreError::Database(e)),
        };
        match encrypted {
            Some(ct) => Ok(Some(self.crypto.decrypt(&ct)?)),
            None => Ok(None),
        }
    }

    /// Listing for display; keys come back masked, never decrypted.
    pub fn list_api_keys(&self, llm_id: i64) -> Result<Vec<ApiKey>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, llm_id, alias, api_key_encrypted, status, created_at
             FROM api_keys WHERE llm_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(rusqlite::params![llm_id], |row| self.row_to_api_key(row))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn update_api_key_status(&self, key_id: i64, status: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE api_keys SET status = ?1 WHERE id = ?2",
            rusqlite::params![status, key_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "api key",
                id: key_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn delete_api_key(&self, key_id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute("DELETE FROM api_keys WHERE id = ?1", rusqlite::params![key_id])?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "api key",
                id: key_id.to_string(),
            });
        }
        Ok(())
    }

    fn row_to_api_key(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiKey> {
        let encrypted: String = row.get(3)?;
        let masked = self
            .crypto
            .decrypt(&encrypted)
            .map(|plain| mask_api_key(&plain))
            .unwrap_or_else(|_| "********".to_string());
        Ok(ApiKey {
            id: row.get(0)?,
            llm_id: row.get(1)?,
            alias: row.get(2)?,
            api_key_encrypted: encrypted,
            masked_key: masked,
            status: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

fn row_to_llm(row: &rusqlite::Row<'_>) -> rusqlite::Result<Llm> {
    Ok(Llm {
        id: row.get(0)?,
        name: row.get(1)?,
        model_type: row.get(2)?,
        provider: row.get(3)?,
        model_name: row.get(4)?,
        base_url: row.get(5)?,
        api_version: row.get(6)?,
        status: row.get(7)?,
        created_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    fn store() -> LlmStore {
        LlmStore::new(test_conn(), KeyCrypto::new(KEY).unwrap())
    }

    #[test]
    fn create_and_fetch_llm() {
        let store = store();
        let llm = store
            .create("gpt", "chat", "openai", "gpt-4o-mini", None, None)
            .unwrap();
        assert_eq!(store.get(llm.id).unwrap().model_name, "gpt-4o-mini");
    }

    #[test]
    fn bad_model_type_rejected() {
        let err = store()
            .create("x", "oracle", "openai", "m", None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn api_key_round_trip_stays_encrypted_at_rest() {
        let store = store();
        let llm = store
            .create("gpt", "chat", "openai", "gpt-4o-mini", None, None)
            .unwrap();
        let key = store.add_api_key(llm.id, "prod", "sk-secret-value").unwrap();
        assert_ne!(key.api_key_encrypted, "sk-secret-value");
        assert!(key.masked_key.starts_with("sk-s"));
        assert!(key.masked_key.contains('*'));

        let plain = store.active_api_key(llm.id).unwrap().unwrap();
        assert_eq!(plain, "sk-secret-value");
    }

    #[test]
    fn disabled_keys_are_not_served() {
        let store = store();
        let llm = store
            .create("gpt", "chat", "openai", "gpt-4o-mini", None, None)
            .unwrap();
        let key = store.add_api_key(llm.id, "prod", "sk-a").unwrap();
        store.update_api_key_status(key.id, 0).unwrap();
        assert!(store.active_api_key(llm.id).unwrap().is_none());
    }

    #[test]
    fn disabled_llm_fails_active_lookup() {
        let store = store();
        let llm = store
            .create("gpt", "chat", "openai", "gpt-4o-mini", None, None)
            .unwrap();
        store.update_status(llm.id, 0).unwrap();
        assert!(matches!(
            store.get_active(llm.id).unwrap_err(),
            StoreError::Precondition(_)
        ));
    }
}
