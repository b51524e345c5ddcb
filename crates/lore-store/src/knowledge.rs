use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{info, instrument};

use crate::error::{Result, StoreError};
use crate::types::Knowledge;

pub const MIN_CHUNK_SIZE: i64 = 100;
pub const MAX_CHUNK_SIZE: i64 = 2000;
pub const MAX_CHUNK_OVERLAP: i64 = 500;

/// Manager for knowledge bases. The vector collection handle and the bound
/// embedding model are immutable after creation; changing either would
/// orphan every stored vector.
pub struct KnowledgeStore {
    db: Mutex<Connection>,
}

impl KnowledgeStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Collection handle for a new KB: `kb_{owner}_{millis}`.
    pub fn new_collection_name(user_id: i64) -> String {
        format!("kb_{}_{}", user_id, chrono::Utc::now().timestamp_millis())
    }

    #[instrument(skip(self))]
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        user_id: i64,
        name: &str,
        description: Option<&str>,
        embed_llm_id: i64,
        vector_collection_name: &str,
        chunk_size: i64,
        chunk_overlap: i64,
    ) -> Result<Knowledge> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(StoreError::Validation(format!(
                "chunk_size must be in [{}, {}]",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }
        if !(0..=MAX_CHUNK_OVERLAP).contains(&chunk_overlap) || chunk_overlap >= chunk_size {
            return Err(StoreError::Validation(format!(
                "chunk_overlap must be in [0, {}] and smaller than chunk_size",
                MAX_CHUNK_OVERLAP
            )));
        }

        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO knowledges (user_id, name, description, embed_llm_id,
                vector_collection_name, chunk_size, chunk_overlap, status,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)",
            rusqlite::params![
                user_id,
                name,
                description,
                embed_llm_id,
                vector_collection_name,
                chunk_size,
                chunk_overlap,
                now
            ],
        )?;
        let id = db.last_insert_rowid();
        info!(knowledge_id = id, name, "created knowledge base");
        Self::get_with(&db, id)
    }

    pub fn get(&self, id: i64) -> Result<Knowledge> {
        let db = self.db.lock().unwrap();
        Self::get_with(&db, id)
    }

    /// Fetch with the owner/admin permission gate the HTTP layer relies on.
    #[instrument(skip(self))]
    pub fn get_owned(&self, id: i64, user_id: i64, is_admin: bool) -> Result<Knowledge> {
        let kb = self.get(id)?;
        if kb.user_id != user_id && !is_admin {
            return Err(StoreError::Forbidden(
                "no access to this knowledge base".to_string(),
            ));
        }
        Ok(kb)
    }

    fn get_with(db: &Connection, id: i64) -> Result<Knowledge> {
        db.query_row(
            "SELECT id, user_id, name, description, embed_llm_id, vector_collection_name,
                    chunk_size, chunk_overlap, document_count, total_chunks, status,
                    created_at, updated_at
             FROM knowledges WHERE id = ?1",
            rusqlite::params![id],
            row_to_knowledge,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                entity: "knowledge base",
                id: id.to_string(),
            },
            other => StoreError::Database(other),
        })
    }

    pub fn list_for_user(&self, user_id: i64, is_admin: bool) -> Result<Vec<Knowledge>> {
        let db = self.db.lock().unwrap();
        let mut out = Vec::new();
        if is_admin {
            let mut stmt = db.prepare(
                "SELECT id, user_id, name, description, embed_llm_id, vector_collection_name,
                        chunk_size, chunk_overlap, document_count, total_chunks, status,
                        created_at, updated_at
                 FROM knowledges ORDER BY id DESC",
            )?;
            let rows = stmt.query_map([], row_to_knowledge)?;
            out.extend(rows.filter_map(|r| r.ok()));
        } else {
            let mut stmt = db.prepare(
                "SELECT id, user_id, name, description, embed_llm_id, vector_collection_name,
                        chunk_size, chunk_overlap, document_count, total_chunks, status,
                        created_at, updated_at
                 FROM knowledges WHERE user_id = ?1 ORDER BY id DESC",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id], row_to_knowledge)?;
            out.extend(rows.filter_map(|r| r.ok()));
        }
        Ok(out)
    }

    /// Name/description/status only; the collection and embedding binding
    /// never change.
    #[instrument(skip(self))]
    pub fn update(
        &self,
        id: i64,
        name: Option<&str>,
        description: Option<&str>,
        status: Option<i64>,
    ) -> Result<Knowledge> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        Self::get_with(&db, id)?;

        if let Some(name) = name {
            db.execute(
                "UPDATE knowledges SET name = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![name, now, id],
            )?;
        }
        if let Some(description) = description {
            db.execute(
                "UPDATE knowledges SET description = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![description, now, id],
            )?;
        }
        if let Some(status) = status {
            db.execute(
                "UPDATE knowledges SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status, now, id],
            )?;
        }
        Self::get_with(&db, id)
    }

    #[instrument(skip(self))]
    pub fn delete(&self, id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute("DELETE FROM knowledges WHERE id = ?1", rusqlite::params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "knowledge base",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Filter a candidate set down to enabled KBs, preserving order.
    pub fn active_ids(&self, ids: &[i64]) -> Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.db.lock().unwrap();
        let mut active = Vec::new();
        let mut stmt = db.prepare("SELECT status FROM knowledges WHERE id = ?1")?;
        for id in ids {
            let status: Option<i64> = match stmt.query_row(rusqlite::params![id], |r| r.get(0)) {
                Ok(s) => Some(s),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(StoreError::Database(e)),
            };
            if status == Some(1) {
                active.push(*id);
            }
        }
        Ok(active)
    }

    /// Load several KBs at once (retrieval's vector leg).
    pub fn get_many(&self, ids: &[i64]) -> Result<Vec<Knowledge>> {
        let db = self.db.lock().unwrap();
        let mut out = Vec::new();
        for id in ids {
            if let Ok(kb) = Self::get_with(&db, *id) {
                out.push(kb);
            }
        }
        Ok(out)
    }
}

fn row_to_knowledge(row: &rusqlite::Row<'_>) -> rusqlite::Result<Knowledge> {
    Ok(Knowledge {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        embed_llm_id: row.get(4)?,
        vector_collection_name: row.get(5)?,
        chunk_size: row.get(6)?,
        chunk_overlap: row.get(7)?,
        document_count: row.get(8)?,
        total_chunks: row.get(9)?,
        status: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    fn store() -> KnowledgeStore {
        KnowledgeStore::new(test_conn())
    }

    fn create(store: &KnowledgeStore, user_id: i64, name: &str) -> Knowledge {
        let coll = KnowledgeStore::new_collection_name(user_id);
        store
            .create(user_id, name, None, 1, &coll, 500, 50)
            .unwrap()
    }

    #[test]
    fn collection_name_is_prefixed() {
        assert!(KnowledgeStore::new_collection_name(7).starts_with("kb_7_"));
    }

    #[test]
    fn chunk_bounds_are_enforced() {
        let store = store();
        assert!(store.create(1, "k", None, 1, "kb_a", 50, 0).is_err());
        assert!(store.create(1, "k", None, 1, "kb_b", 2500, 0).is_err());
        assert!(store.create(1, "k", None, 1, "kb_c", 500, 501).is_err());
        assert!(store.create(1, "k", None, 1, "kb_d", 200, 200).is_err());
        assert!(store.create(1, "k", None, 1, "kb_e", 100, 0).is_ok());
        assert!(store.create(1, "k", None, 1, "kb_f", 2000, 500).is_ok());
    }

    #[test]
    fn ownership_gate() {
        let store = store();
        let kb = create(&store, 1, "mine");
        assert!(store.get_owned(kb.id, 1, false).is_ok());
        assert!(matches!(
            store.get_owned(kb.id, 2, false).unwrap_err(),
            StoreError::Forbidden(_)
        ));
        // admins bypass
        assert!(store.get_owned(kb.id, 2, true).is_ok());
    }

    #[test]
    fn active_ids_filters_disabled() {
        let store = store();
        let a = create(&store, 1, "a");
        let b = create(&store, 1, "b");
        store.update(b.id, None, None, Some(0)).unwrap();
        let active = store.active_ids(&[a.id, b.id, 999]).unwrap();
        assert_eq!(active, vec![a.id]);
    }
}
