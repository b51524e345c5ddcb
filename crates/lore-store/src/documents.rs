use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info, instrument};

use crate::error::{Result, StoreError};
use crate::types::{Document, DocumentStatus};

/// Manager for document rows and the derived knowledge counters.
pub struct DocumentStore {
    db: Mutex<Connection>,
}

impl DocumentStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    #[instrument(skip(self))]
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &self,
        knowledge_id: i64,
        file_name: &str,
        file_extension: &str,
        file_path: &str,
        file_size: i64,
        mime_type: &str,
    ) -> Result<Document> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO documents (knowledge_id, file_name, file_extension, file_path,
                file_size, mime_type, status, chunk_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'uploading', 0, ?7, ?7)",
            rusqlite::params![
                knowledge_id,
                file_name,
                file_extension,
                file_path,
                file_size,
                mime_type,
                now
            ],
        )?;
        let id = db.last_insert_rowid();
        info!(document_id = id, file_name, "registered document");
        Self::get_with(&db, id)
    }

    pub fn get(&self, id: i64) -> Result<Document> {
        let db = self.db.lock().unwrap();
        Self::get_with(&db, id)
    }

    pub fn exists(&self, id: i64) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM documents WHERE id = ?1",
            rusqlite::params![id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    fn get_with(db: &Connection, id: i64) -> Result<Document> {
        db.query_row(
            "SELECT id, knowledge_id, file_name, file_extension, file_path, file_size,
                    mime_type, status, chunk_count, error_msg, created_at, updated_at
             FROM documents WHERE id = ?1",
            rusqlite::params![id],
            row_to_document,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                entity: "document",
                id: id.to_string(),
            },
            other => StoreError::Database(other),
        })
    }

    /// Paged listing with optional filename keyword and status filters.
    #[instrument(skip(self))]
    pub fn list(
        &self,
        knowledge_id: i64,
        keyword: Option<&str>,
        status: Option<&str>,
        skip: usize,
        limit: usize,
    ) -> Result<(i64, Vec<Document>)> {
        let db = self.db.lock().unwrap();

        let mut where_clause = String::from("knowledge_id = ?1");
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(knowledge_id)];
        if let Some(keyword) = keyword {
            params.push(Box::new(format!("%{}%", keyword)));
            where_clause.push_str(&format!(" AND file_name LIKE ?{}", params.len()));
        }
        if let Some(status) = status {
            params.push(Box::new(status.to_string()));
            where_clause.push_str(&format!(" AND status = ?{}", params.len()));
        }

        let total: i64 = db.query_row(
            &format!("SELECT COUNT(*) FROM documents WHERE {}", where_clause),
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            |r| r.get(0),
        )?;

        params.push(Box::new(limit as i64));
        params.push(Box::new(skip as i64));
        let sql = format!(
            "SELECT id, knowledge_id, file_name, file_extension, file_path, file_size,
                    mime_type, status, chunk_count, error_msg, created_at, updated_at
             FROM documents WHERE {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            params.len() - 1,
            params.len()
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            row_to_document,
        )?;
        Ok((total, rows.filter_map(|r| r.ok()).collect()))
    }

    /// Move a document through its lifecycle. `Failed` keeps the error
    /// message; every other transition clears it.
    #[instrument(skip(self))]
    pub fn set_status(
        &self,
        id: i64,
        status: DocumentStatus,
        error_msg: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE documents SET status = ?1, error_msg = ?2, updated_at = ?3 WHERE id = ?4",
            rusqlite::params![status.as_str(), error_msg, now, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "document",
                id: id.to_string(),
            });
        }
        debug!(document_id = id, status = status.as_str(), "document status updated");
        Ok(())
    }

    /// Terminal success: chunk count recorded, error cleared.
    #[instrument(skip(self))]
    pub fn set_completed(&self, id: i64, chunk_count: i64) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE documents
             SET status = 'completed', chunk_count = ?1, error_msg = NULL, updated_at = ?2
             WHERE id = ?3",
            rusqlite::params![chunk_count, now, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "document",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn delete(&self, id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute("DELETE FROM documents WHERE id = ?1", rusqlite::params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "document",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn list_ids_for_knowledge(&self, knowledge_id: i64) -> Result<Vec<i64>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT id FROM documents WHERE knowledge_id = ?1")?;
        let rows = stmt.query_map(rusqlite::params![knowledge_id], |r| r.get(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Recompute the owning KB's document/chunk counters from completed
    /// documents. Called after every terminal pipeline transition and after
    /// deletes, so the counters converge even when stages race.
    #[instrument(skip(self))]
    pub fn recompute_knowledge_counters(&self, knowledge_id: i64) -> Result<(i64, i64)> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let (doc_count, total_chunks): (i64, i64) = db.query_row(
            "SELECT COUNT(*), COALESCE(SUM(chunk_count), 0)
             FROM documents WHERE knowledge_id = ?1 AND status = 'completed'",
            rusqlite::params![knowledge_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        db.execute(
            "UPDATE knowledges SET document_count = ?1, total_chunks = ?2, updated_at = ?3
             WHERE id = ?4",
            rusqlite::params![doc_count, total_chunks, now, knowledge_id],
        )?;
        Ok((doc_count, total_chunks))
    }
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let status_str: String = row.get(7)?;
    Ok(Document {
        id: row.get(0)?,
        knowledge_id: row.get(1)?,
        file_name: row.get(2)?,
        file_extension: row.get(3)?,
        file_path: row.get(4)?,
        file_size: row.get(5)?,
        mime_type: row.get(6)?,
        status: DocumentStatus::parse(&status_str).unwrap_or(DocumentStatus::Failed),
        chunk_count: row.get(8)?,
        error_msg: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    fn store() -> DocumentStore {
        DocumentStore::new(test_conn())
    }

    fn insert(store: &DocumentStore, kb: i64, name: &str) -> Document {
        store
            .insert(kb, name, "txt", "1/20260801/x.txt", 42, "text/plain")
            .unwrap()
    }

    #[test]
    fn lifecycle_transitions() {
        let store = store();
        let doc = insert(&store, 1, "a.txt");
        assert_eq!(doc.status, DocumentStatus::Uploading);

        store.set_status(doc.id, DocumentStatus::Parsing, None).unwrap();
        store.set_status(doc.id, DocumentStatus::Splitting, None).unwrap();
        store.set_status(doc.id, DocumentStatus::Embedding, None).unwrap();
        store.set_completed(doc.id, 3).unwrap();

        let done = store.get(doc.id).unwrap();
        assert_eq!(done.status, DocumentStatus::Completed);
        assert_eq!(done.chunk_count, 3);
        assert!(done.error_msg.is_none());
    }

    #[test]
    fn failure_keeps_error_message() {
        let store = store();
        let doc = insert(&store, 1, "bad.pdf");
        store
            .set_status(doc.id, DocumentStatus::Failed, Some("parse failed: empty"))
            .unwrap();
        let failed = store.get(doc.id).unwrap();
        assert_eq!(failed.status, DocumentStatus::Failed);
        assert_eq!(failed.error_msg.as_deref(), Some("parse failed: empty"));
    }

    #[test]
    fn list_filters_by_keyword_and_status() {
        let store = store();
        let a = insert(&store, 1, "report-2026.pdf");
        insert(&store, 1, "notes.txt");
        store.set_completed(a.id, 1).unwrap();

        let (total, items) = store.list(1, Some("report"), None, 0, 20).unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].file_name, "report-2026.pdf");

        let (total, _) = store.list(1, None, Some("completed"), 0, 20).unwrap();
        assert_eq!(total, 1);

        let (total, _) = store.list(1, None, None, 0, 20).unwrap();
        assert_eq!(total, 2);
    }

    #[test]
    fn counters_track_completed_documents_only() {
        let conn = test_conn();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO knowledges (user_id, name, embed_llm_id, vector_collection_name,
                chunk_size, chunk_overlap, created_at, updated_at)
             VALUES (1, 'k', 1, 'kb_1_1', 500, 50, ?1, ?1)",
            rusqlite::params![now],
        )
        .unwrap();
        let kb_id = conn.last_insert_rowid();
        let store = DocumentStore::new(conn);

        let a = insert(&store, kb_id, "a.txt");
        let b = insert(&store, kb_id, "b.txt");
        store.set_completed(a.id, 4).unwrap();
        store
            .set_status(b.id, DocumentStatus::Failed, Some("boom"))
            .unwrap();

        let (docs, chunks) = store.recompute_knowledge_counters(kb_id).unwrap();
        assert_eq!((docs, chunks), (1, 4));
    }
}
