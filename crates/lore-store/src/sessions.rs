use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::types::{ChatMessageRow, MessageUsage, Session, TimeMetrics};

const TITLE_MAX_CHARS: usize = 50;

/// Manager for sessions and their chat history. The relational store is
/// authoritative; the cache window is rebuilt from here after restarts.
pub struct SessionStore {
    db: Mutex<Connection>,
}

impl SessionStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    #[instrument(skip(self))]
    pub fn create(&self, user_id: i64, robot_id: i64, title: Option<&str>) -> Result<Session> {
        let session_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now();
        let title = title
            .map(str::to_string)
            .unwrap_or_else(|| format!("New chat - {}", now.format("%m/%d %H:%M")));

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO sessions (session_id, user_id, robot_id, title, status,
                message_count, is_pinned, created_at)
             VALUES (?1, ?2, ?3, ?4, 'active', 0, 0, ?5)",
            rusqlite::params![session_id, user_id, robot_id, title, now.to_rfc3339()],
        )?;
        info!(%session_id, user_id, robot_id, "created session");
        Self::get_with(&db, &session_id)
    }

    pub fn get(&self, session_id: &str) -> Result<Session> {
        let db = self.db.lock().unwrap();
        Self::get_with(&db, session_id)
    }

    /// Owner-scoped fetch that hides soft-deleted sessions.
    #[instrument(skip(self))]
    pub fn get_owned(&self, session_id: &str, user_id: i64) -> Result<Session> {
        let session = self.get(session_id)?;
        if session.status == "deleted" {
            return Err(StoreError::NotFound {
                entity: "session",
                id: session_id.to_string(),
            });
        }
        if session.user_id != user_id {
            return Err(StoreError::NotFound {
                // ownership leaks nothing: foreign sessions look absent
                entity: "session",
                id: session_id.to_string(),
            });
        }
        Ok(session)
    }

    fn get_with(db: &Connection, session_id: &str) -> Result<Session> {
        db.query_row(
            "SELECT session_id, user_id, robot_id, title, summary, message_count,
                    status, is_pinned, last_message_at, created_at
             FROM sessions WHERE session_id = ?1",
            rusqlite::params![session_id],
            row_to_session,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                entity: "session",
                id: session_id.to_string(),
            },
            other => StoreError::Database(other),
        })
    }

    /// Paged listing: pinned first, then most recent activity.
    #[instrument(skip(self))]
    pub fn list(
        &self,
        user_id: i64,
        robot_id: Option<i64>,
        status: &str,
        skip: usize,
        limit: usize,
    ) -> Result<(i64, Vec<Session>)> {
        let db = self.db.lock().unwrap();
        let (total, rows) = match robot_id {
            Some(rid) => {
                let total: i64 = db.query_row(
                    "SELECT COUNT(*) FROM sessions
                     WHERE user_id = ?1 AND status = ?2 AND robot_id = ?3",
                    rusqlite::params![user_id, status, rid],
                    |r| r.get(0),
                )?;
                let mut stmt = db.prepare(
                    "SELECT session_id, user_id, robot_id, title, summary, message_count,
                            status, is_pinned, last_message_at, created_at
                     FROM sessions
                     WHERE user_id = ?1 AND status = ?2 AND robot_id = ?3
                     ORDER BY is_pinned DESC, last_message_at DESC
                     LIMIT ?4 OFFSET ?5",
                )?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![user_id, status, rid, limit as i64, skip as i64],
                        row_to_session,
                    )?
                    .filter_map(|r| r.ok())
                    .collect();
                (total, rows)
            }
            None => {
                let total: i64 = db.query_row(
                    "SELECT COUNT(*) FROM sessions WHERE user_id = ?1 AND status = ?2",
                    rusqlite::params![user_id, status],
                    |r| r.get(0),
                )?;
                let mut stmt = db.prepare(
                    "SELECT session_id, user_id, robot_id, title, summary, message_count,
                            status, is_pinned, last_message_at, created_at
                     FROM sessions
                     WHERE user_id = ?1 AND status = ?2
                     ORDER BY is_pinned DESC, last_message_at DESC
                     LIMIT ?3 OFFSET ?4",
                )?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![user_id, status, limit as i64, skip as i64],
                        row_to_session,
                    )?
                    .filter_map(|r| r.ok())
                    .collect();
                (total, rows)
            }
        };
        Ok((total, rows))
    }

    #[instrument(skip(self))]
    pub fn update(
        &self,
        session_id: &str,
        user_id: i64,
        title: Option<&str>,
        is_pinned: Option<bool>,
        status: Option<&str>,
    ) -> Result<Session> {
        self.get_owned(session_id, user_id)?;
        let db = self.db.lock().unwrap();
        if let Some(title) = title {
            db.execute(
                "UPDATE sessions SET title = ?1 WHERE session_id = ?2",
                rusqlite::params![title, session_id],
            )?;
        }
        if let Some(pinned) = is_pinned {
            db.execute(
                "UPDATE sessions SET is_pinned = ?1 WHERE session_id = ?2",
                rusqlite::params![pinned as i64, session_id],
            )?;
        }
        if let Some(status) = status {
            if !matches!(status, "active" | "archived") {
                return Err(StoreError::Validation(format!(
                    "status must be active or archived, got {}",
                    status
                )));
            }
            db.execute(
                "UPDATE sessions SET status = ?1 WHERE session_id = ?2",
                rusqlite::params![status, session_id],
            )?;
        }
        Self::get_with(&db, session_id)
    }

    /// Soft delete; the row stays for history audits.
    #[instrument(skip(self))]
    pub fn soft_delete(&self, session_id: &str, user_id: i64) -> Result<()> {
        self.get_owned(session_id, user_id)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET status = 'deleted' WHERE session_id = ?1",
            rusqlite::params![session_id],
        )?;
        info!(%session_id, "session soft-deleted");
        Ok(())
    }

    /// Append a message with a dense per-session sequence. The count, the
    /// insert and the session bookkeeping run in one transaction so the
    /// `{1..message_count}` invariant survives concurrent writers.
    #[instrument(skip(self, content, contexts))]
    pub fn save_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        contexts: Option<&serde_json::Value>,
        usage: Option<MessageUsage>,
        time_metrics: Option<TimeMetrics>,
    ) -> Result<ChatMessageRow> {
        let now = chrono::Utc::now().to_rfc3339();
        let message_id = Uuid::new_v4().to_string();

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM chat_history WHERE session_id = ?1",
            rusqlite::params![session_id],
            |r| r.get(0),
        )?;
        let sequence = count + 1;

        let contexts_json = contexts.map(|c| c.to_string());
        let referenced_doc_ids = contexts.and_then(|c| {
            let ids: Vec<i64> = c
                .as_array()?
                .iter()
                .filter_map(|ctx| ctx.get("document_id").and_then(|d| d.as_i64()))
                .collect();
            serde_json::to_string(&ids).ok()
        });
        let usage = usage.unwrap_or_default();
        let metrics = time_metrics.unwrap_or_default();

        tx.execute(
            "INSERT INTO chat_history (message_id, session_id, sequence, role, content,
                retrieved_contexts, referenced_doc_ids, prompt_tokens, completion_tokens,
                total_tokens, retrieval_time_ms, generation_time_ms, total_time_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            rusqlite::params![
                message_id,
                session_id,
                sequence,
                role,
                content,
                contexts_json,
                referenced_doc_ids,
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens,
                metrics.retrieval_time_ms,
                metrics.generation_time_ms,
                metrics.total_time_ms,
                now
            ],
        )?;

        tx.execute(
            "UPDATE sessions SET message_count = ?1, last_message_at = ?2 WHERE session_id = ?3",
            rusqlite::params![sequence, now, session_id],
        )?;

        // First user message names the session.
        if role == "user" && count == 0 {
            let title = synthesize_title(content);
            tx.execute(
                "UPDATE sessions SET title = ?1 WHERE session_id = ?2",
                rusqlite::params![title, session_id],
            )?;
        }

        tx.commit()?;
        debug!(%session_id, sequence, role, "chat message saved");

        let db = &*db;
        db.query_row(
            "SELECT message_id, session_id, sequence, role, content, retrieved_contexts,
                    prompt_tokens, completion_tokens, total_tokens, feedback,
                    feedback_comment, retrieval_time_ms, generation_time_ms, total_time_ms,
                    created_at
             FROM chat_history WHERE message_id = ?1",
            rusqlite::params![message_id],
            row_to_message,
        )
        .map_err(StoreError::Database)
    }

    /// Ordered history, oldest first, up to `limit`.
    pub fn messages(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessageRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT message_id, session_id, sequence, role, content, retrieved_contexts,
                    prompt_tokens, completion_tokens, total_tokens, feedback,
                    feedback_comment, retrieval_time_ms, generation_time_ms, total_time_ms,
                    created_at
             FROM chat_history WHERE session_id = ?1 ORDER BY sequence ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_id, limit as i64], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Last `max` messages in chronological order, for rebuilding the cache
    /// window after eviction or restart.
    pub fn recent_messages(&self, session_id: &str, max: usize) -> Result<Vec<ChatMessageRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT message_id, session_id, sequence, role, content, retrieved_contexts,
                    prompt_tokens, completion_tokens, total_tokens, feedback,
                    feedback_comment, retrieval_time_ms, generation_time_ms, total_time_ms,
                    created_at
             FROM (SELECT * FROM chat_history WHERE session_id = ?1
                   ORDER BY sequence DESC LIMIT ?2)
             ORDER BY sequence ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_id, max as i64], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Owner-gated feedback write: 404 for unknown messages, 403 when the
    /// session belongs to someone else.
    #[instrument(skip(self, comment))]
    pub fn update_feedback(
        &self,
        user_id: i64,
        message_id: &str,
        feedback: i64,
        comment: Option<&str>,
    ) -> Result<()> {
        if !(-1..=1).contains(&feedback) {
            return Err(StoreError::Validation(
                "feedback must be -1, 0 or 1".to_string(),
            ));
        }
        let db = self.db.lock().unwrap();
        let session_id: String = db
            .query_row(
                "SELECT session_id FROM chat_history WHERE message_id = ?1",
                rusqlite::params![message_id],
                |r| r.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                    entity: "message",
                    id: message_id.to_string(),
                },
                other => StoreError::Database(other),
            })?;

        let owner: i64 = db.query_row(
            "SELECT user_id FROM sessions WHERE session_id = ?1",
            rusqlite::params![session_id],
            |r| r.get(0),
        )?;
        if owner != user_id {
            return Err(StoreError::Forbidden(
                "no access to this message".to_string(),
            ));
        }

        db.execute(
            "UPDATE chat_history SET feedback = ?1, feedback_comment = ?2 WHERE message_id = ?3",
            rusqlite::params![feedback, comment, message_id],
        )?;
        Ok(())
    }

    /// Archive active sessions whose last activity is older than
    /// `archive_days`. Returns the flipped session ids so the caller can
    /// clear their cache windows.
    #[instrument(skip(self))]
    pub fn archive_older_than(&self, archive_days: i64) -> Result<Vec<String>> {
        let threshold = (chrono::Utc::now() - chrono::Duration::days(archive_days)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT session_id FROM sessions
             WHERE status = 'active' AND last_message_at IS NOT NULL AND last_message_at < ?1",
        )?;
        let ids: Vec<String> = stmt
            .query_map(rusqlite::params![threshold], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();

        for id in &ids {
            db.execute(
                "UPDATE sessions SET status = 'archived' WHERE session_id = ?1",
                rusqlite::params![id],
            )?;
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "archived inactive sessions");
        }
        Ok(ids)
    }
}

fn synthesize_title(content: &str) -> String {
    let chars: Vec<char> = content.chars().collect();
    if chars.len() > TITLE_MAX_CHARS {
        let head: String = chars[..TITLE_MAX_CHARS].iter().collect();
        format!("{}...", head)
    } else {
        content.to_string()
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get(0)?,
        user_id: row.get(1)?,
        robot_id: row.get(2)?,
        title: row.get(3)?,
        summary: row.get(4)?,
        message_count: row.get(5)?,
        status: row.get(6)?,
        is_pinned: row.get::<_, i64>(7)? != 0,
        last_message_at: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessageRow> {
    let contexts: Option<String> = row.get(5)?;
    Ok(ChatMessageRow {
        message_id: row.get(0)?,
        session_id: row.get(1)?,
        sequence: row.get(2)?,
        role: row.get(3)?,
        content: row.get(4)?,
        retrieved_contexts: contexts.and_then(|c| serde_json::from_str(&c).ok()),
        prompt_tokens: row.get(6)?,
        completion_tokens: row.get(7)?,
        total_tokens: row.get(8)?,
        feedback: row.get(9)?,
        feedback_comment: row.get(10)?,
        retrieval_time_ms: row.get(11)?,
        generation_time_ms: row.get(12)?,
        total_time_ms: row.get(13)?,
        created_at: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    fn store() -> SessionStore {
        SessionStore::new(test_conn())
    }

    #[test]
    fn sequence_is_dense_and_ascending() {
        let store = store();
        let session = store.create(1, 1, None).unwrap();
        let sid = &session.session_id;

        store.save_message(sid, "user", "q1", None, None, None).unwrap();
        store.save_message(sid, "assistant", "a1", None, None, None).unwrap();
        store.save_message(sid, "user", "q2", None, None, None).unwrap();

        let msgs = store.messages(sid, 50).unwrap();
        let seqs: Vec<i64> = msgs.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let refreshed = store.get(sid).unwrap();
        assert_eq!(refreshed.message_count, 3);
        assert!(refreshed.last_message_at.is_some());
    }

    #[test]
    fn first_user_message_sets_title() {
        let store = store();
        let session = store.create(1, 1, None).unwrap();
        store
            .save_message(&session.session_id, "user", "say hi", None, None, None)
            .unwrap();
        assert_eq!(store.get(&session.session_id).unwrap().title, "say hi");
    }

    #[test]
    fn long_titles_are_truncated_with_ellipsis() {
        let store = store();
        let session = store.create(1, 1, None).unwrap();
        let long = "x".repeat(80);
        store
            .save_message(&session.session_id, "user", &long, None, None, None)
            .unwrap();
        let title = store.get(&session.session_id).unwrap().title;
        assert_eq!(title.chars().count(), 53);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn assistant_contexts_round_trip() {
        let store = store();
        let session = store.create(1, 1, None).unwrap();
        let contexts = serde_json::json!([
            {"chunk_id": "5_0", "document_id": 5, "score": 0.8, "content": "text"}
        ]);
        let row = store
            .save_message(
                &session.session_id,
                "assistant",
                "answer",
                Some(&contexts),
                Some(MessageUsage {
                    prompt_tokens: 10,
                    completion_tokens: 4,
                    total_tokens: 14,
                }),
                None,
            )
            .unwrap();
        assert_eq!(row.total_tokens, 14);
        let stored = row.retrieved_contexts.unwrap();
        assert_eq!(stored[0]["chunk_id"], "5_0");
    }

    #[test]
    fn feedback_is_owner_gated() {
        let store = store();
        let session = store.create(1, 1, None).unwrap();
        let row = store
            .save_message(&session.session_id, "assistant", "a", None, None, None)
            .unwrap();

        assert!(store.update_feedback(1, &row.message_id, 1, Some("good")).is_ok());
        assert!(matches!(
            store.update_feedback(2, &row.message_id, -1, None).unwrap_err(),
            StoreError::Forbidden(_)
        ));
        assert!(matches!(
            store.update_feedback(1, "missing", 1, None).unwrap_err(),
            StoreError::NotFound { .. }
        ));
        assert!(store.update_feedback(1, &row.message_id, 5, None).is_err());
    }

    #[test]
    fn soft_delete_hides_session() {
        let store = store();
        let session = store.create(1, 1, None).unwrap();
        store.soft_delete(&session.session_id, 1).unwrap();
        assert!(store.get_owned(&session.session_id, 1).is_err());
        // raw get still sees the row
        assert_eq!(store.get(&session.session_id).unwrap().status, "deleted");
    }

    #[test]
    fn archive_flips_stale_sessions_only() {
        let store = store();
        let stale = store.create(1, 1, None).unwrap();
        let fresh = store.create(1, 1, None).unwrap();
        store
            .save_message(&fresh.session_id, "user", "hi", None, None, None)
            .unwrap();

        // Backdate the stale session's activity.
        {
            let db = store.db.lock().unwrap();
            let old = (chrono::Utc::now() - chrono::Duration::days(30)).to_rfc3339();
            db.execute(
                "UPDATE sessions SET last_message_at = ?1 WHERE session_id = ?2",
                rusqlite::params![old, stale.session_id],
            )
            .unwrap();
        }

        let flipped = store.archive_older_than(7).unwrap();
        assert_eq!(flipped, vec![stale.session_id.clone()]);
        assert_eq!(store.get(&stale.session_id).unwrap().status, "archived");
        assert_eq!(store.get(&fresh.session_id).unwrap().status, "active");
    }

    #[test]
    fn recent_messages_keeps_chronological_tail() {
        let store = store();
        let session = store.create(1, 1, None).unwrap();
        for i in 0..6 {
            store
                .save_message(&session.session_id, "user", &format!("m{}", i), None, None, None)
                .unwrap();
        }
        let tail = store.recent_messages(&session.session_id, 4).unwrap();
        let contents: Vec<&str> = tail.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4", "m5"]);
    }
}
