use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Open a connection to the given database path, creating parent
/// directories on first boot. WAL keeps the per-domain managers from
/// blocking each other on reads.
pub fn open(path: &str) -> Result<Connection> {
    if path != ":memory:" {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Initialise every table and index.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id                   INTEGER PRIMARY KEY AUTOINCREMENT,
            username             TEXT NOT NULL UNIQUE,
            email                TEXT NOT NULL UNIQUE,
            password_hash        TEXT NOT NULL,
            role                 TEXT NOT NULL DEFAULT 'user',
            status               INTEGER NOT NULL DEFAULT 1,
            password_changed_at  TEXT,
            created_at           TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS llms (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL,
            model_type  TEXT NOT NULL,
            provider    TEXT NOT NULL,
            model_name  TEXT NOT NULL,
            base_url    TEXT,
            api_version TEXT,
            status      INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS api_keys (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            llm_id            INTEGER NOT NULL,
            alias             TEXT NOT NULL,
            api_key_encrypted TEXT NOT NULL,
            status            INTEGER NOT NULL DEFAULT 1,
            created_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_api_keys_llm ON api_keys(llm_id, status);

        CREATE TABLE IF NOT EXISTS knowledges (
            id                     INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id                INTEGER NOT NULL,
            name                   TEXT NOT NULL,
            description            TEXT,
            embed_llm_id           INTEGER NOT NULL,
            vector_collection_name TEXT NOT NULL UNIQUE,
            chunk_size             INTEGER NOT NULL,
            chunk_overlap          INTEGER NOT NULL,
            document_count         INTEGER NOT NULL DEFAULT 0,
            total_chunks           INTEGER NOT NULL DEFAULT 0,
            status                 INTEGER NOT NULL DEFAULT 1,
            created_at             TEXT NOT NULL,
            updated_at             TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_knowledges_user ON knowledges(user_id);

        CREATE TABLE IF NOT EXISTS documents (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            knowledge_id   INTEGER NOT NULL,
            file_name      TEXT NOT NULL,
            file_extension TEXT NOT NULL,
            file_path      TEXT NOT NULL,
            file_size      INTEGER NOT NULL,
            mime_type      TEXT NOT NULL,
            status         TEXT NOT NULL DEFAULT 'uploading',
            chunk_count    INTEGER NOT NULL DEFAULT 0,
            error_msg      TEXT,
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_documents_knowledge
            ON documents(knowledge_id, status);

        CREATE TABLE IF NOT EXISTS robots (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id       INTEGER NOT NULL,
            name          TEXT NOT NULL,
            description   TEXT,
            chat_llm_id   INTEGER NOT NULL,
            rerank_llm_id INTEGER,
            enable_rerank INTEGER NOT NULL DEFAULT 0,
            top_k         INTEGER NOT NULL DEFAULT 5,
            temperature   REAL NOT NULL DEFAULT 0.7,
            max_tokens    INTEGER NOT NULL DEFAULT 2000,
            system_prompt TEXT NOT NULL DEFAULT '',
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_robots_user ON robots(user_id);

        CREATE TABLE IF NOT EXISTS robot_knowledge (
            robot_id     INTEGER NOT NULL,
            knowledge_id INTEGER NOT NULL,
            UNIQUE(robot_id, knowledge_id)
        );

        CREATE TABLE IF NOT EXISTS sessions (
            session_id      TEXT PRIMARY KEY,
            user_id         INTEGER NOT NULL,
            robot_id        INTEGER NOT NULL,
            title           TEXT NOT NULL,
            summary         TEXT,
            message_count   INTEGER NOT NULL DEFAULT 0,
            status          TEXT NOT NULL DEFAULT 'active',
            is_pinned       INTEGER NOT NULL DEFAULT 0,
            last_message_at TEXT,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON sessions(user_id, status, is_pinned DESC, last_message_at DESC);

        CREATE TABLE IF NOT EXISTS chat_history (
            message_id         TEXT PRIMARY KEY,
            session_id         TEXT NOT NULL,
            sequence           INTEGER NOT NULL,
            role               TEXT NOT NULL,
            content            TEXT NOT NULL,
            retrieved_contexts TEXT,
            referenced_doc_ids TEXT,
            prompt_tokens      INTEGER NOT NULL DEFAULT 0,
            completion_tokens  INTEGER NOT NULL DEFAULT 0,
            total_tokens       INTEGER NOT NULL DEFAULT 0,
            feedback           INTEGER,
            feedback_comment   TEXT,
            retrieval_time_ms  INTEGER NOT NULL DEFAULT 0,
            generation_time_ms INTEGER NOT NULL DEFAULT 0,
            total_time_ms      INTEGER NOT NULL DEFAULT 0,
            created_at         TEXT NOT NULL,
            UNIQUE(session_id, sequence)
        );
        CREATE INDEX IF NOT EXISTS idx_chat_history_session
            ON chat_history(session_id, sequence);",
    )?;
    Ok(())
}

/// Idempotently seed the default admin, the default local embedding LLM and
/// a default knowledge base bound to it.
pub fn seed_defaults(conn: &Connection, admin_password: &str) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();

    let users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
    if users == 0 {
        let hash = crate::users::hash_password(admin_password)?;
        conn.execute(
            "INSERT INTO users (username, email, password_hash, role, status, created_at)
             VALUES ('admin', 'admin@example.com', ?1, 'admin', 1, ?2)",
            rusqlite::params![hash, now],
        )?;
        info!("seeded default admin user");
    }

    let llms: i64 = conn.query_row(
        "SELECT COUNT(*) FROM llms WHERE model_type = 'embedding'",
        [],
        |r| r.get(0),
    )?;
    if llms == 0 {
        conn.execute(
            "INSERT INTO llms (name, model_type, provider, model_name, base_url, status, created_at)
             VALUES ('local-embedding', 'embedding', 'local', 'qwen3-embedding-0.6b', NULL, 1, ?1)",
            rusqlite::params![now],
        )?;
        info!("seeded default local embedding LLM");
    }

    let kbs: i64 = conn.query_row("SELECT COUNT(*) FROM knowledges", [], |r| r.get(0))?;
    if kbs == 0 {
        let admin_id: i64 =
            conn.query_row("SELECT id FROM users WHERE username = 'admin'", [], |r| {
                r.get(0)
            })?;
        let embed_id: i64 = conn.query_row(
            "SELECT id FROM llms WHERE model_type = 'embedding' ORDER BY id LIMIT 1",
            [],
            |r| r.get(0),
        )?;
        let collection = format!("kb_{}_{}", admin_id, chrono::Utc::now().timestamp_millis());
        conn.execute(
            "INSERT INTO knowledges (user_id, name, description, embed_llm_id,
                vector_collection_name, chunk_size, chunk_overlap, status,
                created_at, updated_at)
             VALUES (?1, 'default', 'Default knowledge base', ?2, ?3, 500, 50, 1, ?4, ?4)",
            rusqlite::params![admin_id, embed_id, collection, now],
        )?;
        info!("seeded default knowledge base");
    }

    Ok(())
}

#[cfg(test)]
pub(crate) fn test_conn() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    init_db(&conn).expect("init schema");
    conn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_and_seed_are_idempotent() {
        let conn = test_conn();
        init_db(&conn).unwrap();
        seed_defaults(&conn, "Admin@123").unwrap();
        seed_defaults(&conn, "Admin@123").unwrap();

        let users: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap();
        assert_eq!(users, 1);
        let kbs: i64 = conn
            .query_row("SELECT COUNT(*) FROM knowledges", [], |r| r.get(0))
            .unwrap();
        assert_eq!(kbs, 1);
    }
}
