use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{info, instrument};

use crate::error::{Result, StoreError};
use crate::types::Robot;

pub const MAX_TOP_K: i64 = 20;

/// Manager for robots and their knowledge-base bindings.
pub struct RobotStore {
    db: Mutex<Connection>,
}

/// Everything needed to create or replace a robot row.
#[derive(Debug, Clone)]
pub struct RobotSpec {
    pub name: String,
    pub description: Option<String>,
    pub chat_llm_id: i64,
    pub rerank_llm_id: Option<i64>,
    pub enable_rerank: bool,
    pub top_k: i64,
    pub temperature: f64,
    pub max_tokens: i64,
    pub system_prompt: String,
    pub knowledge_ids: Vec<i64>,
}

impl RobotSpec {
    fn validate(&self) -> Result<()> {
        if !(1..=MAX_TOP_K).contains(&self.top_k) {
            return Err(StoreError::Validation(format!(
                "top_k must be in [1, {}]",
                MAX_TOP_K
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(StoreError::Validation(
                "temperature must be in [0, 2]".to_string(),
            ));
        }
        if self.max_tokens <= 0 {
            return Err(StoreError::Validation(
                "max_tokens must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl RobotStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub fn create(&self, user_id: i64, spec: &RobotSpec) -> Result<Robot> {
        spec.validate()?;
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO robots (user_id, name, description, chat_llm_id, rerank_llm_id,
                enable_rerank, top_k, temperature, max_tokens, system_prompt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                user_id,
                spec.name,
                spec.description,
                spec.chat_llm_id,
                spec.rerank_llm_id,
                spec.enable_rerank as i64,
                spec.top_k,
                spec.temperature,
                spec.max_tokens,
                spec.system_prompt,
                now
            ],
        )?;
        let id = db.last_insert_rowid();
        Self::replace_bindings(&db, id, &spec.knowledge_ids)?;
        info!(robot_id = id, "created robot");
        Self::get_with(&db, id)
    }

    pub fn get(&self, id: i64) -> Result<Robot> {
        let db = self.db.lock().unwrap();
        Self::get_with(&db, id)
    }

    #[instrument(skip(self))]
    pub fn get_owned(&self, id: i64, user_id: i64, is_admin: bool) -> Result<Robot> {
        let robot = self.get(id)?;
        if robot.user_id != user_id && !is_admin {
            return Err(StoreError::Forbidden("no access to this robot".to_string()));
        }
        Ok(robot)
    }

    fn get_with(db: &Connection, id: i64) -> Result<Robot> {
        db.query_row(
            "SELECT id, user_id, name, description, chat_llm_id, rerank_llm_id,
                    enable_rerank, top_k, temperature, max_tokens, system_prompt, created_at
             FROM robots WHERE id = ?1",
            rusqlite::params![id],
            row_to_robot,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                entity: "robot",
                id: id.to_string(),
            },
            other => StoreError::Database(other),
        })
    }

    pub fn list_for_user(&self, user_id: i64) -> Result<Vec<Robot>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, name, description, chat_llm_id, rerank_llm_id,
                    enable_rerank, top_k, temperature, max_tokens, system_prompt, created_at
             FROM robots WHERE user_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id], row_to_robot)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Full replace: the incoming values overwrite the row and binding set.
    #[instrument(skip(self, spec))]
    pub fn update(&self, id: i64, spec: &RobotSpec) -> Result<Robot> {
        spec.validate()?;
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE robots SET name = ?1, description = ?2, chat_llm_id = ?3,
                rerank_llm_id = ?4, enable_rerank = ?5, top_k = ?6, temperature = ?7,
                max_tokens = ?8, system_prompt = ?9
             WHERE id = ?10",
            rusqlite::params![
                spec.name,
                spec.description,
                spec.chat_llm_id,
                spec.rerank_llm_id,
                spec.enable_rerank as i64,
                spec.top_k,
                spec.temperature,
                spec.max_tokens,
                spec.system_prompt,
                id
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "robot",
                id: id.to_string(),
            });
        }
        Self::replace_bindings(&db, id, &spec.knowledge_ids)?;
        Self::get_with(&db, id)
    }

    #[instrument(skip(self))]
    pub fn delete(&self, id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM robot_knowledge WHERE robot_id = ?1",
            rusqlite::params![id],
        )?;
        let changed = db.execute("DELETE FROM robots WHERE id = ?1", rusqlite::params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "robot",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn knowledge_ids(&self, robot_id: i64) -> Result<Vec<i64>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT knowledge_id FROM robot_knowledge WHERE robot_id = ?1 ORDER BY knowledge_id",
        )?;
        let rows = stmt.query_map(rusqlite::params![robot_id], |r| r.get(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn replace_bindings(db: &Connection, robot_id: i64, knowledge_ids: &[i64]) -> Result<()> {
        db.execute(
            "DELETE FROM robot_knowledge WHERE robot_id = ?1",
            rusqlite::params![robot_id],
        )?;
        let mut stmt = db.prepare(
            "INSERT OR IGNORE INTO robot_knowledge (robot_id, knowledge_id) VALUES (?1, ?2)",
        )?;
        for kid in knowledge_ids {
            stmt.execute(rusqlite::params![robot_id, kid])?;
        }
        Ok(())
    }
}

fn row_to_robot(row: &rusqlite::Row<'_>) -> rusqlite::Result<Robot> {
    Ok(Robot {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        chat_llm_id: row.get(4)?,
        rerank_llm_id: row.get(5)?,
        enable_rerank: row.get::<_, i64>(6)? != 0,
        top_k: row.get(7)?,
        temperature: row.get(8)?,
        max_tokens: row.get(9)?,
        system_prompt: row.get(10)?,
        created_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    fn spec() -> RobotSpec {
        RobotSpec {
            name: "helper".to_string(),
            description: None,
            chat_llm_id: 1,
            rerank_llm_id: None,
            enable_rerank: false,
            top_k: 5,
            temperature: 0.7,
            max_tokens: 2000,
            system_prompt: "You are helpful.".to_string(),
            knowledge_ids: vec![1, 2],
        }
    }

    #[test]
    fn create_binds_knowledges_uniquely() {
        let store = RobotStore::new(test_conn());
        let mut s = spec();
        s.knowledge_ids = vec![1, 2, 2, 1];
        let robot = store.create(7, &s).unwrap();
        assert_eq!(store.knowledge_ids(robot.id).unwrap(), vec![1, 2]);
    }

    #[test]
    fn update_replaces_binding_set() {
        let store = RobotStore::new(test_conn());
        let robot = store.create(7, &spec()).unwrap();
        let mut s = spec();
        s.knowledge_ids = vec![3];
        s.top_k = 10;
        let updated = store.update(robot.id, &s).unwrap();
        assert_eq!(updated.top_k, 10);
        assert_eq!(store.knowledge_ids(robot.id).unwrap(), vec![3]);
    }

    #[test]
    fn parameter_ranges_are_validated() {
        let store = RobotStore::new(test_conn());
        let mut s = spec();
        s.top_k = 0;
        assert!(store.create(1, &s).is_err());
        s.top_k = 21;
        assert!(store.create(1, &s).is_err());
        s.top_k = 5;
        s.temperature = 2.5;
        assert!(store.create(1, &s).is_err());
    }

    #[test]
    fn owner_gate_applies() {
        let store = RobotStore::new(test_conn());
        let robot = store.create(7, &spec()).unwrap();
        assert!(store.get_owned(robot.id, 7, false).is_ok());
        assert!(store.get_owned(robot.id, 8, false).is_err());
        assert!(store.get_owned(robot.id, 8, true).is_ok());
    }
}
