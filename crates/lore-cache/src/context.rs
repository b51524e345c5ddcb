use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::store::CacheStore;

const LOCK_TTL: Duration = Duration::from_secs(30);

fn context_key(session_id: &str) -> String {
    format!("rag:session:{}:context", session_id)
}
fn messages_key(session_id: &str) -> String {
    format!("rag:session:{}:messages", session_id)
}
fn lock_key(session_id: &str) -> String {
    format!("rag:session:{}:lock", session_id)
}
fn active_key(user_id: i64) -> String {
    format!("rag:user:{}:active_sessions", user_id)
}

/// Metadata hash kept alongside the rolling message window.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub user_id: i64,
    pub robot_id: i64,
    pub turn_count: usize,
    pub system_prompt: String,
    pub total_tokens: i64,
    pub last_active: String,
}

/// One message in the rolling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub tokens: i64,
    #[serde(default)]
    pub timestamp: String,
}

/// Bounded rolling dialogue window per session. The cache is authoritative
/// for the hot path; the relational history is authoritative across
/// restarts and is loaded back in on a miss.
pub struct ContextManager {
    cache: Arc<CacheStore>,
    max_turns: usize,
    context_ttl: Duration,
    active_ttl: Duration,
}

impl ContextManager {
    pub fn new(cache: Arc<CacheStore>, max_turns: usize, context_ttl: u64, active_ttl: u64) -> Self {
        Self {
            cache,
            max_turns,
            context_ttl: Duration::from_secs(context_ttl),
            active_ttl: Duration::from_secs(active_ttl),
        }
    }

    pub fn max_messages(&self) -> usize {
        self.max_turns * 2
    }

    /// Create the metadata hash and an empty window, and mark the session
    /// active for its user.
    pub fn init_context(
        &self,
        session_id: &str,
        user_id: i64,
        robot_id: i64,
        system_prompt: &str,
    ) {
        let now = chrono::Utc::now().to_rfc3339();
        self.cache.hset(
            &context_key(session_id),
            &[
                ("user_id", user_id.to_string()),
                ("robot_id", robot_id.to_string()),
                ("turn_count", "0".to_string()),
                ("system_prompt", system_prompt.to_string()),
                ("total_tokens", "0".to_string()),
                ("last_active", now),
            ],
            self.context_ttl,
        );
        self.update_active_session(user_id, session_id);
        info!(%session_id, "initialised session context");
    }

    /// Metadata if cached; refreshes the TTL on hit.
    pub fn get_context(&self, session_id: &str) -> Option<SessionContext> {
        let key = context_key(session_id);
        let map = self.cache.hgetall(&key)?;
        self.cache.expire(&key, self.context_ttl);
        Some(SessionContext {
            user_id: map.get("user_id").and_then(|v| v.parse().ok()).unwrap_or(0),
            robot_id: map.get("robot_id").and_then(|v| v.parse().ok()).unwrap_or(0),
            turn_count: map
                .get("turn_count")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            system_prompt: map.get("system_prompt").cloned().unwrap_or_default(),
            total_tokens: map
                .get("total_tokens")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            last_active: map.get("last_active").cloned().unwrap_or_default(),
        })
    }

    pub fn context_exists(&self, session_id: &str) -> bool {
        self.cache.exists(&context_key(session_id))
    }

    pub fn add_user_message(&self, session_id: &str, content: &str, tokens: i64) {
        self.add_message(session_id, "user", content, tokens);
    }

    pub fn add_assistant_message(&self, session_id: &str, content: &str, tokens: i64) {
        self.add_message(session_id, "assistant", content, tokens);
    }

    /// Head-insert one message; evict the oldest when the window would grow
    /// past `2 * max_turns`; bump turn_count and refresh both TTLs.
    fn add_message(&self, session_id: &str, role: &str, content: &str, tokens: i64) {
        let key = messages_key(session_id);
        let message = ContextMessage {
            role: role.to_string(),
            content: content.to_string(),
            tokens,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let encoded = serde_json::to_string(&message).unwrap_or_default();

        if self.cache.llen(&key) >= self.max_messages() {
            self.cache.rpop(&key);
        }
        self.cache.lpush(&key, encoded, self.context_ttl);

        let turns = (self.cache.llen(&key) + 1) / 2;
        let ctx_key = context_key(session_id);
        self.cache.hset(
            &ctx_key,
            &[
                ("turn_count", turns.min(self.max_turns).to_string()),
                ("last_active", chrono::Utc::now().to_rfc3339()),
            ],
            self.context_ttl,
        );
        debug!(%session_id, role, "added message to context window");
    }

    /// Window contents, oldest first, TTL refreshed.
    pub fn get_context_messages(&self, session_id: &str) -> Vec<ContextMessage> {
        let key = messages_key(session_id);
        let raw = self.cache.lrange_all(&key);
        if raw.is_empty() {
            return Vec::new();
        }
        self.cache.expire(&key, self.context_ttl);

        let mut messages: Vec<ContextMessage> = raw
            .iter()
            .filter_map(|m| serde_json::from_str(m).ok())
            .collect();
        messages.reverse(); // storage is newest-first
        messages
    }

    /// Rebuild the window from relational history (already oldest-first);
    /// only the last `2 * max_turns` messages are kept.
    pub fn load_from_history(&self, session_id: &str, messages: &[ContextMessage]) {
        let key = messages_key(session_id);
        self.cache.delete(&key);
        let keep = messages.len().saturating_sub(self.max_messages());
        for message in &messages[keep..] {
            let encoded = serde_json::to_string(message).unwrap_or_default();
            self.cache.lpush(&key, encoded, self.context_ttl);
        }
        info!(%session_id, loaded = messages.len() - keep, "rebuilt context window from history");
    }

    /// Full prompt assembly: system prompt (when present), history oldest
    /// to newest, then the user turn. With retrieved contexts the user turn
    /// wraps them into a knowledge block ahead of the question.
    pub fn build_llm_messages(
        &self,
        session_id: &str,
        system_prompt: &str,
        question: &str,
        retrieved_contexts: Option<&[String]>,
    ) -> Vec<(String, String)> {
        let mut messages: Vec<(String, String)> = Vec::new();
        if !system_prompt.is_empty() {
            messages.push(("system".to_string(), system_prompt.to_string()));
        }
        for msg in self.get_context_messages(session_id) {
            messages.push((msg.role, msg.content));
        }

        let user_content = match retrieved_contexts.filter(|c| !c.is_empty()) {
            Some(contexts) => format!(
                "## Knowledge:\n{}\n\n## Question:\n{}\nAnswer strictly from the knowledge above; say so when it is not covered.",
                contexts.join("\n\n"),
                question
            ),
            None => question.to_string(),
        };
        messages.push(("user".to_string(), user_content));
        messages
    }

    pub fn clear_context(&self, session_id: &str) {
        self.cache.delete(&context_key(session_id));
        self.cache.delete(&messages_key(session_id));
    }

    // ---- single-writer lock ----

    pub fn acquire_session_lock(&self, session_id: &str) -> bool {
        self.cache.set_nx(&lock_key(session_id), LOCK_TTL)
    }

    pub fn release_session_lock(&self, session_id: &str) {
        self.cache.delete(&lock_key(session_id));
    }

    // ---- active-session set ----

    pub fn update_active_session(&self, user_id: i64, session_id: &str) {
        let score = chrono::Utc::now().timestamp_millis() as f64;
        self.cache
            .zadd(&active_key(user_id), session_id, score, self.active_ttl);
    }

    pub fn remove_active_session(&self, user_id: i64, session_id: &str) {
        self.cache.zrem(&active_key(user_id), session_id);
    }

    pub fn user_active_sessions(&self, user_id: i64, limit: usize) -> Vec<String> {
        self.cache.zrevrange(&active_key(user_id), limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ContextManager {
        ContextManager::new(Arc::new(CacheStore::new()), 10, 7200, 86400)
    }

    #[test]
    fn window_is_capped_at_twice_max_turns() {
        let mgr = ContextManager::new(Arc::new(CacheStore::new()), 2, 7200, 86400);
        mgr.init_context("s", 1, 1, "");
        for i in 0..6 {
            mgr.add_user_message("s", &format!("q{}", i), 0);
        }
        let messages = mgr.get_context_messages("s");
        assert_eq!(messages.len(), 4);
        // oldest messages evicted from the head of history
        assert_eq!(messages[0].content, "q2");
        assert_eq!(messages[3].content, "q5");

        let ctx = mgr.get_context("s").unwrap();
        assert!(ctx.turn_count <= 2);
    }

    #[test]
    fn messages_come_back_oldest_first() {
        let mgr = manager();
        mgr.init_context("s", 1, 1, "prompt");
        mgr.add_user_message("s", "question", 0);
        mgr.add_assistant_message("s", "answer", 0);

        let messages = mgr.get_context_messages("s");
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
    }

    #[test]
    fn lock_is_single_holder() {
        let mgr = manager();
        assert!(mgr.acquire_session_lock("s"));
        assert!(!mgr.acquire_session_lock("s"));
        mgr.release_session_lock("s");
        assert!(mgr.acquire_session_lock("s"));
    }

    #[test]
    fn history_rebuild_keeps_only_the_tail() {
        let mgr = ContextManager::new(Arc::new(CacheStore::new()), 1, 7200, 86400);
        let history: Vec<ContextMessage> = (0..5)
            .map(|i| ContextMessage {
                role: "user".to_string(),
                content: format!("m{}", i),
                tokens: 0,
                timestamp: String::new(),
            })
            .collect();
        mgr.load_from_history("s", &history);
        let messages = mgr.get_context_messages("s");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "m3");
        assert_eq!(messages[1].content, "m4");
    }

    #[test]
    fn active_sessions_rank_by_recency() {
        let mgr = manager();
        mgr.update_active_session(1, "old");
        std::thread::sleep(std::time::Duration::from_millis(5));
        mgr.update_active_session(1, "new");
        assert_eq!(mgr.user_active_sessions(1, 10)[0], "new");

        mgr.remove_active_session(1, "new");
        assert_eq!(mgr.user_active_sessions(1, 10), vec!["old"]);
    }

    #[test]
    fn llm_messages_wrap_contexts_into_the_user_turn() {
        let mgr = manager();
        mgr.init_context("s", 1, 1, "be brief");
        mgr.add_user_message("s", "earlier question", 0);
        mgr.add_assistant_message("s", "earlier answer", 0);

        let contexts = vec!["fact one".to_string(), "fact two".to_string()];
        let messages = mgr.build_llm_messages("s", "be brief", "new question", Some(&contexts));

        assert_eq!(messages[0], ("system".to_string(), "be brief".to_string()));
        assert_eq!(messages[1].0, "user");
        assert_eq!(messages[2].0, "assistant");
        let user_turn = &messages[3].1;
        assert!(user_turn.starts_with("## Knowledge:\nfact one\n\nfact two"));
        assert!(user_turn.contains("## Question:\nnew question"));

        // without contexts the question passes through untouched
        let bare = mgr.build_llm_messages("s", "", "plain", None);
        assert_eq!(bare.last().unwrap().1, "plain");
        assert_eq!(bare[0].0, "user"); // no system prompt emitted
    }

    #[test]
    fn clear_drops_both_keys() {
        let mgr = manager();
        mgr.init_context("s", 1, 1, "");
        mgr.add_user_message("s", "q", 0);
        mgr.clear_context("s");
        assert!(mgr.get_context("s").is_none());
        assert!(mgr.get_context_messages("s").is_empty());
    }
}
