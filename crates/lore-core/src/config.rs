use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const API_PREFIX: &str = "/api/v1";

/// Maximum payload accepted by the message bus (10 MiB, matching the
/// broker-side cap the pipeline was sized for).
pub const MAX_BUS_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// Top-level config (lore.toml + LORE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoreConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origins. Empty means same-origin only.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Retained for operators sizing a server-SQL deployment; the embedded
    /// store runs on a single writer connection regardless.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_max_overflow")]
    pub max_overflow: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: default_pool_size(),
            max_overflow: default_max_overflow(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// HS256 signing key, at least 32 bytes.
    pub jwt_secret: String,
    #[serde(default = "default_jwt_expire_hours")]
    pub jwt_expire_hours: i64,
    /// AES-256-GCM key for API keys at rest, exactly 32 bytes.
    pub aead_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: String,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            max_file_size: default_max_file_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_es_host")]
    pub es_host: String,
    #[serde(default = "default_es_index")]
    pub es_index: String,
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            es_host: default_es_host(),
            es_index: default_es_index(),
            qdrant_url: default_qdrant_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Directory holding config.json / model.safetensors / tokenizer.json.
    /// `None` runs the deterministic stub backend (tests, dev boxes).
    pub model_path: Option<String>,
    /// Cross-encoder directory for local rerank; `None` = lexical stub.
    pub rerank_model_path: Option<String>,
    #[serde(default = "default_embedding_dim")]
    pub dim: usize,
    #[serde(default = "default_embedding_batch")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            rerank_model_path: None,
            dim: default_embedding_dim(),
            batch_size: default_embedding_batch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub default_chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: default_chunk_size(),
            default_chunk_overlap: default_chunk_overlap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Rolling context TTL in seconds.
    #[serde(default = "default_context_ttl")]
    pub context_ttl: u64,
    /// Active-session set TTL in seconds.
    #[serde(default = "default_active_ttl")]
    pub active_ttl: u64,
    #[serde(default = "default_max_turns")]
    pub max_context_turns: usize,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// Days of inactivity before a session is archived.
    #[serde(default = "default_archive_days")]
    pub archive_days: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            context_ttl: default_context_ttl(),
            active_ttl: default_active_ttl(),
            max_context_turns: default_max_turns(),
            max_context_tokens: default_max_context_tokens(),
            archive_days: default_archive_days(),
        }
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_db_path() -> String {
    "./data/lore.db".to_string()
}
fn default_pool_size() -> u32 {
    10
}
fn default_max_overflow() -> u32 {
    20
}
fn default_jwt_expire_hours() -> i64 {
    24
}
fn default_storage_root() -> String {
    "./data/files".to_string()
}
fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}
fn default_es_host() -> String {
    "http://localhost:9200".to_string()
}
fn default_es_index() -> String {
    "lore_document_chunks".to_string()
}
fn default_qdrant_url() -> String {
    "http://localhost:6334".to_string()
}
fn default_embedding_dim() -> usize {
    1024
}
fn default_embedding_batch() -> usize {
    32
}
fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_context_ttl() -> u64 {
    7200
}
fn default_active_ttl() -> u64 {
    86400
}
fn default_max_turns() -> usize {
    10
}
fn default_max_context_tokens() -> usize {
    4000
}
fn default_archive_days() -> i64 {
    7
}

impl LoreConfig {
    /// Load config from a TOML file with LORE_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("lore.toml");

        let config: LoreConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("LORE_").split("__"))
            .extract()
            .map_err(|e| crate::error::LoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Key-length checks the rest of the system relies on.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.security.jwt_secret.len() < 32 {
            return Err(crate::error::LoreError::Config(
                "security.jwt_secret must be at least 32 bytes".to_string(),
            ));
        }
        if self.security.aead_key.len() != 32 {
            return Err(crate::error::LoreError::Config(
                "security.aead_key must be exactly 32 bytes".to_string(),
            ));
        }
        if self.chunking.default_chunk_overlap >= self.chunking.default_chunk_size {
            return Err(crate::error::LoreError::Config(
                "chunking overlap must be smaller than chunk size".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_keys(jwt: &str, aead: &str) -> LoreConfig {
        LoreConfig {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            security: SecurityConfig {
                jwt_secret: jwt.to_string(),
                jwt_expire_hours: 24,
                aead_key: aead.to_string(),
            },
            storage: StorageConfig::default(),
            search: SearchConfig::default(),
            embedding: EmbeddingConfig::default(),
            chunking: ChunkingConfig::default(),
            session: SessionConfig::default(),
        }
    }

    #[test]
    fn validate_accepts_proper_key_lengths() {
        let cfg = config_with_keys(
            "0123456789abcdef0123456789abcdef",
            "0123456789abcdef0123456789abcdef",
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_short_jwt_secret() {
        let cfg = config_with_keys("too-short", "0123456789abcdef0123456789abcdef");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_wrong_aead_length() {
        let cfg = config_with_keys("0123456789abcdef0123456789abcdef", "short");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn defaults_match_documented_knobs() {
        let session = SessionConfig::default();
        assert_eq!(session.context_ttl, 7200);
        assert_eq!(session.active_ttl, 86400);
        assert_eq!(session.max_context_turns, 10);
        assert_eq!(session.archive_days, 7);

        let chunking = ChunkingConfig::default();
        assert_eq!(chunking.default_chunk_size, 500);
        assert_eq!(chunking.default_chunk_overlap, 50);
    }
}
