use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

use lore_bus::Bus;
use lore_cache::{CacheStore, ContextManager};
use lore_core::LoreConfig;
use lore_embed::{CrossEncoder, LocalEmbedder};
use lore_ingest::vectorizer::Vectorizer;
use lore_ingest::workers::Pipeline;
use lore_ingest::FileStorage;
use lore_retrieval::{RecallRunner, Retriever};
use lore_search::{TextIndex, VectorStore};
use lore_store::{
    db, DocumentStore, KeyCrypto, KnowledgeStore, LlmStore, RobotStore, SessionStore, UserStore,
};

use crate::ratelimit::RetrievalTestLimiter;

const DEFAULT_ADMIN_PASSWORD: &str = "Admin@123";

/// Central shared state — passed as Arc<AppState> to all handlers.
pub struct AppState {
    pub config: LoreConfig,
    pub users: Arc<UserStore>,
    pub llms: Arc<LlmStore>,
    pub knowledge: Arc<KnowledgeStore>,
    pub documents: Arc<DocumentStore>,
    pub robots: Arc<RobotStore>,
    pub sessions: Arc<SessionStore>,
    pub cache: Arc<CacheStore>,
    pub context: Arc<ContextManager>,
    pub vectors: Arc<VectorStore>,
    pub index: Arc<TextIndex>,
    pub embedder: Arc<LocalEmbedder>,
    pub storage: FileStorage,
    pub bus: Arc<Bus>,
    pub retriever: Arc<Retriever>,
    pub recall: Arc<RecallRunner>,
    pub retrieval_limiter: RetrievalTestLimiter,
}

impl AppState {
    /// Open every subsystem, seed defaults, probe the inverted index and
    /// spawn the pipeline + recall workers.
    pub async fn bootstrap(config: LoreConfig) -> anyhow::Result<Arc<Self>> {
        // Schema + seeding run once on a dedicated connection.
        {
            let conn = db::open(&config.database.path)?;
            db::init_db(&conn)?;
            db::seed_defaults(&conn, DEFAULT_ADMIN_PASSWORD)?;
        }

        let crypto = KeyCrypto::new(&config.security.aead_key)?;
        let users = Arc::new(UserStore::new(db::open(&config.database.path)?));
        let llms = Arc::new(LlmStore::new(db::open(&config.database.path)?, crypto));
        let knowledge = Arc::new(KnowledgeStore::new(db::open(&config.database.path)?));
        let documents = Arc::new(DocumentStore::new(db::open(&config.database.path)?));
        let robots = Arc::new(RobotStore::new(db::open(&config.database.path)?));
        let sessions = Arc::new(SessionStore::new(db::open(&config.database.path)?));

        let cache = Arc::new(CacheStore::new());
        let context = Arc::new(ContextManager::new(
            cache.clone(),
            config.session.max_context_turns,
            config.session.context_ttl,
            config.session.active_ttl,
        ));

        let vectors = Arc::new(VectorStore::connect(&config.search.qdrant_url)?);
        let index = Arc::new(TextIndex::new(&config.search.es_host, &config.search.es_index));
        if !index.probe_analyzer().await {
            warn!("inverted index running degraded (standard analyzer)");
        }

        let embedder = Arc::new(LocalEmbedder::load(
            config.embedding.model_path.as_deref(),
            config.embedding.dim,
            config.embedding.batch_size,
        )?);
        let reranker = Arc::new(CrossEncoder::load(
            config.embedding.rerank_model_path.as_deref(),
        )?);

        let storage = FileStorage::new(&config.storage.root);
        let bus = Arc::new(Bus::new());

        let retriever = Arc::new(Retriever {
            knowledge: knowledge.clone(),
            llms: llms.clone(),
            vectors: vectors.clone(),
            index: index.clone(),
            embedder: embedder.clone(),
            reranker,
        });

        let vectorizer = Arc::new(Vectorizer {
            documents: documents.clone(),
            knowledge: knowledge.clone(),
            llms: llms.clone(),
            vectors: vectors.clone(),
            index: index.clone(),
            embedder: embedder.clone(),
        });
        let pipeline = Arc::new(Pipeline {
            bus: bus.clone(),
            storage: storage.clone(),
            documents: documents.clone(),
            knowledge: knowledge.clone(),
            vectorizer,
            default_chunk_size: config.chunking.default_chunk_size,
            default_chunk_overlap: config.chunking.default_chunk_overlap,
        });
        pipeline.spawn()?;

        let recall = Arc::new(RecallRunner {
            bus: bus.clone(),
            cache: cache.clone(),
            robots: robots.clone(),
            retriever: retriever.clone(),
        });
        recall.clone().spawn_worker()?;

        info!("all subsystems started");
        Ok(Arc::new(Self {
            config,
            users,
            llms,
            knowledge,
            documents,
            robots,
            sessions,
            cache,
            context,
            vectors,
            index,
            embedder,
            storage,
            bus,
            retriever,
            recall,
            retrieval_limiter: RetrievalTestLimiter::default(),
        }))
    }
}

/// Assemble the full router under `/api/v1`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        // auth
        .route("/auth/register", post(crate::http::auth::register))
        .route("/auth/login", post(crate::http::auth::login))
        .route("/auth/me", get(crate::http::auth::me))
        .route("/auth/refresh", post(crate::http::auth::refresh))
        // users (admin)
        .route("/users", get(crate::http::users::list_users))
        // llms + api keys (admin)
        .route("/llms", get(crate::http::llms::list_llms).post(crate::http::llms::create_llm))
        .route(
            "/llms/{id}",
            axum::routing::put(crate::http::llms::update_llm)
                .delete(crate::http::llms::delete_llm),
        )
        .route(
            "/llms/{id}/apikeys",
            get(crate::http::llms::list_api_keys).post(crate::http::llms::create_api_key),
        )
        .route(
            "/llms/{id}/apikeys/{key_id}",
            axum::routing::delete(crate::http::llms::delete_api_key),
        )
        // knowledge bases
        .route(
            "/knowledge",
            get(crate::http::knowledge::list_knowledge).post(crate::http::knowledge::create_knowledge),
        )
        .route(
            "/knowledge/{id}",
            get(crate::http::knowledge::get_knowledge)
                .put(crate::http::knowledge::update_knowledge)
                .delete(crate::http::knowledge::delete_knowledge),
        )
        // documents
        .route("/documents/upload", post(crate::http::documents::upload))
        .route("/documents", get(crate::http::documents::list_documents))
        .route(
            "/documents/{id}",
            get(crate::http::documents::get_document).delete(crate::http::documents::delete_document),
        )
        .route("/documents/{id}/retry", post(crate::http::documents::retry_document))
        .route("/documents/{id}/preview", get(crate::http::documents::preview))
        .route("/documents/{id}/thumb", get(crate::http::documents::thumbnail))
        // robots
        .route(
            "/robots",
            get(crate::http::robots::list_robots).post(crate::http::robots::create_robot),
        )
        .route(
            "/robots/{id}",
            get(crate::http::robots::get_robot)
                .put(crate::http::robots::update_robot)
                .delete(crate::http::robots::delete_robot),
        )
        .route(
            "/robots/{id}/retrieval-test",
            post(crate::http::robots::retrieval_test),
        )
        // chat
        .route("/chat/ask", post(crate::http::chat::ask))
        .route("/chat/ask/stream", post(crate::http::chat::ask_stream))
        .route("/chat/test", post(crate::http::chat::knowledge_test))
        .route("/chat/history/{session_id}", get(crate::http::sessions::history))
        .route(
            "/chat/sessions",
            get(crate::http::sessions::list_sessions).post(crate::http::sessions::create_session),
        )
        .route(
            "/chat/sessions/{session_id}",
            get(crate::http::sessions::get_session)
                .put(crate::http::sessions::update_session)
                .delete(crate::http::sessions::delete_session),
        )
        .route("/chat/feedback", post(crate::http::sessions::feedback))
        // recall evaluation
        .route("/recall/test", post(crate::http::recall::start_test))
        .route("/recall/status/{task_id}", get(crate::http::recall::status))
        // liveness
        .route("/health", get(crate::http::health::health))
        .route("/health/es", get(crate::http::health::health_es));

    let cors = if state.config.server.cors_origins.is_empty() {
        CorsLayer::new()
    } else {
        let origins: Vec<_> = state
            .config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    };

    Router::new()
        .nest("/api/v1", api)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors)
}
