use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

mod config;
mod database;
mod document;
mod handlers;
mod index;
mod models;
mod services;
mod state;
mod storage;
mod utils;

use config::Settings;
use database::{DbPool, Repository};
use index::{PgChunkIndex, PgMemoryIndex, PgTurnIndex};
use services::conversation::PostTurnTasks;
use services::document_service::MAX_UPLOAD_BYTES;
use services::{
    build_reranker, ChatModel, ChatOrchestrator, Compactor, DocumentService, EmbeddingProvider,
    EmbeddingService, Enricher, HybridSearchService, Indexer, LlmService, MemoryEngine,
    QueryReformulator, TopicIndexBuilder,
};
use state::AppState;
use storage::ImageStore;
use utils::limiters::Limiters;
use utils::tasks::TaskPool;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,docchat_server=debug".to_string()),
        )
        .with_target(true)
        .json()
        .init();

    info!("starting docchat server");

    let settings = Settings::load()?;
    let db_pool = DbPool::new(&settings.database).await?;
    info!("database connection established");

    let repository = Arc::new(Repository::new(db_pool.clone()));
    let limiters = Arc::new(Limiters::new(&settings.limits));
    let processing_pool = TaskPool::new(settings.limits.processing_concurrency);

    // Index adapters.
    let chunk_index = Arc::new(PgChunkIndex::new(db_pool.clone()));
    let memory_index = Arc::new(PgMemoryIndex::new(db_pool.clone()));
    let turn_index = Arc::new(PgTurnIndex::new(db_pool.clone()));

    // Outbound model clients.
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(EmbeddingService::new(
        settings.embedding.clone(),
        limiters.clone(),
    ));
    let chat_model: Arc<dyn ChatModel> =
        Arc::new(LlmService::new(settings.llm.clone(), limiters.clone()));
    let reranker = build_reranker(&settings.reranking, chat_model.clone());

    // Ingestion.
    let image_store = Arc::new(ImageStore::new(
        settings.image_storage.base_path.clone(),
        settings.image_storage.max_file_size_bytes,
    ));
    let enricher = Arc::new(Enricher::new(
        chat_model.clone(),
        settings.contextual_chunking.clone(),
    ));
    let indexer = Arc::new(Indexer::new(
        chunk_index.clone(),
        embedder.clone(),
        image_store.clone(),
        repository.clone(),
    ));
    let document_service = Arc::new(DocumentService::new(
        repository.clone(),
        chunk_index.clone(),
        memory_index.clone(),
        turn_index.clone(),
        image_store.clone(),
        enricher,
        indexer,
        settings.chunking.clone(),
        settings.image_grouping.clone(),
        processing_pool.clone(),
    ));

    // Retrieval and conversation core.
    let search = Arc::new(HybridSearchService::new(
        chunk_index.clone(),
        embedder.clone(),
        reranker,
        settings.retrieval.clone(),
        limiters.clone(),
    ));
    let reformulator = Arc::new(QueryReformulator::new(
        repository.clone(),
        turn_index.clone(),
        embedder.clone(),
        chat_model.clone(),
        settings.query_reformulation.clone(),
    ));
    let memory_engine = Arc::new(MemoryEngine::new(
        repository.clone(),
        memory_index.clone(),
        embedder.clone(),
        chat_model.clone(),
        settings.memory.clone(),
    ));
    let compactor = Arc::new(Compactor::new(
        repository.clone(),
        chat_model.clone(),
        settings.compaction.clone(),
    ));
    let topics = Arc::new(TopicIndexBuilder::new(repository.clone()));
    let side_effects = Arc::new(PostTurnTasks::new(
        memory_engine.clone(),
        compactor,
        turn_index.clone(),
        embedder.clone(),
        processing_pool.clone(),
    ));

    let orchestrator = Arc::new(ChatOrchestrator::new(
        repository.clone(),
        reformulator,
        search,
        memory_engine,
        topics,
        side_effects,
        chat_model,
        settings.chat.clone(),
        settings.retrieval.source_anchoring_enabled,
    ));

    let state = Arc::new(AppState {
        repository,
        document_service,
        orchestrator,
        image_store,
        processing_pool,
        settings: settings.clone(),
    });

    let app = build_router(state);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));
    info!(%addr, "server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/stats", get(handlers::health::health_stats));

    let api = Router::new()
        .route(
            "/api/sessions",
            post(handlers::sessions::create_session).get(handlers::sessions::list_sessions),
        )
        .route(
            "/api/sessions/{id}",
            get(handlers::sessions::get_session)
                .put(handlers::sessions::update_session)
                .delete(handlers::sessions::delete_session),
        )
        .route(
            "/api/sessions/{id}/mode",
            put(handlers::sessions::set_session_mode),
        )
        .route(
            "/api/sessions/{id}/documents",
            post(handlers::documents::upload_document).get(handlers::documents::list_documents),
        )
        .route(
            "/api/documents/{id}",
            get(handlers::documents::get_document).delete(handlers::documents::delete_document),
        )
        .route(
            "/api/documents/{id}/status",
            get(handlers::documents::get_document_status),
        )
        .route(
            "/api/sessions/{session_id}/images/{image_id}",
            get(handlers::documents::get_image),
        )
        .route(
            "/api/sessions/{id}/messages",
            get(handlers::chat::list_messages),
        )
        .route(
            "/api/sessions/{id}/chat/stream",
            post(handlers::chat::chat_stream),
        )
        .layer(middleware::from_fn(handlers::inject_error_path));

    Router::new()
        .merge(public)
        .merge(api)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 1024 * 1024))
}
