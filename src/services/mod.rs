pub mod compactor;
pub mod confidence;
pub mod conversation;
pub mod document_service;
pub mod embedding_service;
pub mod enricher;
pub mod hybrid_search;
pub mod indexer;
pub mod llm_service;
pub mod memory;
pub mod reformulator;
pub mod reranker;
pub mod topic_index;

pub use compactor::Compactor;
pub use confidence::ConfidenceScorer;
pub use conversation::ChatOrchestrator;
pub use document_service::DocumentService;
pub use embedding_service::{EmbeddingProvider, EmbeddingService};
pub use enricher::Enricher;
pub use hybrid_search::HybridSearchService;
pub use indexer::Indexer;
pub use llm_service::{ChatModel, LlmService};
pub use memory::MemoryEngine;
pub use reformulator::QueryReformulator;
pub use reranker::{build_reranker, Reranker};
pub use topic_index::TopicIndexBuilder;
