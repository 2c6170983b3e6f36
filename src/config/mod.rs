pub mod settings;

pub use settings::{
    ChatConfig, ChunkingConfig, CompactionConfig, ContextualChunkingConfig, DatabaseConfig,
    EmbeddingConfig, ImageGroupingConfig, ImageStorageConfig, LimitsConfig, LlmConfig,
    MemoryConfig, QueryReformulationConfig, RerankingConfig, RetrievalConfig, ServerConfig,
    Settings, TeiConfig,
};
