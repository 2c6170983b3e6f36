use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub reranking: RerankingConfig,
    pub retrieval: RetrievalConfig,
    pub memory: MemoryConfig,
    pub compaction: CompactionConfig,
    pub image_storage: ImageStorageConfig,
    pub image_grouping: ImageGroupingConfig,
    pub query_reformulation: QueryReformulationConfig,
    pub chunking: ChunkingConfig,
    pub contextual_chunking: ContextualChunkingConfig,
    pub chat: ChatConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub max_tokens: usize,
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RerankingConfig {
    /// "tei" (text-embeddings-inference /rerank endpoint) or "llm".
    pub strategy: String,
    pub tei: TeiConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TeiConfig {
    pub base_url: String,
    #[serde(default)]
    pub raw_scores: bool,
    #[serde(default = "default_tei_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_candidates_multiplier")]
    pub candidates_multiplier: usize,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: u32,
    #[serde(default = "default_true")]
    pub source_anchoring_enabled: bool,
    #[serde(default = "default_max_per_doc")]
    pub max_per_doc: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_extraction_threshold")]
    pub extraction_threshold: f32,
    #[serde(default = "default_max_per_session")]
    pub max_per_session: usize,
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f32,
    #[serde(default = "default_candidate_pool_multiplier")]
    pub candidate_pool_multiplier: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CompactionConfig {
    pub threshold_tokens: usize,
    pub target_tokens: usize,
    #[serde(default = "default_min_compact_turns")]
    pub min_turns: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ImageStorageConfig {
    pub base_path: String,
    pub max_file_size_bytes: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ImageGroupingConfig {
    #[serde(default = "default_spatial_threshold")]
    pub spatial_threshold: f32,
    #[serde(default = "default_min_group_size")]
    pub min_group_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueryReformulationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_recent_messages")]
    pub min_recent_messages: usize,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ContextualChunkingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_summary_chars")]
    pub max_summary_chars: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_channel_capacity")]
    pub stream_channel_capacity: usize,
    #[serde(default = "default_recent_turns")]
    pub recent_turns: usize,
    #[serde(default = "default_recent_summaries")]
    pub recent_summaries: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_embedding_concurrency")]
    pub embedding_concurrency: usize,
    #[serde(default = "default_search_concurrency")]
    pub search_concurrency: usize,
    #[serde(default = "default_llm_concurrency")]
    pub llm_concurrency: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_processing_concurrency")]
    pub processing_concurrency: usize,
}

fn default_embedding_timeout() -> u64 {
    30
}
fn default_llm_timeout() -> u64 {
    60
}
fn default_tei_timeout_ms() -> u64 {
    5_000
}
fn default_candidates_multiplier() -> usize {
    4
}
fn default_rrf_k() -> u32 {
    60
}
fn default_max_per_doc() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_extraction_threshold() -> f32 {
    0.6
}
fn default_max_per_session() -> usize {
    200
}
fn default_semantic_weight() -> f32 {
    0.7
}
fn default_candidate_pool_multiplier() -> usize {
    3
}
fn default_min_compact_turns() -> usize {
    4
}
fn default_spatial_threshold() -> f32 {
    100.0
}
fn default_min_group_size() -> usize {
    2
}
fn default_min_recent_messages() -> usize {
    6
}
fn default_history_window() -> usize {
    8
}
fn default_max_query_length() -> usize {
    512
}
fn default_chunk_size() -> usize {
    400
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_max_summary_chars() -> usize {
    12_000
}
fn default_max_prompt_chars() -> usize {
    48_000
}
fn default_channel_capacity() -> usize {
    64
}
fn default_recent_turns() -> usize {
    10
}
fn default_recent_summaries() -> usize {
    3
}
fn default_embedding_concurrency() -> usize {
    4
}
fn default_search_concurrency() -> usize {
    8
}
fn default_llm_concurrency() -> usize {
    4
}
fn default_acquire_timeout_ms() -> u64 {
    15_000
}
fn default_processing_concurrency() -> usize {
    2
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(true))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}
