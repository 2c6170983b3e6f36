//! Chat turn orchestration: prompt assembly, the streamed turn pipeline,
//! and the seams it consumes.

pub mod manager;
pub mod prompt;
pub mod types;

pub use manager::ChatOrchestrator;
pub use types::{
    ContextRetriever, ConversationStore, MemoryRecall, PostTurnTasks, QueryRewriter,
    TopicCatalog, TurnSideEffects,
};
