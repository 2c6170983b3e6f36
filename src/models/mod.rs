pub mod api;
pub mod domain;

pub use api::{ChatEvent, ChatRequest, CreateSessionRequest, MessagesQuery, UpdateSessionRequest};
pub use domain::{ConfidenceLevel, DocumentStatus, MemoryKind, SessionMode, TurnRole};
