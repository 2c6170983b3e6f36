use std::sync::Arc;

use crate::config::Settings;
use crate::database::Repository;
use crate::services::{ChatOrchestrator, DocumentService};
use crate::storage::ImageStore;
use crate::utils::tasks::TaskPool;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<Repository>,
    pub document_service: Arc<DocumentService>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub image_store: Arc<ImageStore>,
    pub processing_pool: TaskPool,
    pub settings: Settings,
}
