//! Document lifecycle: upload validation, the PENDING → PROCESSING →
//! READY/FAILED status machine, the ingestion pipeline (parse → group
//! images → chunk → enrich → index), and deletion cascades across the
//! index tables and the blob store.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ChunkingConfig, ImageGroupingConfig};
use crate::database::{Document, Repository};
use crate::document::{
    apply_composites, ChunkerConfig, DocumentParser, DraftChunk, ParsedDocument, SectionChunker,
    SpatialConfig,
};
use crate::index::{ChunkIndex, MemoryIndex, TurnIndex};
use crate::services::enricher::Enricher;
use crate::services::indexer::Indexer;
use crate::storage::ImageStore;
use crate::utils::error::ApiError;
use crate::utils::tasks::TaskPool;

pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

pub struct DocumentService {
    repository: Arc<Repository>,
    chunk_index: Arc<dyn ChunkIndex>,
    memory_index: Arc<dyn MemoryIndex>,
    turn_index: Arc<dyn TurnIndex>,
    image_store: Arc<ImageStore>,
    enricher: Arc<Enricher>,
    indexer: Arc<Indexer>,
    chunking: ChunkingConfig,
    grouping: ImageGroupingConfig,
    pool: TaskPool,
}

impl DocumentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<Repository>,
        chunk_index: Arc<dyn ChunkIndex>,
        memory_index: Arc<dyn MemoryIndex>,
        turn_index: Arc<dyn TurnIndex>,
        image_store: Arc<ImageStore>,
        enricher: Arc<Enricher>,
        indexer: Arc<Indexer>,
        chunking: ChunkingConfig,
        grouping: ImageGroupingConfig,
        pool: TaskPool,
    ) -> Self {
        Self {
            repository,
            chunk_index,
            memory_index,
            turn_index,
            image_store,
            enricher,
            indexer,
            chunking,
            grouping,
            pool,
        }
    }

    /// Validate and persist the upload as PENDING, then schedule processing
    /// after the row is committed so concurrent readers observe PENDING
    /// first.
    pub async fn upload(
        self: &Arc<Self>,
        session_id: Uuid,
        file_name: &str,
        declared_mime: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<Document, ApiError> {
        if self.repository.get_session(session_id).await?.is_none() {
            return Err(ApiError::SessionNotFound(session_id));
        }

        let mime = validate_upload(file_name, declared_mime, bytes.len())?;
        check_magic(&bytes, &mime)?;

        let document = self
            .repository
            .insert_document(session_id, file_name, &mime, bytes.len() as i64)
            .await?;
        info!(document_id = %document.id, file_name, %mime, "document accepted");

        // Post-commit trigger: the insert above committed, only now does the
        // processing task get queued.
        let service = self.clone();
        let document_id = document.id;
        self.pool.spawn("document_processing", async move {
            service.process(document_id, mime, bytes).await;
            Ok(())
        });

        Ok(document)
    }

    /// Processing pipeline; failures flip the document to FAILED and stop.
    async fn process(&self, document_id: Uuid, mime: String, bytes: Vec<u8>) {
        if let Err(e) = self.repository.mark_document_processing(document_id).await {
            warn!(error = %e, %document_id, "failed to mark document processing");
            return;
        }

        match self.run_pipeline(document_id, &mime, bytes).await {
            Ok(chunk_count) => {
                info!(%document_id, chunk_count, "document ready");
            }
            Err(e) => {
                warn!(error = %e, %document_id, "document processing failed");
                if let Err(mark) = self
                    .repository
                    .mark_document_failed(document_id, &e.to_string())
                    .await
                {
                    warn!(error = %mark, %document_id, "failed to record FAILED status");
                }
            }
        }
    }

    async fn run_pipeline(&self, document_id: Uuid, mime: &str, bytes: Vec<u8>) -> Result<i32> {
        let document = self
            .repository
            .get_document(document_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("document row disappeared"))?;

        // Parse, group images and chunk off the async runtime.
        let chunker_cfg = ChunkerConfig {
            size: self.chunking.size,
            overlap: self.chunking.overlap,
        };
        let spatial_cfg = SpatialConfig {
            threshold: self.grouping.spatial_threshold,
            min_group_size: self.grouping.min_group_size,
        };
        let mime_owned = mime.to_string();
        let (parsed, drafts) = tokio::task::spawn_blocking(move || {
            parse_and_chunk(&bytes, &mime_owned, &chunker_cfg, &spatial_cfg)
        })
        .await??;

        // Empty document: READY with zero chunks.
        if drafts.is_empty() {
            self.repository
                .mark_document_ready(document_id, 0, None, &[])
                .await?;
            return Ok(0);
        }

        // Enrichment: one analysis call, then a contextual prefix per chunk.
        let analysis = if self.enricher.enabled() {
            self.enricher
                .analyze_document(&document.file_name, &parsed.full_text)
                .await
        } else {
            Default::default()
        };

        let mut prefixes: Vec<Option<String>> = Vec::with_capacity(drafts.len());
        let mut embed_texts: Vec<String> = drafts.iter().map(|d| d.content.clone()).collect();
        for (i, draft) in drafts.iter().enumerate() {
            let prefix = self
                .enricher
                .generate_prefix(&analysis.summary, &draft.content)
                .await;
            if let Some(p) = &prefix {
                embed_texts[i] = format!("{p}\n\n{}", embed_texts[i]);
            }
            prefixes.push(prefix);
        }

        // Blob store + image rows, then dual-embedded index write.
        let image_ids = self.indexer.store_images(&document, &parsed.images).await?;
        let records = self
            .indexer
            .embed_and_index(&document, &drafts, &prefixes, &embed_texts, &image_ids)
            .await?;

        let chunk_count = records.len() as i32;
        let summary = (!analysis.summary.is_empty()).then_some(analysis.summary.as_str());
        self.repository
            .mark_document_ready(document_id, chunk_count, summary, &analysis.topics)
            .await?;

        Ok(chunk_count)
    }

    /// Remove a document: index entries and blobs first, row last.
    pub async fn delete_document(&self, document_id: Uuid) -> Result<(), ApiError> {
        let document = self
            .repository
            .get_document(document_id)
            .await?
            .ok_or(ApiError::DocumentNotFound(document_id))?;

        if let Err(e) = self.chunk_index.delete_document(document_id).await {
            warn!(error = %e, %document_id, "chunk index cleanup failed, continuing");
        }
        if let Err(e) = self
            .image_store
            .delete_document(document.session_id, document_id)
            .await
        {
            warn!(error = %e, %document_id, "image blob cleanup failed, continuing");
        }

        self.repository.delete_document_rows(document_id).await?;
        info!(%document_id, "document deleted");
        Ok(())
    }

    /// Session teardown. Index and blob cleanup errors are logged and do
    /// not block the relational delete.
    pub async fn delete_session(&self, session_id: Uuid) -> Result<(), ApiError> {
        if self.repository.get_session(session_id).await?.is_none() {
            return Err(ApiError::SessionNotFound(session_id));
        }

        if let Err(e) = self.chunk_index.delete_session(session_id).await {
            warn!(error = %e, %session_id, "chunk index cleanup failed, continuing");
        }
        if let Err(e) = self.memory_index.delete_session(session_id).await {
            warn!(error = %e, %session_id, "memory index cleanup failed, continuing");
        }
        if let Err(e) = self.turn_index.delete_session(session_id).await {
            warn!(error = %e, %session_id, "turn index cleanup failed, continuing");
        }
        if let Err(e) = self.image_store.delete_session(session_id).await {
            warn!(error = %e, %session_id, "image blob cleanup failed, continuing");
        }

        self.repository.delete_session_rows(session_id).await?;
        info!(%session_id, "session deleted");
        Ok(())
    }
}

fn parse_and_chunk(
    bytes: &[u8],
    mime: &str,
    chunker_cfg: &ChunkerConfig,
    spatial_cfg: &SpatialConfig,
) -> Result<(ParsedDocument, Vec<DraftChunk>)> {
    let mut parsed = DocumentParser::parse(bytes, mime)?;
    if mime == crate::document::parser::MIME_PDF {
        apply_composites(bytes, &mut parsed, spatial_cfg);
    }
    let drafts = SectionChunker::new(chunker_cfg.clone()).chunk(&parsed);
    Ok((parsed, drafts))
}

/// MIME allow-list plus the upload size cap. Returns the resolved MIME.
pub fn validate_upload(
    file_name: &str,
    declared_mime: Option<&str>,
    size: usize,
) -> Result<String, ApiError> {
    if size > MAX_UPLOAD_BYTES {
        return Err(ApiError::DocumentTooLarge {
            size,
            max: MAX_UPLOAD_BYTES,
        });
    }
    if size == 0 {
        return Err(ApiError::Validation("uploaded file is empty".into()));
    }

    let mime = declared_mime
        .filter(|m| DocumentParser::is_supported(m))
        .map(str::to_string)
        .or_else(|| {
            mime_guess::from_path(file_name)
                .iter()
                .map(|m| m.essence_str().to_string())
                .find(|m| DocumentParser::is_supported(m))
        })
        .ok_or_else(|| {
            ApiError::UnsupportedDocument(
                declared_mime
                    .map(str::to_string)
                    .unwrap_or_else(|| file_name.to_string()),
            )
        })?;

    Ok(mime)
}

/// Magic-number sanity check. Executables are always rejected; a declared
/// PDF must actually look like one. Office containers detect as zip, so
/// only the unambiguous cases are enforced.
pub fn check_magic(bytes: &[u8], mime: &str) -> Result<(), ApiError> {
    let Some(kind) = infer::get(bytes) else {
        return Ok(());
    };
    let detected = kind.mime_type();

    if matches!(
        detected,
        "application/x-executable"
            | "application/vnd.microsoft.portable-executable"
            | "application/x-mach-binary"
    ) {
        return Err(ApiError::Validation(
            "executable uploads are not accepted".into(),
        ));
    }

    if mime == crate::document::parser::MIME_PDF && detected != "application/pdf" {
        return Err(ApiError::UnsupportedDocument(format!(
            "declared application/pdf, detected {detected}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_cap_is_50_mib() {
        let err = validate_upload("big.pdf", Some("application/pdf"), MAX_UPLOAD_BYTES + 1)
            .unwrap_err();
        assert_eq!(err.code(), "DOCUMENT_003");

        assert!(validate_upload("ok.pdf", Some("application/pdf"), MAX_UPLOAD_BYTES).is_ok());
    }

    #[test]
    fn unsupported_type_is_rejected() {
        let err = validate_upload("data.bin", Some("application/octet-stream"), 10).unwrap_err();
        assert_eq!(err.code(), "DOCUMENT_002");
    }

    #[test]
    fn mime_falls_back_to_extension() {
        let mime = validate_upload("notes.md", None, 10).unwrap();
        assert_eq!(mime, "text/markdown");
        let mime = validate_upload("doc.pdf", Some("application/octet-stream"), 10).unwrap();
        assert_eq!(mime, "application/pdf");
    }

    #[test]
    fn executables_are_rejected_by_magic() {
        // ELF header.
        let bytes = [0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let err = check_magic(&bytes, "text/plain").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_001");
    }

    #[test]
    fn declared_pdf_must_look_like_pdf() {
        assert!(check_magic(b"%PDF-1.7 rest of file", "application/pdf").is_ok());
        let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0];
        assert!(check_magic(&png, "application/pdf").is_err());
    }

    #[test]
    fn plain_text_has_no_magic_and_passes() {
        assert!(check_magic(b"just words", "text/plain").is_ok());
    }

    #[test]
    fn empty_upload_is_invalid() {
        let err = validate_upload("empty.txt", Some("text/plain"), 0).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_001");
    }

    #[test]
    fn parse_and_chunk_empty_markdown_yields_no_drafts() {
        let (parsed, drafts) = parse_and_chunk(
            b"",
            "text/markdown",
            &ChunkerConfig::default(),
            &SpatialConfig::default(),
        )
        .unwrap();
        assert!(parsed.full_text.is_empty());
        assert!(drafts.is_empty());
    }
}
