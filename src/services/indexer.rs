//! Index writer: dual-embeds enriched chunks, writes them to the hybrid
//! index, and moves extracted image bytes into the blob store with a row
//! per image. Embedding failures leave the vector empty; those chunks stay
//! lexical-only rather than failing the document.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::database::{Document, DocumentImage, Repository};
use crate::document::{DraftChunk, ExtractedImage};
use crate::index::{ChunkIndex, ChunkRecord};
use crate::services::embedding_service::EmbeddingProvider;
use crate::storage::ImageStore;
use crate::utils::token_estimator;

pub struct Indexer {
    chunk_index: Arc<dyn ChunkIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    image_store: Arc<ImageStore>,
    repository: Arc<Repository>,
}

impl Indexer {
    pub fn new(
        chunk_index: Arc<dyn ChunkIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        image_store: Arc<ImageStore>,
        repository: Arc<Repository>,
    ) -> Self {
        Self {
            chunk_index,
            embedder,
            image_store,
            repository,
        }
    }

    /// Persist image bytes and rows. Returns the stored id for each input
    /// image position; oversize images are skipped and map to `None`.
    pub async fn store_images(
        &self,
        document: &Document,
        images: &[ExtractedImage],
    ) -> Result<Vec<Option<Uuid>>> {
        let mut ids = Vec::with_capacity(images.len());
        let mut rows = Vec::new();

        for (index, image) in images.iter().enumerate() {
            let saved = self
                .image_store
                .save(
                    document.session_id,
                    document.id,
                    index,
                    &image.mime,
                    &image.bytes,
                )
                .await?;

            match saved {
                Some(path) => {
                    let id = Uuid::new_v4();
                    rows.push(DocumentImage {
                        id,
                        document_id: document.id,
                        session_id: document.session_id,
                        image_index: index as i32,
                        mime_type: image.mime.clone(),
                        alt_text: image.alt_text.clone(),
                        file_path: path.to_string_lossy().into_owned(),
                        width: image.width.round() as i32,
                        height: image.height.round() as i32,
                        page_number: image.page_number.map(|p| p as i32),
                        x_pdf: image.x_pdf,
                        y_pdf: image.y_pdf,
                        spatial_group_id: image.spatial_group_id,
                    });
                    ids.push(Some(id));
                }
                None => ids.push(None),
            }
        }

        if !rows.is_empty() {
            self.repository.insert_images(&rows).await?;
        }
        debug!(
            stored = rows.len(),
            skipped = images.len() - rows.len(),
            "document images stored"
        );
        Ok(ids)
    }

    /// Build chunk records from the drafts, embed title and content, and
    /// write the batch to the hybrid index. `prefixes` and `embed_texts`
    /// run parallel to `drafts`; `image_ids` maps parsed-image indices to
    /// stored ids.
    pub async fn embed_and_index(
        &self,
        document: &Document,
        drafts: &[DraftChunk],
        prefixes: &[Option<String>],
        embed_texts: &[String],
        image_ids: &[Option<Uuid>],
    ) -> Result<Vec<ChunkRecord>> {
        let document_title = document_title(&document.file_name);
        let mut records = Vec::with_capacity(drafts.len());

        for (i, draft) in drafts.iter().enumerate() {
            let prefix = prefixes.get(i).cloned().flatten();
            let enriched = match &prefix {
                Some(p) => format!("{p}\n\n{}", draft.content),
                None => draft.content.clone(),
            };
            let embed_text = embed_texts
                .get(i)
                .cloned()
                .unwrap_or_else(|| enriched.clone());

            let title_text = format!("{document_title} > {}", draft.section_title);
            let title_embedding = self.embedder.embed_passage(&title_text).await;
            let content_embedding = self.embedder.embed_passage(&embed_text).await;

            let associated: Vec<Uuid> = draft
                .associated_image_indices
                .iter()
                .filter_map(|&idx| image_ids.get(idx).copied().flatten())
                .collect();

            records.push(ChunkRecord {
                id: Uuid::new_v4(),
                document_id: document.id,
                session_id: document.session_id,
                file_name: document.file_name.clone(),
                chunk_index: i as i32,
                content: draft.content.clone(),
                context_prefix: prefix,
                token_count: token_estimator::estimate_tokens(&enriched) as i32,
                enriched_content: enriched,
                title_embedding,
                content_embedding,
                document_title: document_title.clone(),
                section_title: draft.section_title.clone(),
                section_breadcrumb: draft.breadcrumb.clone(),
                keywords: extract_keywords(&draft.content, 8),
                associated_image_ids: associated,
            });
        }

        self.chunk_index.index_chunks(&records).await?;
        info!(
            document_id = %document.id,
            chunks = records.len(),
            "document indexed"
        );
        Ok(records)
    }
}

pub fn document_title(file_name: &str) -> String {
    std::path::Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name)
        .replace(['_', '-'], " ")
}

/// Cheap lexical keywords: most frequent alphabetic words of length >= 5,
/// ties broken by first appearance.
pub fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (pos, raw) in text.split_whitespace().enumerate() {
        let word: String = raw
            .chars()
            .filter(|c| c.is_alphabetic())
            .collect::<String>()
            .to_lowercase();
        if word.chars().count() < 5 {
            continue;
        }
        let entry = counts.entry(word).or_insert((0, pos));
        entry.0 += 1;
    }

    let mut words: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    words.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    words.into_iter().take(limit).map(|(w, _)| w).collect()
}
