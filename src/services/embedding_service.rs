use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::utils::limiters::Limiters;
use crate::utils::resilience::{Guard, Policy};

/// Instruction prefixes are asymmetric: passages and queries are embedded
/// into the same space with different task framings.
pub const PASSAGE_PREFIX: &str = "Represent this document passage for retrieval: ";
pub const QUERY_PREFIX: &str = "Represent this question for retrieving relevant document passages: ";

/// Inputs longer than this are right-truncated before embedding. Counted in
/// chars, which is conservative for CJK.
pub const MAX_EMBED_CHARS: usize = 5_000;

/// Providers degrade to an empty vector instead of failing; callers treat
/// such chunks and queries as lexical-only.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_passage(&self, text: &str) -> Vec<f32>;
    async fn embed_query(&self, text: &str) -> Vec<f32>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    input: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

pub struct EmbeddingService {
    client: Client,
    base_url: String,
    model: String,
    pub dimension: usize,
    cache: DashMap<String, Vec<f32>>,
    guard: Guard,
    limiters: Arc<Limiters>,
}

impl EmbeddingService {
    pub fn new(config: EmbeddingConfig, limiters: Arc<Limiters>) -> Self {
        let timeout = Duration::from_secs(config.timeout_seconds);
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.base_url,
            model: config.model,
            dimension: config.dimension,
            cache: DashMap::new(),
            guard: Guard::new(Policy::new("embedding", 2, timeout)),
            limiters,
        }
    }

    /// Truncate then prefix. Truncation happens on the raw text so the
    /// instruction prefix is never cut.
    fn prepare(prefix: &str, text: &str) -> String {
        let truncated: String = text.chars().take(MAX_EMBED_CHARS).collect();
        format!("{prefix}{truncated}")
    }

    async fn embed_prepared(&self, prepared: String) -> Vec<f32> {
        if let Some(hit) = self.cache.get(&prepared) {
            debug!("embedding cache hit");
            return hit.clone();
        }

        let permit = Limiters::acquire_timed(
            self.limiters.embedding.clone(),
            self.limiters.acquire_timeout,
            "embedding",
        )
        .await;
        let (_permit, wait) = match permit {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "embedding limiter exhausted, degrading to empty vector");
                return Vec::new();
            }
        };
        debug!(wait_ms = wait.as_millis() as u64, op = "embedding", "wait_queue");

        let exec_start = Instant::now();
        let this = self;
        let input = prepared.clone();
        let result = self
            .guard
            .call(move || this.request_embedding(input.clone()))
            .await;
        debug!(
            exec_ms = exec_start.elapsed().as_millis() as u64,
            op = "embedding",
            "exec"
        );

        match result {
            Ok(embedding) => {
                self.cache.insert(prepared, embedding.clone());
                embedding
            }
            Err(e) => {
                // Named fallback: empty vector, caller goes lexical-only.
                warn!(error = %e, "embedding failed, degrading to empty vector");
                Vec::new()
            }
        }
    }

    async fn request_embedding(&self, input: String) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            input,
            model: self.model.clone(),
        };

        let url = format!("{}/v1/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("failed to reach embedding server")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("embedding API error ({status}): {body}");
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .context("failed to parse embedding response")?;

        let embedding = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .unwrap_or_default();

        if embedding.is_empty() {
            anyhow::bail!("embedding server returned no vector");
        }
        if embedding.len() != self.dimension {
            anyhow::bail!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            );
        }

        Ok(embedding)
    }
}

#[async_trait]
impl EmbeddingProvider for EmbeddingService {
    async fn embed_passage(&self, text: &str) -> Vec<f32> {
        self.embed_prepared(Self::prepare(PASSAGE_PREFIX, text)).await
    }

    async fn embed_query(&self, text: &str) -> Vec<f32> {
        self.embed_prepared(Self::prepare(QUERY_PREFIX, text)).await
    }
}
