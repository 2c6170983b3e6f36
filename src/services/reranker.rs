use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::RerankingConfig;
use crate::services::llm_service::{complete_json, ChatMessage, ChatModel};
use crate::utils::resilience::{Guard, Policy};

/// Cross-encoder seam. Scores are in [0, 1], one per input passage, in
/// input order. The search pipeline treats any error as "pass through with
/// fusion order".
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;
}

pub fn build_reranker(config: &RerankingConfig, chat_model: Arc<dyn ChatModel>) -> Arc<dyn Reranker> {
    match config.strategy.as_str() {
        "llm" => Arc::new(LlmReranker::new(chat_model)),
        _ => Arc::new(TeiReranker::new(config.tei.clone())),
    }
}

// ===== TEI (text-embeddings-inference) =====

#[derive(Debug, Serialize)]
struct TeiRequest<'a> {
    query: &'a str,
    texts: &'a [String],
    raw_scores: bool,
}

#[derive(Debug, Deserialize)]
struct TeiRank {
    index: usize,
    score: f32,
}

pub struct TeiReranker {
    client: Client,
    config: crate::config::TeiConfig,
    guard: Guard,
}

impl TeiReranker {
    pub fn new(config: crate::config::TeiConfig) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms);
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            guard: Guard::new(Policy::new("reranker", 1, timeout)),
            config,
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[async_trait]
impl Reranker for TeiReranker {
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let this = self;
        let ranks: Vec<TeiRank> = self
            .guard
            .call(move || async move {
                let response = this
                    .client
                    .post(format!("{}/rerank", this.config.base_url))
                    .json(&TeiRequest {
                        query,
                        texts: passages,
                        raw_scores: this.config.raw_scores,
                    })
                    .send()
                    .await
                    .context("failed to reach reranker")?;

                if !response.status().is_success() {
                    let status = response.status();
                    anyhow::bail!("reranker error ({status})");
                }

                response
                    .json::<Vec<TeiRank>>()
                    .await
                    .context("failed to parse reranker response")
            })
            .await
            .map_err(anyhow::Error::from)?;

        let mut scores = vec![0.0f32; passages.len()];
        for rank in ranks {
            if rank.index < scores.len() {
                scores[rank.index] = if self.config.raw_scores {
                    sigmoid(rank.score)
                } else {
                    rank.score.clamp(0.0, 1.0)
                };
            }
        }
        debug!(count = scores.len(), "reranked passages via tei");
        Ok(scores)
    }
}

// ===== LLM fallback strategy =====

pub struct LlmReranker {
    model: Arc<dyn ChatModel>,
}

impl LlmReranker {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[derive(Debug, Deserialize)]
struct LlmScores {
    scores: Vec<f32>,
}

#[async_trait]
impl Reranker for LlmReranker {
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let mut listing = String::new();
        for (i, passage) in passages.iter().enumerate() {
            listing.push_str(&format!("--- PASSAGE {i} ---\n{passage}\n\n"));
        }

        let system = "You score passages for relevance to a query. Reply with ONLY a JSON \
                      object {\"scores\": [..]} containing one number in [0,1] per passage, \
                      in the given order. No other keys, no prose.";
        let user = format!("Query: {query}\n\n{listing}");

        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        let parsed: LlmScores = complete_json(self.model.as_ref(), &messages, 512).await?;

        if parsed.scores.len() != passages.len() {
            anyhow::bail!(
                "reranker score count mismatch: {} scores for {} passages",
                parsed.scores.len(),
                passages.len()
            );
        }

        Ok(parsed
            .scores
            .into_iter()
            .map(|s| s.clamp(0.0, 1.0))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm_service::TokenStream;

    #[test]
    fn sigmoid_maps_into_unit_interval() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(10.0) > 0.99);
        assert!(sigmoid(-10.0) < 0.01);
    }

    struct ScriptedModel(String);

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, _: &[ChatMessage], _: usize, _: f32) -> Result<String> {
            Ok(self.0.clone())
        }
        async fn stream(&self, _: &[ChatMessage]) -> Result<TokenStream> {
            anyhow::bail!("not used")
        }
    }

    #[tokio::test]
    async fn llm_reranker_parses_and_clamps() {
        let reranker = LlmReranker::new(Arc::new(ScriptedModel(
            "{\"scores\": [0.9, 1.7, -0.2]}".to_string(),
        )));
        let passages = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let scores = reranker.rerank("q", &passages).await.unwrap();
        assert_eq!(scores, vec![0.9, 1.0, 0.0]);
    }

    #[tokio::test]
    async fn llm_reranker_rejects_mismatched_counts() {
        let reranker = LlmReranker::new(Arc::new(ScriptedModel(
            "{\"scores\": [0.9]}".to_string(),
        )));
        let passages = vec!["a".to_string(), "b".to_string()];
        assert!(reranker.rerank("q", &passages).await.is_err());
    }

    #[tokio::test]
    async fn empty_passages_short_circuit() {
        let reranker = LlmReranker::new(Arc::new(ScriptedModel("ignored".to_string())));
        let scores = reranker.rerank("q", &[]).await.unwrap();
        assert!(scores.is_empty());
    }
}
