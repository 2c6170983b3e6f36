//! Chat history compaction. When the uncompacted token sum passes the
//! threshold, the oldest contiguous run of turns summing to at least the
//! target is summarized into one `Summary` row and those turns are marked
//! compacted, atomically.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::CompactionConfig;
use crate::database::{ChatTurn, Repository, Summary};
use crate::services::llm_service::{ChatMessage, ChatModel};
use crate::utils::token_estimator;

pub struct Compactor {
    repository: Arc<Repository>,
    model: Arc<dyn ChatModel>,
    config: CompactionConfig,
}

impl Compactor {
    pub fn new(
        repository: Arc<Repository>,
        model: Arc<dyn ChatModel>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            repository,
            model,
            config,
        }
    }

    pub async fn over_threshold(&self, session_id: Uuid) -> Result<bool> {
        let total = self.repository.sum_uncompacted_tokens(session_id).await?;
        Ok(total > self.config.threshold_tokens as i64)
    }

    /// Compact once if due. Returns the written summary, or `None` when the
    /// session is under threshold or has too few turns to compact.
    pub async fn maybe_compact(&self, session_id: Uuid) -> Result<Option<Summary>> {
        if !self.over_threshold(session_id).await? {
            return Ok(None);
        }

        let turns = self
            .repository
            .uncompacted_turns_oldest_first(session_id)
            .await?;
        let run = select_compaction_run(&turns, self.config.target_tokens);

        if run.len() < self.config.min_turns {
            debug!(
                available = run.len(),
                min = self.config.min_turns,
                "too few turns to compact"
            );
            return Ok(None);
        }

        let (Some(first), Some(last)) = (run.first(), run.last()) else {
            return Ok(None);
        };

        let original_tokens: i32 = run.iter().map(|t| t.token_count).sum();
        let summary_text = self.summarize(run).await?;
        // The summary may not exceed what it replaced.
        let summary_tokens =
            (token_estimator::estimate_tokens(&summary_text) as i32).min(original_tokens);

        let turn_ids: Vec<Uuid> = run.iter().map(|t| t.id).collect();
        let summary = self
            .repository
            .insert_summary_compacting(
                session_id,
                &summary_text,
                run.len() as i32,
                summary_tokens,
                original_tokens,
                first.created_at,
                last.created_at,
                &turn_ids,
            )
            .await?;

        info!(
            session_id = %session_id,
            turns = run.len(),
            original_tokens,
            summary_tokens,
            "history compacted"
        );
        Ok(Some(summary))
    }

    async fn summarize(&self, turns: &[ChatTurn]) -> Result<String> {
        let mut transcript = String::new();
        for turn in turns {
            transcript.push_str(&format!("{}: {}\n", turn.role, turn.content));
        }

        let system = "Summarize this conversation excerpt for use as compressed context in \
                      later turns. Keep concrete facts, decisions, open questions and the \
                      user's goals; drop pleasantries. Write flowing prose, not bullets.";
        let messages = [
            ChatMessage::system(system),
            ChatMessage::user(transcript),
        ];

        self.model.complete(&messages, 1_024, 0.2).await
    }
}

/// Oldest contiguous prefix of the uncompacted turns whose token sum reaches
/// `target_tokens`. Takes everything if the total stays below target.
pub fn select_compaction_run(turns: &[ChatTurn], target_tokens: usize) -> &[ChatTurn] {
    let mut sum = 0usize;
    for (i, turn) in turns.iter().enumerate() {
        sum += turn.token_count.max(0) as usize;
        if sum >= target_tokens {
            return &turns[..=i];
        }
    }
    turns
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn turn(tokens: i32) -> ChatTurn {
        ChatTurn {
            id: Uuid::new_v4(),
            session_id: Uuid::nil(),
            role: "USER".to_string(),
            content: "x".to_string(),
            mode_used: "EXPLORING".to_string(),
            token_count: tokens,
            is_compacted: false,
            retrieved_context_json: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn run_stops_at_target() {
        let turns: Vec<ChatTurn> = (0..10).map(|_| turn(100)).collect();
        let run = select_compaction_run(&turns, 450);
        assert_eq!(run.len(), 5);
        let sum: i32 = run.iter().map(|t| t.token_count).sum();
        assert!(sum >= 450);
    }

    #[test]
    fn run_takes_all_when_under_target() {
        let turns: Vec<ChatTurn> = (0..3).map(|_| turn(50)).collect();
        let run = select_compaction_run(&turns, 1_000);
        assert_eq!(run.len(), 3);
    }

    #[test]
    fn run_is_a_prefix() {
        let turns: Vec<ChatTurn> = (0..6).map(|_| turn(100)).collect();
        let run = select_compaction_run(&turns, 250);
        let expected: Vec<Uuid> = turns.iter().take(3).map(|t| t.id).collect();
        let got: Vec<Uuid> = run.iter().map(|t| t.id).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn empty_history_yields_empty_run() {
        let run = select_compaction_run(&[], 100);
        assert!(run.is_empty());
    }
}
