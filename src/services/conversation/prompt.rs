//! Prompt assembly. One system message built from fixed-order parts (base
//! instruction, mode flavor, optional hedge, topic index, memories,
//! summaries, retrieved document context), then the recent uncompacted
//! turns oldest-first, then the current user message. A char budget drops
//! older summaries first, then the oldest recent turns; the retrieved
//! context and the current user message are never dropped.

use crate::database::{ChatTurn, Summary};
use crate::models::{SessionMode, TurnRole};
use crate::services::hybrid_search::RankedChunk;
use crate::services::llm_service::ChatMessage;

pub const BASE_INSTRUCTION: &str = "You are an assistant answering questions about the user's \
uploaded documents.\n\
Ground every claim in the document context below and mention which source it came from. \
When the context does not contain the answer, say so plainly instead of guessing. \
Do not invent sources, and do not answer from general knowledge when the documents \
contradict it.";

pub const HEDGING_INSTRUCTION: &str = "Retrieval confidence for this question is low. Be \
explicit about uncertainty, qualify your answer, and point out what additional material \
would help.";

#[derive(Debug)]
pub struct PromptInputs<'a> {
    pub mode: SessionMode,
    pub hedge: bool,
    pub topic_index: &'a str,
    pub memory_block: &'a str,
    /// Newest-first, as fetched from the store.
    pub summaries: &'a [Summary],
    pub chunks: &'a [RankedChunk],
    /// Oldest-first, uncompacted, excluding the current message.
    pub recent_turns: &'a [ChatTurn],
    pub user_message: &'a str,
}

/// Render the retrieved chunks with per-source headers.
pub fn document_context(chunks: &[RankedChunk]) -> String {
    if chunks.is_empty() {
        return String::new();
    }
    let mut out = String::from("=== DOCUMENT CONTEXT ===\n");
    for (i, hit) in chunks.iter().enumerate() {
        let chunk = &hit.chunk;
        if chunk.section_title.is_empty() {
            out.push_str(&format!(
                "[Source {}: {} — {}]\n",
                i + 1,
                chunk.file_name,
                chunk.document_title
            ));
        } else {
            out.push_str(&format!(
                "[Source {}: {} — {} > Section: {}]\n",
                i + 1,
                chunk.file_name,
                chunk.document_title,
                chunk.section_title
            ));
        }
        out.push_str(chunk.content.trim());
        out.push_str("\n\n");
    }
    out.trim_end().to_string()
}

fn summaries_block(summaries: &[&Summary]) -> String {
    if summaries.is_empty() {
        return String::new();
    }
    let mut out = String::from("Earlier conversation, summarized (oldest first):\n");
    for summary in summaries {
        out.push_str(&format!("- {}\n", summary.summary_content.trim()));
    }
    out
}

fn system_content(
    inputs: &PromptInputs<'_>,
    summaries: &[&Summary],
    doc_context: &str,
) -> String {
    let mut parts: Vec<String> = vec![
        BASE_INSTRUCTION.to_string(),
        inputs.mode.prompt_flavor().to_string(),
    ];
    if inputs.hedge {
        parts.push(HEDGING_INSTRUCTION.to_string());
    }
    if !inputs.topic_index.is_empty() {
        parts.push(inputs.topic_index.to_string());
    }
    if !inputs.memory_block.is_empty() {
        parts.push(inputs.memory_block.to_string());
    }
    let summaries_text = summaries_block(summaries);
    if !summaries_text.is_empty() {
        parts.push(summaries_text);
    }
    if !doc_context.is_empty() {
        parts.push(doc_context.to_string());
    }
    parts.join("\n\n")
}

fn total_chars(system: &str, turns: &[&ChatTurn], user_message: &str) -> usize {
    system.chars().count()
        + turns
            .iter()
            .map(|t| t.content.chars().count())
            .sum::<usize>()
        + user_message.chars().count()
}

/// Assemble the final message list under the char budget.
pub fn assemble(inputs: &PromptInputs<'_>, max_chars: usize) -> Vec<ChatMessage> {
    let doc_context = document_context(inputs.chunks);

    // Oldest-first working sets the budget loop can pop from the front.
    let mut summaries: Vec<&Summary> = inputs.summaries.iter().rev().collect();
    let mut turns: Vec<&ChatTurn> = inputs.recent_turns.iter().collect();

    let mut system = system_content(inputs, &summaries, &doc_context);
    while total_chars(&system, &turns, inputs.user_message) > max_chars {
        if !summaries.is_empty() {
            summaries.remove(0);
        } else if !turns.is_empty() {
            turns.remove(0);
        } else {
            break; // only the protected parts remain
        }
        system = system_content(inputs, &summaries, &doc_context);
    }

    let mut messages = vec![ChatMessage::system(system)];
    for turn in turns {
        match TurnRole::parse(&turn.role) {
            Some(TurnRole::User) => messages.push(ChatMessage::user(turn.content.clone())),
            Some(TurnRole::Assistant) => {
                messages.push(ChatMessage::assistant(turn.content.clone()))
            }
            _ => {}
        }
    }
    messages.push(ChatMessage::user(inputs.user_message.to_string()));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ChunkRecord;
    use chrono::Utc;
    use uuid::Uuid;

    fn chunk(file_name: &str, title: &str, section: &str, content: &str) -> RankedChunk {
        RankedChunk {
            chunk: ChunkRecord {
                id: Uuid::new_v4(),
                document_id: Uuid::new_v4(),
                session_id: Uuid::nil(),
                file_name: file_name.to_string(),
                chunk_index: 0,
                content: content.to_string(),
                context_prefix: None,
                enriched_content: content.to_string(),
                title_embedding: Vec::new(),
                content_embedding: Vec::new(),
                token_count: 10,
                document_title: title.to_string(),
                section_title: section.to_string(),
                section_breadcrumb: Vec::new(),
                keywords: Vec::new(),
                associated_image_ids: Vec::new(),
            },
            rrf_score: 0.03,
            rerank_score: Some(0.9),
        }
    }

    fn turn(role: TurnRole, content: &str) -> ChatTurn {
        ChatTurn {
            id: Uuid::new_v4(),
            session_id: Uuid::nil(),
            role: role.as_str().to_string(),
            content: content.to_string(),
            mode_used: "EXPLORING".to_string(),
            token_count: 5,
            is_compacted: false,
            retrieved_context_json: None,
            created_at: Utc::now(),
        }
    }

    fn summary(content: &str) -> Summary {
        Summary {
            id: Uuid::new_v4(),
            session_id: Uuid::nil(),
            summary_content: content.to_string(),
            message_count: 4,
            token_count: 10,
            original_token_count: 100,
            from_timestamp: Utc::now(),
            to_timestamp: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn source_header_format() {
        let chunks = vec![chunk(
            "facts.txt",
            "facts",
            "Geography",
            "Paris is the capital of France.",
        )];
        let context = document_context(&chunks);
        assert!(context.starts_with("=== DOCUMENT CONTEXT ===\n"));
        assert!(context.contains("[Source 1: facts.txt — facts > Section: Geography]"));
        assert!(context.contains("Paris is the capital of France."));
    }

    #[test]
    fn source_header_without_section() {
        let chunks = vec![chunk("notes.txt", "notes", "", "Body.")];
        let context = document_context(&chunks);
        assert!(context.contains("[Source 1: notes.txt — notes]"));
        assert!(!context.contains("Section:"));
    }

    #[test]
    fn system_message_part_order() {
        let chunks = vec![chunk("f.txt", "f", "S", "chunk body")];
        let summaries = vec![summary("earlier recap")];
        let inputs = PromptInputs {
            mode: SessionMode::Research,
            hedge: true,
            topic_index: "Topic index of uploaded documents:\n\nf.txt:\n- topic\n\nuse it",
            memory_block: "Relevant memories from this session:\n- [FACT] x (importance: 0.8)\n",
            summaries: &summaries,
            chunks: &chunks,
            recent_turns: &[],
            user_message: "question?",
        };
        let messages = assemble(&inputs, usize::MAX);
        let system = &messages[0].content;

        let positions: Vec<usize> = [
            BASE_INSTRUCTION,
            SessionMode::Research.prompt_flavor(),
            HEDGING_INSTRUCTION,
            "Topic index of uploaded documents",
            "Relevant memories from this session",
            "Earlier conversation, summarized",
            "=== DOCUMENT CONTEXT ===",
        ]
        .iter()
        .map(|part| system.find(part).unwrap())
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn hedge_absent_when_confident() {
        let inputs = PromptInputs {
            mode: SessionMode::Exploring,
            hedge: false,
            topic_index: "",
            memory_block: "",
            summaries: &[],
            chunks: &[],
            recent_turns: &[],
            user_message: "q",
        };
        let messages = assemble(&inputs, usize::MAX);
        assert!(!messages[0].content.contains(HEDGING_INSTRUCTION));
    }

    #[test]
    fn recent_turns_precede_current_message() {
        let turns = vec![
            turn(TurnRole::User, "first question"),
            turn(TurnRole::Assistant, "first answer"),
        ];
        let inputs = PromptInputs {
            mode: SessionMode::Exploring,
            hedge: false,
            topic_index: "",
            memory_block: "",
            summaries: &[],
            chunks: &[],
            recent_turns: &turns,
            user_message: "second question",
        };
        let messages = assemble(&inputs, usize::MAX);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].content, "first question");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages.last().unwrap().content, "second question");
    }

    #[test]
    fn budget_drops_summaries_before_turns() {
        // Newest-first as fetched from the store: "s..." is newest.
        let summaries = vec![summary(&"s".repeat(2_000)), summary(&"t".repeat(2_000))];
        let turns = vec![
            turn(TurnRole::User, &"u".repeat(200)),
            turn(TurnRole::Assistant, &"a".repeat(200)),
        ];
        let inputs = PromptInputs {
            mode: SessionMode::Exploring,
            hedge: false,
            topic_index: "",
            memory_block: "",
            summaries: &summaries,
            chunks: &[],
            recent_turns: &turns,
            user_message: "q",
        };

        // Roomy enough to keep the turns but only one summary.
        let messages = assemble(&inputs, 3_300);
        let system = &messages[0].content;
        // Newest summary survives, oldest was dropped first; turns intact.
        assert!(system.contains(&"s".repeat(2_000)));
        assert!(!system.contains(&"t".repeat(2_000)));
        assert_eq!(messages.len(), 4);
    }

    #[test]
    fn budget_never_drops_context_or_user_message() {
        let chunks = vec![chunk("f.txt", "f", "", &"c".repeat(2_000))];
        let inputs = PromptInputs {
            mode: SessionMode::Exploring,
            hedge: false,
            topic_index: "",
            memory_block: "",
            summaries: &[],
            chunks: &chunks,
            recent_turns: &[],
            user_message: "the question",
        };
        let messages = assemble(&inputs, 100);
        assert!(messages[0].content.contains(&"c".repeat(2_000)));
        assert_eq!(messages.last().unwrap().content, "the question");
    }

    #[test]
    fn summaries_render_oldest_first() {
        // Store returns newest-first; the prompt shows oldest first.
        let summaries = vec![summary("newest"), summary("oldest")];
        let inputs = PromptInputs {
            mode: SessionMode::Exploring,
            hedge: false,
            topic_index: "",
            memory_block: "",
            summaries: &summaries,
            chunks: &[],
            recent_turns: &[],
            user_message: "q",
        };
        let messages = assemble(&inputs, usize::MAX);
        let system = &messages[0].content;
        assert!(system.find("oldest").unwrap() < system.find("newest").unwrap());
    }
}
