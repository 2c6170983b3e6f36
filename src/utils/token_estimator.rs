//! Cheap token estimation used for prompt budgeting and compaction
//! accounting. The chat model's real tokenizer is not available in-process,
//! so we approximate at ~4 characters per token.

use unicode_segmentation::UnicodeSegmentation;

const CHARS_PER_TOKEN: usize = 4;

/// Estimate tokens for a piece of text. Counts grapheme clusters so CJK and
/// combining sequences do not inflate the estimate.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let chars = text.graphemes(true).count();
    (chars + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN
}

/// Sum of estimates over several texts.
pub fn estimate_total<'a, I: IntoIterator<Item = &'a str>>(texts: I) -> usize {
    texts.into_iter().map(estimate_tokens).sum()
}
