//! Section-aware sliding-window chunker. Windows walk each section's
//! content (falling back to the whole text when the document has no
//! structure), breaking preferably on paragraph, then sentence, then word
//! boundaries. Offsets are char indices into the parsed `full_text`.

use super::parser::{ExtractedImage, ParsedDocument};

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub size: usize,
    pub overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            size: 400,
            overlap: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DraftChunk {
    pub content: String,
    pub section_title: String,
    pub breadcrumb: Vec<String>,
    /// Start of this chunk in the document's full text, in chars.
    pub document_offset: usize,
    /// Indices into the parsed document's image list.
    pub associated_image_indices: Vec<usize>,
}

pub struct SectionChunker {
    config: ChunkerConfig,
}

impl SectionChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        let overlap = config.overlap.min(config.size.saturating_sub(1));
        Self {
            config: ChunkerConfig {
                size: config.size.max(1),
                overlap,
            },
        }
    }

    pub fn chunk(&self, parsed: &ParsedDocument) -> Vec<DraftChunk> {
        let mut chunks = if parsed.has_section_content() {
            let mut out = Vec::new();
            for section in &parsed.sections {
                if section.content.trim().is_empty() {
                    continue;
                }
                self.chunk_text(
                    &section.content,
                    section.start_offset,
                    &section.title,
                    &section.breadcrumb,
                    &mut out,
                );
            }
            out
        } else {
            let mut out = Vec::new();
            if !parsed.full_text.trim().is_empty() {
                self.chunk_text(&parsed.full_text, 0, "", &[], &mut out);
            }
            out
        };

        associate_images(&mut chunks, &parsed.images);
        chunks
    }

    fn chunk_text(
        &self,
        text: &str,
        base_offset: usize,
        section_title: &str,
        breadcrumb: &[String],
        out: &mut Vec<DraftChunk>,
    ) {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        if total == 0 {
            return;
        }

        let size = self.config.size;
        let overlap = self.config.overlap;
        let mut start = 0usize;

        loop {
            let hard_end = (start + size).min(total);
            let end = if hard_end < total {
                find_break(&chars, start, hard_end)
            } else {
                hard_end
            };

            let content: String = chars[start..end].iter().collect();
            let trimmed = content.trim();
            if !trimmed.is_empty() {
                // Keep the offset pointing at the first retained char.
                let leading = content.chars().take_while(|c| c.is_whitespace()).count();
                out.push(DraftChunk {
                    content: trimmed.to_string(),
                    section_title: section_title.to_string(),
                    breadcrumb: breadcrumb.to_vec(),
                    document_offset: base_offset + start + leading,
                    associated_image_indices: Vec::new(),
                });
            }

            if end >= total {
                break;
            }
            // Overlap with the previous window, always making progress.
            start = end.saturating_sub(overlap).max(start + 1);
        }
    }
}

/// Best split point in `(start, hard_end]`: paragraph break, then sentence
/// end, then whitespace, else the hard cut. Only the last three quarters of
/// the window are searched so chunks cannot collapse to slivers.
fn find_break(chars: &[char], start: usize, hard_end: usize) -> usize {
    let window = hard_end - start;
    let floor = start + window / 4;

    // Paragraph: "\n\n" — split after the pair.
    let mut i = hard_end;
    while i > floor + 1 {
        if chars[i - 1] == '\n' && chars[i - 2] == '\n' {
            return i;
        }
        i -= 1;
    }

    // Sentence: terminator followed by whitespace.
    let mut i = hard_end;
    while i > floor + 1 {
        let prev = chars[i - 2];
        if matches!(prev, '.' | '!' | '?') && chars[i - 1].is_whitespace() {
            return i;
        }
        i -= 1;
    }

    // Word boundary.
    let mut i = hard_end;
    while i > floor {
        if chars[i - 1].is_whitespace() {
            return i;
        }
        i -= 1;
    }

    hard_end
}

/// Attach each image (composites already stand in for their groups) to the
/// single chunk whose span is nearest its approximate offset.
fn associate_images(chunks: &mut [DraftChunk], images: &[ExtractedImage]) {
    if chunks.is_empty() {
        return;
    }
    for (image_idx, image) in images.iter().enumerate() {
        let offset = image.approximate_offset;
        let mut best = 0usize;
        let mut best_distance = usize::MAX;
        for (chunk_idx, chunk) in chunks.iter().enumerate() {
            let start = chunk.document_offset;
            let end = start + chunk.content.chars().count();
            let distance = if offset >= start && offset < end {
                0
            } else if offset < start {
                start - offset
            } else {
                offset - end + 1
            };
            if distance < best_distance {
                best_distance = distance;
                best = chunk_idx;
            }
        }
        chunks[best].associated_image_indices.push(image_idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parser::{DocumentParser, Section, MIME_MARKDOWN};

    fn parsed_with_text(text: &str) -> ParsedDocument {
        ParsedDocument {
            full_text: text.to_string(),
            ..ParsedDocument::default()
        }
    }

    fn small_chunker() -> SectionChunker {
        SectionChunker::new(ChunkerConfig {
            size: 40,
            overlap: 8,
        })
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        let chunks = small_chunker().chunk(&parsed_with_text(""));
        assert!(chunks.is_empty());
        let chunks = small_chunker().chunk(&parsed_with_text("   \n "));
        assert!(chunks.is_empty());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = small_chunker().chunk(&parsed_with_text("tiny document"));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "tiny document");
        assert_eq!(chunks[0].document_offset, 0);
        assert!(chunks[0].breadcrumb.is_empty());
    }

    #[test]
    fn offsets_are_monotonic() {
        let text = "one two three four five six seven eight nine ten eleven twelve \
                    thirteen fourteen fifteen sixteen seventeen eighteen nineteen twenty";
        let chunks = small_chunker().chunk(&parsed_with_text(text));
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert!(pair[0].document_offset <= pair[1].document_offset);
        }
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let text = "First paragraph ends here.\n\nSecond paragraph starts and keeps going for a while.";
        let chunks = SectionChunker::new(ChunkerConfig {
            size: 40,
            overlap: 0,
        })
        .chunk(&parsed_with_text(text));
        assert_eq!(chunks[0].content, "First paragraph ends here.");
    }

    #[test]
    fn falls_back_to_sentence_breaks() {
        let text = "A short sentence. Another one follows it directly without paragraph breaks anywhere.";
        let chunks = SectionChunker::new(ChunkerConfig {
            size: 40,
            overlap: 0,
        })
        .chunk(&parsed_with_text(text));
        assert!(chunks[0].content.ends_with('.'));
    }

    #[test]
    fn sections_carry_breadcrumbs() {
        let md = "# Guide\n\nIntro paragraph with enough words to be a chunk.\n\n\
                  ## Setup\n\nSetup body text that also has some length to it.\n";
        let parsed = DocumentParser::parse(md.as_bytes(), MIME_MARKDOWN).unwrap();
        let chunks = SectionChunker::new(ChunkerConfig::default()).chunk(&parsed);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].breadcrumb, vec!["Guide"]);
        assert_eq!(chunks[1].breadcrumb, vec!["Guide", "Setup"]);
        assert_eq!(chunks[1].section_title, "Setup");
    }

    #[test]
    fn section_offsets_point_into_full_text() {
        let md = "# A\n\nAlpha body.\n\n# B\n\nBeta body.\n";
        let parsed = DocumentParser::parse(md.as_bytes(), MIME_MARKDOWN).unwrap();
        let chunks = SectionChunker::new(ChunkerConfig::default()).chunk(&parsed);
        for chunk in &chunks {
            let slice: String = parsed
                .full_text
                .chars()
                .skip(chunk.document_offset)
                .take(chunk.content.chars().count())
                .collect();
            assert_eq!(slice, chunk.content);
        }
    }

    #[test]
    fn empty_sections_fall_back_to_full_text() {
        let parsed = ParsedDocument {
            full_text: "body without headings".to_string(),
            sections: vec![Section {
                title: "Empty".into(),
                depth: 1,
                breadcrumb: vec!["Empty".into()],
                content: "   ".into(),
                start_offset: 0,
                end_offset: 3,
            }],
            ..ParsedDocument::default()
        };
        let chunks = small_chunker().chunk(&parsed);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].breadcrumb.is_empty());
    }

    #[test]
    fn image_attaches_to_nearest_chunk_once() {
        let mut parsed = parsed_with_text(
            "first window of words that runs long enough. second window continues with more words here.",
        );
        parsed.images.push(ExtractedImage {
            bytes: Vec::new(),
            mime: "image/png".into(),
            alt_text: String::new(),
            approximate_offset: 60,
            page_number: Some(1),
            x_pdf: Some(0.0),
            y_pdf: Some(0.0),
            width: 10.0,
            height: 10.0,
            spatial_group_id: Some(0),
        });

        let chunks = SectionChunker::new(ChunkerConfig {
            size: 48,
            overlap: 0,
        })
        .chunk(&parsed);

        let attached: Vec<usize> = chunks
            .iter()
            .flat_map(|c| c.associated_image_indices.clone())
            .collect();
        assert_eq!(attached, vec![0]);

        // Exactly one chunk owns the composite.
        let owners = chunks
            .iter()
            .filter(|c| !c.associated_image_indices.is_empty())
            .count();
        assert_eq!(owners, 1);
    }

    #[test]
    fn chunking_is_deterministic() {
        let md = "# T\n\nBody text that is repeated exactly between runs.\n";
        let parsed = DocumentParser::parse(md.as_bytes(), MIME_MARKDOWN).unwrap();
        let a = SectionChunker::new(ChunkerConfig::default()).chunk(&parsed);
        let b = SectionChunker::new(ChunkerConfig::default()).chunk(&parsed);
        let texts_a: Vec<&str> = a.iter().map(|c| c.content.as_str()).collect();
        let texts_b: Vec<&str> = b.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(texts_a, texts_b);
    }
}
