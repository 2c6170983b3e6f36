//! Document parsers. `parse(bytes, mime)` turns an upload into a
//! [`ParsedDocument`]: plain full text, a section tree addressed by char
//! offsets into that text, tables rendered as GFM, and extracted images with
//! spatial metadata (PDF only). Parse failures are terminal for the
//! document; the lifecycle service maps them to FAILED.

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unsupported document type: {0}")]
    Unsupported(String),

    #[error("corrupt document: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub full_text: String,
    pub sections: Vec<Section>,
    pub tables: Vec<Table>,
    pub images: Vec<ExtractedImage>,
}

impl ParsedDocument {
    pub fn has_section_content(&self) -> bool {
        self.sections.iter().any(|s| !s.content.trim().is_empty())
    }
}

/// One node of the section tree, flattened in document order. `breadcrumb`
/// is the path of titles from the root down to (and including) this section.
#[derive(Debug, Clone)]
pub struct Section {
    pub title: String,
    pub depth: usize,
    pub breadcrumb: Vec<String>,
    pub content: String,
    /// Char offsets into `full_text` covering `content`.
    pub start_offset: usize,
    pub end_offset: usize,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub gfm: String,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct ExtractedImage {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub alt_text: String,
    /// Best-effort char offset into `full_text` for chunk association.
    pub approximate_offset: usize,
    pub page_number: Option<u32>,
    /// PDF coordinates in points (origin bottom-left), absent for other formats.
    pub x_pdf: Option<f32>,
    pub y_pdf: Option<f32>,
    pub width: f32,
    pub height: f32,
    /// Set on composite images produced by spatial grouping.
    pub spatial_group_id: Option<i32>,
}

pub struct DocumentParser;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_EPUB: &str = "application/epub+zip";
pub const MIME_HTML: &str = "text/html";
pub const MIME_XHTML: &str = "application/xhtml+xml";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_TEXT: &str = "text/plain";

impl DocumentParser {
    pub fn is_supported(mime: &str) -> bool {
        matches!(
            mime,
            MIME_PDF | MIME_DOCX | MIME_EPUB | MIME_HTML | MIME_XHTML | MIME_MARKDOWN | MIME_TEXT
        )
    }

    pub fn parse(bytes: &[u8], mime: &str) -> Result<ParsedDocument, ParseError> {
        match mime {
            MIME_PDF => parse_pdf(bytes),
            MIME_DOCX => parse_docx(bytes),
            MIME_EPUB => parse_epub(bytes),
            MIME_HTML | MIME_XHTML => {
                let mut builder = DocBuilder::new();
                parse_html_into(&String::from_utf8_lossy(bytes), &mut builder);
                Ok(builder.finish())
            }
            MIME_MARKDOWN => {
                let mut builder = DocBuilder::new();
                parse_markdown_into(&String::from_utf8_lossy(bytes), &mut builder);
                Ok(builder.finish())
            }
            MIME_TEXT => Ok(ParsedDocument {
                full_text: String::from_utf8_lossy(bytes).into_owned(),
                ..ParsedDocument::default()
            }),
            other => Err(ParseError::Unsupported(other.to_string())),
        }
    }
}

// ===== shared builder =====

/// Accumulates full text and the section tree in one pass. Section content
/// is appended identically to `full_text` and the per-section buffer, so a
/// section's `[start_offset, end_offset)` always slices `full_text` exactly.
struct DocBuilder {
    full_text: String,
    char_len: usize,
    heading_stack: Vec<(usize, String)>,
    current: Option<SectionDraft>,
    sections: Vec<Section>,
    tables: Vec<Table>,
    images: Vec<ExtractedImage>,
}

struct SectionDraft {
    title: String,
    depth: usize,
    breadcrumb: Vec<String>,
    start_offset: usize,
    content: String,
}

impl DocBuilder {
    fn new() -> Self {
        Self {
            full_text: String::new(),
            char_len: 0,
            heading_stack: Vec::new(),
            current: None,
            sections: Vec::new(),
            tables: Vec::new(),
            images: Vec::new(),
        }
    }

    fn push_text(&mut self, text: &str) {
        self.full_text.push_str(text);
        self.char_len += text.chars().count();
    }

    fn heading(&mut self, depth: usize, title: &str) {
        let title = title.trim();
        if title.is_empty() {
            return;
        }
        self.close_section();

        while self
            .heading_stack
            .last()
            .is_some_and(|(d, _)| *d >= depth)
        {
            self.heading_stack.pop();
        }
        self.heading_stack.push((depth, title.to_string()));

        self.push_text(title);
        self.push_text("\n\n");

        let breadcrumb: Vec<String> =
            self.heading_stack.iter().map(|(_, t)| t.clone()).collect();
        self.current = Some(SectionDraft {
            title: title.to_string(),
            depth,
            breadcrumb,
            start_offset: self.char_len,
            content: String::new(),
        });
    }

    fn paragraph(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.body_text(text);
    }

    /// Raw body text appended verbatim (plus paragraph separator) to both the
    /// full text and the open section.
    fn body_text(&mut self, text: &str) {
        self.push_text(text);
        self.push_text("\n\n");
        if let Some(draft) = self.current.as_mut() {
            draft.content.push_str(text);
            draft.content.push_str("\n\n");
        }
    }

    fn table(&mut self, gfm: String) {
        if gfm.trim().is_empty() {
            return;
        }
        self.tables.push(Table {
            gfm: gfm.clone(),
            offset: self.char_len,
        });
        self.body_text(&gfm);
    }

    fn image(&mut self, image: ExtractedImage) {
        self.images.push(image);
    }

    fn close_section(&mut self) {
        if let Some(draft) = self.current.take() {
            let content_len = draft.content.chars().count();
            self.sections.push(Section {
                title: draft.title,
                depth: draft.depth,
                breadcrumb: draft.breadcrumb,
                start_offset: draft.start_offset,
                end_offset: draft.start_offset + content_len,
                content: draft.content,
            });
        }
    }

    fn finish(mut self) -> ParsedDocument {
        self.close_section();
        ParsedDocument {
            full_text: self.full_text,
            sections: self.sections,
            tables: self.tables,
            images: self.images,
        }
    }
}

// ===== PDF =====

fn parse_pdf(bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
    let doc = lopdf::Document::load_mem(bytes)
        .map_err(|e| ParseError::Corrupt(format!("pdf: {e}")))?;
    let page_count = doc.get_pages().len();

    let mut full_text = String::new();
    let mut page_offsets = Vec::with_capacity(page_count);
    let mut char_len = 0usize;

    for page_num in 1..=page_count {
        page_offsets.push(char_len);
        if let Ok(text) = doc.extract_text(&[page_num as u32]) {
            char_len += text.chars().count() + 1;
            full_text.push_str(&text);
            full_text.push('\n');
        }
    }

    let images = extract_pdf_images(bytes, &page_offsets);

    Ok(ParsedDocument {
        full_text,
        sections: Vec::new(),
        tables: Vec::new(),
        images,
    })
}

/// Extract embedded page images with their position on the page, through
/// pdfium. When the pdfium library cannot be bound the document still
/// parses; it just carries no images.
fn extract_pdf_images(bytes: &[u8], page_offsets: &[usize]) -> Vec<ExtractedImage> {
    use pdfium_render::prelude::*;

    let pdfium = match Pdfium::bind_to_system_library() {
        Ok(bindings) => Pdfium::new(bindings),
        Err(e) => {
            warn!(error = %e, "pdfium unavailable, skipping pdf image extraction");
            return Vec::new();
        }
    };

    let doc = match pdfium.load_pdf_from_byte_vec(bytes.to_vec(), None) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(error = %e, "pdfium failed to open document, skipping images");
            return Vec::new();
        }
    };

    let mut images = Vec::new();
    for (page_idx, page) in doc.pages().iter().enumerate() {
        let offset = page_offsets.get(page_idx).copied().unwrap_or(0);
        for object in page.objects().iter() {
            let Some(image_object) = object.as_image_object() else {
                continue;
            };
            let Ok(bounds) = image_object.bounds() else {
                continue;
            };
            let Ok(raw) = image_object.get_raw_image() else {
                continue;
            };

            let mut png = Vec::new();
            if raw
                .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
                .is_err()
            {
                continue;
            }

            let left = bounds.left().value;
            let bottom = bounds.bottom().value;
            images.push(ExtractedImage {
                bytes: png,
                mime: "image/png".to_string(),
                alt_text: String::new(),
                approximate_offset: offset,
                page_number: Some(page_idx as u32 + 1),
                x_pdf: Some(left),
                y_pdf: Some(bottom),
                width: bounds.right().value - left,
                height: bounds.top().value - bottom,
                spatial_group_id: None,
            });
        }
    }

    debug!(count = images.len(), "pdf images extracted");
    images
}

// ===== XHTML =====

fn parse_html_into(html: &str, builder: &mut DocBuilder) {
    let document = scraper::Html::parse_document(html);
    walk_html(*document.root_element(), builder);
}

fn walk_html(node: ego_tree::NodeRef<'_, scraper::Node>, builder: &mut DocBuilder) {
    if let Some(element) = scraper::ElementRef::wrap(node) {
        let name = element.value().name();
        match name {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let depth = name[1..].parse::<usize>().unwrap_or(6);
                let title = element.text().collect::<String>();
                builder.heading(depth, &title);
                return;
            }
            "p" | "li" | "pre" | "blockquote" => {
                let text = element.text().collect::<String>();
                builder.paragraph(&text);
                return;
            }
            "table" => {
                builder.table(html_table_to_gfm(element));
                return;
            }
            "script" | "style" | "head" => return,
            _ => {}
        }
    }
    for child in node.children() {
        walk_html(child, builder);
    }
}

fn html_table_to_gfm(table: scraper::ElementRef<'_>) -> String {
    use once_cell::sync::Lazy;
    static ROW_SELECTOR: Lazy<scraper::Selector> =
        Lazy::new(|| scraper::Selector::parse("tr").expect("static selector"));
    static CELL_SELECTOR: Lazy<scraper::Selector> =
        Lazy::new(|| scraper::Selector::parse("th, td").expect("static selector"));

    let mut rows: Vec<Vec<String>> = Vec::new();
    for row in table.select(&ROW_SELECTOR) {
        let cells: Vec<String> = row
            .select(&CELL_SELECTOR)
            .map(|c| c.text().collect::<String>().trim().replace('|', "\\|"))
            .collect();
        if !cells.is_empty() {
            rows.push(cells);
        }
    }
    rows_to_gfm(&rows)
}

fn rows_to_gfm(rows: &[Vec<String>]) -> String {
    if rows.is_empty() {
        return String::new();
    }
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut out = String::new();
    for (i, row) in rows.iter().enumerate() {
        out.push('|');
        for col in 0..width {
            out.push(' ');
            out.push_str(row.get(col).map(String::as_str).unwrap_or(""));
            out.push_str(" |");
        }
        out.push('\n');
        if i == 0 {
            out.push('|');
            for _ in 0..width {
                out.push_str(" --- |");
            }
            out.push('\n');
        }
    }
    out.trim_end().to_string()
}

// ===== Markdown =====

fn parse_markdown_into(markdown: &str, builder: &mut DocBuilder) {
    use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd};

    let parser = Parser::new_ext(markdown, Options::ENABLE_TABLES);

    let mut text_buf = String::new();
    let mut heading_depth: Option<usize> = None;
    let mut table_rows: Vec<Vec<String>> = Vec::new();
    let mut table_row: Vec<String> = Vec::new();
    let mut in_table = false;

    fn level_depth(level: HeadingLevel) -> usize {
        match level {
            HeadingLevel::H1 => 1,
            HeadingLevel::H2 => 2,
            HeadingLevel::H3 => 3,
            HeadingLevel::H4 => 4,
            HeadingLevel::H5 => 5,
            HeadingLevel::H6 => 6,
        }
    }

    for event in parser {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                heading_depth = Some(level_depth(level));
                text_buf.clear();
            }
            Event::End(TagEnd::Heading(_)) => {
                if let Some(depth) = heading_depth.take() {
                    let title = std::mem::take(&mut text_buf);
                    builder.heading(depth, &title);
                }
            }
            Event::Start(Tag::Table(_)) => {
                in_table = true;
                table_rows.clear();
            }
            Event::End(TagEnd::Table) => {
                in_table = false;
                builder.table(rows_to_gfm(&table_rows));
            }
            Event::Start(Tag::TableRow) | Event::Start(Tag::TableHead) => {
                table_row.clear();
            }
            Event::End(TagEnd::TableRow) | Event::End(TagEnd::TableHead) => {
                if !table_row.is_empty() {
                    table_rows.push(std::mem::take(&mut table_row));
                }
            }
            Event::Start(Tag::TableCell) => {
                text_buf.clear();
            }
            Event::End(TagEnd::TableCell) => {
                table_row.push(std::mem::take(&mut text_buf).trim().to_string());
            }
            Event::Start(Tag::Paragraph) | Event::Start(Tag::Item) => {
                if !in_table {
                    text_buf.clear();
                }
            }
            Event::End(TagEnd::Paragraph) | Event::End(TagEnd::Item) => {
                if !in_table {
                    let text = std::mem::take(&mut text_buf);
                    builder.paragraph(&text);
                }
            }
            Event::Text(t) | Event::Code(t) => {
                text_buf.push_str(&t);
            }
            Event::SoftBreak | Event::HardBreak => {
                text_buf.push(' ');
            }
            _ => {}
        }
    }

    // Trailing text outside any closed paragraph.
    if !text_buf.trim().is_empty() {
        let text = std::mem::take(&mut text_buf);
        builder.paragraph(&text);
    }
}

// ===== DOCX =====

fn parse_docx(bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
    use docx_rs::{
        DocumentChild, ParagraphChild, RunChild, TableCellContent, TableChild, TableRowChild,
    };

    let docx =
        docx_rs::read_docx(bytes).map_err(|e| ParseError::Corrupt(format!("docx: {e:?}")))?;

    let mut builder = DocBuilder::new();

    for child in docx.document.children {
        match child {
            DocumentChild::Paragraph(para) => {
                let style = para
                    .property
                    .style
                    .as_ref()
                    .map(|s| s.val.clone())
                    .unwrap_or_default();

                let mut text = String::new();
                for pc in &para.children {
                    if let ParagraphChild::Run(run) = pc {
                        for rc in &run.children {
                            if let RunChild::Text(t) = rc {
                                text.push_str(&t.text);
                            }
                        }
                    }
                }

                if let Some(depth) = heading_style_depth(&style) {
                    builder.heading(depth, &text);
                } else {
                    builder.paragraph(&text);
                }
            }
            DocumentChild::Table(table) => {
                let mut rows: Vec<Vec<String>> = Vec::new();
                for tc in &table.rows {
                    let TableChild::TableRow(row) = tc;
                    let mut cells = Vec::new();
                    for rc in &row.cells {
                        let TableRowChild::TableCell(cell) = rc;
                        let mut cell_text = String::new();
                        for content in &cell.children {
                            if let TableCellContent::Paragraph(p) = content {
                                for pc in &p.children {
                                    if let ParagraphChild::Run(run) = pc {
                                        for rc in &run.children {
                                            if let RunChild::Text(t) = rc {
                                                cell_text.push_str(&t.text);
                                            }
                                        }
                                    }
                                }
                            }
                        }
                        cells.push(cell_text.trim().replace('|', "\\|"));
                    }
                    if !cells.is_empty() {
                        rows.push(cells);
                    }
                }
                builder.table(rows_to_gfm(&rows));
            }
            _ => {}
        }
    }

    Ok(builder.finish())
}

fn heading_style_depth(style: &str) -> Option<usize> {
    let rest = style.strip_prefix("Heading")?;
    let depth: usize = rest.parse().ok()?;
    (1..=6).contains(&depth).then_some(depth)
}

// ===== EPUB =====

fn parse_epub(bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
    use std::io::Read;

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ParseError::Corrupt(format!("epub: {e}")))?;

    let mut content_names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|f| f.name().to_string()))
        .filter(|name| {
            let lower = name.to_lowercase();
            lower.ends_with(".xhtml") || lower.ends_with(".html") || lower.ends_with(".htm")
        })
        .collect();
    content_names.sort();

    if content_names.is_empty() {
        return Err(ParseError::Corrupt("epub: no xhtml content entries".into()));
    }

    let mut builder = DocBuilder::new();
    for name in content_names {
        let mut file = archive
            .by_name(&name)
            .map_err(|e| ParseError::Corrupt(format!("epub entry {name}: {e}")))?;
        let mut html = String::new();
        file.read_to_string(&mut html)
            .map_err(|e| ParseError::Corrupt(format!("epub entry {name}: {e}")))?;
        parse_html_into(&html, &mut builder);
    }

    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_sections_and_offsets() {
        let md = "# Intro\n\nFirst paragraph.\n\n## Details\n\nSecond paragraph here.\n";
        let doc = DocumentParser::parse(md.as_bytes(), MIME_MARKDOWN).unwrap();

        assert_eq!(doc.sections.len(), 2);
        assert_eq!(doc.sections[0].title, "Intro");
        assert_eq!(doc.sections[0].breadcrumb, vec!["Intro"]);
        assert_eq!(doc.sections[1].breadcrumb, vec!["Intro", "Details"]);

        // Offsets slice full_text exactly.
        for section in &doc.sections {
            let sliced: String = doc
                .full_text
                .chars()
                .skip(section.start_offset)
                .take(section.end_offset - section.start_offset)
                .collect();
            assert_eq!(sliced, section.content);
        }
    }

    #[test]
    fn markdown_sibling_headings_share_parent() {
        let md = "# Root\n\nx\n\n## A\n\na\n\n## B\n\nb\n";
        let doc = DocumentParser::parse(md.as_bytes(), MIME_MARKDOWN).unwrap();
        let b = doc.sections.iter().find(|s| s.title == "B").unwrap();
        assert_eq!(b.breadcrumb, vec!["Root", "B"]);
    }

    #[test]
    fn markdown_table_renders_gfm() {
        let md = "| a | b |\n| --- | --- |\n| 1 | 2 |\n";
        let doc = DocumentParser::parse(md.as_bytes(), MIME_MARKDOWN).unwrap();
        assert_eq!(doc.tables.len(), 1);
        assert!(doc.tables[0].gfm.contains("| a | b |"));
        assert!(doc.tables[0].gfm.contains("| --- | --- |"));
        assert!(doc.tables[0].gfm.contains("| 1 | 2 |"));
    }

    #[test]
    fn html_headings_map_to_section_stack() {
        let html = "<html><body>\
            <h1>Guide</h1><p>Welcome text.</p>\
            <h2>Setup</h2><p>Install steps.</p>\
            <table><tr><th>k</th><th>v</th></tr><tr><td>x</td><td>1</td></tr></table>\
            </body></html>";
        let doc = DocumentParser::parse(html.as_bytes(), MIME_HTML).unwrap();

        assert_eq!(doc.sections.len(), 2);
        assert_eq!(doc.sections[1].breadcrumb, vec!["Guide", "Setup"]);
        assert!(doc.sections[1].content.contains("Install steps."));
        assert_eq!(doc.tables.len(), 1);
        assert!(doc.tables[0].gfm.starts_with("| k | v |"));
        assert!(doc.full_text.contains("Welcome text."));
    }

    #[test]
    fn html_skips_script_and_style() {
        let html = "<html><head><style>p{}</style></head>\
            <body><script>var x=1;</script><p>Visible.</p></body></html>";
        let doc = DocumentParser::parse(html.as_bytes(), MIME_HTML).unwrap();
        assert!(doc.full_text.contains("Visible."));
        assert!(!doc.full_text.contains("var x"));
    }

    #[test]
    fn plain_text_has_no_sections() {
        let doc = DocumentParser::parse(b"just some text", MIME_TEXT).unwrap();
        assert!(doc.sections.is_empty());
        assert_eq!(doc.full_text, "just some text");
    }

    #[test]
    fn empty_input_yields_empty_document() {
        let doc = DocumentParser::parse(b"", MIME_TEXT).unwrap();
        assert!(doc.full_text.is_empty());
        assert!(!doc.has_section_content());
    }

    #[test]
    fn unsupported_mime_is_rejected() {
        let err = DocumentParser::parse(b"x", "application/zip").unwrap_err();
        assert!(matches!(err, ParseError::Unsupported(_)));
    }

    #[test]
    fn corrupt_pdf_is_a_parse_error() {
        let err = DocumentParser::parse(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, ParseError::Corrupt(_)));
    }

    #[test]
    fn parse_is_deterministic() {
        let md = "# T\n\nSome body text.\n\n## U\n\nMore text.\n";
        let a = DocumentParser::parse(md.as_bytes(), MIME_MARKDOWN).unwrap();
        let b = DocumentParser::parse(md.as_bytes(), MIME_MARKDOWN).unwrap();
        assert_eq!(a.full_text, b.full_text);
        let crumbs_a: Vec<_> = a.sections.iter().map(|s| s.breadcrumb.clone()).collect();
        let crumbs_b: Vec<_> = b.sections.iter().map(|s| s.breadcrumb.clone()).collect();
        assert_eq!(crumbs_a, crumbs_b);
    }

    #[test]
    fn gfm_pads_ragged_rows() {
        let rows = vec![
            vec!["a".to_string(), "b".to_string()],
            vec!["only".to_string()],
        ];
        let gfm = rows_to_gfm(&rows);
        let lines: Vec<&str> = gfm.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2].matches('|').count(), 3);
    }
}
