pub mod chunker;
pub mod parser;
pub mod spatial;

pub use chunker::{ChunkerConfig, DraftChunk, SectionChunker};
pub use parser::{DocumentParser, ExtractedImage, ParseError, ParsedDocument, Section};
pub use spatial::{apply_composites, group_images, SpatialConfig};
