// Segment Parser: extracts timing and protection metadata from downloaded segments.

use bytes::Bytes;

use crate::error::ParseError;
use crate::manifest::ProtectionData;
use crate::sink::ChunkContext;

/// Metadata carried by an initialization segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitMetadata {
    pub timescale: Option<u32>,
    pub protection_data: Vec<ProtectionData>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMediaChunk {
    pub data: Bytes,
    /// Media time covered by the chunk, in seconds.
    pub start: f64,
    pub end: f64,
    pub protection_data: Vec<ProtectionData>,
}

pub trait SegmentParser: Send + Sync {
    fn parse_init(&self, context: &ChunkContext, data: &Bytes) -> Result<InitMetadata, ParseError>;

    /// Whether media chunks of `context` can only be parsed once the
    /// initialization metadata is known.
    fn needs_init_metadata(&self, context: &ChunkContext) -> bool;

    fn parse_media(
        &self,
        context: &ChunkContext,
        data: Bytes,
        init: Option<&InitMetadata>,
    ) -> Result<ParsedMediaChunk, ParseError>;
}

/// Parser passing bytes through untouched, taking every time from the segment index.
///
/// Media parsing waits for the init segment whenever the representation has one, so
/// the index timescale is confirmed before any media reaches the sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSegmentParser;

impl SegmentParser for RawSegmentParser {
    fn parse_init(&self, context: &ChunkContext, data: &Bytes) -> Result<InitMetadata, ParseError> {
        if data.is_empty() {
            return Err(ParseError::new(format!(
                "empty initialization segment `{}`",
                context.segment.id
            )));
        }
        Ok(InitMetadata {
            timescale: Some(context.segment.timescale),
            protection_data: context.representation.protection_data.clone(),
        })
    }

    fn needs_init_metadata(&self, context: &ChunkContext) -> bool {
        context.representation.index.init_segment().is_some()
    }

    fn parse_media(
        &self,
        context: &ChunkContext,
        data: Bytes,
        init: Option<&InitMetadata>,
    ) -> Result<ParsedMediaChunk, ParseError> {
        let segment = &context.segment;
        if let Some(timescale) = init.and_then(|m| m.timescale)
            && timescale == 0
        {
            return Err(ParseError::new("initialization segment declares a zero timescale"));
        }
        Ok(ParsedMediaChunk {
            data,
            start: segment.time,
            end: segment.end,
            protection_data: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{chunk_context, video_content};

    #[test]
    fn test_raw_parser_uses_segment_times() {
        let content = video_content(1_000_000.0);
        let ctx = chunk_context(&content, "s3", 18.0, 6.0);
        let parsed = RawSegmentParser
            .parse_media(&ctx, Bytes::from_static(b"moof"), None)
            .unwrap();
        assert_eq!((parsed.start, parsed.end), (18.0, 24.0));
        assert_eq!(parsed.data.len(), 4);
    }

    #[test]
    fn test_empty_init_segment_is_rejected() {
        let content = video_content(1_000_000.0);
        let ctx = chunk_context(&content, "init", 0.0, 0.0);
        assert!(RawSegmentParser.parse_init(&ctx, &Bytes::new()).is_err());
        let meta = RawSegmentParser
            .parse_init(&ctx, &Bytes::from_static(b"moov"))
            .unwrap();
        assert_eq!(meta.timescale, Some(1));
    }
}
