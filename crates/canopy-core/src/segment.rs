//! Paragraph-boundary segmenter.
//!
//! Splits raw text into [`Segment`]s whose text is always an exact slice
//! of the source: `source[span_start..span_end] == segment.text`.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` to `max_chars` using a 4 chars/token ratio.
//! 2. Find paragraphs separated by `\n\n`, trimmed of surrounding whitespace.
//! 3. Extend the current segment paragraph by paragraph until the span
//!    from its first to the next paragraph's last byte would exceed
//!    `max_chars`, then flush.
//! 4. A single paragraph longer than `max_chars` is hard-split at the
//!    last newline or space before the limit.
//! 5. Whitespace-only input yields no segments.
//!
//! # Example
//!
//! ```rust
//! use canopy_core::segment::{ParagraphSegmenter, Segmenter};
//!
//! let text = "Hello world.\n\nSecond paragraph.";
//! let segments = ParagraphSegmenter::new(700).segment(text, 0);
//! assert_eq!(segments.len(), 1);
//! assert_eq!(&text[segments[0].span_start..segments[0].span_end], segments[0].text);
//! ```

use crate::models::Segment;

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Turns raw text into ordered leaf segments.
pub trait Segmenter: Send + Sync {
    /// Segment `text`, numbering segments from `first_index`.
    fn segment(&self, text: &str, first_index: u64) -> Vec<Segment>;
}

/// Default segmenter: paragraph packing with a character budget.
#[derive(Debug, Clone)]
pub struct ParagraphSegmenter {
    max_tokens: usize,
}

impl ParagraphSegmenter {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens: max_tokens.max(1),
        }
    }

    fn max_chars(&self) -> usize {
        self.max_tokens * CHARS_PER_TOKEN
    }
}

impl Default for ParagraphSegmenter {
    fn default() -> Self {
        Self::new(350)
    }
}

impl Segmenter for ParagraphSegmenter {
    fn segment(&self, text: &str, first_index: u64) -> Vec<Segment> {
        let max_chars = self.max_chars();
        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut current: Option<(usize, usize)> = None;

        for (start, end) in paragraphs(text) {
            if let Some((buf_start, _)) = current {
                if end - buf_start > max_chars {
                    spans.extend(current.take());
                }
            }

            if end - start > max_chars {
                spans.extend(current.take());
                spans.extend(hard_split(text, start, end, max_chars));
                continue;
            }

            current = Some(match current {
                Some((buf_start, _)) => (buf_start, end),
                None => (start, end),
            });
        }
        spans.extend(current);

        spans
            .into_iter()
            .enumerate()
            .map(|(i, (s, e))| Segment::new(first_index + i as u64, &text[s..e], s, e))
            .collect()
    }
}

/// Byte ranges of trimmed, non-empty paragraphs.
fn paragraphs(text: &str) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut offset = 0;
    for part in text.split("\n\n") {
        let (s, e) = trim_range(text, offset, offset + part.len());
        if s < e {
            out.push((s, e));
        }
        offset += part.len() + 2;
    }
    out
}

/// Shrink `[start, end)` to exclude leading and trailing whitespace.
fn trim_range(text: &str, start: usize, end: usize) -> (usize, usize) {
    let slice = &text[start..end];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    if lead == slice.len() {
        return (start, start);
    }
    (start + lead, end - trail)
}

/// Split one oversized paragraph at whitespace near the budget.
fn hard_split(text: &str, start: usize, end: usize, max_chars: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut pos = start;
    while pos < end {
        let remaining = &text[pos..end];
        let mut split_at = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
        if split_at == 0 {
            split_at = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }
        if split_at < remaining.len() {
            if let Some(ws) = remaining[..split_at].rfind(['\n', ' ']) {
                if ws > 0 {
                    split_at = ws + 1;
                }
            }
        }
        let (s, e) = trim_range(text, pos, pos + split_at);
        if s < e {
            out.push((s, e));
        }
        pos += split_at;
    }
    out
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_spans(text: &str, segments: &[Segment]) {
        for s in segments {
            assert_eq!(&text[s.span_start..s.span_end], s.text);
        }
    }

    #[test]
    fn small_text_single_segment() {
        let segs = ParagraphSegmenter::new(700).segment("Hello, world!", 0);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].index, 0);
        assert_eq!(segs[0].text, "Hello, world!");
    }

    #[test]
    fn whitespace_only_yields_nothing() {
        assert!(ParagraphSegmenter::new(700).segment("  \n\n \n", 0).is_empty());
        assert!(ParagraphSegmenter::new(700).segment("", 0).is_empty());
    }

    #[test]
    fn paragraphs_exceeding_budget_split() {
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let segs = ParagraphSegmenter::new(8).segment(text, 10);
        assert_eq!(segs.len(), 3);
        for (i, s) in segs.iter().enumerate() {
            assert_eq!(s.index, 10 + i as u64);
        }
        check_spans(text, &segs);
    }

    #[test]
    fn oversized_paragraph_hard_splits_on_space() {
        let text = "word ".repeat(40);
        let segs = ParagraphSegmenter::new(5).segment(&text, 0);
        assert!(segs.len() > 1);
        for s in &segs {
            assert!(s.text.len() <= 20, "{:?}", s.text);
            assert!(!s.text.starts_with(' ') && !s.text.ends_with(' '));
        }
        check_spans(&text, &segs);
    }

    #[test]
    fn multibyte_text_keeps_boundaries() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let segs = ParagraphSegmenter::new(3).segment(text, 0);
        assert!(!segs.is_empty());
        check_spans(text, &segs);
    }

    #[test]
    fn spans_cover_every_paragraph_in_order() {
        let text = (0..30)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let segs = ParagraphSegmenter::new(12).segment(&text, 0);
        check_spans(&text, &segs);
        let joined: String = segs.iter().map(|s| s.text.as_str()).collect::<Vec<_>>().join("\n\n");
        assert_eq!(joined, text);
    }
}
