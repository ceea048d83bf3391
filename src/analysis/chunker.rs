//! Splitting file content into chunks.
//!
//! Two independent policies share the same line bookkeeping:
//! fixed line-count runs, and whole lines accumulated up to a size budget.
//! Line numbers are 1-based and inclusive in the original file.

use std::borrow::Cow;

/// One line-bounded segment of a file, with its absolute position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeChunk {
    /// Position among the emitted (non-empty) chunks.
    pub index: usize,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
    pub line_count: usize,
}

/// `\r\n` and lone `\r` become `\n`.
pub fn normalize_line_endings(content: &str) -> Cow<'_, str> {
    if content.contains('\r') {
        Cow::Owned(content.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(content)
    }
}

/// Runs of `lines_per_chunk` lines. Whitespace-only runs are dropped but
/// still advance the line counter.
pub fn chunk_by_lines(content: &str, lines_per_chunk: usize) -> Vec<CodeChunk> {
    let normalized = normalize_line_endings(content);
    if normalized.is_empty() {
        return Vec::new();
    }
    let per_chunk = lines_per_chunk.max(1);
    let lines: Vec<&str> = normalized.split('\n').collect();

    let mut chunks = Vec::new();
    let mut start_line = 1;
    for run in lines.chunks(per_chunk) {
        let content = run.join("\n");
        let line_count = run.len();
        if !content.trim().is_empty() {
            chunks.push(CodeChunk {
                index: chunks.len(),
                content,
                start_line,
                end_line: start_line + line_count - 1,
                line_count,
            });
        }
        start_line += line_count;
    }
    chunks
}

/// Rough token estimate: four bytes per token, rounded up.
pub fn estimate_tokens(text: &[u8]) -> usize {
    text.len().div_ceil(4)
}

/// Whole lines accumulated while their token estimate stays within
/// `max_tokens`. A single line over budget becomes its own chunk.
pub fn chunk_by_tokens(content: &str, max_tokens: usize) -> Vec<CodeChunk> {
    let normalized = normalize_line_endings(content);
    let pieces = split_by_budget(normalized.as_bytes(), max_tokens, estimate_tokens);

    let mut chunks = Vec::new();
    let mut start_line = 1;
    for piece in pieces {
        let text = String::from_utf8_lossy(piece);
        let body = text.strip_suffix('\n').unwrap_or(&*text);
        let line_count = body.split('\n').count();
        if !body.trim().is_empty() {
            chunks.push(CodeChunk {
                index: chunks.len(),
                content: body.to_string(),
                start_line,
                end_line: start_line + line_count - 1,
                line_count,
            });
        }
        start_line += line_count;
    }
    chunks
}

/// Byte-exact split on line boundaries: each piece keeps its trailing
/// newline, so concatenating the pieces reproduces `bytes`. `measure`
/// sizes a candidate piece against `budget`; lines are never split.
pub fn split_by_budget(
    bytes: &[u8],
    budget: usize,
    measure: impl Fn(&[u8]) -> usize,
) -> Vec<&[u8]> {
    let mut pieces = Vec::new();
    let mut piece_start = 0;
    let mut cursor = 0;
    while cursor < bytes.len() {
        let line_end = bytes[cursor..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(bytes.len(), |p| cursor + p + 1);
        if cursor > piece_start && measure(&bytes[piece_start..line_end]) > budget {
            pieces.push(&bytes[piece_start..cursor]);
            piece_start = cursor;
        }
        cursor = line_end;
    }
    if piece_start < bytes.len() {
        pieces.push(&bytes[piece_start..]);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> String {
        (1..=n).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn line_chunks_cover_the_file() {
        let content = numbered(250);
        let chunks = chunk_by_lines(&content, 100);
        let ranges: Vec<_> = chunks.iter().map(|c| (c.start_line, c.end_line)).collect();
        assert_eq!(ranges, vec![(1, 100), (101, 200), (201, 250)]);
        assert_eq!(chunks[2].line_count, 50);
        let joined = chunks.iter().map(|c| c.content.as_str()).collect::<Vec<_>>().join("\n");
        assert_eq!(joined, content);
    }

    #[test]
    fn whitespace_runs_are_dropped_but_counted() {
        let content = "a\nb\n  \n\t\n\nc";
        let chunks = chunk_by_lines(content, 2);
        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 2));
        assert_eq!((chunks[1].start_line, chunks[1].end_line), (5, 6));
        assert_eq!(chunks[1].index, 1);
    }

    #[test]
    fn crlf_and_cr_are_normalized() {
        let chunks = chunk_by_lines("a\r\nb\rc", 10);
        assert_eq!(chunks[0].content, "a\nb\nc");
        assert_eq!(chunks[0].line_count, 3);
    }

    #[test]
    fn empty_content_has_no_chunks() {
        assert!(chunk_by_lines("", 100).is_empty());
        assert!(chunk_by_tokens("", 100).is_empty());
    }

    #[test]
    fn budget_split_is_byte_exact_and_line_aligned() {
        let data = b"aaaa\nbbbb\ncccc\ndd";
        let pieces = split_by_budget(data, 10, |p| p.len());
        assert_eq!(pieces, vec![&b"aaaa\nbbbb\n"[..], &b"cccc\ndd"[..]]);
        assert_eq!(pieces.concat(), data.to_vec());
    }

    #[test]
    fn oversized_line_stands_alone() {
        let data = b"short\nthis line is far too long\nx\n";
        let pieces = split_by_budget(data, 8, |p| p.len());
        assert_eq!(pieces[1], b"this line is far too long\n");
        assert_eq!(pieces.concat(), data.to_vec());
    }

    #[test]
    fn token_chunks_track_lines() {
        let content = numbered(30);
        let chunks = chunk_by_tokens(&content, 20);
        assert!(chunks.len() > 1);
        let mut expected_start = 1;
        for chunk in &chunks {
            assert_eq!(chunk.start_line, expected_start);
            assert_eq!(chunk.end_line - chunk.start_line + 1, chunk.line_count);
            expected_start = chunk.end_line + 1;
        }
        assert_eq!(expected_start - 1, 30);
    }
}
