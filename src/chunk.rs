//! Recursive-separator text chunker.
//!
//! Splits document content into [`Chunk`]s of roughly `target_size`
//! characters with `overlap` characters of trailing context carried into
//! the next chunk (§4.1). Splitting tries paragraph boundaries first, then
//! falls back to lines, sentences, words, and finally raw characters for
//! any span too large to fit a single chunk at the current granularity.
//!
//! Each chunk receives a deterministic UUID derived from its document ID
//! and index, plus a SHA-256 hash of its text for staleness detection.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::Chunk;

const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " "];

/// Splits `text` on paragraph/line/sentence/word boundaries (falling back to
/// raw characters) so that no produced piece exceeds `target_size` chars,
/// recursing through [`SEPARATORS`] in order.
fn split_recursive(text: &str, target_size: usize, sep_index: usize) -> Vec<String> {
    if text.chars().count() <= target_size {
        return vec![text.to_string()];
    }

    if sep_index >= SEPARATORS.len() {
        // No separator left: hard-split on char boundaries.
        return text
            .chars()
            .collect::<Vec<char>>()
            .chunks(target_size.max(1))
            .map(|c| c.iter().collect())
            .collect();
    }

    let sep = SEPARATORS[sep_index];
    let pieces: Vec<&str> = text.split(sep).filter(|p| !p.is_empty()).collect();
    if pieces.len() <= 1 {
        return split_recursive(text, target_size, sep_index + 1);
    }

    let mut out = Vec::new();
    for piece in pieces {
        if piece.chars().count() > target_size {
            out.extend(split_recursive(piece, target_size, sep_index + 1));
        } else {
            out.push(piece.to_string());
        }
    }
    out
}

/// Greedily packs recursively-split pieces back together up to
/// `target_size`, carrying the trailing `overlap` characters of each
/// packed chunk forward as a prefix of the next one.
fn pack_with_overlap(pieces: &[String], target_size: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        let would_be = if current.is_empty() {
            piece.chars().count()
        } else {
            current.chars().count() + 1 + piece.chars().count()
        };

        if would_be > target_size && !current.is_empty() {
            chunks.push(current.clone());
            let carry: String = current
                .chars()
                .rev()
                .take(overlap)
                .collect::<Vec<char>>()
                .into_iter()
                .rev()
                .collect();
            current = carry;
        }

        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(piece);
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Splits `text` into chunks of roughly `target_size` characters with
/// `overlap` characters of carried-forward context. Returns chunks with
/// contiguous indices starting at 0; always returns at least one chunk.
#[allow(clippy::too_many_arguments)]
pub fn chunk_text(
    document_id: &str,
    text: &str,
    target_size: usize,
    overlap: usize,
    tenant_id: &str,
    source: &str,
    document_type: &str,
    title: &str,
    created_at: Option<DateTime<Utc>>,
    created_at_timestamp: Option<i64>,
) -> Vec<Chunk> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return vec![make_chunk(
            document_id,
            0,
            trimmed,
            tenant_id,
            source,
            document_type,
            title,
            created_at,
            created_at_timestamp,
        )];
    }

    let pieces = split_recursive(trimmed, target_size, 0);
    let packed = pack_with_overlap(&pieces, target_size, overlap);

    let chunks: Vec<Chunk> = packed
        .iter()
        .enumerate()
        .map(|(i, piece)| {
            make_chunk(
                document_id,
                i as i64,
                piece.trim(),
                tenant_id,
                source,
                document_type,
                title,
                created_at,
                created_at_timestamp,
            )
        })
        .collect();

    if chunks.is_empty() {
        vec![make_chunk(
            document_id,
            0,
            trimmed,
            tenant_id,
            source,
            document_type,
            title,
            created_at,
            created_at_timestamp,
        )]
    } else {
        chunks
    }
}

#[allow(clippy::too_many_arguments)]
fn make_chunk(
    document_id: &str,
    index: i64,
    text: &str,
    tenant_id: &str,
    source: &str,
    document_type: &str,
    title: &str,
    created_at: Option<DateTime<Utc>>,
    created_at_timestamp: Option<i64>,
) -> Chunk {
    Chunk {
        chunk_id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        tenant_id: tenant_id.to_string(),
        source: source.to_string(),
        document_type: document_type.to_string(),
        title: title.to_string(),
        created_at,
        created_at_timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, target_size: usize, overlap: usize) -> Vec<Chunk> {
        chunk_text(
            "doc1",
            text,
            target_size,
            overlap,
            "tenant-a",
            "email",
            "email",
            "Subject",
            None,
            None,
        )
    }

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk("Hello, world!", 700, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn empty_text() {
        let chunks = chunk("", 700, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[test]
    fn paragraphs_under_limit_stay_together() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk(text, 700, 50);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("First paragraph."));
        assert!(chunks[0].text.contains("Third paragraph."));
    }

    #[test]
    fn oversized_text_splits_with_contiguous_indices() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk(&text, 40, 10);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64, "index mismatch at {}", i);
        }
    }

    #[test]
    fn overlap_carries_trailing_context_forward() {
        let text = (0..20)
            .map(|i| format!("Sentence {} of the document.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk(&text, 60, 20);
        assert!(chunks.len() > 1);
        // A chunk after the first should start with content from the tail
        // of its predecessor.
        for w in chunks.windows(2) {
            let prev_tail: String = w[0].text.chars().rev().take(10).collect::<Vec<_>>().into_iter().rev().collect();
            let prefix_overlap = prev_tail.split_whitespace().any(|tok| w[1].text.contains(tok));
            assert!(prefix_overlap, "expected overlap between {:?} and {:?}", w[0].text, w[1].text);
        }
    }

    #[test]
    fn deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let c1 = chunk(text, 5, 2);
        let c2 = chunk(text, 5, 2);
        assert_eq!(c1.len(), c2.len());
        for (a, b) in c1.iter().zip(c2.iter()) {
            assert_eq!(a.text, b.text);
            assert_eq!(a.text_hash(), b.text_hash());
            assert_eq!(a.chunk_index, b.chunk_index);
        }
    }
}
