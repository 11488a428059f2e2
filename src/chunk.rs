//! Line-window chunker.
//!
//! Groups transcript lines into overlapping windows that respect a
//! configurable token budget. A line is never split across chunks; when
//! `respect_speaker_boundaries` is set, a boundary is preferred at a
//! speaker turn once the window is mostly full. Adjacent chunks overlap by
//! the configured number of tokens, drawn from the tail of the previous
//! chunk, so retrieval never loses context at a window edge.
//!
//! Every line of the transcript is covered by at least one chunk, and each
//! chunk carries its inclusive line span so citations can be checked
//! against the stored transcript.

use crate::config::ChunkingConfig;
use crate::models::{Chunk, LineRecord};

/// Approximate chars-per-token ratio for the embedding model.
const CHARS_PER_TOKEN: usize = 4;

/// Chunking policy. See [`ChunkingConfig`] for the configurable defaults.
#[derive(Debug, Clone)]
pub struct ChunkPolicy {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
    pub respect_speaker_boundaries: bool,
    pub min_lines: usize,
    pub max_lines: usize,
}

impl From<&ChunkingConfig> for ChunkPolicy {
    fn from(cfg: &ChunkingConfig) -> Self {
        Self {
            target_tokens: cfg.target_tokens,
            overlap_tokens: cfg.overlap_tokens,
            respect_speaker_boundaries: cfg.respect_speaker_boundaries,
            min_lines: cfg.min_lines.max(1),
            max_lines: cfg.max_lines.max(1),
        }
    }
}

/// Approximate token count of a line, never zero so that empty lines still
/// advance the walk.
pub fn approx_tokens(text: &str) -> usize {
    (text.chars().count() / CHARS_PER_TOKEN) + 1
}

/// Render a line the way chunks and prompts present it.
pub fn render_line(line: &LineRecord) -> String {
    format!("{} | {}", line.line_no, line.text)
}

/// Split the transcript into overlapping chunks.
///
/// Returns chunks in line order. Each line appears as fresh content in
/// exactly one chunk; earlier lines may additionally appear as overlap at
/// the head of the following chunk.
pub fn chunk_lines(conversation_id: &str, lines: &[LineRecord], policy: &ChunkPolicy) -> Vec<Chunk> {
    if lines.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut i = 0usize;
    let mut carry: Vec<usize> = Vec::new(); // indices carried over as overlap

    while i < lines.len() {
        let mut members: Vec<usize> = carry.clone();
        let mut tokens: usize = members.iter().map(|&idx| approx_tokens(&lines[idx].text)).sum();
        let mut fresh = 0usize;

        while i < lines.len() {
            let line = &lines[i];
            let cost = approx_tokens(&line.text);

            if fresh >= 1 && members.len() >= policy.min_lines {
                if members.len() >= policy.max_lines {
                    break;
                }
                if tokens + cost > policy.target_tokens {
                    break;
                }
                if policy.respect_speaker_boundaries
                    && tokens * 5 >= policy.target_tokens * 4
                    && is_turn_boundary(members.last().map(|&idx| &lines[idx]), line)
                {
                    break;
                }
            }

            members.push(i);
            tokens += cost;
            fresh += 1;
            i += 1;
        }

        let first = lines[members[0]].line_no;
        let last = lines[*members.last().unwrap()].line_no;
        let text = members
            .iter()
            .map(|&idx| render_line(&lines[idx]))
            .collect::<Vec<_>>()
            .join("\n");
        chunks.push(Chunk::new(conversation_id, (first, last), text));

        // Carry the tail of this chunk into the next one as overlap.
        carry.clear();
        if policy.overlap_tokens > 0 && i < lines.len() {
            let mut budget = 0usize;
            for &idx in members.iter().rev() {
                budget += approx_tokens(&lines[idx].text);
                if budget > policy.overlap_tokens {
                    break;
                }
                carry.push(idx);
            }
            carry.reverse();
        }
    }

    chunks
}

fn is_turn_boundary(prev: Option<&LineRecord>, line: &LineRecord) -> bool {
    match (prev.and_then(|p| p.speaker), line.speaker) {
        (Some(a), Some(b)) => a != b,
        (None, Some(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::normalize;

    fn policy(target: usize, overlap: usize) -> ChunkPolicy {
        ChunkPolicy {
            target_tokens: target,
            overlap_tokens: overlap,
            respect_speaker_boundaries: true,
            min_lines: 1,
            max_lines: 200,
        }
    }

    fn lines_from(raw: &str) -> Vec<crate::models::LineRecord> {
        normalize(raw, Some("en"), 1 << 20).unwrap().0
    }

    #[test]
    fn single_line_single_chunk() {
        let lines = lines_from("Doctor: Hello, how are you feeling today?");
        let chunks = chunk_lines("conv", &lines, &policy(1500, 150));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].line_span, (1, 1));
    }

    #[test]
    fn every_line_covered() {
        let raw = (1..=40)
            .map(|i| format!("Patient: symptom report number {} with some detail", i))
            .collect::<Vec<_>>()
            .join("\n");
        let lines = lines_from(&raw);
        let chunks = chunk_lines("conv", &lines, &policy(40, 10));
        assert!(chunks.len() > 1);
        for line in &lines {
            assert!(
                chunks
                    .iter()
                    .any(|c| c.line_span.0 <= line.line_no && line.line_no <= c.line_span.1),
                "line {} not covered",
                line.line_no
            );
        }
    }

    #[test]
    fn adjacent_chunks_overlap() {
        let raw = (1..=30)
            .map(|i| format!("Doctor: observation {} recorded during the visit", i))
            .collect::<Vec<_>>()
            .join("\n");
        let lines = lines_from(&raw);
        let chunks = chunk_lines("conv", &lines, &policy(50, 20));
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert!(
                pair[1].line_span.0 <= pair[0].line_span.1,
                "expected overlap between spans {:?} and {:?}",
                pair[0].line_span,
                pair[1].line_span
            );
        }
    }

    #[test]
    fn no_overlap_when_disabled() {
        let raw = (1..=20)
            .map(|i| format!("Doctor: note {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let lines = lines_from(&raw);
        let chunks = chunk_lines("conv", &lines, &policy(12, 0));
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].line_span.0, pair[0].line_span.1 + 1);
        }
    }

    #[test]
    fn deterministic() {
        let raw = (1..=25)
            .map(|i| format!("Patient: detail {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let lines = lines_from(&raw);
        let a = chunk_lines("conv", &lines, &policy(30, 8));
        let b = chunk_lines("conv", &lines, &policy(30, 8));
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.chunk_id, y.chunk_id);
            assert_eq!(x.line_span, y.line_span);
        }
    }

    #[test]
    fn chunk_text_carries_line_numbers() {
        let lines = lines_from("Doctor: Hello\nPatient: Hi");
        let chunks = chunk_lines("conv", &lines, &policy(1500, 0));
        assert_eq!(chunks[0].text, "1 | Doctor: Hello\n2 | Patient: Hi");
    }

    #[test]
    fn max_lines_enforced() {
        let raw = (1..=10)
            .map(|i| format!("Doctor: {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let lines = lines_from(&raw);
        let mut p = policy(10_000, 0);
        p.max_lines = 3;
        let chunks = chunk_lines("conv", &lines, &p);
        assert!(chunks.iter().all(|c| c.line_span.1 - c.line_span.0 < 3));
        assert_eq!(chunks.len(), 4);
    }
}
