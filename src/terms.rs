//! Medical term extraction.
//!
//! Runs a single deterministic prompt over the numbered transcript and
//! parses the returned term list. When the transcript exceeds the model's
//! context budget, the extractor windows it with the chunker's stride and
//! merges the per-window results, deduplicating by normalized form.
//!
//! The extractor never trusts line numbers from the model: every returned
//! occurrence is verified against the normalized transcript, with a
//! best-effort relocation when only the offsets are off. Occurrences that
//! cannot be verified are discarded; terms left with no occurrence are
//! dropped.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::chunk::{approx_tokens, render_line};
use crate::citation::char_slice;
use crate::error::EngineResult;
use crate::llm::{CallMode, LlmClient};
use crate::models::{LineRecord, TermCandidate, TermOccurrence};
use crate::prompts;
use crate::transcript::find_line;

#[derive(Debug, Deserialize)]
struct RawTermList {
    #[serde(default)]
    terms: Vec<RawTerm>,
}

#[derive(Debug, Deserialize)]
struct RawTerm {
    surface: String,
    #[serde(default)]
    normalized: Option<String>,
    #[serde(default)]
    occurrences: Vec<RawOccurrence>,
}

#[derive(Debug, Deserialize)]
struct RawOccurrence {
    line_no: u32,
    char_start: usize,
    char_end: usize,
}

/// Extract a deduplicated set of medical terms from the transcript.
///
/// `context_tokens` is the approximate prompt budget; `stride_tokens` is
/// the chunker's stride (target minus overlap) used when windowing.
pub async fn extract_terms(
    llm: &dyn LlmClient,
    lines: &[LineRecord],
    language: &str,
    context_tokens: usize,
    stride_tokens: usize,
) -> EngineResult<Vec<TermCandidate>> {
    let windows = build_windows(lines, context_tokens, stride_tokens.max(1));
    debug!(windows = windows.len(), "running term extraction");

    // BTreeMap keeps the merged term order stable across runs.
    let mut merged: BTreeMap<String, TermCandidate> = BTreeMap::new();

    for window in &windows {
        let numbered = window
            .iter()
            .map(|l| render_line(l))
            .collect::<Vec<_>>()
            .join("\n");
        let response = llm
            .complete_json(
                prompts::TERM_EXTRACTION_SYSTEM,
                &prompts::term_extraction_user(&numbered, language),
                CallMode::Deterministic,
            )
            .await?;

        // The prompt asks for an object, but tolerate a bare array too.
        let raw: RawTermList = if response.is_array() {
            RawTermList {
                terms: serde_json::from_value(response)?,
            }
        } else {
            serde_json::from_value(response)?
        };
        for term in raw.terms {
            let normalized = term
                .normalized
                .clone()
                .unwrap_or_else(|| term.surface.clone())
                .trim()
                .to_lowercase();
            if normalized.is_empty() {
                continue;
            }

            let mut verified = Vec::new();
            for occ in &term.occurrences {
                match verify_occurrence(lines, &term.surface, occ) {
                    Some(v) => verified.push(v),
                    None => {
                        warn!(
                            term = %term.surface,
                            line = occ.line_no,
                            "discarding unverifiable occurrence"
                        );
                    }
                }
            }
            if verified.is_empty() {
                continue;
            }

            let entry = merged.entry(normalized.clone()).or_insert_with(|| TermCandidate {
                surface: term.surface.clone(),
                normalized,
                occurrences: Vec::new(),
            });
            for occ in verified {
                if !entry.occurrences.contains(&occ) {
                    entry.occurrences.push(occ);
                }
            }
        }
    }

    let mut candidates: Vec<TermCandidate> = merged.into_values().collect();
    for candidate in &mut candidates {
        candidate
            .occurrences
            .sort_by_key(|o| (o.line_no, o.char_start));
    }
    Ok(candidates)
}

/// Verify one occurrence against the transcript. When the model's offsets
/// are wrong but the surface does appear in the named line, the occurrence
/// is relocated to the real span.
fn verify_occurrence(
    lines: &[LineRecord],
    surface: &str,
    occ: &RawOccurrence,
) -> Option<TermOccurrence> {
    let line = find_line(lines, occ.line_no)?;

    if let Some(substring) = char_slice(&line.text, occ.char_start, occ.char_end) {
        if substring.eq_ignore_ascii_case(surface) {
            return Some(TermOccurrence {
                line_no: occ.line_no,
                char_start: occ.char_start,
                char_end: occ.char_end,
            });
        }
    }

    locate_in_line(&line.text, surface).map(|(start, end)| TermOccurrence {
        line_no: occ.line_no,
        char_start: start,
        char_end: end,
    })
}

/// Case-insensitive search for `needle` in `haystack`, returning char
/// offsets.
fn locate_in_line(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    if needle.is_empty() {
        return None;
    }
    let lower_haystack = haystack.to_lowercase();
    let lower_needle = needle.to_lowercase();
    let byte_pos = lower_haystack.find(&lower_needle)?;
    let char_start = lower_haystack[..byte_pos].chars().count();
    let char_end = char_start + lower_needle.chars().count();
    Some((char_start, char_end))
}

/// Which of the known terms appear in the given text. Used by the
/// validator to re-detect entities in generated content with the same
/// vocabulary the extraction pass produced.
pub fn find_terms_in_text<'a>(terms: impl Iterator<Item = &'a str>, text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    terms
        .filter(|t| !t.is_empty() && lower.contains(&t.to_lowercase()))
        .map(|t| t.to_string())
        .collect()
}

/// Window the transcript for extraction. A transcript within the budget
/// yields a single window; larger ones advance by `stride_tokens` per
/// window so that adjacent windows overlap.
fn build_windows<'a>(
    lines: &'a [LineRecord],
    context_tokens: usize,
    stride_tokens: usize,
) -> Vec<&'a [LineRecord]> {
    let total: usize = lines.iter().map(|l| approx_tokens(&l.text)).sum();
    if total <= context_tokens {
        return vec![lines];
    }

    let mut windows = Vec::new();
    let mut start = 0usize;
    while start < lines.len() {
        let mut tokens = 0usize;
        let mut end = start;
        while end < lines.len() {
            let cost = approx_tokens(&lines[end].text);
            if end > start && tokens + cost > context_tokens {
                break;
            }
            tokens += cost;
            end += 1;
        }
        windows.push(&lines[start..end]);
        if end >= lines.len() {
            break;
        }

        // Advance by the stride, but always make progress.
        let mut advanced = 0usize;
        let mut next = start;
        while next < end && advanced < stride_tokens {
            advanced += approx_tokens(&lines[next].text);
            next += 1;
        }
        start = next.max(start + 1);
    }
    windows
}
