//! Citation validator.
//!
//! Checks every `(line, start, end, text)` reference of a candidate
//! section against the stored transcript:
//!
//! 1. the line number must exist,
//! 2. `0 ≤ start < end ≤ len(line.text)` in characters,
//! 3. the referenced text must equal the line substring under Unicode NFC.
//!
//! The validator reports each failure with a reason (fed back into the
//! repair prompt) and the overall pass ratio, which flows into the
//! section's blended confidence.

use unicode_normalization::UnicodeNormalization;

use crate::models::{LineRecord, LineReference};
use crate::transcript::find_line;

/// Result of checking one section's references.
#[derive(Debug, Clone)]
pub struct CitationOutcome {
    /// Rejected references with a human-readable reason each.
    pub failures: Vec<(LineReference, String)>,
    /// Fraction of references that passed; `1.0` when there were none.
    pub pass_ratio: f64,
}

impl CitationOutcome {
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Slice a string by character positions, half-open. Returns `None` when
/// the range is out of bounds or inverted.
pub fn char_slice(text: &str, start: usize, end: usize) -> Option<&str> {
    if start >= end {
        return None;
    }
    let count = text.chars().count();
    if end > count {
        return None;
    }
    let byte_start = text.char_indices().nth(start).map(|(i, _)| i)?;
    let byte_end = if end == count {
        text.len()
    } else {
        text.char_indices().nth(end).map(|(i, _)| i)?
    };
    text.get(byte_start..byte_end)
}

/// NFC-normalize for comparison.
pub fn nfc(text: &str) -> String {
    text.nfc().collect()
}

/// Validate every reference of a candidate section against the stored
/// transcript lines.
pub fn validate_references(lines: &[LineRecord], references: &[LineReference]) -> CitationOutcome {
    let mut failures = Vec::new();

    for reference in references {
        match check_reference(lines, reference) {
            Ok(()) => {}
            Err(reason) => failures.push((reference.clone(), reason)),
        }
    }

    let total = references.len();
    let pass_ratio = if total == 0 {
        1.0
    } else {
        (total - failures.len()) as f64 / total as f64
    };

    CitationOutcome {
        failures,
        pass_ratio,
    }
}

fn check_reference(lines: &[LineRecord], reference: &LineReference) -> Result<(), String> {
    let line = find_line(lines, reference.line)
        .ok_or_else(|| format!("line {} does not exist", reference.line))?;

    let len = line.text.chars().count();
    if reference.start >= reference.end {
        return Err(format!(
            "empty or inverted range [{}..{}]",
            reference.start, reference.end
        ));
    }
    if reference.end > len {
        return Err(format!(
            "range [{}..{}] exceeds line length {}",
            reference.start, reference.end, len
        ));
    }

    let substring = char_slice(&line.text, reference.start, reference.end)
        .ok_or_else(|| format!("range [{}..{}] is not sliceable", reference.start, reference.end))?;

    if nfc(substring) != nfc(&reference.text) {
        return Err(format!(
            "text mismatch: transcript has \"{}\"",
            substring
        ));
    }

    Ok(())
}
