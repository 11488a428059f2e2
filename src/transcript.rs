//! Transcript normalizer.
//!
//! Converts raw speaker-annotated text into a sequence of [`LineRecord`]s
//! with stable line numbers and byte offsets into the original input.
//! Line numbers are assigned by position unless the input carries explicit
//! numeric prefixes (`"12 | ..."` or `"12: ..."`), in which case the
//! prefix is authoritative and must be strictly increasing.
//!
//! Byte offsets refer to the UTF-8 encoding of the input as received here;
//! they remain stable for the lifetime of the conversation, so every
//! downstream citation can be checked against the stored lines.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EngineError, EngineResult};
use crate::models::{LineRecord, Speaker};

/// Explicit line-number prefix: `"  12 | text"` or `"12: text"`.
static LINE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s*[:|]\s*").expect("line prefix regex"));

/// Speaker prefix at the start of a line.
static SPEAKER_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(doctor|dr\.?|médecin|docteur|patient|pt\.?)\s*[:\s]")
        .expect("speaker prefix regex")
});

/// Normalize a raw transcript into line records.
///
/// Lines are split on `\n` (a lone `\r\n` pair is treated as one
/// separator); trailing whitespace is trimmed; empty lines are retained to
/// preserve numbering. Returns `InvalidTranscript` when the input is empty
/// or exceeds `max_bytes`.
pub fn normalize(
    raw_text: &str,
    language_hint: Option<&str>,
    max_bytes: usize,
) -> EngineResult<(Vec<LineRecord>, String)> {
    if raw_text.is_empty() {
        return Err(EngineError::InvalidTranscript(
            "transcript is empty".to_string(),
        ));
    }
    if raw_text.len() > max_bytes {
        return Err(EngineError::InvalidTranscript(format!(
            "transcript is {} bytes, limit is {}",
            raw_text.len(),
            max_bytes
        )));
    }

    let language = match language_hint {
        Some(hint) if !hint.trim().is_empty() => hint.trim().to_ascii_lowercase(),
        _ => detect_language(raw_text).to_string(),
    };

    let mut records = Vec::new();
    let mut byte_pos = 0usize;
    let mut position_no = 0u32;
    let mut last_explicit: Option<u32> = None;
    // Explicit numbering must be all-or-nothing; a mixed transcript falls
    // back to positional numbering for every line.
    let uses_explicit = raw_text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .all(|l| LINE_PREFIX.is_match(l));

    for raw_line in raw_text.split('\n') {
        let line_start = byte_pos;
        byte_pos += raw_line.len() + 1; // account for the consumed '\n'

        let content = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        position_no += 1;

        let (line_no, body, body_offset) = if uses_explicit {
            match LINE_PREFIX.captures(content) {
                Some(caps) => {
                    let parsed: u32 = caps[1].parse().map_err(|_| {
                        EngineError::InvalidTranscript(format!(
                            "line prefix '{}' is not a valid line number",
                            &caps[1]
                        ))
                    })?;
                    if let Some(prev) = last_explicit {
                        if parsed <= prev {
                            return Err(EngineError::InvalidTranscript(format!(
                                "explicit line numbers must be strictly increasing: {} after {}",
                                parsed, prev
                            )));
                        }
                    }
                    last_explicit = Some(parsed);
                    let matched = caps.get(0).unwrap();
                    (parsed, &content[matched.end()..], matched.end())
                }
                // Blank line inside an explicitly numbered transcript keeps
                // positional continuity.
                None => (last_explicit.map_or(position_no, |p| p + 1), content, 0),
            }
        } else {
            (position_no, content, 0)
        };

        let text = body.trim_end().to_string();
        let byte_start = line_start + body_offset;
        let byte_end = byte_start + text.len();

        records.push(LineRecord {
            line_no,
            speaker: detect_speaker(&text),
            text,
            byte_start,
            byte_end,
        });
    }

    // A transcript of only blank lines carries nothing to extract.
    if records.iter().all(|r| r.text.is_empty()) {
        return Err(EngineError::InvalidTranscript(
            "transcript contains no text".to_string(),
        ));
    }

    Ok((records, language))
}

/// Flatten a speaker-turn array (`[{"doctor": "..."}, ...]`) into the
/// line-separated form the normalizer consumes, one turn per line.
pub fn flatten_turns(turns: &[(String, String)]) -> String {
    let mut out = String::new();
    for (i, (speaker, text)) in turns.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let mut label: String = speaker.trim().to_string();
        if let Some(first) = label.get(0..1) {
            label.replace_range(0..1, &first.to_uppercase());
        }
        out.push_str(&label);
        out.push_str(": ");
        out.push_str(text.trim());
    }
    out
}

/// Restore the canonical-newline form of the transcript.
///
/// For inputs without explicit line prefixes or trailing whitespace,
/// `reassemble(&normalize(t)?.0) == t` (modulo `\r\n` → `\n`).
pub fn reassemble(lines: &[LineRecord]) -> String {
    lines
        .iter()
        .map(|l| l.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Look up a line by its number.
pub fn find_line(lines: &[LineRecord], line_no: u32) -> Option<&LineRecord> {
    // Dense positional numbering allows direct indexing; explicit
    // numbering may be sparse, so fall back to a scan.
    if let Some(first) = lines.first() {
        let idx = line_no.checked_sub(first.line_no)? as usize;
        if let Some(candidate) = lines.get(idx) {
            if candidate.line_no == line_no {
                return Some(candidate);
            }
        }
    }
    lines.iter().find(|l| l.line_no == line_no)
}

fn detect_speaker(text: &str) -> Option<Speaker> {
    let caps = SPEAKER_PREFIX.captures(text)?;
    let label = caps[1].to_ascii_lowercase();
    if label.starts_with("pat") || label.starts_with("pt") {
        Some(Speaker::Patient)
    } else {
        Some(Speaker::Doctor)
    }
}

const FRENCH_MARKERS: &[&str] = &[
    "le", "la", "les", "je", "vous", "est", "pas", "une", "des", "avez", "être", "avec", "et",
    "que", "mais", "bonjour",
];
const ENGLISH_MARKERS: &[&str] = &[
    "the", "is", "you", "and", "have", "with", "are", "not", "what", "your", "been", "feel",
    "how", "been", "any", "hello",
];

/// Heuristic en/fr detection from stop-word frequency. Used only when the
/// caller supplies no language hint.
pub fn detect_language(text: &str) -> &'static str {
    let mut fr = 0usize;
    let mut en = 0usize;
    for word in text
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
    {
        let lower = word.to_lowercase();
        if FRENCH_MARKERS.contains(&lower.as_str()) {
            fr += 1;
        }
        if ENGLISH_MARKERS.contains(&lower.as_str()) {
            en += 1;
        }
    }
    if fr > en {
        "fr"
    } else {
        "en"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024 * 1024;

    #[test]
    fn positional_numbering() {
        let (lines, lang) = normalize(
            "Doctor: How are you feeling today?\nPatient: I have chest pain.",
            Some("en"),
            MAX,
        )
        .unwrap();
        assert_eq!(lang, "en");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line_no, 1);
        assert_eq!(lines[1].line_no, 2);
        assert_eq!(lines[0].speaker, Some(Speaker::Doctor));
        assert_eq!(lines[1].speaker, Some(Speaker::Patient));
    }

    #[test]
    fn byte_offsets_recover_line_text() {
        let raw = "Doctor: Hello there\nPatient: Hi";
        let (lines, _) = normalize(raw, Some("en"), MAX).unwrap();
        for line in &lines {
            assert_eq!(&raw[line.byte_start..line.byte_end], line.text);
        }
    }

    #[test]
    fn explicit_prefixes_are_authoritative() {
        let raw = "3 | Doctor: Hello\n7 | Patient: Hi there";
        let (lines, _) = normalize(raw, Some("en"), MAX).unwrap();
        assert_eq!(lines[0].line_no, 3);
        assert_eq!(lines[1].line_no, 7);
        assert_eq!(lines[0].text, "Doctor: Hello");
        // Offsets point past the stripped prefix.
        assert_eq!(&raw[lines[1].byte_start..lines[1].byte_end], lines[1].text);
    }

    #[test]
    fn explicit_prefixes_must_increase() {
        let err = normalize("5 | a\n4 | b", Some("en"), MAX).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTranscript(_)));
    }

    #[test]
    fn empty_lines_preserve_numbering() {
        let (lines, _) = normalize("Doctor: Hello\n\nPatient: Hi", Some("en"), MAX).unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].text, "");
        assert_eq!(lines[2].line_no, 3);
    }

    #[test]
    fn empty_input_rejected() {
        assert!(matches!(
            normalize("", Some("en"), MAX),
            Err(EngineError::InvalidTranscript(_))
        ));
    }

    #[test]
    fn oversize_input_rejected_by_one_byte() {
        let raw = "Doctor: Hello";
        assert!(normalize(raw, Some("en"), raw.len()).is_ok());
        assert!(matches!(
            normalize(raw, Some("en"), raw.len() - 1),
            Err(EngineError::InvalidTranscript(_))
        ));
    }

    #[test]
    fn round_trip() {
        let raw = "Doctor: How are you?\nPatient: Fine.\nDoctor: Good.";
        let (lines, _) = normalize(raw, Some("en"), MAX).unwrap();
        assert_eq!(reassemble(&lines), raw);
    }

    #[test]
    fn crlf_round_trips_to_canonical_form() {
        let raw = "Doctor: Hello\r\nPatient: Hi";
        let (lines, _) = normalize(raw, Some("en"), MAX).unwrap();
        assert_eq!(reassemble(&lines), "Doctor: Hello\nPatient: Hi");
    }

    #[test]
    fn french_detection() {
        let raw = "Docteur: Bonjour, comment vous sentez-vous?\nPatient: Je ne suis pas bien, j'ai mal à la tête.";
        let (lines, lang) = normalize(raw, None, MAX).unwrap();
        assert_eq!(lang, "fr");
        assert_eq!(lines[0].speaker, Some(Speaker::Doctor));
    }

    #[test]
    fn turn_array_flattening() {
        let turns = vec![
            ("doctor".to_string(), "How are you?".to_string()),
            ("patient".to_string(), "Chest pain.".to_string()),
        ];
        let flat = flatten_turns(&turns);
        assert_eq!(flat, "Doctor: How are you?\nPatient: Chest pain.");
        let (lines, _) = normalize(&flat, Some("en"), MAX).unwrap();
        assert_eq!(lines[0].speaker, Some(Speaker::Doctor));
        assert_eq!(lines[1].speaker, Some(Speaker::Patient));
    }

    #[test]
    fn find_line_positional_and_sparse() {
        let (lines, _) = normalize("a\nb\nc", Some("en"), MAX).unwrap();
        assert_eq!(find_line(&lines, 2).unwrap().text, "b");
        assert!(find_line(&lines, 9).is_none());

        let (sparse, _) = normalize("2 | a\n9 | b", Some("en"), MAX).unwrap();
        assert_eq!(find_line(&sparse, 9).unwrap().text, "b");
    }
}
