//! Prompt templates for extraction, generation, repair, and validation.
//!
//! Templates are plain format functions so every call site states exactly
//! what context it injects. All JSON-producing prompts instruct the model
//! to answer with the raw object only; the LLM client strips stray code
//! fences before parsing regardless.

use crate::models::{ConceptMapping, LineReference};

/// System prompt for the deterministic term-extraction pass.
pub const TERM_EXTRACTION_SYSTEM: &str = "You are an expert medical terminologist. Your task is \
to identify and extract all potential medical terms, symptoms, diagnoses, medications, and \
procedures from the provided transcript.";

/// User prompt for term extraction over a numbered transcript window.
///
/// The model must echo, for every term, the exact line numbers and
/// character offsets where it occurs; offsets are counted in characters
/// from the start of the line text shown after the `N | ` prefix.
pub fn term_extraction_user(numbered_transcript: &str, language: &str) -> String {
    format!(
        "From the following doctor-patient conversation, extract all potential medical terms.\n\
Be comprehensive. Include diagnoses, symptoms (even described in layperson's terms), \
medications (brand and generic), tests, procedures, and anatomical references. If a patient \
says 'my stomach hurts', extract 'stomach pain'.\n\
\n\
Return ONLY a JSON object of the form:\n\
{{\n\
  \"terms\": [\n\
    {{\n\
      \"surface\": \"exact text as it appears\",\n\
      \"normalized\": \"canonical lowercase form\",\n\
      \"occurrences\": [\n\
        {{ \"line_no\": <int>, \"char_start\": <int>, \"char_end\": <int> }}\n\
      ]\n\
    }}\n\
  ]\n\
}}\n\
\n\
Offsets are character positions within the line text (after the 'N | ' prefix), half-open. \
Never invent line numbers. The transcript is in {language}; extracted terms must also be in \
{language}.\n\
\n\
Transcript:\n\
---\n\
{transcript}\n\
---",
        language = language,
        transcript = numbered_transcript,
    )
}

/// System prompt for section generation.
pub fn section_system(
    section_name: &str,
    language: &str,
    snomed_context: &[ConceptMapping],
    doctor_preferences: &[(String, String)],
    previous_sections: &str,
) -> String {
    let snomed_text = if snomed_context.is_empty() {
        "No validated terms provided.".to_string()
    } else {
        serde_json::to_string_pretty(snomed_context).unwrap_or_default()
    };
    let prefs_text = if doctor_preferences.is_empty() {
        "No specific preferences.".to_string()
    } else {
        doctor_preferences
            .iter()
            .map(|(original, preferred)| format!("- Use '{}' instead of '{}'", preferred, original))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let prev_text = if previous_sections.is_empty() {
        "This is the first section."
    } else {
        previous_sections
    };

    format!(
        "You are a meticulous medical scribe AI. Generate the '{section_name}' section of a \
clinical note with extreme accuracy and traceability.\n\
\n\
Instructions:\n\
1. Use all provided context: the conversation transcript, validated term mappings, the \
doctor's terminology preferences, and previously generated sections.\n\
2. Be specific: extract concrete details, measurements, and key phrases. DO NOT invent \
information; if nothing was said about a point, state that explicitly.\n\
3. Traceability is critical: every piece of information must reference the exact line \
number(s) and substring of the transcript that supports it.\n\
4. Generate the note in {language}.\n\
5. Return ONLY a JSON object of the form:\n\
{{\n\
  \"noteContent\": \"the section text, markdown formatted\",\n\
  \"lineReferences\": [\n\
    {{ \"line\": <int>, \"start\": <int>, \"end\": <int>, \"text\": \"exact substring of that line\" }}\n\
  ],\n\
  \"medicalTerms\": [\"terms used in the content\"],\n\
  \"selfConfidence\": <float 0.0-1.0>\n\
}}\n\
`start`/`end` are character positions within the line text (after the 'N | ' prefix), \
half-open, and `text` must equal that exact substring.\n\
\n\
Validated term mappings:\n{snomed_text}\n\
\n\
Doctor's preferences (apply these terminology changes):\n{prefs_text}\n\
\n\
Previously generated sections (for coherence, do not repeat):\n{prev_text}",
    )
}

/// User prompt for section generation.
pub fn section_user(section_name: &str, section_prompt: &str, transcript_context: &str) -> String {
    format!(
        "Generate the '{section_name}' section.\n\
\n\
Instructions for this section:\n{section_prompt}\n\
\n\
Conversation transcript (with line numbers):\n\
---\n\
{transcript_context}\n\
---\n\
\n\
Your output (JSON object only):",
    )
}

/// Repair addendum appended to the user prompt after a failed validation
/// pass; names each rejected reference so the model can fix or drop it.
pub fn repair_addendum(failures: &[(LineReference, String)]) -> String {
    let mut out = String::from(
        "\n\nYour previous answer failed citation validation. The following references were \
rejected; correct them against the transcript above or remove the unsupported statements:\n",
    );
    for (reference, reason) in failures {
        out.push_str(&format!(
            "- line {} [{}..{}] \"{}\": {}\n",
            reference.line, reference.start, reference.end, reference.text, reason
        ));
    }
    out.push_str("Every reference must point at text that exists verbatim in the transcript.");
    out
}

/// System prompt for the deterministic consistency judge.
pub const CONSISTENCY_JUDGE_SYSTEM: &str = "You are a meticulous clinical fact-checker AI. You \
validate the factual consistency of a generated note section against the source transcript it \
was drawn from.";

/// User prompt for the consistency judge. The returned score is on a 1-10
/// scale; the validator normalizes it into the section confidence.
pub fn consistency_judge_user(generated_content: &str, source_chunks: &str) -> String {
    format!(
        "Generated content:\n---\n{generated_content}\n---\n\
\n\
Source transcript chunks:\n---\n{source_chunks}\n---\n\
\n\
Every claim in the generated content must be supported by the source chunks; unsupported \
information is a hallucination.\n\
\n\
Return ONLY a JSON object:\n\
{{\n\
  \"factualConsistencyScore\": <int 1-10>,\n\
  \"issuesFound\": [ {{ \"statement\": \"...\", \"issue\": \"...\" }} ]\n\
}}",
    )
}
