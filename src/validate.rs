//! Section validator.
//!
//! Grounding, structural, and confidence checks run before a section is
//! published. A section is accepted iff:
//!
//! 1. every line reference resolves against the stored transcript,
//! 2. every medical entity detected in the content is covered by the
//!    section's mappings or the job's global mappings,
//! 3. the structural schema for the section type holds,
//! 4. the blended confidence `min(llm self-score, citation pass ratio)`
//!    meets the accept threshold.
//!
//! Terms the ontology could not resolve at all do not fail a section; they
//! lower the reported confidence instead. Rejections carry the failing
//! references so the orchestrator can build a repair prompt.

use std::collections::HashSet;

use tracing::debug;

use crate::citation::{validate_references, CitationOutcome};
use crate::models::{
    ConceptMapping, LineRecord, LineReference, SectionSpec, SectionType, TermCandidate,
};
use crate::terms::find_terms_in_text;

/// Everything the validator needs to judge one candidate section.
pub struct ValidationInput<'a> {
    pub lines: &'a [LineRecord],
    pub spec: &'a SectionSpec,
    pub content: &'a str,
    pub references: &'a [LineReference],
    /// Self-reported confidence from the generation call, clamped to
    /// `[0, 1]`.
    pub self_confidence: f64,
    /// Terms the model claims it used, in addition to what detection
    /// finds.
    pub claimed_terms: &'a [String],
    pub global_terms: &'a [TermCandidate],
    pub global_mappings: &'a [ConceptMapping],
}

/// Validator verdict for one candidate section.
#[derive(Debug)]
pub struct ValidationOutcome {
    pub accepted: bool,
    /// Final confidence to report: the blend, scaled by the ontology
    /// resolution ratio.
    pub confidence: f64,
    pub citation: CitationOutcome,
    /// Human-readable reasons for rejection; empty when accepted.
    pub reasons: Vec<String>,
    /// Mappings attached to the section: the job's global mappings
    /// restricted to terms present in the content.
    pub section_mappings: Vec<ConceptMapping>,
}

/// Validator with the job's accept threshold.
pub struct SectionValidator {
    pub accept_threshold: f64,
}

impl SectionValidator {
    pub fn new(accept_threshold: f64) -> Self {
        Self { accept_threshold }
    }

    pub fn validate(&self, input: &ValidationInput<'_>) -> ValidationOutcome {
        let mut reasons = Vec::new();

        // Structural schema per section type.
        for problem in check_schema(&input.spec.section_type, input.content, input.references) {
            reasons.push(problem);
        }

        // Citation soundness.
        let citation = validate_references(input.lines, input.references);
        if !citation.all_passed() {
            reasons.push(format!(
                "{} of {} line references failed",
                citation.failures.len(),
                input.references.len()
            ));
        }

        // Entity grounding: detect entities in the content using the
        // extraction vocabulary, then attach their mappings.
        let mut vocabulary: Vec<&str> = Vec::new();
        for term in input.global_terms {
            vocabulary.push(term.normalized.as_str());
            vocabulary.push(term.surface.as_str());
        }
        let mut detected: HashSet<String> = find_terms_in_text(
            vocabulary.into_iter(),
            input.content,
        )
        .into_iter()
        .map(|t| t.to_lowercase())
        .collect();
        for claimed in input.claimed_terms {
            let lowered = claimed.trim().to_lowercase();
            if !lowered.is_empty() {
                detected.insert(lowered);
            }
        }

        let section_mappings: Vec<ConceptMapping> = input
            .global_mappings
            .iter()
            .filter(|m| detected.contains(&m.original_term.to_lowercase()))
            .cloned()
            .collect();

        let mapped_terms: HashSet<String> = input
            .global_mappings
            .iter()
            .map(|m| m.original_term.to_lowercase())
            .collect();
        let resolvable = detected.iter().filter(|t| mapped_terms.contains(*t)).count();
        let resolved_ratio = if detected.is_empty() {
            1.0
        } else {
            resolvable as f64 / detected.len() as f64
        };

        // Blended confidence; ontology gaps scale the reported value but
        // are not grounds for rejection on their own.
        let blended = input.self_confidence.clamp(0.0, 1.0).min(citation.pass_ratio);
        let confidence = blended * (0.5 + resolved_ratio / 2.0);

        if blended < self.accept_threshold {
            reasons.push(format!(
                "confidence {:.2} below accept threshold {:.2}",
                blended, self.accept_threshold
            ));
        }

        let accepted = reasons.is_empty();
        debug!(
            section = %input.spec.section_id,
            accepted,
            confidence,
            pass_ratio = citation.pass_ratio,
            resolved_ratio,
            "section validated"
        );

        ValidationOutcome {
            accepted,
            confidence,
            citation,
            reasons,
            section_mappings,
        }
    }
}

/// Structural checks per section type. The four clinical SOAP sections
/// must cite at least one transcript line; summaries, referrals, and
/// caller-defined sections may legitimately be reference-free (e.g. "no
/// findings reported").
fn check_schema(
    section_type: &SectionType,
    content: &str,
    references: &[LineReference],
) -> Vec<String> {
    let mut problems = Vec::new();
    if content.trim().is_empty() {
        problems.push("content is empty".to_string());
    }
    let requires_reference = matches!(
        section_type,
        SectionType::Subjective | SectionType::Objective | SectionType::Assessment | SectionType::Plan
    );
    if requires_reference && references.is_empty() {
        problems.push(format!(
            "{} sections require at least one line reference",
            section_type.label()
        ));
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MatchKind, TermOccurrence};
    use crate::transcript::normalize;

    fn lines() -> Vec<LineRecord> {
        normalize(
            "Doctor: What brings you in?\nPatient: I have chest pain and hypertension.",
            Some("en"),
            1 << 20,
        )
        .unwrap()
        .0
    }

    fn spec() -> SectionSpec {
        SectionSpec {
            template_id: "soap".into(),
            section_id: "s".into(),
            section_type: SectionType::Subjective,
            prompt: "subjective".into(),
            order_index: 0,
            depends_on: Vec::new(),
        }
    }

    fn term(normalized: &str) -> TermCandidate {
        TermCandidate {
            surface: normalized.to_string(),
            normalized: normalized.to_string(),
            occurrences: vec![TermOccurrence {
                line_no: 2,
                char_start: 0,
                char_end: 1,
            }],
        }
    }

    fn mapping(term: &str, concept: &str) -> ConceptMapping {
        ConceptMapping {
            original_term: term.to_string(),
            concept_id: concept.to_string(),
            preferred_term: term.to_string(),
            language: "en".to_string(),
            confidence: 0.95,
            match_kind: MatchKind::Exact,
        }
    }

    // "Patient: I have chest pain and hypertension."
    fn good_reference() -> LineReference {
        LineReference {
            line: 2,
            start: 16,
            end: 26,
            text: "chest pain".into(),
        }
    }

    #[test]
    fn accepts_grounded_section() {
        let lines = lines();
        let terms = vec![term("chest pain"), term("hypertension")];
        let mappings = vec![
            mapping("chest pain", "29857009"),
            mapping("hypertension", "38341003"),
        ];
        let validator = SectionValidator::new(0.6);
        let outcome = validator.validate(&ValidationInput {
            lines: &lines,
            spec: &spec(),
            content: "Patient reports chest pain.",
            references: &[good_reference()],
            self_confidence: 0.9,
            claimed_terms: &[],
            global_terms: &terms,
            global_mappings: &mappings,
        });
        assert!(outcome.accepted, "reasons: {:?}", outcome.reasons);
        assert_eq!(outcome.section_mappings.len(), 1);
        assert_eq!(outcome.section_mappings[0].concept_id, "29857009");
        assert!((outcome.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn rejects_bad_citation() {
        let lines = lines();
        let validator = SectionValidator::new(0.6);
        let bad = LineReference {
            line: 999,
            start: 0,
            end: 4,
            text: "pain".into(),
        };
        let outcome = validator.validate(&ValidationInput {
            lines: &lines,
            spec: &spec(),
            content: "Patient reports pain.",
            references: &[bad],
            self_confidence: 0.9,
            claimed_terms: &[],
            global_terms: &[],
            global_mappings: &[],
        });
        assert!(!outcome.accepted);
        assert_eq!(outcome.citation.failures.len(), 1);
    }

    #[test]
    fn rejects_empty_content() {
        let lines = lines();
        let validator = SectionValidator::new(0.6);
        let outcome = validator.validate(&ValidationInput {
            lines: &lines,
            spec: &spec(),
            content: "  ",
            references: &[good_reference()],
            self_confidence: 0.9,
            claimed_terms: &[],
            global_terms: &[],
            global_mappings: &[],
        });
        assert!(!outcome.accepted);
    }

    #[test]
    fn clinical_sections_require_references() {
        let lines = lines();
        let validator = SectionValidator::new(0.6);
        let outcome = validator.validate(&ValidationInput {
            lines: &lines,
            spec: &spec(),
            content: "Patient reports chest pain.",
            references: &[],
            self_confidence: 0.9,
            claimed_terms: &[],
            global_terms: &[],
            global_mappings: &[],
        });
        assert!(!outcome.accepted);
        assert!(outcome.reasons[0].contains("line reference"));
    }

    #[test]
    fn summary_sections_allow_zero_references() {
        let lines = lines();
        let mut s = spec();
        s.section_type = SectionType::VisitSummary;
        let validator = SectionValidator::new(0.6);
        let outcome = validator.validate(&ValidationInput {
            lines: &lines,
            spec: &s,
            content: "Routine follow-up visit.",
            references: &[],
            self_confidence: 0.9,
            claimed_terms: &[],
            global_terms: &[],
            global_mappings: &[],
        });
        assert!(outcome.accepted, "reasons: {:?}", outcome.reasons);
    }

    #[test]
    fn low_confidence_rejected() {
        let lines = lines();
        let validator = SectionValidator::new(0.6);
        let outcome = validator.validate(&ValidationInput {
            lines: &lines,
            spec: &spec(),
            content: "Patient reports chest pain.",
            references: &[good_reference()],
            self_confidence: 0.3,
            claimed_terms: &[],
            global_terms: &[],
            global_mappings: &[],
        });
        assert!(!outcome.accepted);
        assert!(outcome.reasons[0].contains("below accept threshold"));
    }

    #[test]
    fn unresolved_terms_scale_confidence_without_failing() {
        let lines = lines();
        // "hypertension" is detected but has no mapping anywhere.
        let terms = vec![term("chest pain"), term("hypertension")];
        let mappings = vec![mapping("chest pain", "29857009")];
        let validator = SectionValidator::new(0.6);
        let outcome = validator.validate(&ValidationInput {
            lines: &lines,
            spec: &spec(),
            content: "Chest pain with known hypertension.",
            references: &[good_reference()],
            self_confidence: 1.0,
            claimed_terms: &[],
            global_terms: &terms,
            global_mappings: &mappings,
        });
        assert!(outcome.accepted, "reasons: {:?}", outcome.reasons);
        // Half the detected terms resolved → blend scaled by 0.75.
        assert!((outcome.confidence - 0.75).abs() < 1e-9);
    }
}
