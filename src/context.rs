//! Section context cache.
//!
//! Per `(conversation_id, template_id)`, a write-once map from section id
//! to its accepted result. Later sections read only the entries named in
//! their `depends_on` list, which keeps a document internally coherent
//! without leaking content across templates or conversations.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::models::SectionResult;

type Key = (String, String);

/// In-flight cache of accepted sections.
pub struct SectionContextCache {
    inner: RwLock<HashMap<Key, HashMap<String, SectionResult>>>,
}

impl SectionContextCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Record an accepted section. Each `section_id` may be written at
    /// most once per job; a second write is a programming error.
    pub fn insert(
        &self,
        conversation_id: &str,
        template_id: &str,
        result: SectionResult,
    ) -> EngineResult<()> {
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .entry((conversation_id.to_string(), template_id.to_string()))
            .or_default();
        if entry.contains_key(&result.section_id) {
            return Err(EngineError::Internal(format!(
                "section {} already cached",
                result.section_id
            )));
        }
        entry.insert(result.section_id.clone(), result);
        Ok(())
    }

    /// Fetch the cached results for the given dependency ids, in the order
    /// they are named. Missing entries are skipped; the orchestrator only
    /// schedules a section once its dependencies are Accepted.
    pub fn dependencies(
        &self,
        conversation_id: &str,
        template_id: &str,
        depends_on: &[String],
    ) -> Vec<SectionResult> {
        let inner = self.inner.read().unwrap();
        let Some(entry) = inner.get(&(conversation_id.to_string(), template_id.to_string())) else {
            return Vec::new();
        };
        depends_on
            .iter()
            .filter_map(|id| entry.get(id).cloned())
            .collect()
    }

    /// Render dependency sections into the prompt block fed to later
    /// sections.
    pub fn render_previous(dependencies: &[SectionResult]) -> String {
        dependencies
            .iter()
            .map(|d| format!("[{}]\n{}", d.section_id, d.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Drop all cached sections of a conversation (any template).
    pub fn drop_conversation(&self, conversation_id: &str) {
        self.inner
            .write()
            .unwrap()
            .retain(|(conv, _), _| conv != conversation_id);
    }

    /// Drop the cached sections of one `(conversation, template)` pair.
    /// Called on re-submission so a superseded or completed job's entries
    /// never collide with the new job's write-once inserts.
    pub fn drop_template(&self, conversation_id: &str, template_id: &str) {
        self.inner
            .write()
            .unwrap()
            .remove(&(conversation_id.to_string(), template_id.to_string()));
    }
}

impl Default for SectionContextCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ValidationStatus;

    fn result(section_id: &str, content: &str) -> SectionResult {
        SectionResult {
            section_id: section_id.to_string(),
            content: content.to_string(),
            line_references: Vec::new(),
            snomed_mappings: Vec::new(),
            confidence: 0.9,
            language: "en".to_string(),
            validation_status: ValidationStatus::Accepted,
        }
    }

    #[test]
    fn write_once_enforced() {
        let cache = SectionContextCache::new();
        cache.insert("conv", "soap", result("s", "subjective")).unwrap();
        let err = cache.insert("conv", "soap", result("s", "again")).unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }

    #[test]
    fn dependencies_read_only_named_sections() {
        let cache = SectionContextCache::new();
        cache.insert("conv", "soap", result("s", "subjective")).unwrap();
        cache.insert("conv", "soap", result("o", "objective")).unwrap();
        cache.insert("conv", "soap", result("a", "assessment")).unwrap();

        let deps = cache.dependencies("conv", "soap", &["s".to_string(), "o".to_string()]);
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].section_id, "s");
        assert_eq!(deps[1].section_id, "o");
    }

    #[test]
    fn templates_are_isolated() {
        let cache = SectionContextCache::new();
        cache.insert("conv", "soap", result("s", "subjective")).unwrap();
        let deps = cache.dependencies("conv", "summary", &["s".to_string()]);
        assert!(deps.is_empty());
    }

    #[test]
    fn drop_conversation_clears_all_templates() {
        let cache = SectionContextCache::new();
        cache.insert("conv", "soap", result("s", "x")).unwrap();
        cache.insert("conv", "summary", result("v", "y")).unwrap();
        cache.drop_conversation("conv");
        assert!(cache.dependencies("conv", "soap", &["s".to_string()]).is_empty());
        assert!(cache
            .dependencies("conv", "summary", &["v".to_string()])
            .is_empty());
    }

    #[test]
    fn render_previous_formats_blocks() {
        let rendered =
            SectionContextCache::render_previous(&[result("s", "alpha"), result("o", "beta")]);
        assert!(rendered.contains("[s]\nalpha"));
        assert!(rendered.contains("[o]\nbeta"));
    }
}
