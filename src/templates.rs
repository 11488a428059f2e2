//! Template resolution.
//!
//! Flattens the templates of a request into ordered [`SectionSpec`]s and
//! validates their structure: unique section ids, known section types,
//! non-empty prompts, dependencies that stay inside their template, and an
//! acyclic dependency graph whose `order_index` is consistent with a
//! topological order.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::models::{SectionSpec, SectionType};

/// One template as supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRequest {
    pub template_id: String,
    pub sections: Vec<SectionRequest>,
}

/// One section definition inside a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionRequest {
    pub section_id: String,
    #[serde(rename = "type")]
    pub section_type: String,
    pub prompt: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Flatten and validate the requested templates into section specs.
///
/// Section ids must be unique across the whole template group so that
/// publication and the job's section states are unambiguous.
pub fn resolve_templates(templates: &[TemplateRequest]) -> EngineResult<Vec<SectionSpec>> {
    if templates.is_empty() {
        return Err(EngineError::InvalidRequest(
            "at least one template is required".to_string(),
        ));
    }

    let mut specs = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut order: u32 = 0;

    for template in templates {
        if template.template_id.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "template_id must not be empty".to_string(),
            ));
        }
        if template.sections.is_empty() {
            return Err(EngineError::InvalidRequest(format!(
                "template '{}' has no sections",
                template.template_id
            )));
        }

        let template_ids: HashSet<&str> = template
            .sections
            .iter()
            .map(|s| s.section_id.as_str())
            .collect();

        for section in &template.sections {
            if section.section_id.trim().is_empty() {
                return Err(EngineError::InvalidRequest(
                    "section_id must not be empty".to_string(),
                ));
            }
            if !seen_ids.insert(section.section_id.clone()) {
                return Err(EngineError::InvalidRequest(format!(
                    "duplicate section_id '{}'",
                    section.section_id
                )));
            }
            let section_type = SectionType::parse(&section.section_type).ok_or_else(|| {
                EngineError::InvalidRequest(format!(
                    "section '{}' has an empty type",
                    section.section_id
                ))
            })?;
            if section.prompt.trim().is_empty() {
                return Err(EngineError::InvalidRequest(format!(
                    "section '{}' has an empty prompt",
                    section.section_id
                )));
            }
            for dep in &section.depends_on {
                if dep == &section.section_id {
                    return Err(EngineError::InvalidRequest(format!(
                        "section '{}' depends on itself",
                        section.section_id
                    )));
                }
                if !template_ids.contains(dep.as_str()) {
                    return Err(EngineError::InvalidRequest(format!(
                        "section '{}' depends on unknown section '{}'",
                        section.section_id, dep
                    )));
                }
            }

            specs.push(SectionSpec {
                template_id: template.template_id.clone(),
                section_id: section.section_id.clone(),
                section_type,
                prompt: section.prompt.clone(),
                order_index: order,
                depends_on: section.depends_on.clone(),
            });
            order += 1;
        }
    }

    topological_order(&specs)?;
    check_order_consistency(&specs)?;
    Ok(specs)
}

/// Kahn's algorithm over the section graph. Errors on a cycle.
pub fn topological_order(specs: &[SectionSpec]) -> EngineResult<Vec<String>> {
    let mut indegree: HashMap<&str, usize> = specs
        .iter()
        .map(|s| (s.section_id.as_str(), s.depends_on.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for spec in specs {
        for dep in &spec.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(spec.section_id.as_str());
        }
    }

    // Seed with ready sections in order_index order so the result is a
    // stable schedule, not just any topological order.
    let mut ready: VecDeque<&str> = specs
        .iter()
        .filter(|s| s.depends_on.is_empty())
        .map(|s| s.section_id.as_str())
        .collect();

    let mut sorted = Vec::with_capacity(specs.len());
    while let Some(id) = ready.pop_front() {
        sorted.push(id.to_string());
        if let Some(next) = dependents.get(id) {
            for &dependent in next {
                let remaining = indegree.get_mut(dependent).unwrap();
                *remaining -= 1;
                if *remaining == 0 {
                    ready.push_back(dependent);
                }
            }
        }
    }

    if sorted.len() != specs.len() {
        let stuck: Vec<&str> = specs
            .iter()
            .map(|s| s.section_id.as_str())
            .filter(|id| !sorted.iter().any(|s| s == id))
            .collect();
        return Err(EngineError::InvalidRequest(format!(
            "cyclic section dependencies involving: {}",
            stuck.join(", ")
        )));
    }
    Ok(sorted)
}

/// `order_index` must not contradict the dependency direction.
fn check_order_consistency(specs: &[SectionSpec]) -> EngineResult<()> {
    let order_of: HashMap<&str, u32> = specs
        .iter()
        .map(|s| (s.section_id.as_str(), s.order_index))
        .collect();
    for spec in specs {
        for dep in &spec.depends_on {
            if let Some(dep_order) = order_of.get(dep.as_str()) {
                if *dep_order >= spec.order_index {
                    return Err(EngineError::InvalidRequest(format!(
                        "section '{}' is ordered before its dependency '{}'",
                        spec.section_id, dep
                    )));
                }
            }
        }
    }
    Ok(())
}
