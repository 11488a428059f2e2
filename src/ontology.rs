//! Clinical ontology client.
//!
//! The [`OntologyClient`] trait abstracts lookup of medical terms against a
//! concept graph. Resolution follows a match ladder per term: exact match
//! on a description, then substring containment, then per-word semantic
//! overlap, with confidence calibrated to the match kind (0.95 / 0.80 /
//! 0.65). Up to `n_max` concepts are returned per term.
//!
//! Backends:
//! - **[`GraphOntologyClient`]** — a concept graph reached over the HTTP
//!   transaction endpoint (Cypher statements against `Concept` /
//!   `Description` nodes, language-filtered).
//! - **[`StaticOntologyClient`]** — an in-memory concept table for tests
//!   and offline runs.
//!
//! [`CachedOntology`] wraps any client with a per-job resolution cache
//! keyed by `(normalized term, language)`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::OntologyConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{ConceptMapping, MatchKind, TermCandidate};

/// Confidence assigned per match kind.
fn confidence_for(kind: MatchKind) -> f64 {
    match kind {
        MatchKind::Exact => 0.95,
        MatchKind::Contains => 0.80,
        MatchKind::Semantic => 0.65,
    }
}

/// Capability interface over the concept graph.
#[async_trait]
pub trait OntologyClient: Send + Sync {
    /// Resolve term candidates to concept mappings in the given language.
    ///
    /// Terms that match nothing simply produce no mappings; resolution
    /// failure for the whole batch is an error.
    async fn resolve(
        &self,
        terms: &[TermCandidate],
        language: &str,
    ) -> EngineResult<Vec<ConceptMapping>>;

    /// Parent concepts (IS_A edges) of a concept, as `(concept_id,
    /// preferred_term)` pairs.
    async fn hierarchy(&self, concept_id: &str) -> EngineResult<Vec<(String, String)>>;

    /// Cheap liveness probe used by the health endpoint.
    async fn probe(&self) -> EngineResult<()>;
}

// ============ Graph backend ============

/// Concept graph reached over the Cypher HTTP transaction endpoint.
pub struct GraphOntologyClient {
    client: reqwest::Client,
    endpoint: String,
    database: String,
    auth: Option<(String, String)>,
    n_max: usize,
}

const EXACT_MATCH_QUERY: &str = "MATCH (c:Concept)-[:HAS_DESCRIPTION]->(d:Description) \
     WHERE toLower(d.term) = $term AND c.active = true AND d.active = true \
     AND (d.languageCode STARTS WITH $language OR d.languageCode IS NULL) \
     RETURN c.id AS conceptId, d.term AS preferredTerm, \
     coalesce(d.languageCode, $language) AS languageCode LIMIT 1";

const CONTAINS_QUERY: &str = "MATCH (c:Concept)-[:HAS_DESCRIPTION]->(d:Description) \
     WHERE toLower(d.term) CONTAINS $term AND c.active = true AND d.active = true \
     AND (d.languageCode STARTS WITH $language OR d.languageCode IS NULL) \
     RETURN c.id AS conceptId, d.term AS preferredTerm, \
     coalesce(d.languageCode, $language) AS languageCode \
     ORDER BY size(d.term) ASC LIMIT $limit";

const SEMANTIC_QUERY: &str = "MATCH (c:Concept)-[:HAS_DESCRIPTION]->(d:Description) \
     WHERE any(word IN split($term, ' ') WHERE toLower(d.term) CONTAINS toLower(word)) \
     AND c.active = true AND d.active = true \
     RETURN c.id AS conceptId, d.term AS preferredTerm, \
     coalesce(d.languageCode, $language) AS languageCode \
     ORDER BY size(d.term) ASC LIMIT $limit";

const HIERARCHY_QUERY: &str = "MATCH (c:Concept {id: $id})-[:IS_A]->(p:Concept)-[:HAS_DESCRIPTION]->(d:Description) \
     WHERE p.active = true AND d.active = true \
     RETURN p.id AS conceptId, d.term AS preferredTerm LIMIT 10";

impl GraphOntologyClient {
    pub fn new(config: &OntologyConfig) -> EngineResult<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| EngineError::Internal("ontology.endpoint required".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let auth = match (&config.username, &config.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        };
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            auth,
            n_max: config.n_max,
        })
    }

    async fn run_query(
        &self,
        statement: &str,
        parameters: serde_json::Value,
    ) -> EngineResult<Vec<serde_json::Value>> {
        let body = serde_json::json!({
            "statements": [{ "statement": statement, "parameters": parameters }]
        });
        let url = format!("{}/db/{}/tx/commit", self.endpoint, self.database);
        let mut req = self.client.post(&url).json(&body);
        if let Some((user, pass)) = &self.auth {
            req = req.basic_auth(user, Some(pass));
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::DependencyUnavailable {
                service: "ontology",
                reason: format!("{}: {}", status, text),
            });
        }

        let json: serde_json::Value = resp.json().await.map_err(EngineError::from)?;
        if let Some(errors) = json["errors"].as_array() {
            if !errors.is_empty() {
                return Err(EngineError::DependencyUnavailable {
                    service: "ontology",
                    reason: errors[0]["message"].as_str().unwrap_or("query error").to_string(),
                });
            }
        }

        // Rows come back as positional arrays matching the RETURN columns;
        // re-key them by column name.
        let result = &json["results"][0];
        let columns: Vec<String> = result["columns"]
            .as_array()
            .map(|cols| {
                cols.iter()
                    .filter_map(|c| c.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let mut rows = Vec::new();
        for item in result["data"].as_array().unwrap_or(&Vec::new()) {
            let mut obj = serde_json::Map::new();
            if let Some(values) = item["row"].as_array() {
                for (col, value) in columns.iter().zip(values.iter()) {
                    obj.insert(col.clone(), value.clone());
                }
            }
            rows.push(serde_json::Value::Object(obj));
        }
        Ok(rows)
    }

    async fn resolve_one(
        &self,
        term: &str,
        language: &str,
    ) -> EngineResult<Vec<ConceptMapping>> {
        let lowered = term.to_lowercase();
        let params = |limit: usize| {
            serde_json::json!({
                "term": lowered,
                "language": language,
                "limit": limit,
            })
        };

        for (statement, kind) in [
            (EXACT_MATCH_QUERY, MatchKind::Exact),
            (CONTAINS_QUERY, MatchKind::Contains),
            (SEMANTIC_QUERY, MatchKind::Semantic),
        ] {
            let rows = self.run_query(statement, params(self.n_max)).await?;
            if !rows.is_empty() {
                return Ok(rows
                    .into_iter()
                    .take(self.n_max)
                    .map(|row| ConceptMapping {
                        original_term: term.to_string(),
                        concept_id: row["conceptId"]
                            .as_str()
                            .map(String::from)
                            .unwrap_or_else(|| row["conceptId"].to_string()),
                        preferred_term: row["preferredTerm"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        language: row["languageCode"].as_str().unwrap_or(language).to_string(),
                        confidence: confidence_for(kind),
                        match_kind: kind,
                    })
                    .collect());
            }
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl OntologyClient for GraphOntologyClient {
    async fn resolve(
        &self,
        terms: &[TermCandidate],
        language: &str,
    ) -> EngineResult<Vec<ConceptMapping>> {
        let mut mappings = Vec::new();
        for term in terms {
            mappings.extend(self.resolve_one(&term.normalized, language).await?);
        }
        Ok(mappings)
    }

    async fn hierarchy(&self, concept_id: &str) -> EngineResult<Vec<(String, String)>> {
        let rows = self
            .run_query(HIERARCHY_QUERY, serde_json::json!({ "id": concept_id }))
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Some((
                    row["conceptId"].as_str()?.to_string(),
                    row["preferredTerm"].as_str()?.to_string(),
                ))
            })
            .collect())
    }

    async fn probe(&self) -> EngineResult<()> {
        self.run_query("RETURN 1 AS test", serde_json::json!({}))
            .await
            .map(|_| ())
    }
}

// ============ Static backend ============

/// One concept in the static table.
#[derive(Debug, Clone)]
pub struct StaticConcept {
    pub concept_id: String,
    /// Preferred term per language code.
    pub preferred: HashMap<String, String>,
    /// Additional matchable descriptions per language code.
    pub synonyms: HashMap<String, Vec<String>>,
    /// Parent concept ids.
    pub parents: Vec<String>,
}

/// In-memory concept table for tests and offline runs.
pub struct StaticOntologyClient {
    concepts: Vec<StaticConcept>,
    n_max: usize,
}

impl StaticOntologyClient {
    pub fn new(concepts: Vec<StaticConcept>, n_max: usize) -> Self {
        Self { concepts, n_max }
    }

    /// A small clinically-plausible table that covers the common demo and
    /// test vocabulary in English and French.
    pub fn with_default_concepts() -> Self {
        fn concept(
            id: &str,
            en: &str,
            fr: &str,
            syn_en: &[&str],
            syn_fr: &[&str],
            parents: &[&str],
        ) -> StaticConcept {
            let mut preferred = HashMap::new();
            preferred.insert("en".to_string(), en.to_string());
            preferred.insert("fr".to_string(), fr.to_string());
            let mut synonyms = HashMap::new();
            synonyms.insert(
                "en".to_string(),
                syn_en.iter().map(|s| s.to_string()).collect(),
            );
            synonyms.insert(
                "fr".to_string(),
                syn_fr.iter().map(|s| s.to_string()).collect(),
            );
            StaticConcept {
                concept_id: id.to_string(),
                preferred,
                synonyms,
                parents: parents.iter().map(|s| s.to_string()).collect(),
            }
        }

        Self::new(
            vec![
                concept(
                    "38341003",
                    "Hypertensive disorder",
                    "Hypertension artérielle",
                    &["hypertension", "high blood pressure", "htn"],
                    &["hypertension", "tension artérielle élevée"],
                    &["64572001"],
                ),
                concept(
                    "29857009",
                    "Chest pain",
                    "Douleur thoracique",
                    &["chest pain", "chest discomfort"],
                    &["douleur thoracique", "douleur à la poitrine"],
                    &["22253000"],
                ),
                concept(
                    "25064002",
                    "Headache",
                    "Céphalée",
                    &["headache", "head pain"],
                    &["céphalée", "mal de tête"],
                    &["22253000"],
                ),
                concept(
                    "73211009",
                    "Diabetes mellitus",
                    "Diabète sucré",
                    &["diabetes", "diabetes mellitus"],
                    &["diabète"],
                    &["64572001"],
                ),
                concept(
                    "267036007",
                    "Dyspnea",
                    "Dyspnée",
                    &["shortness of breath", "dyspnea", "breathlessness"],
                    &["essoufflement", "dyspnée"],
                    &["22253000"],
                ),
                concept(
                    "386661006",
                    "Fever",
                    "Fièvre",
                    &["fever", "pyrexia"],
                    &["fièvre"],
                    &["22253000"],
                ),
                concept(
                    "422587007",
                    "Nausea",
                    "Nausée",
                    &["nausea", "feeling sick"],
                    &["nausée"],
                    &["22253000"],
                ),
                concept(
                    "387506000",
                    "Lisinopril",
                    "Lisinopril",
                    &["lisinopril"],
                    &["lisinopril"],
                    &["410942007"],
                ),
                concept(
                    "22253000",
                    "Pain",
                    "Douleur",
                    &["pain"],
                    &["douleur"],
                    &[],
                ),
                concept(
                    "64572001",
                    "Disease",
                    "Maladie",
                    &["disease", "disorder"],
                    &["maladie"],
                    &[],
                ),
            ],
            5,
        )
    }

    fn descriptions<'a>(&self, concept: &'a StaticConcept, language: &str) -> Vec<&'a str> {
        let mut out = Vec::new();
        if let Some(p) = concept.preferred.get(language) {
            out.push(p.as_str());
        }
        if let Some(syns) = concept.synonyms.get(language) {
            out.extend(syns.iter().map(|s| s.as_str()));
        }
        out
    }

    fn match_term(&self, term: &str, language: &str) -> Vec<ConceptMapping> {
        let needle = term.to_lowercase();
        let mut best: Vec<(MatchKind, &StaticConcept)> = Vec::new();

        for ladder in [MatchKind::Exact, MatchKind::Contains, MatchKind::Semantic] {
            for concept in &self.concepts {
                let descriptions = self.descriptions(concept, language);
                let hit = match ladder {
                    MatchKind::Exact => descriptions.iter().any(|d| d.to_lowercase() == needle),
                    MatchKind::Contains => descriptions
                        .iter()
                        .any(|d| d.to_lowercase().contains(&needle) || needle.contains(&d.to_lowercase())),
                    MatchKind::Semantic => {
                        let words: Vec<&str> = needle.split_whitespace().collect();
                        descriptions.iter().any(|d| {
                            let lower = d.to_lowercase();
                            words.iter().any(|w| lower.contains(w))
                        })
                    }
                };
                if hit {
                    best.push((ladder, concept));
                }
            }
            if !best.is_empty() {
                break;
            }
        }

        best.into_iter()
            .take(self.n_max)
            .map(|(kind, concept)| ConceptMapping {
                original_term: term.to_string(),
                concept_id: concept.concept_id.clone(),
                preferred_term: concept
                    .preferred
                    .get(language)
                    .or_else(|| concept.preferred.get("en"))
                    .cloned()
                    .unwrap_or_default(),
                language: language.to_string(),
                confidence: confidence_for(kind),
                match_kind: kind,
            })
            .collect()
    }
}

#[async_trait]
impl OntologyClient for StaticOntologyClient {
    async fn resolve(
        &self,
        terms: &[TermCandidate],
        language: &str,
    ) -> EngineResult<Vec<ConceptMapping>> {
        let mut mappings = Vec::new();
        for term in terms {
            mappings.extend(self.match_term(&term.normalized, language));
        }
        Ok(mappings)
    }

    async fn hierarchy(&self, concept_id: &str) -> EngineResult<Vec<(String, String)>> {
        let Some(concept) = self.concepts.iter().find(|c| c.concept_id == concept_id) else {
            return Ok(Vec::new());
        };
        Ok(concept
            .parents
            .iter()
            .filter_map(|pid| {
                let parent = self.concepts.iter().find(|c| &c.concept_id == pid)?;
                Some((
                    parent.concept_id.clone(),
                    parent.preferred.get("en").cloned().unwrap_or_default(),
                ))
            })
            .collect())
    }

    async fn probe(&self) -> EngineResult<()> {
        Ok(())
    }
}

// ============ Job-scope cache ============

/// Caches resolutions per `(normalized term, language)` for the lifetime
/// of a job.
pub struct CachedOntology<C> {
    inner: C,
    cache: Mutex<HashMap<(String, String), Vec<ConceptMapping>>>,
}

impl<C: OntologyClient> CachedOntology<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<C: OntologyClient> OntologyClient for CachedOntology<C> {
    async fn resolve(
        &self,
        terms: &[TermCandidate],
        language: &str,
    ) -> EngineResult<Vec<ConceptMapping>> {
        let mut out = Vec::new();
        let mut misses = Vec::new();
        {
            let cache = self.cache.lock().unwrap();
            for term in terms {
                let key = (term.normalized.clone(), language.to_string());
                match cache.get(&key) {
                    Some(hit) => out.extend(hit.clone()),
                    None => misses.push(term.clone()),
                }
            }
        }

        if !misses.is_empty() {
            let resolved = self.inner.resolve(&misses, language).await?;
            let mut cache = self.cache.lock().unwrap();
            for term in &misses {
                let hits: Vec<ConceptMapping> = resolved
                    .iter()
                    .filter(|m| m.original_term == term.normalized)
                    .cloned()
                    .collect();
                cache.insert((term.normalized.clone(), language.to_string()), hits);
            }
            out.extend(resolved);
        }
        Ok(out)
    }

    async fn hierarchy(&self, concept_id: &str) -> EngineResult<Vec<(String, String)>> {
        self.inner.hierarchy(concept_id).await
    }

    async fn probe(&self) -> EngineResult<()> {
        self.inner.probe().await
    }
}
