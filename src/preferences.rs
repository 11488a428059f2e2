//! Doctor terminology preference store.
//!
//! Maps `(doctor_id, original_term)` to a preferred term with a confidence
//! learned from past note edits. The store is a JSON file loaded at
//! startup and rewritten on update; reads during a job come from a
//! snapshot taken at job start, so out-of-band updates never affect a
//! running job.
//!
//! Only entries at or above the apply threshold (default 0.7) are applied
//! to generation. Request-supplied preferences overlay the stored snapshot
//! and win on conflict.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::models::PreferenceEntry;

type DoctorMap = HashMap<String, HashMap<String, PreferenceEntry>>;

/// File-backed preference store.
pub struct PreferenceStore {
    path: PathBuf,
    inner: RwLock<DoctorMap>,
}

impl PreferenceStore {
    /// Load the store from disk; a missing file yields an empty store.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let inner: DoctorMap = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| EngineError::Internal(format!("read {}: {}", path.display(), e)))?;
            serde_json::from_str(&content)
                .map_err(|e| EngineError::Internal(format!("parse {}: {}", path.display(), e)))?
        } else {
            HashMap::new()
        };

        info!(
            path = %path.display(),
            doctors = inner.len(),
            "preference store loaded"
        );

        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(inner),
        })
    }

    /// An empty in-memory store that persists nowhere (tests, offline).
    pub fn ephemeral() -> Self {
        Self {
            path: PathBuf::new(),
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// All stored entries for a doctor.
    pub fn get(&self, doctor_id: &str) -> HashMap<String, PreferenceEntry> {
        self.inner
            .read()
            .unwrap()
            .get(doctor_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace a doctor's preference map and persist.
    pub fn put(&self, doctor_id: &str, preferences: HashMap<String, String>) -> EngineResult<()> {
        let now = Utc::now();
        let entries: HashMap<String, PreferenceEntry> = preferences
            .into_iter()
            .map(|(original, preferred)| {
                (
                    original,
                    PreferenceEntry {
                        preferred,
                        confidence: 1.0,
                        last_updated: now,
                    },
                )
            })
            .collect();

        {
            let mut inner = self.inner.write().unwrap();
            inner.insert(doctor_id.to_string(), entries);
        }
        self.persist()
    }

    /// The preferences applied to a job: stored entries at or above the
    /// threshold, overlaid with any request-supplied preferences (which
    /// win on conflict). Returned sorted by original term so preference
    /// application is a deterministic function of its inputs.
    pub fn snapshot(
        &self,
        doctor_id: &str,
        request_overlay: &HashMap<String, String>,
        threshold: f64,
    ) -> Vec<(String, String)> {
        let mut applied: HashMap<String, String> = self
            .get(doctor_id)
            .into_iter()
            .filter(|(_, entry)| entry.confidence >= threshold)
            .map(|(original, entry)| (original, entry.preferred))
            .collect();

        for (original, preferred) in request_overlay {
            applied.insert(original.clone(), preferred.clone());
        }

        let mut out: Vec<(String, String)> = applied.into_iter().collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn persist(&self) -> EngineResult<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| EngineError::Internal(format!("mkdir {}: {}", parent.display(), e)))?;
            }
        }
        let inner = self.inner.read().unwrap();
        let json = serde_json::to_string_pretty(&*inner)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        std::fs::write(&self.path, json)
            .map_err(|e| EngineError::Internal(format!("write {}: {}", self.path.display(), e)))
    }
}
