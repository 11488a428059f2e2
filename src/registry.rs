//! Job registry.
//!
//! Tracks in-flight jobs by `job_id` and by `(conversation_id,
//! template_group_id)` for cancellation and idempotency. At most one job
//! may be Running per `(conversation_id, template_group_id)`: admitting a
//! duplicate cancels the running job first.
//!
//! The registry is the only process-wide mutable structure in the engine;
//! all access goes through a single mutex. Section and job states are
//! write-once terminal: a state in a terminal value never transitions
//! again, which is what makes `cancel` idempotent.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::models::{JobSnapshot, JobStatus, SectionState};

struct JobEntry {
    job_id: String,
    conversation_id: String,
    template_group_id: String,
    status: JobStatus,
    section_states: Vec<(String, SectionState)>,
    started_at: chrono::DateTime<Utc>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, JobEntry>,
    // (conversation_id, template_group_id) → job_id of the active job
    by_key: HashMap<(String, String), String>,
}

/// Process-wide registry of jobs.
pub struct JobRegistry {
    inner: Mutex<Inner>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Admit a new job. If a non-terminal job exists for the same
    /// `(conversation_id, template_group_id)`, it is cancelled first; its
    /// cancellation token is returned so the caller can await teardown.
    ///
    /// Returns `(job_id, this job's cancellation token, superseded job's
    /// token if any)`.
    pub fn start(
        &self,
        conversation_id: &str,
        template_group_id: &str,
        section_ids: &[String],
    ) -> (String, CancellationToken, Option<CancellationToken>) {
        let mut inner = self.inner.lock().unwrap();

        let key = (conversation_id.to_string(), template_group_id.to_string());
        let superseded = inner.by_key.get(&key).cloned().and_then(|existing_id| {
            let entry = inner.by_id.get_mut(&existing_id)?;
            if entry.status.is_terminal() {
                return None;
            }
            info!(job_id = %existing_id, "cancelling superseded job");
            entry.status = JobStatus::Cancelled;
            entry.cancel.cancel();
            Some(entry.cancel.clone())
        });

        let job_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let entry = JobEntry {
            job_id: job_id.clone(),
            conversation_id: conversation_id.to_string(),
            template_group_id: template_group_id.to_string(),
            status: JobStatus::Pending,
            section_states: section_ids
                .iter()
                .map(|id| (id.clone(), SectionState::Pending))
                .collect(),
            started_at: Utc::now(),
            cancel: cancel.clone(),
        };
        inner.by_key.insert(key, job_id.clone());
        inner.by_id.insert(job_id.clone(), entry);

        (job_id, cancel, superseded)
    }

    /// Transition a pending job to Running.
    pub fn mark_running(&self, job_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.by_id.get_mut(job_id) {
            if entry.status == JobStatus::Pending {
                entry.status = JobStatus::Running;
            }
        }
    }

    /// Update one section's state. Terminal section states are
    /// write-once: further updates are ignored.
    pub fn set_section_state(&self, job_id: &str, section_id: &str, state: SectionState) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.by_id.get_mut(job_id) {
            if let Some(slot) = entry
                .section_states
                .iter_mut()
                .find(|(id, _)| id == section_id)
            {
                if !slot.1.is_terminal() {
                    slot.1 = state;
                }
            }
        }
    }

    /// Current state of one section.
    pub fn section_state(&self, job_id: &str, section_id: &str) -> Option<SectionState> {
        let inner = self.inner.lock().unwrap();
        inner.by_id.get(job_id).and_then(|entry| {
            entry
                .section_states
                .iter()
                .find(|(id, _)| id == section_id)
                .map(|(_, state)| *state)
        })
    }

    /// Move a job to a terminal status. A job already terminal (e.g.
    /// cancelled) keeps its first terminal status.
    pub fn finish(&self, job_id: &str, status: JobStatus) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.by_id.get_mut(job_id) {
            if !entry.status.is_terminal() {
                entry.status = status;
            }
        }
    }

    /// Cancel a job. Idempotent: cancelling a terminal or unknown job is
    /// a no-op. Returns `false` only when the job id is unknown.
    pub fn cancel(&self, job_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.by_id.get_mut(job_id) {
            Some(entry) => {
                if !entry.status.is_terminal() {
                    entry.status = JobStatus::Cancelled;
                    entry.cancel.cancel();
                    info!(job_id, "job cancelled");
                }
                true
            }
            None => false,
        }
    }

    /// Status snapshot of a job.
    pub fn snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner.by_id.get(job_id).map(|entry| JobSnapshot {
            job_id: entry.job_id.clone(),
            conversation_id: entry.conversation_id.clone(),
            template_group_id: entry.template_group_id.clone(),
            status: entry.status,
            section_states: entry.section_states.clone(),
            started_at: entry.started_at,
        })
    }

    /// The job's cancellation token.
    pub fn token(&self, job_id: &str) -> Option<CancellationToken> {
        let inner = self.inner.lock().unwrap();
        inner.by_id.get(job_id).map(|entry| entry.cancel.clone())
    }

    /// Derive the terminal job status from its section states: all
    /// accepted → Completed; none accepted → Failed; otherwise
    /// PartiallyFailed.
    pub fn conclude(&self, job_id: &str) -> JobStatus {
        let inner = self.inner.lock().unwrap();
        let Some(entry) = inner.by_id.get(job_id) else {
            return JobStatus::Failed;
        };
        let total = entry.section_states.len();
        let accepted = entry
            .section_states
            .iter()
            .filter(|(_, s)| *s == SectionState::Accepted)
            .count();
        if accepted == total {
            JobStatus::Completed
        } else if accepted == 0 {
            JobStatus::Failed
        } else {
            JobStatus::PartiallyFailed
        }
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
