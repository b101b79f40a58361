//! Job manifest for audit and replay.
//!
//! Emitted when a job finishes successfully: which plan ran, under which
//! assignment, with which engine version. Two runs of the same plan with the
//! same configuration and registry produce equal `plan_hash` and
//! `assignment_hash`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::Hash256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManifest {
    pub id: JobId,

    /// Caller-supplied job name, if any.
    pub job_name: Option<String>,

    /// Structural fingerprint of the plan.
    pub plan_hash: Hash256,

    /// Hash of the final platform/channel assignment.
    pub assignment_hash: Hash256,

    /// Hash of the configuration snapshot.
    pub config_hash: Hash256,

    pub engine_version: String,

    /// Milliseconds since Unix epoch (UTC).
    pub started_ms: u64,
    pub finished_ms: u64,

    /// How many times the assignment was revised while running.
    pub reoptimizations: u32,

    /// Number of segments that were replayed on a fallback platform.
    pub fallbacks: u32,
}

impl JobManifest {
    pub fn new(
        id: JobId,
        job_name: Option<String>,
        plan_hash: Hash256,
        assignment_hash: Hash256,
        config_hash: Hash256,
        started_ms: u64,
    ) -> Self {
        Self {
            id,
            job_name,
            plan_hash,
            assignment_hash,
            config_hash,
            engine_version: crate::VERSION.to_string(),
            started_ms,
            finished_ms: started_ms,
            reoptimizations: 0,
            fallbacks: 0,
        }
    }

    pub fn finish(mut self, finished_ms: u64, assignment_hash: Hash256) -> Self {
        self.finished_ms = finished_ms;
        self.assignment_hash = assignment_hash;
        self
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
