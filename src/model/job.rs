//! Queue jobs.
//!
//! A job is a request to audit one (student, area) pair. It has identity,
//! a priority (lower number = more urgent), the input course snapshot, and
//! lifecycle state. Jobs are ephemeral: deleted on completion, kept only
//! in the dead state for operator inspection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A queued audit request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub id: JobId,

    /// Student being audited.
    pub student_id: String,

    /// Declared area code (e.g., "456" or "csci-ba").
    pub area_code: String,

    /// Catalog year the area is evaluated under.
    pub catalog: String,

    /// Batch run identifier. Jobs submitted together share a run.
    pub run: i64,

    /// Priority. Lower = more urgent.
    pub priority: i32,

    /// The student's course snapshot, opaque to the queue.
    pub input_data: serde_json::Value,

    /// Reuse an existing computed lineage instead of recomputing.
    /// Link-only results never move the lineage's active pointer.
    pub link_only: bool,

    /// What-if evaluation: staged hypotheticals are folded into the
    /// snapshot, and the produced result never becomes active.
    pub speculative: bool,

    /// Current lifecycle state.
    pub state: JobState,

    /// Number of execution attempts so far.
    pub attempts: u32,

    /// Maximum attempts before dead-lettering. None = dispatcher default.
    pub max_attempts: Option<u32>,

    /// Last failure message, set on retry or dead-letter.
    pub last_error: Option<String>,

    /// Worker holding the claim, while claimed.
    pub claimed_by: Option<String>,

    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Jobs past this instant are never delivered to a worker.
    pub expires_at: Option<DateTime<Utc>>,

    /// Retry backoff gate; the job is not claimable before this instant.
    pub not_before: Option<DateTime<Utc>>,
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job. Completed jobs have no state: their row is
/// deleted once the result is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker.
    Pending,
    /// Delivered to a worker, computation in flight.
    Claimed,
    /// Exhausted retries or administratively killed. Terminal.
    Dead,
}

impl JobState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Claimed)
                | (Claimed, Pending) // retry with backoff
                | (Claimed, Dead)    // exhausted or non-retryable
                | (Pending, Dead) // administrative kill
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Dead)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Claimed => "claimed",
            JobState::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "claimed" => Ok(JobState::Claimed),
            "dead" => Ok(JobState::Dead),
            _ => Err(crate::error::Error::Other(format!(
                "unknown job state: {s}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for submitting jobs. The queue's public API for new work.
pub struct NewJob {
    pub(crate) student_id: String,
    pub(crate) area_code: String,
    pub(crate) catalog: String,
    pub(crate) run: i64,
    pub(crate) priority: i32,
    pub(crate) input_data: serde_json::Value,
    pub(crate) link_only: bool,
    pub(crate) speculative: bool,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) expires_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(
        student_id: impl Into<String>,
        area_code: impl Into<String>,
        catalog: impl Into<String>,
    ) -> Self {
        Self {
            student_id: student_id.into(),
            area_code: area_code.into(),
            catalog: catalog.into(),
            run: 0,
            priority: 100,
            input_data: serde_json::Value::Null,
            link_only: false,
            speculative: false,
            max_attempts: None,
            expires_at: None,
        }
    }

    pub fn input_data(mut self, data: serde_json::Value) -> Self {
        self.input_data = data;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn run(mut self, run: i64) -> Self {
        self.run = run;
        self
    }

    pub fn link_only(mut self) -> Self {
        self.link_only = true;
        self
    }

    pub fn speculative(mut self) -> Self {
        self.speculative = true;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}
