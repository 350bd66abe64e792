//! Audit results.
//!
//! A result is one computed audit for a (student, area) pair. Results in
//! one pair form a lineage ordered by revision; exactly one finalized
//! result per lineage is active at a time. Rows are immutable once
//! finalized, except for the `is_active` flag.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rules::SatNode;

/// Disjoint mapping of course record (clbid) to the requirement slot it
/// satisfies.
pub type ClaimedCourses = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// AuditResult
// ---------------------------------------------------------------------------

/// One computed audit, at one revision of its lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResult {
    pub id: ResultId,

    pub student_id: String,
    pub area_code: String,
    pub catalog: String,

    /// Batch run this result was computed under.
    pub run: i64,

    /// Position in the lineage. None while the computation is in flight;
    /// assigned at finalize, strictly increasing, never reused.
    pub revision: Option<i64>,

    /// The single-active flag. At most one finalized result per
    /// (student, area) carries it.
    pub is_active: bool,

    pub status: ResultStatus,

    /// What-if results never become active.
    pub speculative: bool,

    /// Raw fit score and the maximum achievable for this area.
    pub rank: f64,
    pub max_rank: f64,

    pub gpa: f64,

    /// Courses claimed by requirement slots. Keys are pairwise disjoint.
    pub claimed_courses: ClaimedCourses,

    /// The clause-satisfaction tree, present on successful audits.
    pub result_tree: Option<SatNode>,

    /// Diagnostic payload, present on failed audits.
    pub error: Option<serde_json::Value>,

    /// For link-only results: the computed result this one references.
    pub link_to: Option<ResultId>,

    /// Wall-clock cost of the computation.
    pub duration_ms: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuditResult {
    /// Normalized fit score in [0, 1], used to compare candidate areas.
    pub fn normalized_rank(&self) -> f64 {
        if self.max_rank > 0.0 {
            self.rank / self.max_rank
        } else {
            0.0
        }
    }
}

/// Newtype for result IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultId(pub Uuid);

impl ResultId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ResultId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for ResultId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Row opened, computation in flight.
    Pending,
    /// Audit completed.
    Ok,
    /// Audit failed; `error` carries diagnostics.
    Failed,
}

impl ResultStatus {
    pub fn is_final(self) -> bool {
        !matches!(self, ResultStatus::Pending)
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultStatus::Pending => "pending",
            ResultStatus::Ok => "ok",
            ResultStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ResultStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ResultStatus::Pending),
            "ok" => Ok(ResultStatus::Ok),
            "failed" => Ok(ResultStatus::Failed),
            _ => Err(crate::error::Error::Other(format!(
                "unknown result status: {s}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What a finished computation hands to the result store for finalization.
#[derive(Debug, Clone)]
pub struct AuditOutcome {
    pub status: ResultStatus,
    pub rank: f64,
    pub max_rank: f64,
    pub gpa: f64,
    pub claimed_courses: ClaimedCourses,
    pub result_tree: Option<SatNode>,
    pub error: Option<serde_json::Value>,
    pub link_to: Option<ResultId>,
    pub duration_ms: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuditOutcome {
    pub fn ok(
        rank: f64,
        max_rank: f64,
        gpa: f64,
        claimed_courses: ClaimedCourses,
        result_tree: SatNode,
    ) -> Self {
        Self {
            status: ResultStatus::Ok,
            rank,
            max_rank,
            gpa,
            claimed_courses,
            result_tree: Some(result_tree),
            error: None,
            link_to: None,
            duration_ms: None,
            expires_at: None,
        }
    }

    pub fn failed(error: serde_json::Value) -> Self {
        Self {
            status: ResultStatus::Failed,
            rank: 0.0,
            max_rank: 0.0,
            gpa: 0.0,
            claimed_courses: ClaimedCourses::new(),
            result_tree: None,
            error: Some(error),
            link_to: None,
            duration_ms: None,
            expires_at: None,
        }
    }

    /// A link-only outcome: reference `target` and carry its scores
    /// without recomputation.
    pub fn link(target: &AuditResult) -> Self {
        Self {
            status: ResultStatus::Ok,
            rank: target.rank,
            max_rank: target.max_rank,
            gpa: target.gpa,
            claimed_courses: target.claimed_courses.clone(),
            result_tree: None,
            error: None,
            link_to: Some(target.id),
            duration_ms: None,
            expires_at: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}
