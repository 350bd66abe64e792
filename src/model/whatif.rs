//! What-if staging and templates.
//!
//! Staged changes are non-committing hypotheticals layered onto a pair's
//! next evaluation: a different catalog, an added course, a dropped
//! course. Templates are named, per-student saved course sets, revisioned
//! independently of any result lineage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rules::Course;

// ---------------------------------------------------------------------------
// Staged changes
// ---------------------------------------------------------------------------

/// One staged hypothetical for a (student, area) pair. At most one row
/// per (pair, kind); re-staging replaces the value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedChange {
    pub student_id: String,
    pub area_code: String,
    pub kind: StageKind,
    /// Kind-shaped payload: a catalog string, a course object, or a clbid.
    pub value: serde_json::Value,
    pub staged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Evaluate under a different catalog.
    Catalog,
    /// Add a hypothetical course to the snapshot.
    Add,
    /// Drop a completed course (by clbid) from the snapshot.
    Drop,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageKind::Catalog => "catalog",
            StageKind::Add => "add",
            StageKind::Drop => "drop",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for StageKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "catalog" => Ok(StageKind::Catalog),
            "add" => Ok(StageKind::Add),
            "drop" => Ok(StageKind::Drop),
            _ => Err(crate::error::Error::Other(format!(
                "unknown stage kind: {s}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// A named, per-student saved set of hypothetical courses. Saving under
/// an existing name creates the next revision; old revisions stay
/// retrievable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub student_id: String,
    pub name: String,
    /// Monotonic per (student, name).
    pub revision: i64,
    pub courses: Vec<Course>,
    pub created_at: DateTime<Utc>,
}

/// Newtype for template IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateId(pub Uuid);

impl TemplateId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for TemplateId {
    fn default() -> Self {
        Self::new()
    }
}
