//! Advisor exceptions.
//!
//! An exception is an advisor-authored override layered onto computed
//! audits: force a clause to pass, substitute credits or subject, or
//! insert a specific course record into a clause. Rows are soft-disabled,
//! never deleted, so the override history stays auditable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::overlay::{PatchOp, TreePatch};

/// Upper bound on advisor notes, enforced before persistence.
pub const NOTES_MAX_LEN: usize = 2048;

// ---------------------------------------------------------------------------
// Exception
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exception {
    pub id: ExceptionId,

    pub student_id: String,
    pub area_code: String,

    /// Path into the clause tree the override applies to.
    pub path: Vec<String>,

    pub kind: ExceptionKind,

    /// Course record for insert-course exceptions.
    pub clbid: Option<String>,

    pub forced_pass: bool,
    pub override_credits: Option<f64>,
    pub override_subject: Option<String>,

    /// Disabled exceptions stay on file but have no effect on the next
    /// computed result.
    pub is_enabled: bool,

    pub author: String,
    pub notes: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Exception {
    /// The overlay patch this exception contributes, if enabled.
    pub fn to_patch(&self) -> Option<TreePatch> {
        if !self.is_enabled {
            return None;
        }

        let op = match self.kind {
            ExceptionKind::ForcedPass => PatchOp::ForcePass,
            ExceptionKind::OverrideCredits => PatchOp::OverrideCredits(self.override_credits?),
            ExceptionKind::OverrideSubject => {
                PatchOp::OverrideSubject(self.override_subject.clone()?)
            }
            ExceptionKind::InsertCourse => PatchOp::InsertCourse(self.clbid.clone()?),
        };

        Some(TreePatch {
            path: self.path.clone(),
            op,
        })
    }
}

/// Newtype for exception IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExceptionId(pub Uuid);

impl ExceptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ExceptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for ExceptionId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExceptionKind {
    /// The clause at `path` counts as satisfied regardless of computation.
    ForcedPass,
    /// Substitute the numeric credits field at `path`.
    OverrideCredits,
    /// Substitute the categorical subject field at `path`.
    OverrideSubject,
    /// Insert the course record `clbid` into the clause at `path`.
    InsertCourse,
}

impl std::fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExceptionKind::ForcedPass => "forced-pass",
            ExceptionKind::OverrideCredits => "override-credits",
            ExceptionKind::OverrideSubject => "override-subject",
            ExceptionKind::InsertCourse => "insert-course",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExceptionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "forced-pass" => Ok(ExceptionKind::ForcedPass),
            "override-credits" => Ok(ExceptionKind::OverrideCredits),
            "override-subject" => Ok(ExceptionKind::OverrideSubject),
            "insert-course" => Ok(ExceptionKind::InsertCourse),
            _ => Err(Error::Other(format!("unknown exception kind: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder + update patch
// ---------------------------------------------------------------------------

/// Builder for creating exceptions.
pub struct NewException {
    pub(crate) student_id: String,
    pub(crate) area_code: String,
    pub(crate) path: Vec<String>,
    pub(crate) kind: ExceptionKind,
    pub(crate) clbid: Option<String>,
    pub(crate) override_credits: Option<f64>,
    pub(crate) override_subject: Option<String>,
    pub(crate) author: String,
    pub(crate) notes: String,
}

impl NewException {
    pub fn new(
        student_id: impl Into<String>,
        area_code: impl Into<String>,
        path: Vec<String>,
        kind: ExceptionKind,
        author: impl Into<String>,
    ) -> Self {
        Self {
            student_id: student_id.into(),
            area_code: area_code.into(),
            path,
            kind,
            clbid: None,
            override_credits: None,
            override_subject: None,
            author: author.into(),
            notes: String::new(),
        }
    }

    pub fn clbid(mut self, clbid: impl Into<String>) -> Self {
        self.clbid = Some(clbid.into());
        self
    }

    pub fn override_credits(mut self, credits: f64) -> Self {
        self.override_credits = Some(credits);
        self
    }

    pub fn override_subject(mut self, subject: impl Into<String>) -> Self {
        self.override_subject = Some(subject.into());
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    /// Reject before persistence: oversized notes, kind/field mismatches.
    pub fn validate(&self) -> Result<()> {
        validate_notes(&self.notes)?;

        match self.kind {
            ExceptionKind::OverrideCredits if self.override_credits.is_none() => Err(
                Error::Validation("override-credits exception requires credits".into()),
            ),
            ExceptionKind::OverrideSubject if self.override_subject.is_none() => Err(
                Error::Validation("override-subject exception requires a subject".into()),
            ),
            ExceptionKind::InsertCourse if self.clbid.is_none() => Err(Error::Validation(
                "insert-course exception requires a clbid".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Fields an update may touch. Everything else on the row is immutable.
#[derive(Debug, Default, Clone)]
pub struct ExceptionUpdate {
    pub override_credits: Option<f64>,
    pub override_subject: Option<String>,
    pub notes: Option<String>,
}

impl ExceptionUpdate {
    pub fn validate(&self) -> Result<()> {
        if let Some(ref notes) = self.notes {
            validate_notes(notes)?;
        }
        Ok(())
    }
}

pub(crate) fn validate_notes(notes: &str) -> Result<()> {
    if notes.chars().count() > NOTES_MAX_LEN {
        return Err(Error::Validation(format!(
            "notes exceed {NOTES_MAX_LEN} characters"
        )));
    }
    Ok(())
}
