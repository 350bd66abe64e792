//! Core data model: jobs, results, exceptions, what-if staging.

pub mod exception;
pub mod job;
pub mod result;
pub mod whatif;

pub use exception::{
    Exception, ExceptionId, ExceptionKind, ExceptionUpdate, NewException, NOTES_MAX_LEN,
};
pub use job::{Job, JobId, JobState, NewJob};
pub use result::{AuditOutcome, AuditResult, ClaimedCourses, ResultId, ResultStatus};
pub use whatif::{StageKind, StagedChange, Template, TemplateId};
