//! Compute pipeline: from a claimed job to a finalizable outcome.
//!
//! Drives the external rules engine, probing the memoization cache
//! before each candidate enumeration, then applies exception overlays
//! and aggregates rank/GPA. Permanent failures become failed outcomes
//! right here; transient failures bubble up so the dispatcher can
//! retry the job.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{debug, info};

use crate::db::Db;
use crate::error::{Error, Result, RulesError};
use crate::model::job::Job;
use crate::model::result::{AuditOutcome, ClaimedCourses, ResultId};
use crate::model::whatif::StageKind;
use crate::overlay::apply_patches;
use crate::rules::{CandidateSets, Course, CourseSnapshot, EvalContext, RulesEngine, clause_hash};

/// The worker-side pipeline. One instance is shared by all workers.
pub struct ComputePipeline {
    db: Arc<Db>,
    rules: Arc<dyn RulesEngine>,
}

impl ComputePipeline {
    pub fn new(db: Arc<Db>, rules: Arc<dyn RulesEngine>) -> Self {
        Self { db, rules }
    }

    /// Execute one claimed job. Returns the opened result row's ID and
    /// the outcome to finalize it with.
    ///
    /// Transient errors delete the orphaned pending row (and its memo
    /// entries, by cascade) and propagate, leaving the retry decision to
    /// the dispatcher.
    pub async fn execute(&self, job: &Job) -> Result<(ResultId, AuditOutcome)> {
        let start = Instant::now();
        let result_id = self.db.open_result(job).await?;

        match self.run(job, result_id).await {
            Ok(outcome) => {
                let outcome = outcome.with_duration(start.elapsed().as_millis() as i64);
                Ok((result_id, outcome))
            }
            Err(Error::Rules(RulesError::Permanent(msg))) => {
                info!(job_id = %job.id, error = %msg, "audit failed permanently");
                let outcome = AuditOutcome::failed(json!({
                    "error": msg,
                    "kind": "permanent",
                }))
                .with_duration(start.elapsed().as_millis() as i64);
                Ok((result_id, outcome))
            }
            Err(e) => {
                let _ = self.db.delete_result(result_id, "system").await;
                Err(e)
            }
        }
    }

    async fn run(&self, job: &Job, result_id: ResultId) -> Result<AuditOutcome> {
        if job.link_only {
            return self.link(job).await;
        }

        let mut snapshot = CourseSnapshot::from_input(&job.input_data)?;
        let mut catalog = job.catalog.clone();

        // Speculative runs fold the pair's staged hypotheticals into the
        // snapshot; committed runs evaluate the real record only.
        if job.speculative {
            self.apply_staging(job, &mut snapshot, &mut catalog).await?;
        }

        let ctx = EvalContext {
            student_id: job.student_id.clone(),
            area_code: job.area_code.clone(),
            catalog,
            snapshot,
        };

        let candidates = self.resolve_candidates(&ctx, result_id).await?;
        let tree = self.rules.evaluate(&ctx, &candidates)?;

        let exceptions = self
            .db
            .list_exceptions(&job.student_id, &job.area_code, true)
            .await?;
        let patches: Vec<_> = exceptions.iter().filter_map(|e| e.to_patch()).collect();
        let tree = apply_patches(&tree, &patches);

        let claimed = collect_claims(&tree)?;
        let rank = tree.total_rank();
        let max_rank = tree.total_max_rank();
        let gpa = ctx.snapshot.gpa();

        debug!(
            result_id = %result_id,
            rank,
            max_rank,
            gpa,
            claims = claimed.len(),
            overlays = patches.len(),
            "audit computed"
        );

        Ok(AuditOutcome::ok(rank, max_rank, gpa, claimed, tree))
    }

    /// Link-only: reference the lineage's active result instead of
    /// recomputing. The referenced lineage's pointer is never touched.
    async fn link(&self, job: &Job) -> Result<AuditOutcome> {
        let target = self
            .db
            .get_active(&job.student_id, &job.area_code)
            .await?
            .ok_or_else(|| {
                RulesError::Permanent(format!(
                    "link-only job for {}/{} but the lineage has no active result",
                    job.student_id, job.area_code
                ))
            })?;

        debug!(job_id = %job.id, target = %target.id, "link-only result");
        Ok(AuditOutcome::link(&target))
    }

    /// Resolve candidate sets for every clause the engine flags,
    /// consulting the per-result memo cache before enumerating.
    async fn resolve_candidates(
        &self,
        ctx: &EvalContext,
        result_id: ResultId,
    ) -> Result<CandidateSets> {
        let clauses = self.rules.candidate_clauses(ctx)?;
        let mut candidates = CandidateSets::default();

        for clause in &clauses {
            let hash = clause_hash(clause);

            let list = match self.db.memo_lookup(result_id, clause).await? {
                Some(entry) => entry.candidates,
                None => {
                    let list = self.rules.enumerate(ctx, clause)?;
                    self.db.memo_store(result_id, clause, &list).await?;
                    list
                }
            };

            candidates.insert(hash, list);
        }

        Ok(candidates)
    }

    async fn apply_staging(
        &self,
        job: &Job,
        snapshot: &mut CourseSnapshot,
        catalog: &mut String,
    ) -> Result<()> {
        let staged = self.db.staged_for(&job.student_id, &job.area_code).await?;

        for change in staged {
            match change.kind {
                StageKind::Catalog => {
                    if let Some(c) = change.value.as_str() {
                        *catalog = c.to_string();
                    }
                }
                StageKind::Add => {
                    let course: Course = serde_json::from_value(change.value).map_err(|e| {
                        RulesError::Permanent(format!("malformed staged course: {e}"))
                    })?;
                    if !snapshot.contains_clbid(&course.clbid) {
                        snapshot.courses.push(course);
                    }
                }
                StageKind::Drop => {
                    if let Some(clbid) = change.value.as_str() {
                        snapshot.courses.retain(|c| c.clbid != clbid);
                    }
                }
            }
        }

        Ok(())
    }
}

/// Flatten the tree's claims into the disjoint course → slot mapping.
/// The same record claimed for two different slots violates the
/// disjointness invariant and fails the audit permanently: it means the
/// rules engine (or an overlay combination) double-counted a course.
fn collect_claims(tree: &crate::rules::SatNode) -> Result<ClaimedCourses> {
    let mut claimed = BTreeMap::new();

    for claim in tree.all_claims() {
        match claimed.entry(claim.clbid.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(claim.slot.clone());
            }
            Entry::Occupied(entry) if *entry.get() == claim.slot => {}
            Entry::Occupied(entry) => {
                return Err(Error::Rules(RulesError::Permanent(format!(
                    "course {} claimed by two slots: {} and {}",
                    claim.clbid,
                    entry.get(),
                    claim.slot
                ))));
            }
        }
    }

    Ok(claimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{CourseClaim, SatNode};

    #[test]
    fn duplicate_claims_for_one_slot_collapse() {
        let tree = SatNode {
            claims: vec![
                CourseClaim {
                    clbid: "a".into(),
                    slot: "core".into(),
                },
                CourseClaim {
                    clbid: "a".into(),
                    slot: "core".into(),
                },
            ],
            ..SatNode::leaf("$", true, 1.0, 1.0)
        };

        let claimed = collect_claims(&tree).unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[test]
    fn conflicting_claims_are_rejected() {
        let tree = SatNode {
            claims: vec![
                CourseClaim {
                    clbid: "a".into(),
                    slot: "core".into(),
                },
                CourseClaim {
                    clbid: "a".into(),
                    slot: "electives".into(),
                },
            ],
            ..SatNode::leaf("$", true, 1.0, 1.0)
        };

        assert!(collect_claims(&tree).is_err());
    }
}
