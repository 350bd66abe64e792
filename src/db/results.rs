//! Versioned result store.
//!
//! Results for one (student, area) pair form a lineage ordered by
//! revision. Finalization assigns the revision and performs the
//! activation flip in one transaction; a partial unique index backs the
//! single-active invariant structurally. Activation is decided by
//! revision number, never wall-clock: a completion that would activate a
//! lower or equal revision than the current active one is persisted but
//! stays inactive.

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::AuditEvent;
use crate::model::job::Job;
use crate::model::result::*;
use crate::telemetry::metrics;

const RESULT_COLUMNS: &str = "id, student_id, area_code, catalog, run, revision, is_active, \
     status, speculative, rank, max_rank, gpa, claimed_courses, result_tree, error, link_to, \
     duration_ms, created_at, finished_at, expires_at";

/// Whether a finalized result won the active pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// This result is now the lineage's active one.
    Activated,
    /// An equal or higher revision was already active; this row is
    /// persisted but inactive. Not a failure: the revision-ordering
    /// rule resolved a race deterministically.
    Superseded,
    /// Link-only and speculative results never contend for the pointer.
    Skipped,
}

/// A finalized result row plus its activation outcome.
#[derive(Debug)]
pub struct Finalized {
    pub result: AuditResult,
    pub activation: Activation,
}

impl super::Db {
    /// Open a pending result row for a claimed job. Memo entries written
    /// during the computation hang off this row.
    pub async fn open_result(&self, job: &Job) -> Result<ResultId> {
        let id = ResultId::new();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO results (
                id, student_id, area_code, catalog, run, status, speculative,
                is_active, created_at
             ) VALUES (?, ?, ?, ?, ?, 'pending', ?, 0, ?)",
        )
        .bind(id.0.to_string())
        .bind(&job.student_id)
        .bind(&job.area_code)
        .bind(&job.catalog)
        .bind(job.run)
        .bind(job.speculative)
        .bind(now)
        .execute(self.pool())
        .await?;

        debug!(result_id = %id, student_id = %job.student_id, area_code = %job.area_code, "result row opened");
        Ok(id)
    }

    /// Finalize a pending result: assign its revision, write the
    /// outcome, and run the activation compare-and-set.
    ///
    /// `revision` is normally None (assigned as lineage max + 1, or 0
    /// for a new lineage); recomputations that carry a revision assigned
    /// at claim time pass it explicitly and take their chances against
    /// the ordering rule.
    pub async fn finalize_result(
        &self,
        id: ResultId,
        outcome: AuditOutcome,
        revision: Option<i64>,
        actor: &str,
    ) -> Result<Finalized> {
        if !outcome.status.is_final() {
            return Err(Error::Validation(
                "finalize requires an ok or failed status".into(),
            ));
        }

        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let row = get_result_on(&mut *tx, &id.0.to_string()).await?;
        if row.parsed_status()? != ResultStatus::Pending {
            return Err(Error::InvalidTransition {
                from: row.status.clone(),
                to: outcome.status.to_string(),
            });
        }

        let revision = match revision {
            Some(r) => r,
            None => {
                let (next,): (i64,) = sqlx::query_as(
                    "SELECT COALESCE(MAX(revision), -1) + 1 FROM results
                     WHERE student_id = ? AND area_code = ? AND revision IS NOT NULL",
                )
                .bind(&row.student_id)
                .bind(&row.area_code)
                .fetch_one(&mut *tx)
                .await?;
                next
            }
        };

        let claimed = serde_json::to_value(&outcome.claimed_courses)
            .map_err(|e| Error::Other(format!("serialize claimed_courses: {e}")))?;
        let tree = outcome
            .result_tree
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| Error::Other(format!("serialize result tree: {e}")))?;

        sqlx::query(
            "UPDATE results
             SET revision = ?, status = ?, rank = ?, max_rank = ?, gpa = ?,
                 claimed_courses = ?, result_tree = ?, error = ?, link_to = ?,
                 duration_ms = ?, finished_at = ?, expires_at = ?
             WHERE id = ?",
        )
        .bind(revision)
        .bind(outcome.status.to_string())
        .bind(outcome.rank)
        .bind(outcome.max_rank)
        .bind(outcome.gpa)
        .bind(&claimed)
        .bind(&tree)
        .bind(&outcome.error)
        .bind(outcome.link_to.map(|r| r.0.to_string()))
        .bind(outcome.duration_ms)
        .bind(now)
        .bind(outcome.expires_at)
        .bind(id.0.to_string())
        .execute(&mut *tx)
        .await?;

        // Link-only and speculative results never touch the pointer.
        let contends = outcome.link_to.is_none() && !row.speculative;

        let activation = if contends {
            // Deactivate the current active row only if it is older.
            sqlx::query(
                "UPDATE results SET is_active = 0
                 WHERE student_id = ? AND area_code = ? AND is_active = 1 AND revision < ?",
            )
            .bind(&row.student_id)
            .bind(&row.area_code)
            .bind(revision)
            .execute(&mut *tx)
            .await?;

            // Activate iff the slot is free. If an equal-or-higher
            // revision is still active, this row loses and stays
            // inactive.
            let activated = sqlx::query(
                "UPDATE results SET is_active = 1
                 WHERE id = ? AND NOT EXISTS (
                     SELECT 1 FROM results
                     WHERE student_id = ? AND area_code = ? AND is_active = 1
                 )",
            )
            .bind(id.0.to_string())
            .bind(&row.student_id)
            .bind(&row.area_code)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if activated == 1 {
                Activation::Activated
            } else {
                Activation::Superseded
            }
        } else {
            Activation::Skipped
        };

        let result = get_result_on(&mut *tx, &id.0.to_string())
            .await?
            .try_into_result()?;
        tx.commit().await?;

        // Emission is synchronous but after commit; the sink's fate does
        // not affect the store.
        let after = serde_json::to_value(&result).unwrap_or_default();
        self.audit().emit(AuditEvent::insert("results", actor, after));

        match activation {
            Activation::Superseded => {
                warn!(
                    result_id = %id,
                    revision,
                    student_id = %result.student_id,
                    area_code = %result.area_code,
                    "activation lost to an equal or higher revision"
                );
                metrics::activation_conflicts().add(1, &[]);
            }
            _ => {
                info!(
                    result_id = %id,
                    revision,
                    status = %result.status,
                    activation = ?activation,
                    "result finalized"
                );
            }
        }
        metrics::results_finalized().add(
            1,
            &[KeyValue::new("status", result.status.to_string())],
        );
        if let Some(ms) = result.duration_ms {
            metrics::audit_duration_ms().record(ms as f64, &[]);
        }

        Ok(Finalized { result, activation })
    }

    /// The lineage's current result, if any revision has been activated.
    pub async fn get_active(
        &self,
        student_id: &str,
        area_code: &str,
    ) -> Result<Option<AuditResult>> {
        let row: Option<ResultRow> = sqlx::query_as(&format!(
            "SELECT {RESULT_COLUMNS} FROM results
             WHERE student_id = ? AND area_code = ? AND is_active = 1"
        ))
        .bind(student_id)
        .bind(area_code)
        .fetch_optional(self.pool())
        .await?;

        row.map(ResultRow::try_into_result).transpose()
    }

    /// One specific revision of a lineage.
    pub async fn get_revision(
        &self,
        student_id: &str,
        area_code: &str,
        revision: i64,
    ) -> Result<Option<AuditResult>> {
        let row: Option<ResultRow> = sqlx::query_as(&format!(
            "SELECT {RESULT_COLUMNS} FROM results
             WHERE student_id = ? AND area_code = ? AND revision = ?"
        ))
        .bind(student_id)
        .bind(area_code)
        .bind(revision)
        .fetch_optional(self.pool())
        .await?;

        row.map(ResultRow::try_into_result).transpose()
    }

    /// Every finalized revision of a lineage, oldest first.
    pub async fn list_history(
        &self,
        student_id: &str,
        area_code: &str,
    ) -> Result<Vec<AuditResult>> {
        let rows: Vec<ResultRow> = sqlx::query_as(&format!(
            "SELECT {RESULT_COLUMNS} FROM results
             WHERE student_id = ? AND area_code = ? AND revision IS NOT NULL
             ORDER BY revision ASC"
        ))
        .bind(student_id)
        .bind(area_code)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(ResultRow::try_into_result).collect()
    }

    /// Get a result by ID.
    pub async fn get_result(&self, id: ResultId) -> Result<AuditResult> {
        let mut conn = self.pool().acquire().await?;
        get_result_on(&mut *conn, &id.0.to_string())
            .await?
            .try_into_result()
    }

    /// Results computed under a batch run, link-only included.
    pub async fn find_by_run(
        &self,
        student_id: &str,
        area_code: &str,
        run: i64,
    ) -> Result<Vec<AuditResult>> {
        let rows: Vec<ResultRow> = sqlx::query_as(&format!(
            "SELECT {RESULT_COLUMNS} FROM results
             WHERE student_id = ? AND area_code = ? AND run = ?
             ORDER BY created_at ASC"
        ))
        .bind(student_id)
        .bind(area_code)
        .bind(run)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(ResultRow::try_into_result).collect()
    }

    /// Delete a result and (by cascade) its memo entries. The active
    /// result of a lineage cannot be deleted; that would leave a
    /// committed lineage with no current answer.
    pub async fn delete_result(&self, id: ResultId, actor: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        let row = get_result_on(&mut *tx, &id.0.to_string()).await?;
        if row.is_active {
            return Err(Error::Validation(
                "cannot delete the active result of a lineage".into(),
            ));
        }
        let before = row.try_into_result()?;

        sqlx::query("DELETE FROM results WHERE id = ?")
            .bind(id.0.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let before = serde_json::to_value(&before).unwrap_or_default();
        self.audit()
            .emit(AuditEvent::delete("results", actor, before));
        Ok(())
    }

    /// Drop expired, inactive, finalized results. Returns the number
    /// deleted (their memo entries cascade).
    pub async fn sweep_expired_results(&self) -> Result<u64> {
        let affected = sqlx::query(
            "DELETE FROM results
             WHERE expires_at IS NOT NULL AND expires_at <= ?
               AND is_active = 0 AND status != 'pending'",
        )
        .bind(Utc::now())
        .execute(self.pool())
        .await?
        .rows_affected();

        if affected > 0 {
            info!(count = affected, "swept expired results");
        }
        Ok(affected)
    }

    /// Drop pending result rows older than the cutoff: leftovers of
    /// computations that timed out between opening a row and finalizing.
    pub async fn sweep_stale_pending(&self, older_than: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - older_than;
        let affected =
            sqlx::query("DELETE FROM results WHERE status = 'pending' AND created_at <= ?")
                .bind(cutoff)
                .execute(self.pool())
                .await?
                .rows_affected();

        if affected > 0 {
            info!(count = affected, "swept stale pending results");
        }
        Ok(affected)
    }
}

async fn get_result_on(conn: &mut sqlx::SqliteConnection, id: &str) -> Result<ResultRow> {
    let row: Option<ResultRow> =
        sqlx::query_as(&format!("SELECT {RESULT_COLUMNS} FROM results WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

    row.ok_or_else(|| Error::NotFound(format!("result {id}")))
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ResultRow {
    id: String,
    student_id: String,
    area_code: String,
    catalog: String,
    run: i64,
    revision: Option<i64>,
    is_active: bool,
    status: String,
    speculative: bool,
    rank: f64,
    max_rank: f64,
    gpa: f64,
    claimed_courses: serde_json::Value,
    result_tree: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    link_to: Option<String>,
    duration_ms: Option<i64>,
    created_at: chrono::DateTime<Utc>,
    finished_at: Option<chrono::DateTime<Utc>>,
    expires_at: Option<chrono::DateTime<Utc>>,
}

impl ResultRow {
    fn parsed_status(&self) -> Result<ResultStatus> {
        self.status.parse()
    }

    fn try_into_result(self) -> Result<AuditResult> {
        let status = self.parsed_status()?;

        Ok(AuditResult {
            id: ResultId(
                self.id
                    .parse()
                    .map_err(|e: uuid::Error| Error::Other(format!("bad result id: {e}")))?,
            ),
            student_id: self.student_id,
            area_code: self.area_code,
            catalog: self.catalog,
            run: self.run,
            revision: self.revision,
            is_active: self.is_active,
            status,
            speculative: self.speculative,
            rank: self.rank,
            max_rank: self.max_rank,
            gpa: self.gpa,
            claimed_courses: serde_json::from_value(self.claimed_courses)
                .map_err(|e| Error::Other(format!("bad claimed_courses: {e}")))?,
            result_tree: self
                .result_tree
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| Error::Other(format!("bad result tree: {e}")))?,
            error: self.error,
            link_to: self
                .link_to
                .map(|s| s.parse().map(ResultId))
                .transpose()
                .map_err(|e: uuid::Error| Error::Other(format!("bad link_to: {e}")))?,
            duration_ms: self.duration_ms,
            created_at: self.created_at,
            finished_at: self.finished_at,
            expires_at: self.expires_at,
        })
    }
}
