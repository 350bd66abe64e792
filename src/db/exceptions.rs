//! Exception rows: create, limited update, enable/disable.
//!
//! Rows are never hard-deleted; disabling keeps the history intact.
//! Every mutation stamps `updated_at` and emits an audit event with
//! before- and after-images.

use chrono::Utc;
use tracing::info;

use crate::error::{Error, Result};
use crate::events::AuditEvent;
use crate::model::exception::*;
use crate::telemetry::metrics;

const EXCEPTION_COLUMNS: &str = "id, student_id, area_code, path, kind, clbid, forced_pass, \
     override_credits, override_subject, is_enabled, author, notes, created_at, updated_at";

impl super::Db {
    /// Create an exception. Validation (notes bound, kind/field match)
    /// runs before anything is persisted.
    pub async fn create_exception(&self, new: NewException) -> Result<Exception> {
        new.validate()?;

        let id = ExceptionId::new();
        let now = Utc::now();
        let path = serde_json::to_value(&new.path)
            .map_err(|e| Error::Other(format!("serialize path: {e}")))?;
        let forced_pass = new.kind == ExceptionKind::ForcedPass;

        sqlx::query(
            "INSERT INTO exceptions (
                id, student_id, area_code, path, kind, clbid, forced_pass,
                override_credits, override_subject, is_enabled, author, notes,
                created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)",
        )
        .bind(id.0.to_string())
        .bind(&new.student_id)
        .bind(&new.area_code)
        .bind(&path)
        .bind(new.kind.to_string())
        .bind(&new.clbid)
        .bind(forced_pass)
        .bind(new.override_credits)
        .bind(&new.override_subject)
        .bind(&new.author)
        .bind(&new.notes)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        let exception = self.get_exception(id).await?;

        let after = serde_json::to_value(&exception).unwrap_or_default();
        self.audit()
            .emit(AuditEvent::insert("exceptions", &exception.author, after));
        metrics::exception_mutations().add(1, &[]);

        info!(
            exception_id = %id,
            student_id = %exception.student_id,
            area_code = %exception.area_code,
            kind = %exception.kind,
            "exception created"
        );
        Ok(exception)
    }

    /// Update override fields and notes. Everything else on the row is
    /// immutable.
    pub async fn update_exception(
        &self,
        id: ExceptionId,
        update: ExceptionUpdate,
        actor: &str,
    ) -> Result<Exception> {
        update.validate()?;

        let before = self.get_exception(id).await?;

        let override_credits = update.override_credits.or(before.override_credits);
        let override_subject = update
            .override_subject
            .clone()
            .or_else(|| before.override_subject.clone());
        let notes = update.notes.clone().unwrap_or_else(|| before.notes.clone());

        sqlx::query(
            "UPDATE exceptions
             SET override_credits = ?, override_subject = ?, notes = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(override_credits)
        .bind(&override_subject)
        .bind(&notes)
        .bind(Utc::now())
        .bind(id.0.to_string())
        .execute(self.pool())
        .await?;

        let after = self.get_exception(id).await?;
        self.emit_exception_update(&before, &after, actor);
        Ok(after)
    }

    /// Re-enable a disabled exception; it affects the next computation.
    pub async fn enable_exception(&self, id: ExceptionId, actor: &str) -> Result<Exception> {
        self.set_exception_enabled(id, true, actor).await
    }

    /// Disable an exception. The row stays on file and retrievable; only
    /// its effect on future computations is removed.
    pub async fn disable_exception(&self, id: ExceptionId, actor: &str) -> Result<Exception> {
        self.set_exception_enabled(id, false, actor).await
    }

    async fn set_exception_enabled(
        &self,
        id: ExceptionId,
        enabled: bool,
        actor: &str,
    ) -> Result<Exception> {
        let before = self.get_exception(id).await?;

        sqlx::query("UPDATE exceptions SET is_enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(Utc::now())
            .bind(id.0.to_string())
            .execute(self.pool())
            .await?;

        let after = self.get_exception(id).await?;
        self.emit_exception_update(&before, &after, actor);

        info!(
            exception_id = %id,
            enabled,
            "exception toggled"
        );
        Ok(after)
    }

    /// Get an exception by ID.
    pub async fn get_exception(&self, id: ExceptionId) -> Result<Exception> {
        let row: Option<ExceptionRow> = sqlx::query_as(&format!(
            "SELECT {EXCEPTION_COLUMNS} FROM exceptions WHERE id = ?"
        ))
        .bind(id.0.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("exception {id}")))?
            .try_into_exception()
    }

    /// Exceptions for a pair, oldest first. `enabled_only` is what the
    /// compute pipeline uses; history views pass false.
    pub async fn list_exceptions(
        &self,
        student_id: &str,
        area_code: &str,
        enabled_only: bool,
    ) -> Result<Vec<Exception>> {
        let rows: Vec<ExceptionRow> = if enabled_only {
            sqlx::query_as(&format!(
                "SELECT {EXCEPTION_COLUMNS} FROM exceptions
                 WHERE student_id = ? AND area_code = ? AND is_enabled = 1
                 ORDER BY created_at ASC"
            ))
            .bind(student_id)
            .bind(area_code)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as(&format!(
                "SELECT {EXCEPTION_COLUMNS} FROM exceptions
                 WHERE student_id = ? AND area_code = ?
                 ORDER BY created_at ASC"
            ))
            .bind(student_id)
            .bind(area_code)
            .fetch_all(self.pool())
            .await?
        };

        rows.into_iter()
            .map(ExceptionRow::try_into_exception)
            .collect()
    }

    fn emit_exception_update(&self, before: &Exception, after: &Exception, actor: &str) {
        let before = serde_json::to_value(before).unwrap_or_default();
        let after = serde_json::to_value(after).unwrap_or_default();
        self.audit()
            .emit(AuditEvent::update("exceptions", actor, before, after));
        metrics::exception_mutations().add(1, &[]);
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ExceptionRow {
    id: String,
    student_id: String,
    area_code: String,
    path: serde_json::Value,
    kind: String,
    clbid: Option<String>,
    forced_pass: bool,
    override_credits: Option<f64>,
    override_subject: Option<String>,
    is_enabled: bool,
    author: String,
    notes: String,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl ExceptionRow {
    fn try_into_exception(self) -> Result<Exception> {
        Ok(Exception {
            id: ExceptionId(
                self.id
                    .parse()
                    .map_err(|e: uuid::Error| Error::Other(format!("bad exception id: {e}")))?,
            ),
            student_id: self.student_id,
            area_code: self.area_code,
            path: serde_json::from_value(self.path)
                .map_err(|e| Error::Other(format!("bad exception path: {e}")))?,
            kind: self.kind.parse()?,
            clbid: self.clbid,
            forced_pass: self.forced_pass,
            override_credits: self.override_credits,
            override_subject: self.override_subject,
            is_enabled: self.is_enabled,
            author: self.author,
            notes: self.notes,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
