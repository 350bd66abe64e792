//! What-if staging and template storage.
//!
//! Staged hypotheticals are keyed by (student, area, kind): re-staging
//! replaces the prior value instead of accumulating. Templates are
//! per-student named course sets with their own revision counter,
//! unrelated to any result lineage.

use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::error::{Error, Result};
use crate::events::AuditEvent;
use crate::model::whatif::*;
use crate::rules::Course;

impl super::Db {
    /// Stage evaluation under a different catalog.
    pub async fn stage_catalog_change(
        &self,
        student_id: &str,
        area_code: &str,
        catalog: &str,
        actor: &str,
    ) -> Result<StagedChange> {
        self.stage(student_id, area_code, StageKind::Catalog, json!(catalog), actor)
            .await
    }

    /// Stage a hypothetical added course.
    pub async fn stage_add(
        &self,
        student_id: &str,
        area_code: &str,
        course: &Course,
        actor: &str,
    ) -> Result<StagedChange> {
        let value = serde_json::to_value(course)
            .map_err(|e| Error::Other(format!("serialize staged course: {e}")))?;
        self.stage(student_id, area_code, StageKind::Add, value, actor)
            .await
    }

    /// Stage dropping a completed course by clbid.
    pub async fn stage_drop(
        &self,
        student_id: &str,
        area_code: &str,
        clbid: &str,
        actor: &str,
    ) -> Result<StagedChange> {
        self.stage(student_id, area_code, StageKind::Drop, json!(clbid), actor)
            .await
    }

    async fn stage(
        &self,
        student_id: &str,
        area_code: &str,
        kind: StageKind,
        value: serde_json::Value,
        actor: &str,
    ) -> Result<StagedChange> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let before: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT value FROM whatif_stages
             WHERE student_id = ? AND area_code = ? AND kind = ?",
        )
        .bind(student_id)
        .bind(area_code)
        .bind(kind.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO whatif_stages (student_id, area_code, kind, value, staged_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (student_id, area_code, kind)
             DO UPDATE SET value = excluded.value, staged_at = excluded.staged_at",
        )
        .bind(student_id)
        .bind(area_code)
        .bind(kind.to_string())
        .bind(&value)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let staged = StagedChange {
            student_id: student_id.to_string(),
            area_code: area_code.to_string(),
            kind,
            value: value.clone(),
            staged_at: now,
        };
        let after = serde_json::to_value(&staged).unwrap_or_default();

        match before {
            Some((before_value,)) => {
                let before = json!({
                    "student_id": student_id,
                    "area_code": area_code,
                    "kind": kind.to_string(),
                    "value": before_value,
                });
                self.audit()
                    .emit(AuditEvent::update("whatif_stages", actor, before, after));
            }
            None => {
                self.audit()
                    .emit(AuditEvent::insert("whatif_stages", actor, after));
            }
        }

        info!(student_id, area_code, kind = %kind, "what-if staged");
        Ok(staged)
    }

    /// Everything staged for a pair.
    pub async fn staged_for(&self, student_id: &str, area_code: &str) -> Result<Vec<StagedChange>> {
        let rows: Vec<(String, serde_json::Value, chrono::DateTime<Utc>)> = sqlx::query_as(
            "SELECT kind, value, staged_at FROM whatif_stages
             WHERE student_id = ? AND area_code = ?
             ORDER BY kind ASC",
        )
        .bind(student_id)
        .bind(area_code)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|(kind, value, staged_at)| {
                Ok(StagedChange {
                    student_id: student_id.to_string(),
                    area_code: area_code.to_string(),
                    kind: kind.parse()?,
                    value,
                    staged_at,
                })
            })
            .collect()
    }

    /// Clear a pair's staged hypotheticals. Returns how many were
    /// removed.
    pub async fn clear_staged(
        &self,
        student_id: &str,
        area_code: &str,
        actor: &str,
    ) -> Result<u64> {
        let staged = self.staged_for(student_id, area_code).await?;

        let affected =
            sqlx::query("DELETE FROM whatif_stages WHERE student_id = ? AND area_code = ?")
                .bind(student_id)
                .bind(area_code)
                .execute(self.pool())
                .await?
                .rows_affected();

        for change in &staged {
            let before = serde_json::to_value(change).unwrap_or_default();
            self.audit()
                .emit(AuditEvent::delete("whatif_stages", actor, before));
        }

        Ok(affected)
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    /// Save a template under a name. A name that already exists gets the
    /// next revision; old revisions stay retrievable.
    pub async fn save_template(
        &self,
        student_id: &str,
        name: &str,
        courses: &[Course],
    ) -> Result<Template> {
        if name.trim().is_empty() {
            return Err(Error::Validation("template name must not be empty".into()));
        }

        let id = TemplateId::new();
        let now = Utc::now();
        let payload = serde_json::to_value(courses)
            .map_err(|e| Error::Other(format!("serialize template courses: {e}")))?;

        let mut tx = self.pool().begin().await?;

        let (revision,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(revision), -1) + 1 FROM templates
             WHERE student_id = ? AND name = ?",
        )
        .bind(student_id)
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO templates (id, student_id, name, revision, courses, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id.0.to_string())
        .bind(student_id)
        .bind(name)
        .bind(revision)
        .bind(&payload)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let template = Template {
            id,
            student_id: student_id.to_string(),
            name: name.to_string(),
            revision,
            courses: courses.to_vec(),
            created_at: now,
        };

        let after = serde_json::to_value(&template).unwrap_or_default();
        self.audit()
            .emit(AuditEvent::insert("templates", student_id, after));

        info!(student_id, name, revision, "template saved");
        Ok(template)
    }

    /// Latest revision of a named template.
    pub async fn get_template(&self, student_id: &str, name: &str) -> Result<Option<Template>> {
        let row: Option<TemplateRow> = sqlx::query_as(
            "SELECT id, student_id, name, revision, courses, created_at FROM templates
             WHERE student_id = ? AND name = ?
             ORDER BY revision DESC LIMIT 1",
        )
        .bind(student_id)
        .bind(name)
        .fetch_optional(self.pool())
        .await?;

        row.map(TemplateRow::try_into_template).transpose()
    }

    /// One specific revision of a named template.
    pub async fn get_template_revision(
        &self,
        student_id: &str,
        name: &str,
        revision: i64,
    ) -> Result<Option<Template>> {
        let row: Option<TemplateRow> = sqlx::query_as(
            "SELECT id, student_id, name, revision, courses, created_at FROM templates
             WHERE student_id = ? AND name = ? AND revision = ?",
        )
        .bind(student_id)
        .bind(name)
        .bind(revision)
        .fetch_optional(self.pool())
        .await?;

        row.map(TemplateRow::try_into_template).transpose()
    }

    /// A student's templates, latest revision of each name.
    pub async fn list_templates(&self, student_id: &str) -> Result<Vec<Template>> {
        let rows: Vec<TemplateRow> = sqlx::query_as(
            "SELECT id, student_id, name, revision, courses, created_at FROM templates t
             WHERE student_id = ?
               AND revision = (
                   SELECT MAX(revision) FROM templates
                   WHERE student_id = t.student_id AND name = t.name
               )
             ORDER BY name ASC",
        )
        .bind(student_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(TemplateRow::try_into_template)
            .collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: String,
    student_id: String,
    name: String,
    revision: i64,
    courses: serde_json::Value,
    created_at: chrono::DateTime<Utc>,
}

impl TemplateRow {
    fn try_into_template(self) -> Result<Template> {
        Ok(Template {
            id: TemplateId(
                self.id
                    .parse()
                    .map_err(|e: uuid::Error| Error::Other(format!("bad template id: {e}")))?,
            ),
            student_id: self.student_id,
            name: self.name,
            revision: self.revision,
            courses: serde_json::from_value(self.courses)
                .map_err(|e| Error::Other(format!("bad template courses: {e}")))?,
            created_at: self.created_at,
        })
    }
}
