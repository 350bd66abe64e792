//! Per-result memoization cache.
//!
//! Keyed by (owning result, clause_hash). Entries are write-once and die
//! with their result (FK cascade); a recompute gets a fresh result row
//! and therefore a fresh cache, so replaying an old result never sees
//! later course-data. The canonical clause text is stored beside the
//! hash and verified on every hit, so a hash collision degrades to a miss
//! instead of silently serving the wrong candidates.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::result::ResultId;
use crate::rules::{canonical_clause, clause_hash};
use crate::telemetry::metrics;

/// A cached candidate set for one clause of one in-progress result.
#[derive(Debug, Clone)]
pub struct MemoEntry {
    pub result_id: ResultId,
    pub clause_hash: String,
    pub clause_canonical: String,
    pub candidates: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl super::Db {
    /// Look up the candidate set for a clause, scoped to `result_id`.
    pub async fn memo_lookup(
        &self,
        result_id: ResultId,
        clause: &Value,
    ) -> Result<Option<MemoEntry>> {
        let hash = clause_hash(clause);

        let row: Option<(String, Value, DateTime<Utc>)> = sqlx::query_as(
            "SELECT clause_canonical, candidates, created_at FROM memo
             WHERE result_id = ? AND clause_hash = ?",
        )
        .bind(result_id.0.to_string())
        .bind(&hash)
        .fetch_optional(self.pool())
        .await?;

        let Some((stored_canonical, candidates, created_at)) = row else {
            metrics::memo_lookups().add(1, &[KeyValue::new("outcome", "miss")]);
            return Ok(None);
        };

        let canonical = canonical_clause(clause);
        if stored_canonical != canonical {
            // Same digest, different clause. Treat as a miss; the caller
            // recomputes and the write-once rule keeps the first entry.
            warn!(
                result_id = %result_id,
                clause_hash = %hash,
                "memo hash collision, recomputing"
            );
            metrics::memo_lookups().add(1, &[KeyValue::new("outcome", "collision")]);
            return Ok(None);
        }

        metrics::memo_lookups().add(1, &[KeyValue::new("outcome", "hit")]);
        Ok(Some(MemoEntry {
            result_id,
            clause_hash: hash,
            clause_canonical: stored_canonical,
            candidates: serde_json::from_value(candidates)
                .map_err(|e| Error::Other(format!("bad memo candidates: {e}")))?,
            created_at,
        }))
    }

    /// Store a candidate set. Write-once: if an entry for the key
    /// already exists it is kept, never replaced.
    pub async fn memo_store(
        &self,
        result_id: ResultId,
        clause: &Value,
        candidates: &[String],
    ) -> Result<()> {
        let hash = clause_hash(clause);
        let canonical = canonical_clause(clause);
        let payload = serde_json::to_value(candidates)
            .map_err(|e| Error::Other(format!("serialize memo candidates: {e}")))?;

        sqlx::query(
            "INSERT OR IGNORE INTO memo
                 (result_id, clause_hash, clause_canonical, candidates, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(result_id.0.to_string())
        .bind(&hash)
        .bind(&canonical)
        .bind(&payload)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Number of memo entries owned by a result.
    pub async fn memo_count(&self, result_id: ResultId) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM memo WHERE result_id = ?")
                .bind(result_id.0.to_string())
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }
}
