//! Integration tests for the versioned result store: revision
//! assignment, the activation flip, and the single-active invariant.

use std::sync::Arc;

use auditq::db::Db;
use auditq::db::results::Activation;
use auditq::error::Error;
use auditq::events::MemoryAuditSink;
use auditq::model::{AuditOutcome, Job, NewJob, ResultStatus};
use auditq::rules::SatNode;
use serde_json::json;

async fn test_db() -> Db {
    Db::in_memory().await.expect("failed to create in-memory db")
}

/// Enqueue and claim a job for the pair, so a result row can be opened.
async fn claimed_job(db: &Db, student_id: &str, area_code: &str) -> Job {
    db.enqueue(
        NewJob::new(student_id, area_code, "2019-20").input_data(json!({"courses": []})),
    )
    .await
    .unwrap();
    db.claim("test-worker").await.unwrap().unwrap()
}

fn sat_tree() -> SatNode {
    SatNode {
        children: vec![SatNode::leaf("core", true, 2.0, 2.0)],
        ..SatNode::leaf("$", true, 0.0, 0.0)
    }
}

fn ok_outcome() -> AuditOutcome {
    AuditOutcome::ok(2.0, 2.0, 3.4, Default::default(), sat_tree())
}

// ---------------------------------------------------------------------------
// Revision assignment and activation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_finalize_gets_revision_zero_and_activates() {
    let db = test_db().await;
    let job = claimed_job(&db, "122932", "csci-ba").await;

    let result_id = db.open_result(&job).await.unwrap();
    let finalized = db
        .finalize_result(result_id, ok_outcome(), None, "worker:w1")
        .await
        .unwrap();

    assert_eq!(finalized.activation, Activation::Activated);
    assert_eq!(finalized.result.revision, Some(0));
    assert!(finalized.result.is_active);
    assert_eq!(finalized.result.status, ResultStatus::Ok);

    let active = db.get_active("122932", "csci-ba").await.unwrap().unwrap();
    assert_eq!(active.id, result_id);
}

#[tokio::test]
async fn revisions_increase_and_active_pointer_follows() {
    let db = test_db().await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let job = claimed_job(&db, "122932", "csci-ba").await;
        let result_id = db.open_result(&job).await.unwrap();
        db.finalize_result(result_id, ok_outcome(), None, "worker:w1")
            .await
            .unwrap();
        db.complete(job.id).await.unwrap();
        ids.push(result_id);
    }

    let history = db.list_history("122932", "csci-ba").await.unwrap();
    assert_eq!(history.len(), 3);
    let revisions: Vec<_> = history.iter().map(|r| r.revision.unwrap()).collect();
    assert_eq!(revisions, vec![0, 1, 2]);

    // exactly one active row, and it is the highest revision
    let active: Vec<_> = history.iter().filter(|r| r.is_active).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].revision, Some(2));
    assert_eq!(active[0].id, ids[2]);
}

#[tokio::test]
async fn reverse_wall_clock_commit_order_keeps_highest_revision_active() {
    let db = test_db().await;

    // two computations for the same pair in flight at once
    let job1 = claimed_job(&db, "122932", "csci-ba").await;
    let job2 = claimed_job(&db, "122932", "csci-ba").await;
    let result1 = db.open_result(&job1).await.unwrap();
    let result2 = db.open_result(&job2).await.unwrap();

    // revision 6 commits first, revision 5 arrives later
    let first = db
        .finalize_result(result2, ok_outcome(), Some(6), "worker:w2")
        .await
        .unwrap();
    assert_eq!(first.activation, Activation::Activated);

    let late = db
        .finalize_result(result1, ok_outcome(), Some(5), "worker:w1")
        .await
        .unwrap();
    assert_eq!(late.activation, Activation::Superseded);

    // last by revision number, not by wall clock
    let active = db.get_active("122932", "csci-ba").await.unwrap().unwrap();
    assert_eq!(active.revision, Some(6));

    // the losing row is persisted, just never activated
    let rev5 = db
        .get_revision("122932", "csci-ba", 5)
        .await
        .unwrap()
        .unwrap();
    assert!(!rev5.is_active);
    assert_eq!(rev5.status, ResultStatus::Ok);
}

#[tokio::test]
async fn failed_results_take_the_active_pointer() {
    let db = test_db().await;

    let job = claimed_job(&db, "s", "a").await;
    let result_id = db.open_result(&job).await.unwrap();
    db.finalize_result(result_id, ok_outcome(), None, "worker:w1")
        .await
        .unwrap();
    db.complete(job.id).await.unwrap();

    let job = claimed_job(&db, "s", "a").await;
    let result_id = db.open_result(&job).await.unwrap();
    let finalized = db
        .finalize_result(
            result_id,
            AuditOutcome::failed(json!({"error": "unknown catalog"})),
            None,
            "worker:w1",
        )
        .await
        .unwrap();

    // a failed audit is still the lineage's current answer
    assert_eq!(finalized.activation, Activation::Activated);
    let active = db.get_active("s", "a").await.unwrap().unwrap();
    assert_eq!(active.status, ResultStatus::Failed);
    assert!(active.error.is_some());
}

#[tokio::test]
async fn finalize_is_once_only() {
    let db = test_db().await;
    let job = claimed_job(&db, "s", "a").await;
    let result_id = db.open_result(&job).await.unwrap();

    db.finalize_result(result_id, ok_outcome(), None, "worker:w1")
        .await
        .unwrap();

    let err = db
        .finalize_result(result_id, ok_outcome(), None, "worker:w1")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

// ---------------------------------------------------------------------------
// Link-only and speculative results
// ---------------------------------------------------------------------------

#[tokio::test]
async fn link_only_result_never_moves_the_pointer() {
    let db = test_db().await;

    // a computed lineage with an active revision
    let job = claimed_job(&db, "122932", "csci-ba").await;
    let computed = db.open_result(&job).await.unwrap();
    db.finalize_result(computed, ok_outcome(), None, "worker:w1")
        .await
        .unwrap();
    db.complete(job.id).await.unwrap();

    let target = db.get_active("122932", "csci-ba").await.unwrap().unwrap();

    // a link-only result referencing it, under a batch run
    db.enqueue(
        NewJob::new("122932", "csci-ba", "2019-20")
            .input_data(json!({"courses": []}))
            .link_only()
            .run(42),
    )
    .await
    .unwrap();
    let link_job = db.claim("w2").await.unwrap().unwrap();
    let link_id = db.open_result(&link_job).await.unwrap();

    let finalized = db
        .finalize_result(link_id, AuditOutcome::link(&target), None, "worker:w2")
        .await
        .unwrap();

    assert_eq!(finalized.activation, Activation::Skipped);
    assert_eq!(finalized.result.link_to, Some(target.id));
    assert!(!finalized.result.is_active);

    // the referenced lineage's pointer is untouched
    let active = db.get_active("122932", "csci-ba").await.unwrap().unwrap();
    assert_eq!(active.id, target.id);

    // and the link result is retrievable by its run
    let by_run = db.find_by_run("122932", "csci-ba", 42).await.unwrap();
    assert_eq!(by_run.len(), 1);
    assert_eq!(by_run[0].id, link_id);
}

#[tokio::test]
async fn speculative_result_never_activates() {
    let db = test_db().await;

    db.enqueue(
        NewJob::new("s", "a", "c")
            .input_data(json!({"courses": []}))
            .speculative(),
    )
    .await
    .unwrap();
    let job = db.claim("w1").await.unwrap().unwrap();
    let result_id = db.open_result(&job).await.unwrap();

    let finalized = db
        .finalize_result(result_id, ok_outcome(), None, "worker:w1")
        .await
        .unwrap();

    assert_eq!(finalized.activation, Activation::Skipped);
    assert!(db.get_active("s", "a").await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Memo cache ownership
// ---------------------------------------------------------------------------

#[tokio::test]
async fn memo_entries_are_write_once() {
    let db = test_db().await;
    let job = claimed_job(&db, "s", "a").await;
    let result_id = db.open_result(&job).await.unwrap();

    let clause = json!({"subject": "CSCI", "level": 200});
    db.memo_store(result_id, &clause, &["c1".into(), "c2".into()])
        .await
        .unwrap();
    // second write is ignored; the first entry wins
    db.memo_store(result_id, &clause, &["c3".into()])
        .await
        .unwrap();

    let entry = db.memo_lookup(result_id, &clause).await.unwrap().unwrap();
    assert_eq!(entry.candidates, vec!["c1".to_string(), "c2".to_string()]);
    assert_eq!(db.memo_count(result_id).await.unwrap(), 1);
}

#[tokio::test]
async fn memo_is_scoped_per_result() {
    let db = test_db().await;
    let job1 = claimed_job(&db, "s", "a").await;
    let job2 = claimed_job(&db, "s", "a").await;
    let result1 = db.open_result(&job1).await.unwrap();
    let result2 = db.open_result(&job2).await.unwrap();

    let clause = json!({"subject": "CSCI"});
    db.memo_store(result1, &clause, &["c1".into()]).await.unwrap();

    // a different result never sees another result's cache
    assert!(db.memo_lookup(result2, &clause).await.unwrap().is_none());
}

#[tokio::test]
async fn deleting_a_result_cascades_its_memo_entries() {
    let db = test_db().await;
    let job = claimed_job(&db, "s", "a").await;
    let result_id = db.open_result(&job).await.unwrap();

    db.memo_store(result_id, &json!({"subject": "CSCI"}), &["c1".into()])
        .await
        .unwrap();
    assert_eq!(db.memo_count(result_id).await.unwrap(), 1);

    db.delete_result(result_id, "registrar").await.unwrap();
    assert_eq!(db.memo_count(result_id).await.unwrap(), 0);
}

#[tokio::test]
async fn the_active_result_cannot_be_deleted() {
    let db = test_db().await;
    let job = claimed_job(&db, "s", "a").await;
    let result_id = db.open_result(&job).await.unwrap();
    db.finalize_result(result_id, ok_outcome(), None, "worker:w1")
        .await
        .unwrap();

    let err = db.delete_result(result_id, "registrar").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

// ---------------------------------------------------------------------------
// Maintenance and audit emission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_pending_rows_are_swept() {
    let db = test_db().await;
    let job = claimed_job(&db, "s", "a").await;
    db.open_result(&job).await.unwrap();

    assert_eq!(
        db.sweep_stale_pending(chrono::Duration::zero()).await.unwrap(),
        1
    );
    assert!(db.list_history("s", "a").await.unwrap().is_empty());
}

#[tokio::test]
async fn finalize_emits_an_audit_event_after_commit() {
    let sink = Arc::new(MemoryAuditSink::new());
    let db = test_db().await.with_audit_sink(sink.clone());

    let job = claimed_job(&db, "s", "a").await;
    let result_id = db.open_result(&job).await.unwrap();
    db.finalize_result(result_id, ok_outcome(), None, "worker:w7")
        .await
        .unwrap();

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].table, "results");
    assert_eq!(events[0].actor, "worker:w7");
    assert!(events[0].after.is_some());
}
