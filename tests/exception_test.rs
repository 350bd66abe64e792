//! Integration tests for exception rows: validation, limited updates,
//! soft-disable semantics, audit emission.

use std::sync::Arc;

use auditq::db::Db;
use auditq::error::Error;
use auditq::events::{AuditOp, MemoryAuditSink};
use auditq::model::{ExceptionKind, ExceptionUpdate, NewException, NOTES_MAX_LEN};

async fn test_db() -> Db {
    Db::in_memory().await.expect("failed to create in-memory db")
}

fn forced_pass(student_id: &str, area_code: &str) -> NewException {
    NewException::new(
        student_id,
        area_code,
        vec!["$".into(), "core".into()],
        ExceptionKind::ForcedPass,
        "advisor.olson",
    )
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn oversized_notes_are_rejected_before_persistence() {
    let db = test_db().await;

    let err = db
        .create_exception(forced_pass("122932", "csci-ba").notes("x".repeat(NOTES_MAX_LEN + 1)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    // nothing was persisted
    let rows = db.list_exceptions("122932", "csci-ba", false).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn notes_at_the_limit_are_accepted() {
    let db = test_db().await;

    let exception = db
        .create_exception(forced_pass("122932", "csci-ba").notes("x".repeat(NOTES_MAX_LEN)))
        .await
        .unwrap();
    assert_eq!(exception.notes.len(), NOTES_MAX_LEN);
}

#[tokio::test]
async fn update_validates_notes_too() {
    let db = test_db().await;
    let exception = db
        .create_exception(forced_pass("122932", "csci-ba"))
        .await
        .unwrap();

    let err = db
        .update_exception(
            exception.id,
            ExceptionUpdate {
                notes: Some("x".repeat(NOTES_MAX_LEN + 1)),
                ..Default::default()
            },
            "advisor.olson",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    // the row is unchanged
    let row = db.get_exception(exception.id).await.unwrap();
    assert_eq!(row.notes, "");
}

#[tokio::test]
async fn kind_specific_fields_are_required() {
    let db = test_db().await;

    let missing_credits = NewException::new(
        "s",
        "a",
        vec!["$".into()],
        ExceptionKind::OverrideCredits,
        "advisor.olson",
    );
    assert!(matches!(
        db.create_exception(missing_credits).await.unwrap_err(),
        Error::Validation(_)
    ));

    let missing_clbid = NewException::new(
        "s",
        "a",
        vec!["$".into()],
        ExceptionKind::InsertCourse,
        "advisor.olson",
    );
    assert!(matches!(
        db.create_exception(missing_clbid).await.unwrap_err(),
        Error::Validation(_)
    ));
}

// ---------------------------------------------------------------------------
// Updates and soft-disable
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_touches_only_override_fields_and_notes() {
    let db = test_db().await;

    let exception = db
        .create_exception(
            NewException::new(
                "122932",
                "csci-ba",
                vec!["$".into(), "electives".into()],
                ExceptionKind::OverrideCredits,
                "advisor.olson",
            )
            .override_credits(1.0),
        )
        .await
        .unwrap();

    let updated = db
        .update_exception(
            exception.id,
            ExceptionUpdate {
                override_credits: Some(1.5),
                notes: Some("petition 2024-117".into()),
                ..Default::default()
            },
            "advisor.olson",
        )
        .await
        .unwrap();

    assert_eq!(updated.override_credits, Some(1.5));
    assert_eq!(updated.notes, "petition 2024-117");
    assert!(updated.updated_at >= exception.updated_at);
    // immutable parts survive
    assert_eq!(updated.path, exception.path);
    assert_eq!(updated.kind, exception.kind);
    assert_eq!(updated.author, exception.author);
}

#[tokio::test]
async fn disabling_keeps_the_row_retrievable() {
    let db = test_db().await;
    let exception = db
        .create_exception(forced_pass("122932", "csci-ba"))
        .await
        .unwrap();

    let disabled = db
        .disable_exception(exception.id, "advisor.olson")
        .await
        .unwrap();
    assert!(!disabled.is_enabled);

    // gone from the effective set
    let enabled = db.list_exceptions("122932", "csci-ba", true).await.unwrap();
    assert!(enabled.is_empty());

    // still on file in history
    let all = db.list_exceptions("122932", "csci-ba", false).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, exception.id);

    // and re-enabling restores it
    db.enable_exception(exception.id, "advisor.olson")
        .await
        .unwrap();
    let enabled = db.list_exceptions("122932", "csci-ba", true).await.unwrap();
    assert_eq!(enabled.len(), 1);
}

// ---------------------------------------------------------------------------
// Audit emission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_mutation_emits_an_audit_event() {
    let sink = Arc::new(MemoryAuditSink::new());
    let db = test_db().await.with_audit_sink(sink.clone());

    let exception = db
        .create_exception(forced_pass("122932", "csci-ba"))
        .await
        .unwrap();
    db.update_exception(
        exception.id,
        ExceptionUpdate {
            notes: Some("per petition".into()),
            ..Default::default()
        },
        "advisor.olson",
    )
    .await
    .unwrap();
    db.disable_exception(exception.id, "registrar").await.unwrap();

    let events = sink.events();
    assert_eq!(events.len(), 3);

    assert_eq!(events[0].operation, AuditOp::Insert);
    assert_eq!(events[0].table, "exceptions");
    assert_eq!(events[0].actor, "advisor.olson");
    assert!(events[0].before.is_none());

    // updates carry both images
    assert_eq!(events[1].operation, AuditOp::Update);
    assert!(events[1].before.is_some());
    assert!(events[1].after.is_some());

    assert_eq!(events[2].actor, "registrar");
}
