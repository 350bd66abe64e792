//! End-to-end tests of the compute pipeline and dispatcher: memoized
//! candidate resolution, exception overlays, retry classification, and
//! the full claim → compute → finalize loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use auditq::db::Db;
use auditq::db::queue::RetryPolicy;
use auditq::db::results::Activation;
use auditq::engine::{ComputePipeline, ControlConfig, Dispatcher};
use auditq::error::RulesError;
use auditq::model::{ExceptionKind, NewException, NewJob, ResultStatus};
use auditq::rules::{
    CandidateSets, Course, CourseClaim, EvalContext, RulesEngine, SatNode,
};
use serde_json::{Value, json};

async fn test_db() -> Arc<Db> {
    Arc::new(Db::in_memory().await.expect("failed to create in-memory db"))
}

fn course(clbid: &str, subject: &str, grade_points: f64) -> Course {
    Course {
        clbid: clbid.to_string(),
        course: format!("{subject} 101"),
        subject: subject.to_string(),
        credits: 1.0,
        grade_points,
        in_gpa: true,
    }
}

fn snapshot_of(courses: Vec<Course>) -> Value {
    json!({ "courses": courses })
}

// ---------------------------------------------------------------------------
// Stub rules engine
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum StubMode {
    Ok,
    TransientEnumerate,
    PermanentEvaluate,
}

/// One candidate clause per subject; a course satisfies the clause for
/// its own subject. Counts enumerations so tests can observe memo hits.
struct StubEngine {
    subjects: Vec<String>,
    mode: StubMode,
    enumerate_calls: AtomicUsize,
}

impl StubEngine {
    fn new(subjects: &[&str]) -> Self {
        Self {
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            mode: StubMode::Ok,
            enumerate_calls: AtomicUsize::new(0),
        }
    }

    fn with_mode(mut self, mode: StubMode) -> Self {
        self.mode = mode;
        self
    }

    fn clause_for(subject: &str) -> Value {
        json!({"subject": subject})
    }
}

impl RulesEngine for StubEngine {
    fn candidate_clauses(&self, _ctx: &EvalContext) -> Result<Vec<Value>, RulesError> {
        Ok(self
            .subjects
            .iter()
            .map(|s| Self::clause_for(s))
            .collect())
    }

    fn enumerate(&self, ctx: &EvalContext, clause: &Value) -> Result<Vec<String>, RulesError> {
        if matches!(self.mode, StubMode::TransientEnumerate) {
            return Err(RulesError::Transient("rules engine timed out".into()));
        }

        self.enumerate_calls.fetch_add(1, Ordering::SeqCst);
        let subject = clause["subject"].as_str().unwrap_or_default();
        Ok(ctx
            .snapshot
            .courses
            .iter()
            .filter(|c| c.subject == subject)
            .map(|c| c.clbid.clone())
            .collect())
    }

    fn evaluate(
        &self,
        _ctx: &EvalContext,
        candidates: &CandidateSets,
    ) -> Result<SatNode, RulesError> {
        if matches!(self.mode, StubMode::PermanentEvaluate) {
            return Err(RulesError::Permanent("area specification is malformed".into()));
        }

        let children = self
            .subjects
            .iter()
            .map(|subject| {
                let matched = candidates
                    .get_for_clause(&Self::clause_for(subject))
                    .unwrap_or_default();
                SatNode {
                    claims: matched
                        .iter()
                        .map(|clbid| CourseClaim {
                            clbid: clbid.clone(),
                            slot: subject.clone(),
                        })
                        .collect(),
                    ..SatNode::leaf(
                        subject.clone(),
                        !matched.is_empty(),
                        if matched.is_empty() { 0.0 } else { 1.0 },
                        1.0,
                    )
                }
            })
            .collect();

        Ok(SatNode {
            children,
            ..SatNode::leaf("$", true, 0.0, 0.0)
        })
    }
}

async fn wait_for<F, Fut, T>(mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..200 {
        if let Some(value) = probe().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within 5s");
}

// ---------------------------------------------------------------------------
// Dispatcher end to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dispatcher_computes_and_activates_results() {
    let db = test_db().await;
    let engine = Arc::new(StubEngine::new(&["CSCI"]));

    let dispatcher = Dispatcher::new(
        Arc::clone(&db),
        engine,
        ControlConfig {
            workers: 2,
            poll_interval: Duration::from_millis(25),
            execution_budget: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        },
    );

    let runner = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run().await })
    };

    db.enqueue(
        NewJob::new("122932", "csci-ba", "2019-20").input_data(snapshot_of(vec![
            course("c1", "CSCI", 4.0),
            course("c2", "CSCI", 3.0),
            course("m1", "MATH", 2.0),
        ])),
    )
    .await
    .unwrap();

    let active = wait_for(|| {
        let db = Arc::clone(&db);
        async move { db.get_active("122932", "csci-ba").await.unwrap() }
    })
    .await;

    assert_eq!(active.status, ResultStatus::Ok);
    assert_eq!(active.revision, Some(0));
    assert_eq!(active.rank, 1.0);
    assert_eq!(active.max_rank, 1.0);
    assert!((active.gpa - 3.0).abs() < 1e-9);
    assert_eq!(active.claimed_courses.len(), 2);
    assert_eq!(active.claimed_courses["c1"], "CSCI");

    // the job is retired once its result is finalized
    wait_for(|| {
        let db = Arc::clone(&db);
        async move {
            let jobs = db.list_jobs(None, 100).await.unwrap();
            jobs.is_empty().then_some(())
        }
    })
    .await;

    dispatcher.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn dispatcher_dead_letters_after_exhausted_retries() {
    let db = test_db().await;
    let engine = Arc::new(StubEngine::new(&["CSCI"]).with_mode(StubMode::TransientEnumerate));

    let dispatcher = Dispatcher::new(
        Arc::clone(&db),
        engine,
        ControlConfig {
            workers: 1,
            poll_interval: Duration::from_millis(25),
            execution_budget: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::ZERO,
            },
        },
    );

    let runner = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run().await })
    };

    db.enqueue(
        NewJob::new("122932", "csci-ba", "2019-20")
            .input_data(snapshot_of(vec![course("c1", "CSCI", 4.0)])),
    )
    .await
    .unwrap();

    let dead = wait_for(|| {
        let db = Arc::clone(&db);
        async move {
            let dead = db.list_dead().await.unwrap();
            if dead.is_empty() { None } else { Some(dead) }
        }
    })
    .await;

    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 2);
    assert!(dead[0].last_error.as_deref().unwrap().contains("timed out"));

    // no result was ever activated
    assert!(db.get_active("122932", "csci-ba").await.unwrap().is_none());

    dispatcher.shutdown();
    runner.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Pipeline: memoization
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_clauses_hit_the_memo_cache() {
    let db = test_db().await;
    // the same clause appears twice in the area
    let engine = Arc::new(StubEngine::new(&["CSCI", "CSCI"]));
    let pipeline = ComputePipeline::new(Arc::clone(&db), Arc::clone(&engine) as _);

    db.enqueue(
        NewJob::new("s", "a", "c").input_data(snapshot_of(vec![course("c1", "CSCI", 4.0)])),
    )
    .await
    .unwrap();
    let job = db.claim("w1").await.unwrap().unwrap();

    let (result_id, outcome) = pipeline.execute(&job).await.unwrap();

    // second occurrence was served from the cache
    assert_eq!(engine.enumerate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(db.memo_count(result_id).await.unwrap(), 1);
    assert_eq!(outcome.status, ResultStatus::Ok);
}

// ---------------------------------------------------------------------------
// Pipeline: exception overlays
// ---------------------------------------------------------------------------

#[tokio::test]
async fn forced_pass_overlay_satisfies_a_failing_clause() {
    let db = test_db().await;
    let engine = Arc::new(StubEngine::new(&["CSCI"]));
    let pipeline = ComputePipeline::new(Arc::clone(&db), Arc::clone(&engine) as _);

    // no CSCI coursework: the clause fails on its own
    let empty = snapshot_of(vec![course("m1", "MATH", 3.0)]);

    let compute = |input: Value| {
        let db = Arc::clone(&db);
        let pipeline = &pipeline;
        async move {
            db.enqueue(NewJob::new("122932", "csci-ba", "2019-20").input_data(input))
                .await
                .unwrap();
            let job = db.claim("w1").await.unwrap().unwrap();
            let (result_id, outcome) = pipeline.execute(&job).await.unwrap();
            let finalized = db
                .finalize_result(result_id, outcome, None, "worker:w1")
                .await
                .unwrap();
            db.complete(job.id).await.unwrap();
            finalized.result
        }
    };

    let computed = compute(empty.clone()).await;
    assert_eq!(computed.rank, 0.0);
    assert!(!computed.result_tree.as_ref().unwrap().children[0].satisfied);

    // an advisor forces the clause to pass
    let exception = db
        .create_exception(NewException::new(
            "122932",
            "csci-ba",
            vec!["$".into(), "CSCI".into()],
            ExceptionKind::ForcedPass,
            "advisor.olson",
        ))
        .await
        .unwrap();

    let overlaid = compute(empty.clone()).await;
    assert_eq!(overlaid.rank, 1.0);
    assert!(overlaid.result_tree.as_ref().unwrap().children[0].satisfied);

    // disabling removes the effect from the next computation
    db.disable_exception(exception.id, "advisor.olson")
        .await
        .unwrap();
    let plain = compute(empty.clone()).await;
    assert_eq!(plain.rank, 0.0);

    // re-enabling restores it
    db.enable_exception(exception.id, "advisor.olson")
        .await
        .unwrap();
    let restored = compute(empty).await;
    assert_eq!(restored.rank, 1.0);
}

#[tokio::test]
async fn insert_course_overlay_adds_a_claim() {
    let db = test_db().await;
    let engine = Arc::new(StubEngine::new(&["CSCI"]));
    let pipeline = ComputePipeline::new(Arc::clone(&db), Arc::clone(&engine) as _);

    db.create_exception(
        NewException::new(
            "122932",
            "csci-ba",
            vec!["$".into(), "CSCI".into()],
            ExceptionKind::InsertCourse,
            "advisor.olson",
        )
        .clbid("transfer-17"),
    )
    .await
    .unwrap();

    db.enqueue(
        NewJob::new("122932", "csci-ba", "2019-20").input_data(snapshot_of(vec![])),
    )
    .await
    .unwrap();
    let job = db.claim("w1").await.unwrap().unwrap();
    let (_, outcome) = pipeline.execute(&job).await.unwrap();

    assert_eq!(outcome.claimed_courses["transfer-17"], "CSCI");
}

// ---------------------------------------------------------------------------
// Pipeline: failure classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_input_fails_permanently() {
    let db = test_db().await;
    let engine = Arc::new(StubEngine::new(&["CSCI"]));
    let pipeline = ComputePipeline::new(Arc::clone(&db), Arc::clone(&engine) as _);

    db.enqueue(NewJob::new("s", "a", "c").input_data(json!({"not": "a snapshot"})))
        .await
        .unwrap();
    let job = db.claim("w1").await.unwrap().unwrap();

    let (result_id, outcome) = pipeline.execute(&job).await.unwrap();
    assert_eq!(outcome.status, ResultStatus::Failed);
    assert!(
        outcome.error.as_ref().unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("malformed input_data")
    );

    // persisted immediately, no retry
    let finalized = db
        .finalize_result(result_id, outcome, None, "worker:w1")
        .await
        .unwrap();
    assert_eq!(finalized.result.status, ResultStatus::Failed);
}

#[tokio::test]
async fn permanent_engine_failure_becomes_a_failed_result() {
    let db = test_db().await;
    let engine = Arc::new(StubEngine::new(&["CSCI"]).with_mode(StubMode::PermanentEvaluate));
    let pipeline = ComputePipeline::new(Arc::clone(&db), Arc::clone(&engine) as _);

    db.enqueue(
        NewJob::new("s", "a", "c").input_data(snapshot_of(vec![course("c1", "CSCI", 4.0)])),
    )
    .await
    .unwrap();
    let job = db.claim("w1").await.unwrap().unwrap();

    let (_, outcome) = pipeline.execute(&job).await.unwrap();
    assert_eq!(outcome.status, ResultStatus::Failed);
    assert_eq!(outcome.error.as_ref().unwrap()["kind"], "permanent");
}

#[tokio::test]
async fn transient_engine_failure_propagates_for_retry() {
    let db = test_db().await;
    let engine = Arc::new(StubEngine::new(&["CSCI"]).with_mode(StubMode::TransientEnumerate));
    let pipeline = ComputePipeline::new(Arc::clone(&db), Arc::clone(&engine) as _);

    db.enqueue(
        NewJob::new("s", "a", "c").input_data(snapshot_of(vec![course("c1", "CSCI", 4.0)])),
    )
    .await
    .unwrap();
    let job = db.claim("w1").await.unwrap().unwrap();

    let err = pipeline.execute(&job).await.unwrap_err();
    assert!(err.is_retryable());

    // the aborted pending row was cleaned up
    assert!(db.list_history("s", "a").await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Pipeline: link-only and what-if staging
// ---------------------------------------------------------------------------

#[tokio::test]
async fn link_only_jobs_reference_without_recomputing() {
    let db = test_db().await;
    let engine = Arc::new(StubEngine::new(&["CSCI"]));
    let pipeline = ComputePipeline::new(Arc::clone(&db), Arc::clone(&engine) as _);

    // computed lineage first
    db.enqueue(
        NewJob::new("122932", "csci-ba", "2019-20")
            .input_data(snapshot_of(vec![course("c1", "CSCI", 4.0)])),
    )
    .await
    .unwrap();
    let job = db.claim("w1").await.unwrap().unwrap();
    let (result_id, outcome) = pipeline.execute(&job).await.unwrap();
    db.finalize_result(result_id, outcome, None, "worker:w1")
        .await
        .unwrap();
    db.complete(job.id).await.unwrap();
    let target = db.get_active("122932", "csci-ba").await.unwrap().unwrap();

    let calls_before = engine.enumerate_calls.load(Ordering::SeqCst);

    db.enqueue(
        NewJob::new("122932", "csci-ba", "2019-20")
            .input_data(snapshot_of(vec![]))
            .link_only()
            .run(7),
    )
    .await
    .unwrap();
    let link_job = db.claim("w1").await.unwrap().unwrap();
    let (link_id, outcome) = pipeline.execute(&link_job).await.unwrap();
    let finalized = db
        .finalize_result(link_id, outcome, None, "worker:w1")
        .await
        .unwrap();

    // no recomputation happened, the pointer did not move
    assert_eq!(engine.enumerate_calls.load(Ordering::SeqCst), calls_before);
    assert_eq!(finalized.activation, Activation::Skipped);
    assert_eq!(finalized.result.link_to, Some(target.id));
    assert_eq!(finalized.result.rank, target.rank);
    assert_eq!(
        db.get_active("122932", "csci-ba").await.unwrap().unwrap().id,
        target.id
    );
}

#[tokio::test]
async fn link_only_without_a_computed_lineage_fails_permanently() {
    let db = test_db().await;
    let engine = Arc::new(StubEngine::new(&["CSCI"]));
    let pipeline = ComputePipeline::new(Arc::clone(&db), Arc::clone(&engine) as _);

    db.enqueue(
        NewJob::new("s", "a", "c")
            .input_data(snapshot_of(vec![]))
            .link_only(),
    )
    .await
    .unwrap();
    let job = db.claim("w1").await.unwrap().unwrap();

    let (_, outcome) = pipeline.execute(&job).await.unwrap();
    assert_eq!(outcome.status, ResultStatus::Failed);
}

#[tokio::test]
async fn speculative_jobs_fold_staged_hypotheticals() {
    let db = test_db().await;
    let engine = Arc::new(StubEngine::new(&["CSCI"]));
    let pipeline = ComputePipeline::new(Arc::clone(&db), Arc::clone(&engine) as _);

    // no CSCI coursework on record, but one staged
    db.stage_add(
        "122932",
        "csci-ba",
        &course("hypo-1", "CSCI", 0.0),
        "122932",
    )
    .await
    .unwrap();

    db.enqueue(
        NewJob::new("122932", "csci-ba", "2019-20")
            .input_data(snapshot_of(vec![]))
            .speculative(),
    )
    .await
    .unwrap();
    let job = db.claim("w1").await.unwrap().unwrap();
    let (result_id, outcome) = pipeline.execute(&job).await.unwrap();

    assert_eq!(outcome.rank, 1.0);
    assert_eq!(outcome.claimed_courses["hypo-1"], "CSCI");

    // non-committing: finalizes without touching the pointer
    let finalized = db
        .finalize_result(result_id, outcome, None, "worker:w1")
        .await
        .unwrap();
    assert_eq!(finalized.activation, Activation::Skipped);
    assert!(db.get_active("122932", "csci-ba").await.unwrap().is_none());
}

#[tokio::test]
async fn committed_jobs_ignore_staged_hypotheticals() {
    let db = test_db().await;
    let engine = Arc::new(StubEngine::new(&["CSCI"]));
    let pipeline = ComputePipeline::new(Arc::clone(&db), Arc::clone(&engine) as _);

    db.stage_add(
        "122932",
        "csci-ba",
        &course("hypo-1", "CSCI", 0.0),
        "122932",
    )
    .await
    .unwrap();

    db.enqueue(
        NewJob::new("122932", "csci-ba", "2019-20").input_data(snapshot_of(vec![])),
    )
    .await
    .unwrap();
    let job = db.claim("w1").await.unwrap().unwrap();
    let (_, outcome) = pipeline.execute(&job).await.unwrap();

    // the real record has no CSCI coursework
    assert_eq!(outcome.rank, 0.0);
    assert!(outcome.claimed_courses.is_empty());
}
