//! Dispatcher: the worker pool that drains the queue.
//!
//! Each worker claims one job at a time and runs it to completion —
//! no preemption. Shutdown lets in-flight audits finish; their results
//! are still finalized under the revision-ordering rule.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{Instrument, error, info, warn};

use crate::db::Db;
use crate::db::queue::RetryPolicy;
use crate::db::results::Activation;
use crate::error::Result;
use crate::model::job::Job;
use crate::rules::RulesEngine;
use crate::telemetry::audit_span::{record_state_transition, start_job_span};

use super::compute::ComputePipeline;

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// How long an idle worker sleeps before re-polling the queue.
    pub poll_interval: Duration,
    /// Execution budget per claimed job; overruns count as transient
    /// failures and go through the retry policy.
    pub execution_budget: Duration,
    pub retry: RetryPolicy,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(2),
            execution_budget: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

/// The worker pool. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Dispatcher {
    db: Arc<Db>,
    pipeline: Arc<ComputePipeline>,
    config: ControlConfig,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(db: Arc<Db>, rules: Arc<dyn RulesEngine>, config: ControlConfig) -> Self {
        let pipeline = Arc::new(ComputePipeline::new(Arc::clone(&db), rules));
        Self {
            db,
            pipeline,
            config,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Signal the pool to stop. Idle workers exit immediately; busy
    /// workers finish their current job first.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Jobs currently being computed.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Run the worker pool until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(workers = self.config.workers, "dispatcher started");

        let mut handles = Vec::with_capacity(self.config.workers);
        for n in 0..self.config.workers {
            let pool = self.clone();
            let worker_id = format!("worker-{n}");
            handles.push(tokio::spawn(async move {
                pool.worker_loop(&worker_id).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        info!("dispatcher stopped");
        Ok(())
    }

    async fn worker_loop(&self, worker_id: &str) {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                info!(worker_id, "worker shutting down");
                return;
            }

            match self.db.claim(worker_id).await {
                Ok(Some(job)) => {
                    self.active.fetch_add(1, Ordering::Relaxed);
                    self.process(worker_id, job).await;
                    self.active.fetch_sub(1, Ordering::Relaxed);
                    // Drain eagerly: try the next job right away.
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id, "claim error: {e}");
                }
            }

            tokio::select! {
                _ = self.shutdown.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Execute one claimed job end to end: pipeline under the execution
    /// budget, then finalize-and-complete or fail-with-retry.
    async fn process(&self, worker_id: &str, job: Job) {
        let span = start_job_span(&job.student_id, &job.area_code, &job.id.0);
        let job_id = job.id;
        let actor = format!("worker:{worker_id}");

        async {
            record_state_transition(&tracing::Span::current(), "pending", "claimed");

            let outcome =
                tokio::time::timeout(self.config.execution_budget, self.pipeline.execute(&job))
                    .await;

            match outcome {
                Ok(Ok((result_id, outcome))) => {
                    let finalized = self
                        .db
                        .finalize_result(result_id, outcome, None, &actor)
                        .await;

                    match finalized {
                        Ok(finalized) => {
                            record_state_transition(
                                &tracing::Span::current(),
                                "claimed",
                                "completed",
                            );
                            if let Err(e) = self.db.complete(job_id).await {
                                warn!(job_id = %job_id, "retire after finalize failed: {e}");
                            }
                            info!(
                                job_id = %job_id,
                                result_id = %finalized.result.id,
                                revision = ?finalized.result.revision,
                                superseded =
                                    matches!(finalized.activation, Activation::Superseded),
                                "job completed"
                            );
                        }
                        Err(e) => {
                            // The computation succeeded but the store
                            // rejected the commit; retry the whole job.
                            error!(job_id = %job_id, "finalize failed: {e}");
                            self.fail_job(job_id, &e.to_string(), true).await;
                        }
                    }
                }
                Ok(Err(e)) => {
                    record_state_transition(&tracing::Span::current(), "claimed", "failed");
                    self.fail_job(job_id, &e.to_string(), e.is_retryable()).await;
                }
                Err(_) => {
                    record_state_transition(&tracing::Span::current(), "claimed", "failed");
                    warn!(
                        job_id = %job_id,
                        budget_ms = self.config.execution_budget.as_millis() as u64,
                        "execution budget exceeded"
                    );
                    self.fail_job(job_id, "execution budget exceeded", true)
                        .await;
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn fail_job(&self, job_id: crate::model::job::JobId, error: &str, retryable: bool) {
        match self
            .db
            .fail(job_id, error, retryable, &self.config.retry)
            .await
        {
            Ok(outcome) => {
                info!(job_id = %job_id, outcome = ?outcome, "job failure recorded");
            }
            Err(e) => {
                error!(job_id = %job_id, "recording job failure failed: {e}");
            }
        }
    }
}
