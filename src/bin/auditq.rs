//! auditq CLI — operator interface to the audit service.

use auditq::config::{Config, ServiceConfig};
use auditq::db::Db;
use auditq::engine::Dispatcher;
use auditq::error::RulesError;
use auditq::model::{ExceptionKind, JobState, NewException, NewJob};
use auditq::rules::{CandidateSets, EvalContext, RulesEngine, SatNode};
use auditq::telemetry::init_telemetry;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "auditq", about = "Queue-backed degree-audit computation service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool daemon
    Serve {
        /// Service tuning TOML (defaults apply when missing)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Audit operations
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
    /// Queue administration
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Exception management
    Exception {
        #[command(subcommand)]
        action: ExceptionAction,
    },
    /// Drop expired jobs and results
    Sweep,
}

#[derive(Subcommand)]
enum AuditAction {
    /// Submit an audit request
    Submit {
        student_id: String,
        area_code: String,
        catalog: String,
        /// Path to the course-snapshot JSON
        #[arg(long)]
        input: PathBuf,
        /// Priority (lower = more urgent)
        #[arg(long, default_value_t = 100)]
        priority: i32,
        /// Batch run identifier
        #[arg(long, default_value_t = 0)]
        run: i64,
        /// Reference the existing lineage instead of recomputing
        #[arg(long)]
        link_only: bool,
        /// Evaluate staged what-if hypotheticals, without committing
        #[arg(long)]
        speculative: bool,
    },
    /// Show the active result for a pair
    Active {
        student_id: String,
        area_code: String,
    },
    /// List a pair's revision history
    History {
        student_id: String,
        area_code: String,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued jobs
    List {
        /// Filter by state (pending | claimed | dead)
        #[arg(long)]
        state: Option<String>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// List dead-lettered jobs
    Dead,
    /// Reject future submissions for a pair
    Block {
        student_id: String,
        area_code: String,
    },
    /// Clear a block
    Unblock {
        student_id: String,
        area_code: String,
    },
}

#[derive(Subcommand)]
enum ExceptionAction {
    /// Create an exception
    Add {
        student_id: String,
        area_code: String,
        /// Slash-separated path into the clause tree, e.g. "$/core/intro"
        path: String,
        /// forced-pass | override-credits | override-subject | insert-course
        kind: String,
        #[arg(long)]
        clbid: Option<String>,
        #[arg(long)]
        credits: Option<f64>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long, default_value = "registrar")]
        author: String,
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// List a pair's exceptions, disabled ones included
    List {
        student_id: String,
        area_code: String,
    },
    /// Re-enable an exception
    Enable { id: String },
    /// Disable an exception (the row is kept)
    Disable { id: String },
}

/// Stands in when no institutional rules engine is linked into the
/// binary: every audit fails permanently with a clear diagnostic instead
/// of fabricating satisfaction trees.
struct NullRulesEngine;

impl RulesEngine for NullRulesEngine {
    fn candidate_clauses(&self, _ctx: &EvalContext) -> Result<Vec<serde_json::Value>, RulesError> {
        Ok(Vec::new())
    }

    fn enumerate(
        &self,
        _ctx: &EvalContext,
        _clause: &serde_json::Value,
    ) -> Result<Vec<String>, RulesError> {
        Ok(Vec::new())
    }

    fn evaluate(
        &self,
        _ctx: &EvalContext,
        _candidates: &CandidateSets,
    ) -> Result<SatNode, RulesError> {
        Err(RulesError::Permanent(
            "no rules engine linked into this binary".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { config: path } => {
            init_telemetry(&config.log_level)?;

            let service = match path {
                Some(path) => ServiceConfig::load(&path)?,
                None => ServiceConfig::default(),
            };

            let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
            db.health_check().await?;

            let dispatcher = Dispatcher::new(
                Arc::clone(&db),
                Arc::new(NullRulesEngine),
                service.control_config(),
            );

            let pool = dispatcher.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                pool.shutdown();
            });

            dispatcher.run().await?;
            Ok(())
        }
        command => {
            let db = Db::connect(config.database_url.expose_secret()).await?;
            run_command(&db, command).await
        }
    }
}

async fn run_command(db: &Db, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Serve { .. } => unreachable!("handled in main"),
        Command::Audit { action } => match action {
            AuditAction::Submit {
                student_id,
                area_code,
                catalog,
                input,
                priority,
                run,
                link_only,
                speculative,
            } => {
                let input_data: serde_json::Value =
                    serde_json::from_str(&std::fs::read_to_string(&input)?)?;

                let mut new = NewJob::new(&student_id, &area_code, &catalog)
                    .input_data(input_data)
                    .priority(priority)
                    .run(run);
                if link_only {
                    new = new.link_only();
                }
                if speculative {
                    new = new.speculative();
                }

                let outcome = db.enqueue(new).await?;
                let job = outcome.job();
                println!("{}: {} (priority {})", outcome_word(&outcome), job.id, job.priority);
                Ok(())
            }
            AuditAction::Active {
                student_id,
                area_code,
            } => {
                match db.get_active(&student_id, &area_code).await? {
                    Some(result) => print_result(&result),
                    None => println!("No active result for {student_id}/{area_code}."),
                }
                Ok(())
            }
            AuditAction::History {
                student_id,
                area_code,
            } => {
                let history = db.list_history(&student_id, &area_code).await?;
                if history.is_empty() {
                    println!("No results for {student_id}/{area_code}.");
                    return Ok(());
                }
                println!(
                    "{:<4}  {:<8}  {:<8}  {:<6}  {:<6}  FINISHED",
                    "REV", "ID", "STATUS", "ACTIVE", "RANK"
                );
                for result in &history {
                    println!(
                        "{:<4}  {:<8}  {:<8}  {:<6}  {:<6.2}  {}",
                        result.revision.unwrap_or(-1),
                        result.id,
                        result.status,
                        if result.is_active { "yes" } else { "-" },
                        result.normalized_rank(),
                        result
                            .finished_at
                            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_else(|| "-".to_string()),
                    );
                }
                Ok(())
            }
        },
        Command::Queue { action } => match action {
            QueueAction::List { state, limit } => {
                let state = state
                    .map(|s| s.parse::<JobState>())
                    .transpose()
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                let jobs = db.list_jobs(state, limit).await?;
                if jobs.is_empty() {
                    println!("No jobs found.");
                    return Ok(());
                }
                println!(
                    "{:<8}  {:<10}  {:<10}  {:<8}  {:<4}  SUBMITTED",
                    "ID", "STUDENT", "AREA", "STATE", "PRI"
                );
                for job in &jobs {
                    println!(
                        "{:<8}  {:<10}  {:<10}  {:<8}  {:<4}  {}",
                        job.id,
                        job.student_id,
                        job.area_code,
                        job.state,
                        job.priority,
                        job.submitted_at.format("%Y-%m-%d %H:%M"),
                    );
                }
                println!("\n{} job(s)", jobs.len());
                Ok(())
            }
            QueueAction::Dead => {
                let jobs = db.list_dead().await?;
                if jobs.is_empty() {
                    println!("Dead-letter queue is empty.");
                    return Ok(());
                }
                for job in &jobs {
                    println!(
                        "{}  {}/{}  attempts={}  {}",
                        job.id,
                        job.student_id,
                        job.area_code,
                        job.attempts,
                        job.last_error.as_deref().unwrap_or("-"),
                    );
                }
                Ok(())
            }
            QueueAction::Block {
                student_id,
                area_code,
            } => {
                db.block(&student_id, &area_code).await?;
                println!("Blocked {student_id}/{area_code}.");
                Ok(())
            }
            QueueAction::Unblock {
                student_id,
                area_code,
            } => {
                let existed = db.unblock(&student_id, &area_code).await?;
                println!(
                    "{} {student_id}/{area_code}.",
                    if existed { "Unblocked" } else { "No block on" }
                );
                Ok(())
            }
        },
        Command::Exception { action } => match action {
            ExceptionAction::Add {
                student_id,
                area_code,
                path,
                kind,
                clbid,
                credits,
                subject,
                author,
                notes,
            } => {
                let kind: ExceptionKind = kind.parse().map_err(|e| anyhow::anyhow!("{e}"))?;
                let path: Vec<String> = path.split('/').map(str::to_string).collect();

                let mut new = NewException::new(&student_id, &area_code, path, kind, &author)
                    .notes(&notes);
                if let Some(clbid) = clbid {
                    new = new.clbid(clbid);
                }
                if let Some(credits) = credits {
                    new = new.override_credits(credits);
                }
                if let Some(subject) = subject {
                    new = new.override_subject(subject);
                }

                let exception = db.create_exception(new).await?;
                println!("Created exception {}.", exception.id);
                Ok(())
            }
            ExceptionAction::List {
                student_id,
                area_code,
            } => {
                let exceptions = db.list_exceptions(&student_id, &area_code, false).await?;
                if exceptions.is_empty() {
                    println!("No exceptions for {student_id}/{area_code}.");
                    return Ok(());
                }
                for e in &exceptions {
                    println!(
                        "{}  {:<17}  {:<8}  {}  by {}",
                        e.id,
                        e.kind.to_string(),
                        if e.is_enabled { "enabled" } else { "disabled" },
                        e.path.join("/"),
                        e.author,
                    );
                }
                Ok(())
            }
            ExceptionAction::Enable { id } => {
                let id = parse_exception_id(&id)?;
                db.enable_exception(id, "registrar").await?;
                println!("Enabled {id}.");
                Ok(())
            }
            ExceptionAction::Disable { id } => {
                let id = parse_exception_id(&id)?;
                db.disable_exception(id, "registrar").await?;
                println!("Disabled {id}.");
                Ok(())
            }
        },
        Command::Sweep => {
            let jobs = db.sweep_expired_jobs().await?;
            let results = db.sweep_expired_results().await?;
            println!("Swept {jobs} job(s), {results} result(s).");
            Ok(())
        }
    }
}

fn outcome_word(outcome: &auditq::db::queue::EnqueueOutcome) -> &'static str {
    match outcome {
        auditq::db::queue::EnqueueOutcome::Created(_) => "Created",
        auditq::db::queue::EnqueueOutcome::Coalesced(_) => "Coalesced",
    }
}

fn parse_exception_id(id: &str) -> anyhow::Result<auditq::model::ExceptionId> {
    Ok(auditq::model::ExceptionId(uuid::Uuid::parse_str(id)?))
}

fn print_result(result: &auditq::model::AuditResult) {
    println!("ID:        {}", result.id);
    println!("Pair:      {}/{}", result.student_id, result.area_code);
    println!("Catalog:   {}", result.catalog);
    println!("Revision:  {}", result.revision.unwrap_or(-1));
    println!("Status:    {}", result.status);
    println!("Active:    {}", result.is_active);
    println!(
        "Rank:      {:.3} ({:.1}/{:.1})",
        result.normalized_rank(),
        result.rank,
        result.max_rank
    );
    println!("GPA:       {:.2}", result.gpa);
    if !result.claimed_courses.is_empty() {
        println!("Claims:");
        for (clbid, slot) in &result.claimed_courses {
            println!("  {clbid} -> {slot}");
        }
    }
    if let Some(ref error) = result.error {
        println!("Error:     {error}");
    }
    if let Some(link) = result.link_to {
        println!("Links to:  {link}");
    }
}
