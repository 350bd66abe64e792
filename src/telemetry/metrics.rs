//! Metric instrument factories for auditq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"auditq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for auditq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("auditq")
}

/// Counter: jobs submitted.
/// Labels: `outcome` ("created" | "coalesced" | "blocked").
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("auditq.jobs.enqueued")
        .with_description("Number of job submissions")
        .build()
}

/// Counter: queue-level operations.
/// Labels: `operation` ("claim" | "claim_empty" | "complete" | "fail" | "expire").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("auditq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: finalized results.
/// Labels: `status` ("ok" | "failed").
pub fn results_finalized() -> Counter<u64> {
    meter()
        .u64_counter("auditq.results.finalized")
        .with_description("Number of finalized results")
        .build()
}

/// Counter: activations lost to the revision-ordering rule.
pub fn activation_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("auditq.results.activation_conflicts")
        .with_description("Finalizations superseded by an equal or higher revision")
        .build()
}

/// Counter: memoization cache lookups.
/// Labels: `outcome` ("hit" | "miss" | "collision").
pub fn memo_lookups() -> Counter<u64> {
    meter()
        .u64_counter("auditq.memo.lookups")
        .with_description("Memoization cache lookups")
        .build()
}

/// Counter: exception mutations (create, update, enable, disable).
pub fn exception_mutations() -> Counter<u64> {
    meter()
        .u64_counter("auditq.exceptions.mutations")
        .with_description("Number of exception mutations")
        .build()
}

/// Histogram: audit computation duration in milliseconds.
pub fn audit_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("auditq.audit.duration_ms")
        .with_description("Audit computation duration in milliseconds")
        .with_unit("ms")
        .build()
}
