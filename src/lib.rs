//! # auditq
//!
//! Queue-backed degree-audit computation service.
//!
//! Audit requests go into a priority queue; a worker pool drives the
//! external rules engine, memoizing candidate enumeration per result,
//! and commits into a versioned store that keeps exactly one active
//! result per (student, area) pair. Advisor exceptions overlay computed
//! trees; what-if staging evaluates hypotheticals without committing.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod overlay;
pub mod rules;
pub mod telemetry;
