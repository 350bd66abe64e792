//! Rules engine contract and evaluation types.
//!
//! The requirement-rule evaluation logic is an external collaborator,
//! consumed behind [`RulesEngine`]. The worker drives it in three steps:
//! ask which clauses need candidate enumeration, resolve candidates
//! (through the memoization cache), then evaluate the full tree against
//! the resolved candidate sets.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::RulesError;

// ---------------------------------------------------------------------------
// Course snapshot
// ---------------------------------------------------------------------------

/// One completed-course record in a student's snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    /// Identifier of this completed-course record instance.
    pub clbid: String,
    /// Course code, e.g. "CSCI 251".
    pub course: String,
    pub subject: String,
    pub credits: f64,
    /// Grade value on the 4.0 scale.
    pub grade_points: f64,
    /// Whether this course counts toward GPA.
    pub in_gpa: bool,
}

/// The student's coursework at evaluation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourseSnapshot {
    pub courses: Vec<Course>,
}

impl CourseSnapshot {
    /// Parse a job's `input_data`. Malformed input is a permanent compute
    /// failure; retrying cannot fix it.
    pub fn from_input(input: &Value) -> Result<Self, RulesError> {
        serde_json::from_value(input.clone())
            .map_err(|e| RulesError::Permanent(format!("malformed input_data: {e}")))
    }

    /// Credit-weighted GPA over in-GPA courses.
    pub fn gpa(&self) -> f64 {
        let (points, credits) = self
            .courses
            .iter()
            .filter(|c| c.in_gpa && c.credits > 0.0)
            .fold((0.0, 0.0), |(p, cr), c| {
                (p + c.grade_points * c.credits, cr + c.credits)
            });

        if credits > 0.0 { points / credits } else { 0.0 }
    }

    pub fn contains_clbid(&self, clbid: &str) -> bool {
        self.courses.iter().any(|c| c.clbid == clbid)
    }
}

// ---------------------------------------------------------------------------
// Evaluation context
// ---------------------------------------------------------------------------

/// Everything the rules engine needs to evaluate one audit.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub student_id: String,
    pub area_code: String,
    pub catalog: String,
    pub snapshot: CourseSnapshot,
}

// ---------------------------------------------------------------------------
// Satisfaction tree
// ---------------------------------------------------------------------------

/// A node of the clause-satisfaction tree produced by evaluation.
///
/// `rank`/`max_rank` are this node's own contribution; aggregates are
/// computed by summing over the subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatNode {
    /// Label of this node within its parent; paths into the tree are
    /// sequences of keys from the root.
    pub key: String,
    pub satisfied: bool,
    pub rank: f64,
    pub max_rank: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claims: Vec<CourseClaim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SatNode>,
}

/// A course record claimed by a requirement slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseClaim {
    pub clbid: String,
    /// The requirement slot this course fills, e.g. "major/core/intro".
    pub slot: String,
}

impl SatNode {
    pub fn leaf(key: impl Into<String>, satisfied: bool, rank: f64, max_rank: f64) -> Self {
        Self {
            key: key.into(),
            satisfied,
            rank,
            max_rank,
            credits: None,
            subject: None,
            claims: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Sum of `rank` over the whole subtree.
    pub fn total_rank(&self) -> f64 {
        self.rank + self.children.iter().map(SatNode::total_rank).sum::<f64>()
    }

    /// Sum of `max_rank` over the whole subtree.
    pub fn total_max_rank(&self) -> f64 {
        self.max_rank
            + self
                .children
                .iter()
                .map(SatNode::total_max_rank)
                .sum::<f64>()
    }

    /// All claims in the subtree, preorder.
    pub fn all_claims(&self) -> Vec<&CourseClaim> {
        let mut out: Vec<&CourseClaim> = self.claims.iter().collect();
        for child in &self.children {
            out.extend(child.all_claims());
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Candidate sets
// ---------------------------------------------------------------------------

/// Per-clause candidate course-id lists, keyed by clause hash. Built by
/// the worker (through the memo cache) and handed to `evaluate`.
#[derive(Debug, Default, Clone)]
pub struct CandidateSets {
    by_hash: BTreeMap<String, Vec<String>>,
}

impl CandidateSets {
    pub fn insert(&mut self, clause_hash: String, candidates: Vec<String>) {
        self.by_hash.insert(clause_hash, candidates);
    }

    pub fn get(&self, clause_hash: &str) -> Option<&[String]> {
        self.by_hash.get(clause_hash).map(Vec::as_slice)
    }

    /// Look up by clause expression, hashing it the same way the worker
    /// did when populating the set.
    pub fn get_for_clause(&self, clause: &Value) -> Option<&[String]> {
        self.get(&clause_hash(clause))
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Rules engine contract
// ---------------------------------------------------------------------------

/// The external rules engine. Evaluates an area's clause tree against a
/// course snapshot; this crate never implements the evaluation itself.
pub trait RulesEngine: Send + Sync {
    /// The clauses of this area that require candidate enumeration.
    fn candidate_clauses(&self, ctx: &EvalContext) -> Result<Vec<Value>, RulesError>;

    /// Enumerate candidate course records for one clause. This is the
    /// expensive sub-computation the worker memoizes.
    fn enumerate(&self, ctx: &EvalContext, clause: &Value) -> Result<Vec<String>, RulesError>;

    /// Evaluate the full clause tree against pre-resolved candidate sets.
    fn evaluate(&self, ctx: &EvalContext, candidates: &CandidateSets)
    -> Result<SatNode, RulesError>;
}

// ---------------------------------------------------------------------------
// Clause canonicalization + hashing
// ---------------------------------------------------------------------------

/// Stable, order-independent digest of a clause expression: SHA-256 hex
/// over the canonical text. Hash-only keys risk silent collisions, so the
/// memo cache stores the canonical text alongside and verifies on hit.
pub fn clause_hash(clause: &Value) -> String {
    let canonical = canonical_clause(clause);
    let digest = Sha256::digest(canonical.as_bytes());

    let mut hex = String::with_capacity(64);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Canonical text of a clause expression: object keys sorted, `$and`/`$or`
/// child lists sorted by their own canonical text (the combinators are
/// commutative), every other array kept in order.
pub fn canonical_clause(clause: &Value) -> String {
    let mut out = String::new();
    write_canonical(clause, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');

                let child = &map[*key];
                match child {
                    Value::Array(items) if *key == "$and" || *key == "$or" => {
                        let mut parts: Vec<String> =
                            items.iter().map(canonical_clause).collect();
                        parts.sort();
                        out.push('[');
                        out.push_str(&parts.join(","));
                        out.push(']');
                    }
                    other => write_canonical(other, out),
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
