//! Exception overlays as functional tree patches.
//!
//! Overrides are modeled as small tagged patch operations (path + op +
//! value) applied to an immutable satisfaction tree, producing a new
//! tree. The worker pipeline never mutates a tree in place.

use tracing::warn;

use crate::rules::{CourseClaim, SatNode};

/// A single overlay operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    /// Mark the node satisfied and raise its rank to its max_rank.
    ForcePass,
    /// Substitute the node's credits field.
    OverrideCredits(f64),
    /// Substitute the node's subject field.
    OverrideSubject(String),
    /// Add a claim for the given course record to the node.
    InsertCourse(String),
}

/// An operation targeted at one node of the tree. The path is the
/// sequence of node keys from the root, root key included.
#[derive(Debug, Clone, PartialEq)]
pub struct TreePatch {
    pub path: Vec<String>,
    pub op: PatchOp,
}

/// Apply patches in order, each against the output of the previous one.
/// Overlay values always win over computed values at the same path.
pub fn apply_patches(tree: &SatNode, patches: &[TreePatch]) -> SatNode {
    patches
        .iter()
        .fold(tree.clone(), |acc, patch| apply_patch(&acc, patch))
}

/// Apply one patch. A path that resolves to no node leaves the tree
/// unchanged and logs a diagnostic; advisors sometimes point at clauses
/// a later catalog renamed.
pub fn apply_patch(tree: &SatNode, patch: &TreePatch) -> SatNode {
    match patch.path.split_first() {
        Some((root_key, rest)) if *root_key == tree.key => {
            let (node, matched) = apply_at(tree, rest, &patch.op);
            if !matched {
                warn!(path = patch.path.join("/"), "overlay path matched no node");
            }
            node
        }
        _ => {
            warn!(path = patch.path.join("/"), "overlay path matched no node");
            tree.clone()
        }
    }
}

fn apply_at(node: &SatNode, rest: &[String], op: &PatchOp) -> (SatNode, bool) {
    let Some((next_key, remainder)) = rest.split_first() else {
        return (apply_op(node, op), true);
    };

    let mut matched = false;
    let children = node
        .children
        .iter()
        .map(|child| {
            if !matched && child.key == *next_key {
                let (patched, hit) = apply_at(child, remainder, op);
                matched = hit;
                patched
            } else {
                child.clone()
            }
        })
        .collect();

    let mut out = node.clone();
    out.children = children;
    (out, matched)
}

fn apply_op(node: &SatNode, op: &PatchOp) -> SatNode {
    let mut out = node.clone();
    match op {
        PatchOp::ForcePass => {
            out.satisfied = true;
            out.rank = out.max_rank;
        }
        PatchOp::OverrideCredits(credits) => {
            out.credits = Some(*credits);
        }
        PatchOp::OverrideSubject(subject) => {
            out.subject = Some(subject.clone());
        }
        PatchOp::InsertCourse(clbid) => {
            if !out.claims.iter().any(|c| c.clbid == *clbid) {
                out.claims.push(CourseClaim {
                    clbid: clbid.clone(),
                    slot: node.key.clone(),
                });
            }
        }
    }
    out
}
