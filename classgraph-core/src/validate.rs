//! Structural invariants of a [`GraphDocument`].

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::document::{is_valid_display_id, DisplayId, EdgeKey, GraphDocument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum Violation {
    DuplicateDisplayId {
        display_id: DisplayId,
        count: usize,
    },
    InvalidDisplayId {
        stable_id: String,
        display_id: DisplayId,
    },
    DanglingEdge {
        edge_id: String,
        missing_display_id: DisplayId,
    },
    ParallelEdge {
        key: EdgeKey,
        count: usize,
    },
    NextIdNotMonotonic {
        next_id: DisplayId,
        max_display_id: DisplayId,
    },
}

impl Violation {
    pub fn code(&self) -> &'static str {
        match self {
            Violation::DuplicateDisplayId { .. } => "duplicate_display_id",
            Violation::InvalidDisplayId { .. } => "invalid_display_id",
            Violation::DanglingEdge { .. } => "dangling_edge",
            Violation::ParallelEdge { .. } => "parallel_edge",
            Violation::NextIdNotMonotonic { .. } => "next_id_not_monotonic",
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::DuplicateDisplayId { display_id, count } => {
                write!(f, "display id {display_id} used by {count} nodes")
            }
            Violation::InvalidDisplayId {
                stable_id,
                display_id,
            } => write!(f, "node {stable_id} has out-of-range display id {display_id}"),
            Violation::DanglingEdge {
                edge_id,
                missing_display_id,
            } => write!(f, "edge {edge_id} references missing node {missing_display_id}"),
            Violation::ParallelEdge { key, count } => {
                write!(f, "{count} edges between {key}")
            }
            Violation::NextIdNotMonotonic {
                next_id,
                max_display_id,
            } => write!(f, "next id {next_id} not above max display id {max_display_id}"),
        }
    }
}

/// Every invariant violation in `doc`, in document order.
pub fn validate(doc: &GraphDocument) -> Vec<Violation> {
    let mut violations = Vec::new();

    let mut counts: HashMap<DisplayId, usize> = HashMap::with_capacity(doc.nodes.len());
    let mut order = Vec::new();
    for node in &doc.nodes {
        if !is_valid_display_id(node.display_id) {
            violations.push(Violation::InvalidDisplayId {
                stable_id: node.stable_id.clone(),
                display_id: node.display_id,
            });
        }
        let count = counts.entry(node.display_id).or_insert(0);
        if *count == 0 {
            order.push(node.display_id);
        }
        *count += 1;
    }
    for id in order {
        let count = counts[&id];
        if count > 1 {
            violations.push(Violation::DuplicateDisplayId {
                display_id: id,
                count,
            });
        }
    }

    let node_ids: HashSet<DisplayId> = counts.keys().copied().collect();
    let mut pairs: HashMap<EdgeKey, usize> = HashMap::with_capacity(doc.edges.len());
    let mut pair_order = Vec::new();
    for edge in &doc.edges {
        for endpoint in [edge.from_display_id, edge.to_display_id] {
            if !node_ids.contains(&endpoint) {
                violations.push(Violation::DanglingEdge {
                    edge_id: edge.id.clone(),
                    missing_display_id: endpoint,
                });
                break;
            }
        }
        let count = pairs.entry(edge.key()).or_insert(0);
        if *count == 0 {
            pair_order.push(edge.key());
        }
        *count += 1;
    }
    for key in pair_order {
        let count = pairs[&key];
        if count > 1 {
            violations.push(Violation::ParallelEdge { key, count });
        }
    }

    let max_display_id = doc.max_display_id();
    if doc.next_id <= max_display_id {
        violations.push(Violation::NextIdNotMonotonic {
            next_id: doc.next_id,
            max_display_id,
        });
    }

    violations
}

pub fn is_valid(doc: &GraphDocument) -> bool {
    validate(doc).is_empty()
}
