//! Identifier reconciliation for documents merged from outside the session.
//!
//! Imports and stored snapshots can carry display ids that are invalid
//! (non-positive, past [`MAX_DISPLAY_ID`], or placeholders for non-integral values, see
//! [`crate::import`]) or duplicated. Reconciliation renumbers nodes so every
//! display id is positive and unique, then repairs the edge list:
//!
//! ```text
//!   group by display_id
//!        │
//!        ├── invalid id ─▶ every member gets a fresh id  (max valid + 1, …,
//!        │                 wrapping to the lowest free id at the ceiling)
//!        │                 old → first fresh id is kept for edge remapping
//!        │
//!        └── duplicate  ─▶ first member keeps the id, the rest get fresh ids
//!                          (edges are NOT remapped: they stay on the first)
//!
//!   edges: remap invalid endpoints, drop dangling (checked against the
//!          input ids), collapse parallel pairs
//!   next_id = max(next_id, max node id + 1)
//! ```
//!
//! Reconciling a valid document is a no-op, so running it twice is the same
//! as running it once.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::{is_valid_display_id, DisplayId, EdgeKey, GraphDocument, MAX_DISPLAY_ID};

/// What to do with duplicated (but otherwise valid) display ids.
///
/// Duplicates cannot be resolved without guessing which node an edge meant,
/// so callers choose explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// First node keeps the id, later ones are renumbered, edges stay put.
    #[default]
    KeepFirst,
    /// Refuse the merge.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("document repeats display ids {0:?}")]
    DuplicateDisplayIds(Vec<DisplayId>),
}

/// Valid display ids that appear on more than one node, in first-seen order.
pub fn duplicated_display_ids(doc: &GraphDocument) -> Vec<DisplayId> {
    let mut counts: HashMap<DisplayId, usize> = HashMap::with_capacity(doc.nodes.len());
    let mut order = Vec::new();
    for node in &doc.nodes {
        if !is_valid_display_id(node.display_id) {
            continue;
        }
        let count = counts.entry(node.display_id).or_insert(0);
        *count += 1;
        if *count == 2 {
            order.push(node.display_id);
        }
    }
    order
}

/// Reconcile under an explicit duplicate policy.
pub fn reconcile_identifiers_with(
    doc: GraphDocument,
    policy: DuplicatePolicy,
) -> Result<GraphDocument, ReconcileError> {
    if policy == DuplicatePolicy::Reject {
        let duplicates = duplicated_display_ids(&doc);
        if !duplicates.is_empty() {
            return Err(ReconcileError::DuplicateDisplayIds(duplicates));
        }
    }
    Ok(reconcile_identifiers(doc))
}

/// Hands out display ids no node holds, counting up from the highest valid
/// id and wrapping to the lowest free id past [`MAX_DISPLAY_ID`].
struct FreshIds {
    used: HashSet<DisplayId>,
    cursor: DisplayId,
}

impl FreshIds {
    fn new(used: HashSet<DisplayId>) -> Self {
        let max_valid = used.iter().copied().max().unwrap_or(0);
        let cursor = if max_valid < MAX_DISPLAY_ID { max_valid + 1 } else { 1 };
        Self { used, cursor }
    }

    fn next(&mut self) -> DisplayId {
        loop {
            let id = self.cursor;
            self.cursor = if id < MAX_DISPLAY_ID { id + 1 } else { 1 };
            if self.used.insert(id) {
                return id;
            }
        }
    }
}

/// Renumber nodes to unique positive display ids and repair edges.
pub fn reconcile_identifiers(mut doc: GraphDocument) -> GraphDocument {
    // Ids that survive unchanged: the first holder of each valid id.
    let kept: HashSet<DisplayId> = doc
        .nodes
        .iter()
        .map(|n| n.display_id)
        .filter(|id| is_valid_display_id(*id))
        .collect();
    let mut fresh = FreshIds::new(kept.clone());

    let mut seen: HashSet<DisplayId> = HashSet::with_capacity(doc.nodes.len());
    let mut remap: HashMap<DisplayId, DisplayId> = HashMap::new();
    let mut renumbered = 0usize;

    for node in &mut doc.nodes {
        let old = node.display_id;
        if !is_valid_display_id(old) {
            node.display_id = fresh.next();
            remap.entry(old).or_insert(node.display_id);
        } else if !seen.insert(old) {
            node.display_id = fresh.next();
        } else {
            continue;
        }
        renumbered += 1;
    }

    // Endpoints resolve against the input ids, so an edge never lands on a
    // renumbered duplicate by accident.
    let resolve = |id: DisplayId| -> Option<DisplayId> {
        match remap.get(&id) {
            Some(&fresh_id) => Some(fresh_id),
            None => kept.contains(&id).then_some(id),
        }
    };
    let edge_count = doc.edges.len();

    // Walk backwards so the last edge on a pair wins, then restore order.
    let mut pairs: HashSet<EdgeKey> = HashSet::with_capacity(edge_count);
    let mut edges = Vec::with_capacity(edge_count);
    for mut edge in doc.edges.drain(..).rev() {
        let (Some(from), Some(to)) = (resolve(edge.from_display_id), resolve(edge.to_display_id))
        else {
            continue;
        };
        edge.from_display_id = from;
        edge.to_display_id = to;
        if pairs.insert(edge.key()) {
            edges.push(edge);
        }
    }
    edges.reverse();
    let dropped = edge_count - edges.len();
    doc.edges = edges;

    doc.next_id = doc.next_id.max(doc.max_display_id() + 1);

    if renumbered > 0 || dropped > 0 {
        log::debug!(
            "Reconciled identifiers: {renumbered} nodes renumbered, {dropped} edges dropped"
        );
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Edge, EdgeKind, Node, Position};
    use crate::validate::validate;

    fn node(id: DisplayId) -> Node {
        Node::new(id, format!("N{id}"), Position::default())
    }

    fn edge(from: DisplayId, to: DisplayId) -> Edge {
        Edge::new(from, to, EdgeKind::Association)
    }

    fn doc(nodes: Vec<Node>, edges: Vec<Edge>, next_id: DisplayId) -> GraphDocument {
        GraphDocument {
            next_id,
            nodes,
            edges,
            ..GraphDocument::new()
        }
    }

    fn ids(doc: &GraphDocument) -> Vec<DisplayId> {
        doc.nodes.iter().map(|n| n.display_id).collect()
    }

    #[test]
    fn test_valid_document_is_unchanged() {
        let input = doc(vec![node(1), node(2)], vec![edge(1, 2)], 3);
        let output = reconcile_identifiers(input.clone());
        assert_eq!(output, input);
    }

    #[test]
    fn test_duplicate_keeps_first_and_leaves_edges() {
        // (1), (1), edge 1→1: the self-loop stays on the kept node.
        let input = doc(vec![node(1), node(1)], vec![edge(1, 1)], 1);
        let first_stable = input.nodes[0].stable_id.clone();

        let output = reconcile_identifiers(input);
        assert_eq!(ids(&output), vec![1, 2]);
        assert_eq!(output.nodes[0].stable_id, first_stable);
        assert_eq!(output.edges.len(), 1);
        assert_eq!(output.edges[0].from_display_id, 1);
        assert_eq!(output.edges[0].to_display_id, 1);
        assert_eq!(output.next_id, 3);
    }

    #[test]
    fn test_invalid_ids_get_fresh_ids_and_edges_follow() {
        let input = doc(
            vec![node(3), node(-1), node(0)],
            vec![edge(-1, 3), edge(0, -1)],
            0,
        );
        let output = reconcile_identifiers(input);
        assert_eq!(ids(&output), vec![3, 4, 5]);
        let keys: Vec<_> = output.edges.iter().map(|e| e.key()).collect();
        assert_eq!(keys, vec![EdgeKey::new(3, 4), EdgeKey::new(4, 5)]);
        assert_eq!(output.next_id, 6);
    }

    #[test]
    fn test_repeated_invalid_id_maps_to_first_fresh_id() {
        let input = doc(vec![node(2), node(-7), node(-7)], vec![edge(-7, 2)], 1);
        let output = reconcile_identifiers(input);
        assert_eq!(ids(&output), vec![2, 3, 4]);
        assert_eq!(output.edges[0].key(), EdgeKey::new(2, 3));
    }

    #[test]
    fn test_dangling_edges_dropped() {
        let input = doc(vec![node(1)], vec![edge(1, 9), edge(-4, 1)], 2);
        let output = reconcile_identifiers(input);
        assert!(output.edges.is_empty());
    }

    #[test]
    fn test_dangling_edge_does_not_attach_to_renumbered_duplicate() {
        // Node 2 never existed; the duplicate renumbered to 2 must not pick up the edge.
        let input = doc(vec![node(1), node(1)], vec![edge(1, 2)], 2);
        let output = reconcile_identifiers(input);
        assert_eq!(ids(&output), vec![1, 2]);
        assert!(output.edges.is_empty());
    }

    #[test]
    fn test_id_past_ceiling_is_renumbered() {
        let input = doc(vec![node(4), node(i64::MAX)], vec![edge(i64::MAX, 4)], i64::MAX);
        let output = reconcile_identifiers(input);
        assert_eq!(ids(&output), vec![4, 5]);
        assert_eq!(output.edges[0].key(), EdgeKey::new(4, 5));
        assert!(validate(&output).is_empty(), "{:?}", validate(&output));
    }

    #[test]
    fn test_fresh_ids_wrap_to_free_ids_at_ceiling() {
        let input = doc(
            vec![node(MAX_DISPLAY_ID), node(1), node(-1), node(MAX_DISPLAY_ID)],
            vec![edge(-1, MAX_DISPLAY_ID)],
            1,
        );
        let output = reconcile_identifiers(input);
        assert_eq!(ids(&output), vec![MAX_DISPLAY_ID, 1, 2, 3]);
        assert_eq!(output.edges[0].key(), EdgeKey::new(2, MAX_DISPLAY_ID));
        assert_eq!(output.next_id, MAX_DISPLAY_ID + 1);
        assert_eq!(reconcile_identifiers(output.clone()), output);
    }

    #[test]
    fn test_parallel_edges_collapse_to_last() {
        let mut second = Edge::new(2, 1, EdgeKind::Generalization);
        second.label = Some("is-a".into());
        let input = doc(vec![node(1), node(2)], vec![edge(1, 2), second.clone()], 3);
        let output = reconcile_identifiers(input);
        assert_eq!(output.edges, vec![second]);
    }

    #[test]
    fn test_next_id_never_decreases() {
        let input = doc(vec![node(1)], Vec::new(), 40);
        assert_eq!(reconcile_identifiers(input).next_id, 40);
        let empty = doc(Vec::new(), Vec::new(), -3);
        assert_eq!(reconcile_identifiers(empty).next_id, 1);
    }

    #[test]
    fn test_idempotent_on_messy_input() {
        let input = doc(
            vec![node(5), node(5), node(-2), node(0), node(1), node(1)],
            vec![edge(5, -2), edge(0, 1), edge(1, 5), edge(5, 1), edge(8, 8)],
            2,
        );
        let once = reconcile_identifiers(input);
        let twice = reconcile_identifiers(once.clone());
        assert_eq!(once, twice);
        assert!(validate(&once).is_empty(), "{:?}", validate(&once));
    }

    #[test]
    fn test_reject_policy_refuses_duplicates() {
        let input = doc(vec![node(1), node(2), node(1), node(2), node(2)], Vec::new(), 3);
        let err = reconcile_identifiers_with(input, DuplicatePolicy::Reject).unwrap_err();
        assert_eq!(err, ReconcileError::DuplicateDisplayIds(vec![1, 2]));
    }

    #[test]
    fn test_reject_policy_still_fixes_invalid_ids() {
        let input = doc(vec![node(1), node(-1)], Vec::new(), 1);
        let output = reconcile_identifiers_with(input, DuplicatePolicy::Reject).unwrap();
        assert_eq!(ids(&output), vec![1, 2]);
    }
}
