//! Mutation taxonomy and the authoritative application function.
//!
//! Every change to a [`GraphDocument`] goes through [`GraphDocument::apply`].
//! The hub applies envelopes to its room copy with it, and clients apply
//! both their own optimistic edits and remote patches with it. The returned
//! [`Change`] list is what observers (render, broadcast, autosave) react to.
//!
//! Minimal payloads: every kind except `ImportDocument` and
//! `PersistSnapshot` names only the entity it touches, so a peer can patch
//! one node or edge instead of re-deriving the document.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::{
    is_valid_display_id, Attribute, DisplayId, Edge, EdgeKey, EdgeKind, GraphDocument, Method,
    Node, Position, Size,
};
use crate::reconcile::reconcile_identifiers;

/// Wire-level mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    CreateNode,
    EditNode,
    DeleteNode,
    MoveNode,
    CreateEdge,
    EditEdge,
    DeleteEdge,
    ImportDocument,
    PersistSnapshot,
}

impl MutationKind {
    pub const ALL: [MutationKind; 9] = [
        MutationKind::CreateNode,
        MutationKind::EditNode,
        MutationKind::DeleteNode,
        MutationKind::MoveNode,
        MutationKind::CreateEdge,
        MutationKind::EditEdge,
        MutationKind::DeleteEdge,
        MutationKind::ImportDocument,
        MutationKind::PersistSnapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::CreateNode => "create_node",
            MutationKind::EditNode => "edit_node",
            MutationKind::DeleteNode => "delete_node",
            MutationKind::MoveNode => "move_node",
            MutationKind::CreateEdge => "create_edge",
            MutationKind::EditEdge => "edit_edge",
            MutationKind::DeleteEdge => "delete_edge",
            MutationKind::ImportDocument => "import_document",
            MutationKind::PersistSnapshot => "persist_snapshot",
        }
    }

    /// Kinds that carry a whole document rather than a minimal patch.
    pub fn carries_document(&self) -> bool {
        matches!(
            self,
            MutationKind::ImportDocument | MutationKind::PersistSnapshot
        )
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a single entity, used by fast-path patches and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityRef {
    Node(DisplayId),
    Edge(EdgeKey),
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityRef::Node(id) => write!(f, "node {id}"),
            EntityRef::Edge(key) => write!(f, "edge {key}"),
        }
    }
}

/// Partial node update. `None` leaves a field untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub attributes: Option<Vec<Attribute>>,
    #[serde(default)]
    pub methods: Option<Vec<Method>>,
    #[serde(default)]
    pub size: Option<Size>,
}

impl NodePatch {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.attributes.is_none()
            && self.methods.is_none()
            && self.size.is_none()
    }

    fn apply_to(&self, node: &mut Node) {
        if let Some(name) = &self.name {
            node.name = name.clone();
        }
        if let Some(attributes) = &self.attributes {
            node.attributes = attributes.clone();
        }
        if let Some(methods) = &self.methods {
            node.methods = methods.clone();
        }
        if let Some(size) = self.size {
            node.size = Some(size);
        }
    }
}

/// Partial edge update. An empty string clears an optional text field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgePatch {
    #[serde(default)]
    pub kind: Option<EdgeKind>,
    #[serde(default)]
    pub origin_card: Option<String>,
    #[serde(default)]
    pub dest_card: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

impl EdgePatch {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.origin_card.is_none()
            && self.dest_card.is_none()
            && self.label.is_none()
    }

    fn apply_to(&self, edge: &mut Edge) {
        fn set(slot: &mut Option<String>, value: &Option<String>) {
            if let Some(v) = value {
                *slot = if v.is_empty() { None } else { Some(v.clone()) };
            }
        }
        if let Some(kind) = self.kind {
            edge.kind = kind;
        }
        set(&mut edge.origin_card, &self.origin_card);
        set(&mut edge.dest_card, &self.dest_card);
        set(&mut edge.label, &self.label);
    }
}

/// A mutation payload. The variant is the [`MutationKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Mutation {
    CreateNode { node: Node },
    EditNode { display_id: DisplayId, patch: NodePatch },
    DeleteNode { display_id: DisplayId },
    MoveNode { display_id: DisplayId, x: f64, y: f64 },
    CreateEdge { edge: Edge },
    EditEdge { from: DisplayId, to: DisplayId, patch: EdgePatch },
    DeleteEdge { from: DisplayId, to: DisplayId },
    ImportDocument { document: GraphDocument },
    PersistSnapshot { document: GraphDocument },
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::CreateNode { .. } => MutationKind::CreateNode,
            Mutation::EditNode { .. } => MutationKind::EditNode,
            Mutation::DeleteNode { .. } => MutationKind::DeleteNode,
            Mutation::MoveNode { .. } => MutationKind::MoveNode,
            Mutation::CreateEdge { .. } => MutationKind::CreateEdge,
            Mutation::EditEdge { .. } => MutationKind::EditEdge,
            Mutation::DeleteEdge { .. } => MutationKind::DeleteEdge,
            Mutation::ImportDocument { .. } => MutationKind::ImportDocument,
            Mutation::PersistSnapshot { .. } => MutationKind::PersistSnapshot,
        }
    }

    /// The single entity a minimal-payload mutation touches.
    pub fn target(&self) -> Option<EntityRef> {
        match self {
            Mutation::CreateNode { node } => Some(EntityRef::Node(node.display_id)),
            Mutation::EditNode { display_id, .. }
            | Mutation::DeleteNode { display_id }
            | Mutation::MoveNode { display_id, .. } => Some(EntityRef::Node(*display_id)),
            Mutation::CreateEdge { edge } => Some(EntityRef::Edge(edge.key())),
            Mutation::EditEdge { from, to, .. } | Mutation::DeleteEdge { from, to } => {
                Some(EntityRef::Edge(EdgeKey::new(*from, *to)))
            }
            Mutation::ImportDocument { .. } | Mutation::PersistSnapshot { .. } => None,
        }
    }
}

/// Fine-grained effect of applying a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    NodeAdded(DisplayId),
    NodeUpdated(DisplayId),
    NodeMoved { display_id: DisplayId, position: Position },
    NodeRemoved(DisplayId),
    EdgeAdded(EdgeKey),
    EdgeUpdated(EdgeKey),
    EdgeRemoved(EdgeKey),
    DocumentReplaced,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApplyError {
    #[error("{0} not found")]
    NotFound(EntityRef),
    #[error("display id {display_id} already belongs to node {existing}")]
    Conflict {
        display_id: DisplayId,
        existing: String,
    },
    #[error("invalid mutation: {0}")]
    Invalid(String),
}

impl GraphDocument {
    /// Apply one mutation in place and report what changed.
    ///
    /// On error the document is left untouched.
    pub fn apply(&mut self, mutation: &Mutation) -> Result<Vec<Change>, ApplyError> {
        match mutation {
            Mutation::CreateNode { node } => self.create_node(node),
            Mutation::EditNode { display_id, patch } => {
                let node = self
                    .node_mut(*display_id)
                    .ok_or(ApplyError::NotFound(EntityRef::Node(*display_id)))?;
                patch.apply_to(node);
                Ok(vec![Change::NodeUpdated(*display_id)])
            }
            Mutation::DeleteNode { display_id } => self.delete_node(*display_id),
            Mutation::MoveNode { display_id, x, y } => {
                if !x.is_finite() || !y.is_finite() {
                    return Err(ApplyError::Invalid(format!(
                        "non-finite position ({x}, {y}) for node {display_id}"
                    )));
                }
                let node = self
                    .node_mut(*display_id)
                    .ok_or(ApplyError::NotFound(EntityRef::Node(*display_id)))?;
                node.position = Position::new(*x, *y);
                Ok(vec![Change::NodeMoved {
                    display_id: *display_id,
                    position: node.position,
                }])
            }
            Mutation::CreateEdge { edge } => self.create_edge(edge),
            Mutation::EditEdge { from, to, patch } => {
                let key = EdgeKey::new(*from, *to);
                let edge = self
                    .edge_between_mut(*from, *to)
                    .ok_or(ApplyError::NotFound(EntityRef::Edge(key)))?;
                patch.apply_to(edge);
                Ok(vec![Change::EdgeUpdated(key)])
            }
            Mutation::DeleteEdge { from, to } => {
                let key = EdgeKey::new(*from, *to);
                let before = self.edges.len();
                self.edges.retain(|e| e.key() != key);
                if self.edges.len() == before {
                    return Err(ApplyError::NotFound(EntityRef::Edge(key)));
                }
                Ok(vec![Change::EdgeRemoved(key)])
            }
            Mutation::ImportDocument { document } => {
                *self = reconcile_identifiers(document.clone());
                Ok(vec![Change::DocumentReplaced])
            }
            Mutation::PersistSnapshot { .. } => Ok(Vec::new()),
        }
    }

    fn create_node(&mut self, node: &Node) -> Result<Vec<Change>, ApplyError> {
        if !is_valid_display_id(node.display_id) {
            return Err(ApplyError::Invalid(format!(
                "display id {} is out of range",
                node.display_id
            )));
        }
        if let Some(existing) = self.node_mut(node.display_id) {
            if existing.stable_id != node.stable_id {
                return Err(ApplyError::Conflict {
                    display_id: node.display_id,
                    existing: existing.stable_id.clone(),
                });
            }
            // Redelivery of the same node: overwrite.
            *existing = node.clone();
            return Ok(vec![Change::NodeUpdated(node.display_id)]);
        }
        self.nodes.push(node.clone());
        self.next_id = self.next_id.max(node.display_id + 1);
        Ok(vec![Change::NodeAdded(node.display_id)])
    }

    fn delete_node(&mut self, display_id: DisplayId) -> Result<Vec<Change>, ApplyError> {
        let index = self
            .nodes
            .iter()
            .position(|n| n.display_id == display_id)
            .ok_or(ApplyError::NotFound(EntityRef::Node(display_id)))?;
        self.nodes.remove(index);

        let mut changes = vec![Change::NodeRemoved(display_id)];
        let mut kept = Vec::with_capacity(self.edges.len());
        for edge in self.edges.drain(..) {
            if edge.touches(display_id) {
                changes.push(Change::EdgeRemoved(edge.key()));
            } else {
                kept.push(edge);
            }
        }
        self.edges = kept;
        Ok(changes)
    }

    /// Set semantics: an existing edge on the same unordered pair is replaced.
    fn create_edge(&mut self, edge: &Edge) -> Result<Vec<Change>, ApplyError> {
        for endpoint in [edge.from_display_id, edge.to_display_id] {
            if !self.contains_node(endpoint) {
                return Err(ApplyError::NotFound(EntityRef::Node(endpoint)));
            }
        }
        let key = edge.key();
        let mut changes = Vec::with_capacity(2);
        if let Some(index) = self.edges.iter().position(|e| e.key() == key) {
            self.edges.remove(index);
            changes.push(Change::EdgeRemoved(key));
        }
        self.edges.push(edge.clone());
        changes.push(Change::EdgeAdded(key));
        Ok(changes)
    }
}
