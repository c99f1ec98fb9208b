//! Class-diagram document model.
//!
//! A [`GraphDocument`] is the unit of collaboration: one per project, shared
//! by every session in the project's room. Nodes are classes, edges are the
//! relationships between them.
//!
//! ```text
//! GraphDocument
//! ├── next_id        display id allocator (always > max node id)
//! ├── nodes[]        Node { stable_id, display_id, name, position, … }
//! └── edges[]        Edge { from_display_id, to_display_id, kind, … }
//!                    at most one edge per unordered endpoint pair
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current document format version.
pub const FORMAT_VERSION: u32 = 1;

/// Human-visible, document-scoped node identifier. Valid ids are
/// `1..=MAX_DISPLAY_ID`.
pub type DisplayId = i64;

/// Largest display id: the largest integer a JSON number holds exactly.
pub const MAX_DISPLAY_ID: DisplayId = (1 << 53) - 1;

/// Whether `id` is usable as a node display id.
#[inline]
pub fn is_valid_display_id(id: DisplayId) -> bool {
    (1..=MAX_DISPLAY_ID).contains(&id)
}

/// Canvas position of a node's top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Explicit node size. Absent means "let the renderer decide".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub w: f64,
    pub h: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

impl Attribute {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Method {
    pub name: String,
    pub return_type: String,
}

impl Method {
    pub fn new(name: impl Into<String>, return_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            return_type: return_type.into(),
        }
    }
}

/// A class in the diagram.
///
/// `stable_id` never changes for the node's lifetime; `display_id` may be
/// renumbered by identifier reconciliation when documents are merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub stable_id: String,
    pub display_id: DisplayId,
    pub name: String,
    pub position: Position,
    #[serde(default)]
    pub size: Option<Size>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub methods: Vec<Method>,
}

impl Node {
    /// Create a node with a fresh stable id.
    pub fn new(display_id: DisplayId, name: impl Into<String>, position: Position) -> Self {
        Self {
            stable_id: Uuid::new_v4().to_string(),
            display_id,
            name: name.into(),
            position,
            size: None,
            attributes: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }
}

/// UML relationship kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    #[default]
    Association,
    Generalization,
    Aggregation,
    Composition,
}

/// Unordered endpoint pair. `EdgeKey::new(a, b) == EdgeKey::new(b, a)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub low: DisplayId,
    pub high: DisplayId,
}

impl EdgeKey {
    pub fn new(a: DisplayId, b: DisplayId) -> Self {
        Self {
            low: a.min(b),
            high: a.max(b),
        }
    }

    pub fn touches(&self, id: DisplayId) -> bool {
        self.low == id || self.high == id
    }
}

impl std::fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}<->{}", self.low, self.high)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub from_display_id: DisplayId,
    pub to_display_id: DisplayId,
    #[serde(default)]
    pub kind: EdgeKind,
    #[serde(default)]
    pub origin_card: Option<String>,
    #[serde(default)]
    pub dest_card: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(from: DisplayId, to: DisplayId, kind: EdgeKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from_display_id: from,
            to_display_id: to,
            kind,
            origin_card: None,
            dest_card: None,
            label: None,
        }
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(self.from_display_id, self.to_display_id)
    }

    pub fn touches(&self, id: DisplayId) -> bool {
        self.from_display_id == id || self.to_display_id == id
    }
}

/// The shared class-diagram model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDocument {
    pub format_version: u32,
    pub next_id: DisplayId,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Default for GraphDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphDocument {
    /// An empty document.
    pub fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            next_id: 1,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    pub fn node(&self, display_id: DisplayId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.display_id == display_id)
    }

    pub fn node_mut(&mut self, display_id: DisplayId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.display_id == display_id)
    }

    pub fn contains_node(&self, display_id: DisplayId) -> bool {
        self.node(display_id).is_some()
    }

    /// The edge joining `a` and `b`, in either direction.
    pub fn edge_between(&self, a: DisplayId, b: DisplayId) -> Option<&Edge> {
        let key = EdgeKey::new(a, b);
        self.edges.iter().find(|e| e.key() == key)
    }

    pub fn edge_between_mut(&mut self, a: DisplayId, b: DisplayId) -> Option<&mut Edge> {
        let key = EdgeKey::new(a, b);
        self.edges.iter_mut().find(|e| e.key() == key)
    }

    pub fn edges_touching(&self, display_id: DisplayId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.touches(display_id))
    }

    /// Highest node display id, or 0 for an empty document.
    pub fn max_display_id(&self) -> DisplayId {
        self.nodes.iter().map(|n| n.display_id).max().unwrap_or(0)
    }

    /// Reserve the next display id.
    ///
    /// Never returns an id already used by a node, even if `next_id` was
    /// left behind by a hand-edited snapshot. `None` once the allocator has
    /// passed [`MAX_DISPLAY_ID`].
    pub fn allocate_display_id(&mut self) -> Option<DisplayId> {
        let id = self
            .next_id
            .max(self.max_display_id().saturating_add(1))
            .max(1);
        if !is_valid_display_id(id) {
            return None;
        }
        self.next_id = id + 1;
        Some(id)
    }
}
