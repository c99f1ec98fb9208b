//! Tolerant JSON import of class diagrams.
//!
//! Files written by older editors or by hand may have display ids that are
//! not positive integers: `0`, `-3`, `2.5`, `"A"`, `null`. Each distinct
//! invalid raw value is interned to its own non-positive placeholder, with
//! the same mapping applied to node ids and edge endpoints. Reconciliation
//! can then give those nodes fresh ids and carry their edges along.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::document::{
    is_valid_display_id, Attribute, DisplayId, Edge, EdgeKind, GraphDocument, Method, Node,
    Position, Size, FORMAT_VERSION, MAX_DISPLAY_ID,
};
use crate::reconcile::{reconcile_identifiers_with, DuplicatePolicy, ReconcileError};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("malformed document JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported format version {0} (max {max})", max = FORMAT_VERSION)]
    UnsupportedVersion(u32),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

fn default_format_version() -> u32 {
    FORMAT_VERSION
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDocument {
    #[serde(default = "default_format_version")]
    format_version: u32,
    #[serde(default)]
    next_id: Value,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    edges: Vec<RawEdge>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNode {
    #[serde(default)]
    stable_id: Option<String>,
    #[serde(default)]
    display_id: Value,
    #[serde(default)]
    name: String,
    #[serde(default)]
    position: Position,
    #[serde(default)]
    size: Option<Size>,
    #[serde(default)]
    attributes: Vec<Attribute>,
    #[serde(default)]
    methods: Vec<Method>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEdge {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    from_display_id: Value,
    #[serde(default)]
    to_display_id: Value,
    #[serde(default)]
    kind: EdgeKind,
    #[serde(default)]
    origin_card: Option<String>,
    #[serde(default)]
    dest_card: Option<String>,
    #[serde(default)]
    label: Option<String>,
}

/// Maps raw JSON id values onto display ids.
struct IdInterner {
    placeholders: HashMap<String, DisplayId>,
    next_placeholder: DisplayId,
}

impl IdInterner {
    fn new() -> Self {
        Self {
            placeholders: HashMap::new(),
            next_placeholder: 0,
        }
    }

    fn intern(&mut self, raw: &Value) -> DisplayId {
        if let Some(id) = positive_integer(raw) {
            return id;
        }
        let next = &mut self.next_placeholder;
        *self.placeholders.entry(raw.to_string()).or_insert_with(|| {
            let id = *next;
            *next -= 1;
            id
        })
    }
}

/// `3` and `3.0` are display id 3; everything else, including integers
/// past [`MAX_DISPLAY_ID`], is invalid.
fn positive_integer(raw: &Value) -> Option<DisplayId> {
    let number = raw.as_number()?;
    if let Some(id) = number.as_i64() {
        return is_valid_display_id(id).then_some(id);
    }
    let f = number.as_f64()?;
    (f.fract() == 0.0 && f >= 1.0 && f <= MAX_DISPLAY_ID as f64).then_some(f as DisplayId)
}

/// Parse a document without reconciling it.
///
/// Invalid display ids come back as non-positive placeholders. Run the
/// result through reconciliation before using it.
pub fn decode_document(json: &str) -> Result<GraphDocument, ImportError> {
    let raw: RawDocument = serde_json::from_str(json)?;
    if raw.format_version > FORMAT_VERSION {
        return Err(ImportError::UnsupportedVersion(raw.format_version));
    }

    let mut ids = IdInterner::new();
    let nodes = raw
        .nodes
        .into_iter()
        .map(|n| Node {
            stable_id: n.stable_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            display_id: ids.intern(&n.display_id),
            name: n.name,
            position: n.position,
            size: n.size,
            attributes: n.attributes,
            methods: n.methods,
        })
        .collect();
    let edges = raw
        .edges
        .into_iter()
        .map(|e| Edge {
            id: e.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            from_display_id: ids.intern(&e.from_display_id),
            to_display_id: ids.intern(&e.to_display_id),
            kind: e.kind,
            origin_card: e.origin_card,
            dest_card: e.dest_card,
            label: e.label,
        })
        .collect();

    Ok(GraphDocument {
        format_version: FORMAT_VERSION,
        next_id: raw.next_id.as_i64().unwrap_or(1),
        nodes,
        edges,
    })
}

/// Parse and reconcile a document for import.
pub fn import_json(json: &str, policy: DuplicatePolicy) -> Result<GraphDocument, ImportError> {
    let doc = decode_document(json)?;
    Ok(reconcile_identifiers_with(doc, policy)?)
}

pub fn encode_document(doc: &GraphDocument) -> Result<String, ImportError> {
    Ok(serde_json::to_string_pretty(doc)?)
}
