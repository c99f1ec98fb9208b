//! # classgraph-core: shared class-diagram document model
//!
//! Pure, synchronous building blocks used by both the hub and the clients:
//!
//! - [`document`]: `GraphDocument`, `Node`, `Edge` and lookup helpers
//! - [`mutation`]: the mutation taxonomy and `GraphDocument::apply`
//! - [`validate`]: structural invariant checks
//! - [`reconcile`]: display-id reconciliation for merged documents
//! - [`import`]: tolerant JSON import/export
//!
//! Nothing here does I/O or knows about sessions; see `classgraph-collab`
//! for the networked engine.

pub mod document;
pub mod import;
pub mod mutation;
pub mod reconcile;
pub mod validate;

pub use document::{
    is_valid_display_id, Attribute, DisplayId, Edge, EdgeKey, EdgeKind, GraphDocument, Method,
    Node, Position, Size, FORMAT_VERSION, MAX_DISPLAY_ID,
};
pub use import::{decode_document, encode_document, import_json, ImportError};
pub use mutation::{
    ApplyError, Change, EdgePatch, EntityRef, Mutation, MutationKind, NodePatch,
};
pub use reconcile::{
    duplicated_display_ids, reconcile_identifiers, reconcile_identifiers_with, DuplicatePolicy,
    ReconcileError,
};
pub use validate::{is_valid, validate, Violation};
