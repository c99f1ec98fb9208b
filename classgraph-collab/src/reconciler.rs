//! Client-side replica and the rules for what leaves it.
//!
//! The reconciler owns the client's copy of the document and is the only
//! thing that mutates it. Local edits and remote envelopes both go through
//! [`GraphDocument::apply`]; what differs is what the resulting changes
//! are allowed to trigger:
//!
//! ```text
//!                     apply_local                 receive
//!                          │                         │
//!                 role gate, joined?          echo? ─► Echo (dropped)
//!                          │                         │
//!                          ▼                 [applying_remote]
//!                 ┌────────────────┐                 │
//!                 │ GraphDocument  │◄────────────────┘
//!                 │    ::apply     │
//!                 └───────┬────────┘
//!                         │ Vec<Change>
//!                         ▼
//!                     observe(change)
//!           render patch ─┤ (always, unless frozen)
//!                         │ guards clear?
//!          moves ─► Effects.moves  (coalesced, not emitted)
//!     edge add/remove ─► Effects.outbound
//!       any local change ─► Effects.persist
//! ```
//!
//! Explicit edit paths emit their own envelope. Edge additions and
//! removals that are side effects of another edit (cascade on node delete,
//! replacement on edge create) are kept silent by the guards, so each user
//! action produces exactly one envelope.

use classgraph_core::{
    reconcile_identifiers_with, Attribute, DisplayId, DuplicatePolicy, Edge, EdgeKey, EdgeKind,
    EdgePatch, GraphDocument, Method, Mutation, MutationKind, Node, NodePatch, Position, Size,
};
use uuid::Uuid;

use crate::error::SyncError;
use crate::protocol::Envelope;
use crate::role::{self, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Joined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// A remote envelope is being applied; nothing may be re-emitted.
    ApplyingRemote,
    /// A node delete is removing its edges; the cascade stays local.
    SuppressCascadeEmit,
    /// An explicit edge create owns its emission.
    CreatingLink,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReentrancyGuards {
    applying_remote: bool,
    suppress_cascade_emit: bool,
    creating_link: bool,
}

impl ReentrancyGuards {
    pub fn is_set(&self, guard: Guard) -> bool {
        match guard {
            Guard::ApplyingRemote => self.applying_remote,
            Guard::SuppressCascadeEmit => self.suppress_cascade_emit,
            Guard::CreatingLink => self.creating_link,
        }
    }

    pub fn is_clear(&self) -> bool {
        *self == Self::default()
    }

    fn replace(&mut self, guard: Guard, on: bool) -> bool {
        let slot = match guard {
            Guard::ApplyingRemote => &mut self.applying_remote,
            Guard::SuppressCascadeEmit => &mut self.suppress_cascade_emit,
            Guard::CreatingLink => &mut self.creating_link,
        };
        std::mem::replace(slot, on)
    }
}

/// An edit made by the local user.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEdit {
    AddNode {
        name: String,
        position: Position,
        size: Option<Size>,
        attributes: Vec<Attribute>,
        methods: Vec<Method>,
    },
    EditNode {
        display_id: DisplayId,
        patch: NodePatch,
    },
    MoveNode {
        display_id: DisplayId,
        x: f64,
        y: f64,
    },
    DeleteNode {
        display_id: DisplayId,
    },
    CreateEdge {
        from: DisplayId,
        to: DisplayId,
        kind: EdgeKind,
        origin_card: Option<String>,
        dest_card: Option<String>,
        label: Option<String>,
    },
    EditEdge {
        from: DisplayId,
        to: DisplayId,
        patch: EdgePatch,
    },
    DeleteEdge {
        from: DisplayId,
        to: DisplayId,
    },
    ImportDocument {
        document: GraphDocument,
    },
}

impl LocalEdit {
    pub fn add_node(name: impl Into<String>, position: Position) -> Self {
        LocalEdit::AddNode {
            name: name.into(),
            position,
            size: None,
            attributes: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn link(from: DisplayId, to: DisplayId, kind: EdgeKind) -> Self {
        LocalEdit::CreateEdge {
            from,
            to,
            kind,
            origin_card: None,
            dest_card: None,
            label: None,
        }
    }

    pub fn kind(&self) -> MutationKind {
        match self {
            LocalEdit::AddNode { .. } => MutationKind::CreateNode,
            LocalEdit::EditNode { .. } => MutationKind::EditNode,
            LocalEdit::MoveNode { .. } => MutationKind::MoveNode,
            LocalEdit::DeleteNode { .. } => MutationKind::DeleteNode,
            LocalEdit::CreateEdge { .. } => MutationKind::CreateEdge,
            LocalEdit::EditEdge { .. } => MutationKind::EditEdge,
            LocalEdit::DeleteEdge { .. } => MutationKind::DeleteEdge,
            LocalEdit::ImportDocument { .. } => MutationKind::ImportDocument,
        }
    }
}

/// Single-entity update for the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderPatch {
    NodeUpserted(Node),
    NodeRemoved(DisplayId),
    EdgeUpserted(Edge),
    EdgeRemoved(EdgeKey),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderUpdate {
    /// Re-render everything from this document.
    FullReplace(GraphDocument),
    Patch(RenderPatch),
}

/// What a local edit asks the outside world to do.
#[derive(Debug, Default)]
pub struct Effects {
    /// Send now.
    pub outbound: Vec<Envelope>,
    /// Feed to the move debouncer.
    pub moves: Vec<(DisplayId, Position)>,
    pub render: Vec<RenderUpdate>,
    /// Schedule an autosave snapshot.
    pub persist: bool,
}

/// Outcome of a remote envelope.
#[derive(Debug)]
pub enum Inbound {
    /// Produced by this session; discarded.
    Echo,
    /// Not joined, or addressed to another room.
    Ignored,
    /// A `persist_snapshot`; handed to the persistence boundary only.
    Persist(GraphDocument),
    Rendered(Vec<RenderUpdate>),
    /// The patch did not apply; the replica needs a resync from the hub.
    Resync(SyncError),
}

pub struct Reconciler {
    room: Uuid,
    session_id: Option<Uuid>,
    role: Option<Role>,
    state: ConnectionState,
    document: GraphDocument,
    guards: ReentrancyGuards,
    render_frozen: bool,
    duplicate_policy: DuplicatePolicy,
}

impl Reconciler {
    pub fn new(room: Uuid, duplicate_policy: DuplicatePolicy) -> Self {
        Self {
            room,
            session_id: None,
            role: None,
            state: ConnectionState::Disconnected,
            document: GraphDocument::new(),
            guards: ReentrancyGuards::default(),
            render_frozen: false,
            duplicate_policy,
        }
    }

    pub fn room(&self) -> Uuid {
        self.room
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn document(&self) -> &GraphDocument {
        &self.document
    }

    pub fn guards(&self) -> ReentrancyGuards {
        self.guards
    }

    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// Adopt the hub's document and the session identity it assigned.
    pub fn on_welcome(
        &mut self,
        session_id: Uuid,
        role: Role,
        document: GraphDocument,
    ) -> RenderUpdate {
        self.session_id = Some(session_id);
        self.role = Some(role);
        self.state = ConnectionState::Joined;
        let mut effects = Effects::default();
        self.with_guard(Guard::ApplyingRemote, |this| {
            this.replace_document(document, &mut effects)
        });
        RenderUpdate::FullReplace(self.document.clone())
    }

    /// Forget the session. The role is resolved again on the next join.
    pub fn on_disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.session_id = None;
        self.role = None;
        self.guards = ReentrancyGuards::default();
        self.render_frozen = false;
    }

    /// Apply a local edit optimistically and report what to send.
    ///
    /// Fails without touching the document when not joined, when the role
    /// may not mutate, or when the edit does not apply.
    pub fn apply_local(&mut self, edit: LocalEdit) -> Result<Effects, SyncError> {
        let (session_id, role) = match (self.state, self.session_id, self.role) {
            (ConnectionState::Joined, Some(session_id), Some(role)) => (session_id, role),
            _ => return Err(SyncError::Transport("not joined to a room".into())),
        };
        role::authorize(role, edit.kind())?;

        let mutation = self.build_mutation(edit)?;
        let mut effects = Effects::default();
        match mutation.kind() {
            MutationKind::CreateEdge => self.with_guard(Guard::CreatingLink, |this| {
                this.commit(&mutation, &mut effects)
            })?,
            MutationKind::DeleteNode => self.with_guard(Guard::SuppressCascadeEmit, |this| {
                this.commit(&mutation, &mut effects)
            })?,
            _ => self.commit(&mutation, &mut effects)?,
        }

        // Moves go through the debouncer; edge deletes were emitted by the observer.
        if !matches!(
            mutation.kind(),
            MutationKind::MoveNode | MutationKind::DeleteEdge
        ) {
            effects
                .outbound
                .push(Envelope::new(self.room, session_id, mutation));
        }
        Ok(effects)
    }

    /// Apply an envelope from the hub.
    pub fn receive(&mut self, envelope: Envelope) -> Inbound {
        if self.state != ConnectionState::Joined {
            return Inbound::Ignored;
        }
        if envelope.room != self.room {
            log::warn!(
                "Dropping {} for room {} while joined to {}",
                envelope.kind(),
                envelope.room,
                self.room
            );
            return Inbound::Ignored;
        }
        if self.session_id.is_some_and(|id| envelope.is_echo_for(id)) {
            log::trace!("Dropping echo of own {}", envelope.kind());
            return Inbound::Echo;
        }

        let kind = envelope.kind();
        let mut effects = Effects::default();
        let result = match envelope.mutation {
            Mutation::PersistSnapshot { document } => return Inbound::Persist(document),
            Mutation::ImportDocument { document } => {
                self.with_guard(Guard::ApplyingRemote, |this| {
                    this.replace_document(document, &mut effects)
                });
                Ok(())
            }
            mutation => self.with_guard(Guard::ApplyingRemote, |this| {
                this.commit(&mutation, &mut effects)
            }),
        };

        match result {
            Ok(()) => {
                debug_assert!(effects.outbound.is_empty() && effects.moves.is_empty());
                Inbound::Rendered(effects.render)
            }
            Err(e) => {
                log::warn!("Remote {kind} from {} did not apply: {e}", envelope.origin);
                Inbound::Resync(e.into())
            }
        }
    }

    /// `move_node` carrying a position this session chose.
    ///
    /// A remote move that landed inside the debounce window reached the hub
    /// ahead of this one, so the replica takes the local position back and
    /// the node goes to `render` again. `None` once the node is gone or the
    /// session may no longer mutate.
    pub fn move_envelope(
        &mut self,
        display_id: DisplayId,
        position: Position,
        render: &mut Vec<RenderUpdate>,
    ) -> Option<Envelope> {
        let session_id = self.mutating_session()?;
        let node = self.document.node_mut(display_id)?;
        if node.position != position {
            node.position = position;
            render.push(RenderUpdate::Patch(RenderPatch::NodeUpserted(node.clone())));
        }
        Some(Envelope::new(
            self.room,
            session_id,
            Mutation::MoveNode {
                display_id,
                x: position.x,
                y: position.y,
            },
        ))
    }

    /// `persist_snapshot` of the live document.
    pub fn snapshot_envelope(&self) -> Option<Envelope> {
        let session_id = self.mutating_session()?;
        Some(Envelope::new(
            self.room,
            session_id,
            Mutation::PersistSnapshot {
                document: self.document.clone(),
            },
        ))
    }

    fn mutating_session(&self) -> Option<Uuid> {
        match (self.state, self.session_id, self.role) {
            (ConnectionState::Joined, Some(id), Some(role)) if role.can_mutate() => Some(id),
            _ => None,
        }
    }

    fn build_mutation(&mut self, edit: LocalEdit) -> Result<Mutation, SyncError> {
        let mutation = match edit {
            LocalEdit::AddNode {
                name,
                position,
                size,
                attributes,
                methods,
            } => {
                let display_id = self.document.allocate_display_id().ok_or_else(|| {
                    SyncError::Validation("no display ids left in this document".into())
                })?;
                let mut node = Node::new(display_id, name, position);
                node.size = size;
                node.attributes = attributes;
                node.methods = methods;
                Mutation::CreateNode { node }
            }
            LocalEdit::EditNode { display_id, patch } => Mutation::EditNode { display_id, patch },
            LocalEdit::MoveNode { display_id, x, y } => Mutation::MoveNode { display_id, x, y },
            LocalEdit::DeleteNode { display_id } => Mutation::DeleteNode { display_id },
            LocalEdit::CreateEdge {
                from,
                to,
                kind,
                origin_card,
                dest_card,
                label,
            } => {
                let mut edge = Edge::new(from, to, kind);
                edge.origin_card = origin_card;
                edge.dest_card = dest_card;
                edge.label = label;
                Mutation::CreateEdge { edge }
            }
            LocalEdit::EditEdge { from, to, patch } => Mutation::EditEdge { from, to, patch },
            LocalEdit::DeleteEdge { from, to } => Mutation::DeleteEdge { from, to },
            LocalEdit::ImportDocument { document } => {
                let document = reconcile_identifiers_with(document, self.duplicate_policy)
                    .map_err(|e| SyncError::Validation(e.to_string()))?;
                Mutation::ImportDocument { document }
            }
        };
        Ok(mutation)
    }

    fn with_guard<T>(&mut self, guard: Guard, f: impl FnOnce(&mut Self) -> T) -> T {
        let previous = self.guards.replace(guard, true);
        let out = f(self);
        self.guards.replace(guard, previous);
        out
    }

    fn commit(
        &mut self,
        mutation: &Mutation,
        effects: &mut Effects,
    ) -> Result<(), classgraph_core::ApplyError> {
        // Whole-document replacement renders once, after the fact.
        let replacing = mutation.kind() == MutationKind::ImportDocument;
        self.render_frozen = replacing;
        let changes = match self.document.apply(mutation) {
            Ok(changes) => changes,
            Err(e) => {
                self.render_frozen = false;
                return Err(e);
            }
        };
        for change in &changes {
            self.observe(change, effects);
        }
        self.render_frozen = false;

        if replacing {
            effects
                .render
                .push(RenderUpdate::FullReplace(self.document.clone()));
        }
        Ok(())
    }

    fn replace_document(&mut self, document: GraphDocument, effects: &mut Effects) {
        let mutation = Mutation::ImportDocument { document };
        // Import reconciles and cannot fail.
        if let Err(e) = self.commit(&mutation, effects) {
            log::error!("Replacing document failed: {e}");
        }
    }

    fn observe(&self, change: &classgraph_core::Change, effects: &mut Effects) {
        use classgraph_core::Change;

        if !self.render_frozen {
            if let Some(patch) = self.render_patch(change) {
                effects.render.push(RenderUpdate::Patch(patch));
            }
        }
        if self.guards.is_set(Guard::ApplyingRemote) {
            return;
        }
        effects.persist = true;

        let Some(session_id) = self.session_id else {
            return;
        };
        match change {
            Change::NodeMoved {
                display_id,
                position,
            } => effects.moves.push((*display_id, *position)),
            Change::EdgeAdded(key) if !self.guards.is_set(Guard::CreatingLink) => {
                if let Some(edge) = self.document.edge_between(key.low, key.high) {
                    effects.outbound.push(Envelope::new(
                        self.room,
                        session_id,
                        Mutation::CreateEdge { edge: edge.clone() },
                    ));
                }
            }
            Change::EdgeRemoved(key)
                if !self.guards.is_set(Guard::CreatingLink)
                    && !self.guards.is_set(Guard::SuppressCascadeEmit) =>
            {
                effects.outbound.push(Envelope::new(
                    self.room,
                    session_id,
                    Mutation::DeleteEdge {
                        from: key.low,
                        to: key.high,
                    },
                ));
            }
            _ => {}
        }
    }

    fn render_patch(&self, change: &classgraph_core::Change) -> Option<RenderPatch> {
        use classgraph_core::Change;

        match change {
            Change::NodeAdded(id) | Change::NodeUpdated(id) => {
                self.document.node(*id).cloned().map(RenderPatch::NodeUpserted)
            }
            Change::NodeMoved { display_id, .. } => self
                .document
                .node(*display_id)
                .cloned()
                .map(RenderPatch::NodeUpserted),
            Change::NodeRemoved(id) => Some(RenderPatch::NodeRemoved(*id)),
            Change::EdgeAdded(key) | Change::EdgeUpdated(key) => self
                .document
                .edge_between(key.low, key.high)
                .cloned()
                .map(RenderPatch::EdgeUpserted),
            Change::EdgeRemoved(key) => Some(RenderPatch::EdgeRemoved(*key)),
            Change::DocumentReplaced => None,
        }
    }
}
