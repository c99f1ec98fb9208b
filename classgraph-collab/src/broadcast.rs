//! Room hub: membership, the live room document, and fan-out.
//!
//! One [`Room`] per project. Each room owns a tokio broadcast channel and
//! the hub's copy of the document. Every accepted envelope is applied to
//! that copy and published under the same lock, so broadcast order is
//! apply order and a joiner's snapshot plus its subscription never miss or
//! double an envelope.
//!
//! Frames are tagged with the originating session. [`Subscription::recv`]
//! skips the subscriber's own frames, which is how a sender is excluded
//! from its own broadcast.
//!
//! Store reads and writes run on the blocking pool and hold at most their
//! own room's lock, never the hub-wide map lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use classgraph_core::{
    duplicated_display_ids, reconcile_identifiers, DuplicatePolicy, GraphDocument, Mutation,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::error::SyncError;
use crate::protocol::{Envelope, Member, PresenceEvent, WireMessage, HUB_ORIGIN};
use crate::role::{self, Role};
use crate::storage::{DocumentStore, StoreError};

/// A joined session as the hub sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub role: Role,
}

impl SessionInfo {
    pub fn new(project_id: Uuid, user_id: Uuid, role: Role) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            project_id,
            role,
        }
    }

    pub fn member(&self) -> Member {
        Member {
            user_id: self.user_id,
            role: self.role,
        }
    }

    /// Whether the envelope claims this session's room and identity.
    pub fn owns(&self, envelope: &Envelope) -> bool {
        envelope.room == self.project_id && envelope.origin == self.session_id
    }
}

#[derive(Debug, Clone)]
struct RoomFrame {
    origin: Uuid,
    bytes: Arc<Vec<u8>>,
}

/// A session's view of its room's broadcast channel.
pub struct Subscription {
    session_id: Uuid,
    receiver: broadcast::Receiver<RoomFrame>,
}

impl Subscription {
    /// Next encoded frame published by anyone but this session.
    pub async fn recv(&mut self) -> Result<Arc<Vec<u8>>, RecvError> {
        loop {
            let frame = self.receiver.recv().await?;
            if frame.origin != self.session_id {
                return Ok(frame.bytes);
            }
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

struct RoomState {
    members: HashMap<Uuid, SessionInfo>,
    document: GraphDocument,
    /// False until a join has read the document from the store.
    loaded: bool,
    /// Emptied by a leave whose final save has not finished.
    closing: bool,
    /// Number of times the room emptied; tells a stale close apart.
    closes: u64,
    /// Bumped by every applied envelope.
    revision: u64,
}

pub struct Room {
    project_id: Uuid,
    sender: broadcast::Sender<RoomFrame>,
    state: Mutex<RoomState>,
    /// Serializes saves. Holds the revision the last close wrote.
    saved: Mutex<Option<u64>>,
    /// Set before the room leaves the hub's map.
    removed: AtomicBool,
    messages_sent: AtomicU64,
}

impl Room {
    fn new(project_id: Uuid, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            project_id,
            sender,
            state: Mutex::new(RoomState {
                members: HashMap::new(),
                document: GraphDocument::new(),
                loaded: false,
                closing: false,
                closes: 0,
                revision: 0,
            }),
            saved: Mutex::new(None),
            removed: AtomicBool::new(false),
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Encode once and hand the same bytes to every subscriber.
    fn publish(&self, origin: Uuid, msg: &WireMessage) -> Result<usize, SyncError> {
        let bytes = Arc::new(msg.encode()?);
        let receivers = self.sender.send(RoomFrame { origin, bytes }).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(receivers)
    }

    /// Fan an envelope out to every subscriber but its origin. Callers hold
    /// the state lock.
    fn broadcast(&self, envelope: Envelope) -> Result<usize, SyncError> {
        let origin = envelope.origin;
        self.publish(origin, &WireMessage::Mutation(envelope))
    }

    fn subscribe(&self, session_id: Uuid) -> Subscription {
        Subscription {
            session_id,
            receiver: self.sender.subscribe(),
        }
    }

    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub async fn member_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    pub async fn members(&self) -> Vec<Member> {
        let state = self.state.lock().await;
        state.members.values().map(SessionInfo::member).collect()
    }

    pub async fn document(&self) -> GraphDocument {
        self.state.lock().await.document.clone()
    }
}

/// Everything a new session needs to start.
pub struct JoinTicket {
    pub subscription: Subscription,
    pub document: GraphDocument,
    /// Members present before this session joined.
    pub peers: Vec<Member>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Applied to the room document and published.
    Broadcast { changes: usize },
    /// Written to the store; snapshots are not fanned out.
    Persisted,
}

pub struct Hub {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    store: Arc<dyn DocumentStore>,
    capacity: usize,
    max_sessions_per_room: usize,
    duplicate_policy: DuplicatePolicy,
}

impl Hub {
    pub fn new(store: Arc<dyn DocumentStore>, capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            capacity: capacity.max(1),
            max_sessions_per_room: usize::MAX,
            duplicate_policy: DuplicatePolicy::Reject,
        }
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions_per_room = max.max(1);
        self
    }

    /// Policy for client-originated `import_document` envelopes.
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Add a session to its project's room, opening the room if needed.
    ///
    /// The first join loads the document from the store. A store error
    /// refuses the join rather than serving an empty document that would
    /// overwrite the stored one when the room closes. The load holds only
    /// this room's lock, so other rooms keep running.
    pub async fn join(&self, session: SessionInfo) -> Result<JoinTicket, SyncError> {
        let project_id = session.project_id;
        loop {
            let room = self.room_entry(project_id).await;
            let mut state = room.state.lock().await;
            if room.is_removed() {
                // Closed between lookup and lock; the next entry is fresh.
                continue;
            }

            if !state.loaded {
                match self.load(project_id).await {
                    Ok(document) => {
                        log::info!(
                            "Room {project_id} opened ({} nodes, {} edges)",
                            document.nodes.len(),
                            document.edges.len()
                        );
                        state.document = document;
                        state.loaded = true;
                    }
                    Err(e) => {
                        room.removed.store(true, Ordering::Release);
                        drop(state);
                        self.unlink(&room).await;
                        return Err(e);
                    }
                }
            }
            if state.closing {
                state.closing = false;
                log::debug!("Room {project_id} reopened before its close finished");
            }

            if state.members.len() >= self.max_sessions_per_room {
                return Err(SyncError::Validation(format!(
                    "room {project_id} is full ({} sessions)",
                    state.members.len()
                )));
            }

            let peers = state.members.values().map(SessionInfo::member).collect();
            let subscription = room.subscribe(session.session_id);
            let document = state.document.clone();
            state.members.insert(session.session_id, session.clone());

            room.publish(
                session.session_id,
                &WireMessage::Presence(PresenceEvent::Joined {
                    user_id: session.user_id,
                }),
            )?;
            log::debug!(
                "Session {} ({}) joined room {project_id}, {} members",
                session.session_id,
                session.role,
                state.members.len()
            );

            return Ok(JoinTicket {
                subscription,
                document,
                peers,
            });
        }
    }

    /// Remove a session. The last leave saves the document and closes the room.
    ///
    /// The room stays on the map until the save finishes, so a join racing
    /// the close picks up the live document instead of a stale stored one.
    pub async fn leave(&self, project_id: Uuid, session_id: Uuid) -> Option<SessionInfo> {
        let room = self.room(project_id).await?;
        let mut state = room.state.lock().await;
        let session = state.members.remove(&session_id)?;

        if let Err(e) = room.publish(
            session_id,
            &WireMessage::Presence(PresenceEvent::Left {
                user_id: session.user_id,
            }),
        ) {
            log::warn!("Failed to announce leave of {session_id}: {e}");
        }
        if !state.members.is_empty() {
            return Some(session);
        }

        state.closing = true;
        state.closes += 1;
        let close = state.closes;
        let revision = state.revision;
        let document = state.document.clone();
        drop(state);

        self.save_on_close(&room, revision, document).await;

        let state = room.state.lock().await;
        if state.closing && state.closes == close {
            room.removed.store(true, Ordering::Release);
            drop(state);
            self.unlink(&room).await;
            log::info!("Room {project_id} closed");
        }
        Some(session)
    }

    /// Publish an envelope to every member of its room except the origin.
    ///
    /// Does not touch the room document; see [`Hub::submit`] for the
    /// accept path. Returns the number of subscriptions the frame reached,
    /// the origin's own included.
    pub async fn broadcast(&self, envelope: Envelope) -> Result<usize, SyncError> {
        let room = self
            .room(envelope.room)
            .await
            .ok_or_else(|| SyncError::Validation(format!("no open room {}", envelope.room)))?;
        // Ordered with the envelopes submit applies.
        let _state = room.state.lock().await;
        room.broadcast(envelope)
    }

    /// Accept an envelope from a joined session.
    ///
    /// ```text
    /// owns? ── no ──► Validation
    ///  │ yes
    /// role gate ── viewer ──► Authorization
    ///  │
    /// persist_snapshot ──► store.save_document ──► Persisted
    /// import_document with duplicates under Reject ──► Validation
    ///  │
    /// apply to room document ── error ──► NotFound / Validation
    ///  │ ok
    /// broadcast ──► Broadcast
    /// ```
    pub async fn submit(
        &self,
        session: &SessionInfo,
        envelope: Envelope,
    ) -> Result<Delivery, SyncError> {
        if !session.owns(&envelope) {
            return Err(SyncError::Validation(format!(
                "envelope for room {} from {} does not match session {}",
                envelope.room, envelope.origin, session.session_id
            )));
        }
        role::authorize(session.role, envelope.kind())?;

        let room = self.room(session.project_id).await.ok_or_else(|| {
            SyncError::Validation(format!("no open room {}", session.project_id))
        })?;

        match &envelope.mutation {
            Mutation::PersistSnapshot { document } => {
                let document = reconcile_identifiers(document.clone());
                let _saving = room.saved.lock().await;
                self.save(session.project_id, document).await?;
                log::debug!(
                    "Persisted snapshot of {} from {}",
                    session.project_id,
                    session.session_id
                );
                return Ok(Delivery::Persisted);
            }
            Mutation::ImportDocument { document }
                if self.duplicate_policy == DuplicatePolicy::Reject =>
            {
                let duplicates = duplicated_display_ids(document);
                if !duplicates.is_empty() {
                    return Err(SyncError::Validation(format!(
                        "import repeats display ids {duplicates:?}"
                    )));
                }
            }
            _ => {}
        }

        let mut state = room.state.lock().await;
        if !state.members.contains_key(&session.session_id) {
            return Err(SyncError::Validation(format!(
                "session {} is not in room {}",
                session.session_id, session.project_id
            )));
        }
        let changes = state.document.apply(&envelope.mutation)?;
        state.revision += 1;
        room.broadcast(envelope)?;
        drop(state);

        Ok(Delivery::Broadcast {
            changes: changes.len(),
        })
    }

    /// A new subscription plus a snapshot for a session whose receiver fell
    /// behind.
    ///
    /// Both are taken under the room lock: the snapshot covers every frame
    /// published before the subscription and none after it.
    pub async fn resubscribe(&self, session: &SessionInfo) -> Option<(Subscription, Envelope)> {
        let room = self.room(session.project_id).await?;
        let state = room.state.lock().await;
        if !state.members.contains_key(&session.session_id) {
            return None;
        }
        let subscription = room.subscribe(session.session_id);
        let envelope = Envelope::new(
            session.project_id,
            HUB_ORIGIN,
            Mutation::ImportDocument {
                document: state.document.clone(),
            },
        );
        Some((subscription, envelope))
    }

    /// `import_document` of the live room document, from the hub.
    pub async fn resync_envelope(&self, project_id: Uuid) -> Option<Envelope> {
        let room = self.room(project_id).await?;
        let document = room.document().await;
        Some(Envelope::new(
            project_id,
            HUB_ORIGIN,
            Mutation::ImportDocument { document },
        ))
    }

    pub async fn room(&self, project_id: Uuid) -> Option<Arc<Room>> {
        self.rooms
            .read()
            .await
            .get(&project_id)
            .filter(|room| !room.is_removed())
            .cloned()
    }

    pub async fn document(&self, project_id: Uuid) -> Option<GraphDocument> {
        Some(self.room(project_id).await?.document().await)
    }

    pub async fn members(&self, project_id: Uuid) -> Vec<Member> {
        match self.room(project_id).await {
            Some(room) => room.members().await,
            None => Vec::new(),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn session_count(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut total = 0;
        for room in rooms {
            total += room.member_count().await;
        }
        total
    }

    /// The room on the map, inserted unloaded if there is none.
    async fn room_entry(&self, project_id: Uuid) -> Arc<Room> {
        if let Some(room) = self.room(project_id).await {
            return room;
        }
        let mut rooms = self.rooms.write().await;
        match rooms.get(&project_id) {
            Some(room) if !room.is_removed() => room.clone(),
            _ => {
                let room = Arc::new(Room::new(project_id, self.capacity));
                rooms.insert(project_id, room.clone());
                room
            }
        }
    }

    /// Take a removed room off the map unless a fresh one replaced it.
    async fn unlink(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms.write().await;
        if rooms
            .get(&room.project_id)
            .is_some_and(|current| Arc::ptr_eq(current, room))
        {
            rooms.remove(&room.project_id);
        }
    }

    async fn save_on_close(&self, room: &Room, revision: u64, document: GraphDocument) {
        let mut saved = room.saved.lock().await;
        if saved.is_some_and(|written| written >= revision) {
            log::debug!("Room {} already saved at revision {revision}", room.project_id);
            return;
        }
        match self.save(room.project_id, document).await {
            Ok(()) => *saved = Some(revision),
            Err(e) => log::error!("Failed to save room {} on close: {e}", room.project_id),
        }
    }

    async fn load(&self, project_id: Uuid) -> Result<GraphDocument, SyncError> {
        let store = self.store.clone();
        let stored = tokio::task::spawn_blocking(move || store.load_document(project_id))
            .await
            .map_err(|e| StoreError::Unavailable(format!("load task failed: {e}")))??;
        Ok(stored.map(reconcile_identifiers).unwrap_or_default())
    }

    async fn save(&self, project_id: Uuid, document: GraphDocument) -> Result<(), StoreError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save_document(project_id, &document))
            .await
            .map_err(|e| StoreError::Unavailable(format!("save task failed: {e}")))?
    }
}
