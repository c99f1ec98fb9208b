//! WebSocket sync client.
//!
//! ```text
//!  SyncClient::edit ──► Reconciler::apply_local ──► outbound ──► writer task ──► hub
//!                              │ moves / persist
//!                              ▼
//!                          Coalescer ◄── driver wakes at next_deadline, flushes
//!
//!  hub ──► driver (reader) ──► Reconciler::receive ──► ClientEvent (render, persist, presence)
//! ```
//!
//! The driver task owns the socket. When the connection drops it cancels
//! pending coalesced work, reports `Disconnected`, and reconnects with
//! exponential backoff. Edits made while not joined fail with a transport
//! error; nothing is buffered for replay.

use std::sync::Arc;
use std::time::{Duration, Instant};

use classgraph_core::{DuplicatePolicy, GraphDocument, MutationKind};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::coalesce::{Coalescer, MOVE_DEBOUNCE, PERSIST_DEBOUNCE};
use crate::error::SyncError;
use crate::presence::PresenceRoster;
use crate::protocol::{PresenceEvent, WireMessage};
use crate::reconciler::{ConnectionState, Inbound, LocalEdit, Reconciler, RenderPatch, RenderUpdate};
use crate::role::Role;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hub WebSocket URL
    pub server_url: String,
    /// Quiet window before a dragged node's position is sent
    pub move_debounce: Duration,
    /// Quiet window before an autosave snapshot is sent
    pub persist_debounce: Duration,
    /// First reconnect delay, doubled per failed attempt
    pub reconnect_base: Duration,
    /// Reconnect delay ceiling
    pub reconnect_max: Duration,
    /// Policy for local imports with repeated display ids
    pub duplicate_policy: DuplicatePolicy,
    /// Buffered application events
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            move_debounce: MOVE_DEBOUNCE,
            persist_debounce: PERSIST_DEBOUNCE,
            reconnect_base: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
            duplicate_policy: DuplicatePolicy::Reject,
            event_capacity: 256,
        }
    }
}

/// Delay before reconnect attempt `attempt` (0-based).
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(max)
}

/// Events for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    Welcome { session_id: Uuid, role: Role },
    /// Re-render from this document.
    FullReplace(GraphDocument),
    Patch(RenderPatch),
    /// A peer's autosave snapshot, for the local persistence layer.
    Persist(GraphDocument),
    PeerJoined(Uuid),
    PeerLeft(Uuid),
    Rejected {
        kind: Option<MutationKind>,
        reason: String,
    },
}

impl From<RenderUpdate> for ClientEvent {
    fn from(update: RenderUpdate) -> Self {
        match update {
            RenderUpdate::FullReplace(doc) => ClientEvent::FullReplace(doc),
            RenderUpdate::Patch(patch) => ClientEvent::Patch(patch),
        }
    }
}

struct Shared {
    reconciler: Reconciler,
    coalescer: Coalescer,
    roster: PresenceRoster,
    outgoing: Option<mpsc::Sender<WireMessage>>,
}

impl Shared {
    /// Forget the connection. Edits fail with `Transport` from here on.
    fn detach(&mut self) {
        self.outgoing = None;
        self.reconciler.on_disconnect();
        self.coalescer.cancel();
        self.roster.clear();
    }
}

pub struct SyncClient {
    config: ClientConfig,
    project_id: Uuid,
    user_id: Uuid,
    shared: Arc<Mutex<Shared>>,
    wake: Arc<Notify>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig, project_id: Uuid, user_id: Uuid) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Shared {
            reconciler: Reconciler::new(project_id, config.duplicate_policy),
            coalescer: Coalescer::new(config.move_debounce, config.persist_debounce),
            roster: PresenceRoster::new(),
            outgoing: None,
        };
        Self {
            config,
            project_id,
            user_id,
            shared: Arc::new(Mutex::new(shared)),
            wake: Arc::new(Notify::new()),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx,
            task: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Open the connection and start the driver task.
    ///
    /// Fails if the first connection attempt fails. Later drops are retried
    /// by the driver.
    pub async fn connect(&mut self) -> Result<(), SyncError> {
        if self.task.is_some() {
            return Ok(());
        }
        self.shared.lock().await.reconciler.begin_connect();
        let stream = match open(&self.config.server_url).await {
            Ok(stream) => stream,
            Err(e) => {
                self.shared.lock().await.reconciler.on_disconnect();
                return Err(e);
            }
        };
        self.shutdown_tx.send_replace(false);

        let driver = Driver {
            config: self.config.clone(),
            project_id: self.project_id,
            user_id: self.user_id,
            shared: self.shared.clone(),
            wake: self.wake.clone(),
            events: self.event_tx.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        };
        self.task = Some(tokio::spawn(driver.run(stream)));
        Ok(())
    }

    /// Leave the room and stop reconnecting.
    pub async fn disconnect(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Client driver ended abnormally: {e}");
            }
        }
    }

    /// Apply a local edit and send what it produced.
    ///
    /// Returns the render updates for the local view.
    pub async fn edit(&self, edit: LocalEdit) -> Result<Vec<RenderUpdate>, SyncError> {
        let mut shared = self.shared.lock().await;
        let Some(tx) = shared.outgoing.clone() else {
            return Err(SyncError::Transport("not connected".into()));
        };
        let effects = shared.reconciler.apply_local(edit)?;
        shared.coalescer.record(&effects, Instant::now());

        // Sent under the lock so the hub sees edits in local apply order.
        for envelope in effects.outbound {
            tx.send(WireMessage::Mutation(envelope))
                .await
                .map_err(|_| SyncError::Transport("connection closed".into()))?;
        }
        drop(shared);

        if !effects.moves.is_empty() || effects.persist {
            self.wake.notify_one();
        }
        Ok(effects.render)
    }

    /// Ask the hub for a fresh copy of the room document.
    pub async fn request_resync(&self) -> Result<(), SyncError> {
        let tx = self
            .shared
            .lock()
            .await
            .outgoing
            .clone()
            .ok_or_else(|| SyncError::Transport("not connected".into()))?;
        tx.send(WireMessage::Resync)
            .await
            .map_err(|_| SyncError::Transport("connection closed".into()))
    }

    pub async fn document(&self) -> GraphDocument {
        self.shared.lock().await.reconciler.document().clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.shared.lock().await.reconciler.state()
    }

    pub async fn session_id(&self) -> Option<Uuid> {
        self.shared.lock().await.reconciler.session_id()
    }

    pub async fn role(&self) -> Option<Role> {
        self.shared.lock().await.reconciler.role()
    }

    /// Users currently online in the room, this user excluded.
    pub async fn online_peers(&self) -> Vec<Uuid> {
        let shared = self.shared.lock().await;
        shared
            .roster
            .online()
            .into_iter()
            .filter(|id| *id != self.user_id)
            .collect()
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }
}

async fn open(url: &str) -> Result<WsStream, SyncError> {
    let (stream, _) = tokio_tungstenite::connect_async(url).await?;
    Ok(stream)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending::<()>().await,
    }
}

struct Driver {
    config: ClientConfig,
    project_id: Uuid,
    user_id: Uuid,
    shared: Arc<Mutex<Shared>>,
    wake: Arc<Notify>,
    events: mpsc::Sender<ClientEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self, first: WsStream) {
        let mut pending = Some(first);
        let mut attempt: u32 = 0;

        loop {
            let stream = match pending.take() {
                Some(stream) => stream,
                None => {
                    let delay =
                        backoff_delay(self.config.reconnect_base, self.config.reconnect_max, attempt);
                    attempt = attempt.saturating_add(1);
                    log::info!("Reconnecting to {} in {delay:?}", self.config.server_url);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => {}
                    }
                    if *self.shutdown.borrow() {
                        break;
                    }
                    self.shared.lock().await.reconciler.begin_connect();
                    self.emit(ClientEvent::StateChanged(ConnectionState::Connecting))
                        .await;
                    match open(&self.config.server_url).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            log::warn!("Reconnect attempt {attempt} failed: {e}");
                            self.mark_disconnected().await;
                            continue;
                        }
                    }
                }
            };

            match self.session(stream).await {
                Ok(true) => attempt = 0,
                Ok(false) => {}
                Err(e) => log::warn!("Session ended with error: {e}"),
            }
            self.mark_disconnected().await;

            if *self.shutdown.borrow() {
                break;
            }
        }
        log::debug!("Client driver for {} stopped", self.project_id);
    }

    async fn mark_disconnected(&self) {
        self.shared.lock().await.detach();
        self.emit(ClientEvent::StateChanged(ConnectionState::Disconnected))
            .await;
    }

    /// Run one connection. Returns whether the room was joined.
    async fn session(&self, stream: WsStream) -> Result<bool, SyncError> {
        let (mut writer, mut reader) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(256);

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let bytes = match msg.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("Dropping unencodable {}: {e}", msg.label());
                        continue;
                    }
                };
                if writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        out_tx
            .send(WireMessage::Join {
                project_id: self.project_id,
                user_id: self.user_id,
            })
            .await
            .map_err(|_| SyncError::Transport("writer closed".into()))?;
        self.shared.lock().await.outgoing = Some(out_tx.clone());

        let mut shutdown = self.shutdown.clone();
        let mut joined = false;
        let result = loop {
            if *shutdown.borrow() {
                let _ = out_tx.send(WireMessage::Leave).await;
                break Ok(());
            }
            let deadline = self.shared.lock().await.coalescer.next_deadline();
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match WireMessage::decode(&bytes) {
                            Ok(msg) => {
                                if matches!(msg, WireMessage::Welcome { .. }) {
                                    joined = true;
                                }
                                self.handle(msg, &out_tx).await;
                            }
                            Err(e) => log::warn!("Dropping malformed frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(SyncError::from(e)),
                },
                _ = sleep_until(deadline) => self.flush(&out_tx).await,
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => {}
            }
        };

        // Detach before draining the writer so no edit queues into a dead socket.
        self.shared.lock().await.detach();
        drop(out_tx);
        if tokio::time::timeout(Duration::from_secs(1), writer_task)
            .await
            .is_err()
        {
            log::debug!("Writer task did not drain within 1s");
        }
        result.map(|()| joined)
    }

    async fn handle(&self, msg: WireMessage, out_tx: &mpsc::Sender<WireMessage>) {
        match msg {
            WireMessage::Welcome {
                session_id,
                role,
                document,
                members,
            } => {
                let update = {
                    let mut shared = self.shared.lock().await;
                    shared.roster.reset(&members);
                    shared.reconciler.on_welcome(session_id, role, document)
                };
                log::info!(
                    "Joined room {} as {role} (session {session_id}, {} peers)",
                    self.project_id,
                    members.len()
                );
                self.emit(ClientEvent::StateChanged(ConnectionState::Joined))
                    .await;
                self.emit(ClientEvent::Welcome { session_id, role }).await;
                self.emit(update.into()).await;
            }
            WireMessage::Mutation(envelope) => {
                let inbound = self.shared.lock().await.reconciler.receive(envelope);
                match inbound {
                    Inbound::Echo | Inbound::Ignored => {}
                    Inbound::Persist(document) => self.emit(ClientEvent::Persist(document)).await,
                    Inbound::Rendered(updates) => {
                        for update in updates {
                            self.emit(update.into()).await;
                        }
                    }
                    Inbound::Resync(e) => {
                        log::info!("Requesting resync after: {e}");
                        let _ = out_tx.send(WireMessage::Resync).await;
                    }
                }
            }
            WireMessage::Presence(event) => {
                let changed = self.shared.lock().await.roster.apply(&event);
                if changed {
                    self.emit(match event {
                        PresenceEvent::Joined { user_id } => ClientEvent::PeerJoined(user_id),
                        PresenceEvent::Left { user_id } => ClientEvent::PeerLeft(user_id),
                    })
                    .await;
                }
            }
            WireMessage::Rejected { kind, reason } => {
                log::warn!(
                    "Hub rejected {}: {reason}",
                    kind.map(|k| k.as_str()).unwrap_or("request")
                );
                self.emit(ClientEvent::Rejected { kind, reason }).await;
            }
            WireMessage::Ping => {
                let _ = out_tx.send(WireMessage::Pong).await;
            }
            WireMessage::Pong => {}
            other => log::debug!("Ignoring unexpected {} from hub", other.label()),
        }
    }

    /// Send coalesced envelopes whose windows have elapsed.
    ///
    /// These are this session's own output and go straight to the writer.
    async fn flush(&self, out_tx: &mpsc::Sender<WireMessage>) {
        let mut shared = self.shared.lock().await;
        let Shared {
            reconciler,
            coalescer,
            ..
        } = &mut *shared;
        let flushed = coalescer.flush(reconciler, Instant::now());
        // Sent under the lock so later edits queue behind these.
        for envelope in flushed.outbound {
            log::trace!("Flushing coalesced {}", envelope.kind());
            if out_tx.send(WireMessage::Mutation(envelope)).await.is_err() {
                break;
            }
        }
        drop(shared);
        for update in flushed.render {
            self.emit(update.into()).await;
        }
    }

    async fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event).await;
    }
}
