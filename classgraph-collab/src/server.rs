//! WebSocket front end for the [`Hub`].
//!
//! ```text
//! Client A ──┐                       ┌── loadDocument / saveDocument
//!            ├── connection task ── Hub ── Room (project_id) ── live GraphDocument
//! Client B ──┘        │                         │
//!                     │                  broadcast::channel (fan-out)
//!                     │                         │
//!                     └─◄── Subscription ◄──────┘
//! ```
//!
//! One task per connection. The first frame must be `Join`; the task
//! resolves the role through the [`MembershipService`], joins the room and
//! answers with `Welcome`. From then on it feeds envelopes to
//! [`Hub::submit`] and forwards the room's frames into the socket. A lagging
//! subscription is replaced and sent a fresh `import_document` so it
//! converges.
//!
//! [`SyncServer::shutdown`] stops the accept loop and closes every
//! connection; the usual leave path then saves each room as it empties.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use classgraph_core::DuplicatePolicy;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{Delivery, Hub, SessionInfo, Subscription};
use crate::error::SyncError;
use crate::protocol::WireMessage;
use crate::role::MembershipService;
use crate::storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Maximum sessions per room
    pub max_sessions_per_room: usize,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Policy for client-originated imports with repeated display ids
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_sessions_per_room: 100,
            storage_path: None,
            duplicate_policy: DuplicatePolicy::Reject,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_mutations: u64,
    pub persisted_snapshots: u64,
    pub lagged_resyncs: u64,
}

#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<Hub>,
    membership: Arc<dyn MembershipService>,
    stats: Arc<RwLock<ServerStats>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SyncServer {
    /// Build a server over RocksDB when `storage_path` is set, or memory otherwise.
    pub fn open(
        config: ServerConfig,
        membership: Arc<dyn MembershipService>,
    ) -> Result<Self, StoreError> {
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => {
                let store = RocksStore::open(StoreConfig::at(path.clone()))?;
                log::info!(
                    "Opened document store at {} ({} stored documents)",
                    store.path().display(),
                    store.list_documents()?.len()
                );
                Arc::new(store)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store, membership))
    }

    pub fn with_store(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        membership: Arc<dyn MembershipService>,
    ) -> Self {
        let hub = Hub::new(store, config.broadcast_capacity)
            .with_max_sessions(config.max_sessions_per_room)
            .with_duplicate_policy(config.duplicate_policy);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            hub: Arc::new(hub),
            membership,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Bind `bind_addr` and serve until the listener fails or the server
    /// is shut down.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    ///
    /// Returns `Ok` after [`SyncServer::shutdown`]; the listener is dropped
    /// with it.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        let mut stop = self.shutdown.subscribe();
        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = stopped(&mut stop) => {
                    log::info!("Sync server stopped accepting connections");
                    return Ok(());
                }
            };
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::warn!("Connection from {addr} ended: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), SyncError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (sink, mut source) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection {
            addr,
            sink,
            session: None,
            subscription: None,
        };
        let result = self.drive(&mut conn, &mut source).await;

        // Runs for every exit path, errors included.
        if let Some(session) = conn.session.take() {
            self.hub.leave(session.project_id, session.session_id).await;
        }
        let active_rooms = self.hub.room_count().await;
        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = active_rooms;
        result
    }

    async fn drive(&self, conn: &mut Connection, source: &mut WsSource) -> Result<(), SyncError> {
        let mut stop = self.shutdown.subscribe();
        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        {
                            let mut s = self.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += bytes.len() as u64;
                        }
                        match WireMessage::decode(&bytes) {
                            Ok(msg) => self.handle_message(conn, msg).await?,
                            Err(e) => log::warn!("Failed to decode message from {}: {e}", conn.addr),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => conn.sink.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {}", conn.addr);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                forwarded = next_frame(&mut conn.subscription) => match forwarded {
                    Ok(bytes) => conn.sink.send(Message::Binary(bytes.to_vec().into())).await?,
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Connection {} lagged by {n} frames, resyncing", conn.addr);
                        self.stats.write().await.lagged_resyncs += 1;
                        self.resubscribe(conn).await?;
                    }
                    Err(RecvError::Closed) => conn.subscription = None,
                },
                _ = stopped(&mut stop) => {
                    log::info!("Closing connection from {} for shutdown", conn.addr);
                    let _ = conn.sink.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    async fn handle_message(&self, conn: &mut Connection, msg: WireMessage) -> Result<(), SyncError> {
        match msg {
            WireMessage::Join {
                project_id,
                user_id,
            } => {
                if conn.session.is_some() {
                    return conn.reject(None, "already joined").await;
                }
                let role = self.membership.resolve_role(project_id, user_id);
                let session = SessionInfo::new(project_id, user_id, role);
                match self.hub.join(session.clone()).await {
                    Ok(ticket) => {
                        log::info!(
                            "User {user_id} joined room {project_id} as {role} (session {})",
                            session.session_id
                        );
                        conn.subscription = Some(ticket.subscription);
                        let welcome = WireMessage::Welcome {
                            session_id: session.session_id,
                            role,
                            document: ticket.document,
                            members: ticket.peers,
                        };
                        conn.session = Some(session);
                        conn.send(&welcome).await?;
                        self.stats.write().await.active_rooms = self.hub.room_count().await;
                    }
                    Err(e) => {
                        log::warn!("Refused join of {user_id} to {project_id}: {e}");
                        conn.reject(None, &e.to_string()).await?;
                    }
                }
            }

            WireMessage::Mutation(envelope) => {
                let Some(session) = conn.session.clone() else {
                    return conn.reject(Some(envelope.kind()), "not joined").await;
                };
                let kind = envelope.kind();
                match self.hub.submit(&session, envelope).await {
                    Ok(Delivery::Broadcast { changes }) => {
                        log::debug!("Routed {kind} from {} ({changes} changes)", session.session_id);
                    }
                    Ok(Delivery::Persisted) => {
                        self.stats.write().await.persisted_snapshots += 1;
                    }
                    Err(SyncError::Persistence(e)) => {
                        log::error!("Failed to persist {}: {e}", session.project_id);
                    }
                    Err(e @ SyncError::Authorization { .. }) => {
                        log::warn!("Rejected {kind} from {}: {e}", session.session_id);
                        self.stats.write().await.rejected_mutations += 1;
                        conn.reject(Some(kind), &e.to_string()).await?;
                    }
                    Err(e) => {
                        log::warn!("Rejected {kind} from {}: {e}", session.session_id);
                        self.stats.write().await.rejected_mutations += 1;
                        conn.reject(Some(kind), &e.to_string()).await?;
                        if e.needs_resync() {
                            self.send_resync(conn).await?;
                        }
                    }
                }
            }

            WireMessage::Leave => {
                if let Some(session) = conn.session.take() {
                    conn.subscription = None;
                    self.hub.leave(session.project_id, session.session_id).await;
                    log::info!(
                        "User {} left room {}",
                        session.user_id,
                        session.project_id
                    );
                }
            }

            WireMessage::Resync => self.send_resync(conn).await?,

            WireMessage::Ping => conn.send(&WireMessage::Pong).await?,

            other => log::debug!("Ignoring {} from {}", other.label(), conn.addr),
        }
        Ok(())
    }

    /// Swap a lagging subscription for a fresh one and send the snapshot
    /// that bridges the two. The dropped backlog is never forwarded.
    async fn resubscribe(&self, conn: &mut Connection) -> Result<(), SyncError> {
        let Some(session) = conn.session.as_ref() else {
            return Ok(());
        };
        match self.hub.resubscribe(session).await {
            Some((subscription, envelope)) => {
                conn.subscription = Some(subscription);
                conn.send(&WireMessage::Mutation(envelope)).await
            }
            None => Ok(()),
        }
    }

    async fn send_resync(&self, conn: &mut Connection) -> Result<(), SyncError> {
        let Some(project_id) = conn.session.as_ref().map(|s| s.project_id) else {
            return Ok(());
        };
        match self.hub.resync_envelope(project_id).await {
            Some(envelope) => conn.send(&WireMessage::Mutation(envelope)).await,
            None => Ok(()),
        }
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&self) {
        log::info!("Sync server shutting down");
        self.shutdown.send_replace(true);
    }

    /// Wait until every connection task has finished its cleanup.
    ///
    /// Returns false if connections were still open after `limit`.
    pub async fn drain(&self, limit: Duration) -> bool {
        let waiting = async {
            while self.stats.read().await.active_connections > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(limit, waiting).await.is_ok()
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

struct Connection {
    addr: SocketAddr,
    sink: WsSink,
    session: Option<SessionInfo>,
    subscription: Option<Subscription>,
}

impl Connection {
    async fn send(&mut self, msg: &WireMessage) -> Result<(), SyncError> {
        let bytes = msg.encode()?;
        self.sink.send(Message::Binary(bytes.into())).await?;
        Ok(())
    }

    async fn reject(
        &mut self,
        kind: Option<classgraph_core::MutationKind>,
        reason: &str,
    ) -> Result<(), SyncError> {
        self.send(&WireMessage::Rejected {
            kind,
            reason: reason.to_string(),
        })
        .await
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    // A closed channel means the server is gone too.
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn next_frame(subscription: &mut Option<Subscription>) -> Result<Arc<Vec<u8>>, RecvError> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
