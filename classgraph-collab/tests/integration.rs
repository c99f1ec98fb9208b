//! End-to-end tests over real WebSockets.
//!
//! Each test starts a server on a free port and connects `SyncClient`s, plus
//! raw protocol peers where a test needs to count exactly what goes on the
//! wire.

use std::sync::Arc;

use classgraph_collab::{
    ClientConfig, ClientEvent, ConnectionState, Envelope, LocalEdit, MemoryStore, RenderPatch,
    RenderUpdate, Role, ServerConfig, StaticMembership, SyncClient, SyncError, SyncServer,
    WireMessage, HUB_ORIGIN,
};
use classgraph_core::{DisplayId, EdgeKind, Mutation, MutationKind, NodePatch, Position};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

/// Start a server on a free port, return its URL.
async fn start_server(membership: Arc<StaticMembership>) -> (String, SyncServer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let config = ServerConfig {
        broadcast_capacity: 64,
        max_sessions_per_room: 10,
        ..ServerConfig::default()
    };
    let server = SyncServer::with_store(config, Arc::new(MemoryStore::new()), membership);
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (url, server)
}

fn editors() -> Arc<StaticMembership> {
    Arc::new(StaticMembership::new(Role::Editor))
}

async fn wait_for<F>(events: &mut mpsc::Receiver<ClientEvent>, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Events received within `window`.
async fn drain(events: &mut mpsc::Receiver<ClientEvent>, window: Duration) -> Vec<ClientEvent> {
    let deadline = Instant::now() + window;
    let mut out = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Some(event)) => out.push(event),
            _ => return out,
        }
    }
}

async fn joined_client(
    url: &str,
    project_id: Uuid,
) -> (SyncClient, mpsc::Receiver<ClientEvent>) {
    let config = ClientConfig {
        server_url: url.to_string(),
        ..ClientConfig::default()
    };
    let mut client = SyncClient::new(config, project_id, Uuid::new_v4());
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::Welcome { .. })).await;
    (client, events)
}

async fn add(client: &SyncClient, name: &str) -> DisplayId {
    let updates = client
        .edit(LocalEdit::add_node(name, Position::new(0.0, 0.0)))
        .await
        .unwrap();
    updates
        .iter()
        .find_map(|u| match u {
            RenderUpdate::Patch(RenderPatch::NodeUpserted(node)) => Some(node.display_id),
            _ => None,
        })
        .unwrap()
}

/// A peer speaking the wire protocol directly.
struct RawPeer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    project_id: Uuid,
    session_id: Uuid,
    role: Role,
}

impl RawPeer {
    async fn join(url: &str, project_id: Uuid, user_id: Uuid) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let mut peer = RawPeer {
            ws,
            project_id,
            session_id: Uuid::nil(),
            role: Role::Viewer,
        };
        peer.send(&WireMessage::Join {
            project_id,
            user_id,
        })
        .await;
        match peer.recv().await {
            Some(WireMessage::Welcome {
                session_id, role, ..
            }) => {
                peer.session_id = session_id;
                peer.role = role;
            }
            other => panic!("expected welcome, got {other:?}"),
        }
        peer
    }

    async fn send(&mut self, msg: &WireMessage) {
        let bytes = msg.encode().unwrap();
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    async fn submit(&mut self, mutation: Mutation) {
        let envelope = Envelope::new(self.project_id, self.session_id, mutation);
        self.send(&WireMessage::Mutation(envelope)).await;
    }

    async fn recv(&mut self) -> Option<WireMessage> {
        loop {
            match timeout(Duration::from_secs(2), self.ws.next()).await {
                Ok(Some(Ok(Message::Binary(data)))) => {
                    let bytes: Vec<u8> = data.into();
                    return Some(WireMessage::decode(&bytes).unwrap());
                }
                Ok(Some(Ok(_))) => continue,
                _ => return None,
            }
        }
    }

    /// Every frame received within `window`.
    async fn collect_for(&mut self, window: Duration) -> Vec<WireMessage> {
        let deadline = Instant::now() + window;
        let mut out = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.ws.next()).await {
                Ok(Some(Ok(Message::Binary(data)))) => {
                    let bytes: Vec<u8> = data.into();
                    out.push(WireMessage::decode(&bytes).unwrap());
                }
                Ok(Some(Ok(_))) => continue,
                _ => return out,
            }
        }
    }
}

fn mutations(frames: &[WireMessage]) -> Vec<&Envelope> {
    frames
        .iter()
        .filter_map(|f| match f {
            WireMessage::Mutation(envelope) => Some(envelope),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_client_joins_and_receives_welcome() {
    let (url, server) = start_server(editors()).await;
    let project = Uuid::new_v4();

    let config = ClientConfig {
        server_url: url,
        ..ClientConfig::default()
    };
    let mut client = SyncClient::new(config, project, Uuid::new_v4());
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match wait_for(&mut events, |e| matches!(e, ClientEvent::Welcome { .. })).await {
        ClientEvent::Welcome { role, .. } => assert_eq!(role, Role::Editor),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.connection_state().await, ConnectionState::Joined);
    assert!(client.session_id().await.is_some());
    assert_eq!(server.hub().session_count().await, 1);
}

#[tokio::test]
async fn test_edit_propagates_without_echo() {
    let (url, server) = start_server(editors()).await;
    let project = Uuid::new_v4();
    let (alice, mut alice_events) = joined_client(&url, project).await;
    let (_bob, mut bob_events) = joined_client(&url, project).await;

    add(&alice, "Customer").await;

    match wait_for(&mut bob_events, |e| matches!(e, ClientEvent::Patch(_))).await {
        ClientEvent::Patch(RenderPatch::NodeUpserted(node)) => assert_eq!(node.name, "Customer"),
        other => panic!("unexpected {other:?}"),
    }

    // Alice never sees her own envelope come back.
    let echoed = drain(&mut alice_events, Duration::from_millis(300)).await;
    assert!(!echoed.iter().any(|e| matches!(e, ClientEvent::Patch(_))));
    assert_eq!(alice.document().await.nodes.len(), 1);
    assert_eq!(server.hub().document(project).await.unwrap().nodes.len(), 1);
}

#[tokio::test]
async fn test_late_joiner_gets_room_document() {
    let (url, _server) = start_server(editors()).await;
    let project = Uuid::new_v4();
    let (alice, _alice_events) = joined_client(&url, project).await;

    let a = add(&alice, "Order").await;
    let b = add(&alice, "LineItem").await;
    alice
        .edit(LocalEdit::link(a, b, EdgeKind::Composition))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (carol, _carol_events) = joined_client(&url, project).await;
    let doc = carol.document().await;
    assert_eq!(doc.nodes.len(), 2);
    assert_eq!(doc.edges.len(), 1);
    assert_eq!(doc.edges[0].kind, EdgeKind::Composition);
}

#[tokio::test]
async fn test_presence_join_and_leave() {
    let (url, _server) = start_server(editors()).await;
    let project = Uuid::new_v4();
    let (alice, mut alice_events) = joined_client(&url, project).await;
    let (mut bob, _bob_events) = joined_client(&url, project).await;

    let bob_id = bob.user_id();
    let joined = wait_for(&mut alice_events, |e| matches!(e, ClientEvent::PeerJoined(_))).await;
    assert_eq!(joined, ClientEvent::PeerJoined(bob_id));
    assert_eq!(alice.online_peers().await, vec![bob_id]);

    bob.disconnect().await;
    let left = wait_for(&mut alice_events, |e| matches!(e, ClientEvent::PeerLeft(_))).await;
    assert_eq!(left, ClientEvent::PeerLeft(bob_id));
    assert!(alice.online_peers().await.is_empty());
}

#[tokio::test]
async fn test_viewer_is_gated_on_both_sides() {
    let project = Uuid::new_v4();
    let membership = Arc::new(StaticMembership::new(Role::Viewer));
    let (url, server) = start_server(membership).await;

    // Client-side gate: nothing is built or sent.
    let (viewer, _events) = joined_client(&url, project).await;
    assert_eq!(viewer.role().await, Some(Role::Viewer));
    let err = viewer
        .edit(LocalEdit::add_node("Sneaky", Position::new(0.0, 0.0)))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Authorization { .. }));

    // Hub-side gate for a peer that skips the client check.
    let mut raw = RawPeer::join(&url, project, Uuid::new_v4()).await;
    assert_eq!(raw.role, Role::Viewer);
    raw.submit(Mutation::DeleteNode { display_id: 1 }).await;
    loop {
        match raw.recv().await {
            Some(WireMessage::Rejected { kind, .. }) => {
                assert_eq!(kind, Some(MutationKind::DeleteNode));
                break;
            }
            Some(_) => continue,
            None => panic!("no rejection"),
        }
    }
    assert!(server.hub().document(project).await.unwrap().is_empty());
    assert_eq!(server.stats().await.rejected_mutations, 1);
}

#[tokio::test]
async fn test_drag_sends_one_move_with_final_position() {
    let (url, server) = start_server(editors()).await;
    let project = Uuid::new_v4();
    let (alice, _alice_events) = joined_client(&url, project).await;
    let mut observer = RawPeer::join(&url, project, Uuid::new_v4()).await;

    let id = add(&alice, "Draggable").await;
    for i in 0..50 {
        alice
            .edit(LocalEdit::MoveNode {
                display_id: id,
                x: i as f64,
                y: 10.0,
            })
            .await
            .unwrap();
    }

    let frames = observer.collect_for(Duration::from_millis(800)).await;
    let moves: Vec<&Envelope> = mutations(&frames)
        .into_iter()
        .filter(|e| e.kind() == MutationKind::MoveNode)
        .collect();
    assert_eq!(moves.len(), 1);
    match &moves[0].mutation {
        Mutation::MoveNode { x, y, .. } => {
            assert_eq!(*x, 49.0);
            assert_eq!(*y, 10.0);
        }
        other => panic!("unexpected {other:?}"),
    }
    // Snapshots go to the store, not to peers.
    assert!(!mutations(&frames)
        .iter()
        .any(|e| e.kind() == MutationKind::PersistSnapshot));

    let node = server.hub().document(project).await.unwrap().nodes[0].clone();
    assert_eq!(node.position, Position::new(49.0, 10.0));
}

#[tokio::test]
async fn test_node_delete_emits_no_edge_deletes() {
    let (url, server) = start_server(editors()).await;
    let project = Uuid::new_v4();
    let (alice, _alice_events) = joined_client(&url, project).await;
    let mut observer = RawPeer::join(&url, project, Uuid::new_v4()).await;

    let hub_node = add(&alice, "Hub").await;
    let left = add(&alice, "Left").await;
    let right = add(&alice, "Right").await;
    alice
        .edit(LocalEdit::link(hub_node, left, EdgeKind::Association))
        .await
        .unwrap();
    alice
        .edit(LocalEdit::link(right, hub_node, EdgeKind::Generalization))
        .await
        .unwrap();
    alice
        .edit(LocalEdit::DeleteNode {
            display_id: hub_node,
        })
        .await
        .unwrap();

    let frames = observer.collect_for(Duration::from_millis(500)).await;
    let count = |kind: MutationKind| {
        mutations(&frames)
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    };
    assert_eq!(count(MutationKind::CreateNode), 3);
    assert_eq!(count(MutationKind::CreateEdge), 2);
    assert_eq!(count(MutationKind::DeleteNode), 1);
    assert_eq!(count(MutationKind::DeleteEdge), 0);

    let doc = server.hub().document(project).await.unwrap();
    assert_eq!(doc.nodes.len(), 2);
    assert!(doc.edges.is_empty());
}

#[tokio::test]
async fn test_failed_apply_is_rejected_and_resynced() {
    let (url, _server) = start_server(editors()).await;
    let project = Uuid::new_v4();
    let mut raw = RawPeer::join(&url, project, Uuid::new_v4()).await;

    raw.submit(Mutation::EditNode {
        display_id: 42,
        patch: NodePatch::rename("Ghost"),
    })
    .await;

    match raw.recv().await {
        Some(WireMessage::Rejected { kind, .. }) => assert_eq!(kind, Some(MutationKind::EditNode)),
        other => panic!("expected rejection, got {other:?}"),
    }
    match raw.recv().await {
        Some(WireMessage::Mutation(envelope)) => {
            assert_eq!(envelope.origin, HUB_ORIGIN);
            assert_eq!(envelope.kind(), MutationKind::ImportDocument);
        }
        other => panic!("expected resync, got {other:?}"),
    }
}

#[tokio::test]
async fn test_mismatched_origin_is_refused() {
    let (url, server) = start_server(editors()).await;
    let project = Uuid::new_v4();
    let mut raw = RawPeer::join(&url, project, Uuid::new_v4()).await;

    let forged = Envelope::new(
        project,
        Uuid::new_v4(),
        Mutation::DeleteNode { display_id: 1 },
    );
    raw.send(&WireMessage::Mutation(forged)).await;
    match raw.recv().await {
        Some(WireMessage::Rejected { kind, .. }) => assert_eq!(kind, Some(MutationKind::DeleteNode)),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(server.stats().await.rejected_mutations, 1);
}

#[tokio::test]
async fn test_ping_pong() {
    let (url, _server) = start_server(editors()).await;
    let mut raw = RawPeer::join(&url, Uuid::new_v4(), Uuid::new_v4()).await;
    raw.send(&WireMessage::Ping).await;
    assert_eq!(raw.recv().await, Some(WireMessage::Pong));
}

#[tokio::test]
async fn test_last_leave_closes_room() {
    let (url, server) = start_server(editors()).await;
    let project = Uuid::new_v4();
    let (mut alice, _events) = joined_client(&url, project).await;
    assert_eq!(server.hub().room_count().await, 1);

    alice.disconnect().await;
    timeout(Duration::from_secs(2), async {
        while server.hub().room_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("room should close after the last leave");
    assert_eq!(alice.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_client_rejoins_after_hub_restart() {
    let store = Arc::new(MemoryStore::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let first = SyncServer::with_store(ServerConfig::default(), store.clone(), editors());
    let serving = first.clone();
    let first_loop = tokio::spawn(async move { serving.serve(listener).await });

    let project = Uuid::new_v4();
    let config = ClientConfig {
        server_url: format!("ws://{addr}"),
        reconnect_base: Duration::from_millis(50),
        reconnect_max: Duration::from_millis(200),
        ..ClientConfig::default()
    };
    let mut client = SyncClient::new(config, project, Uuid::new_v4());
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::Welcome { .. })).await;
    add(&client, "Survivor").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    first.shutdown();
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::StateChanged(ConnectionState::Disconnected))
    })
    .await;
    first_loop.await.unwrap().unwrap();
    assert!(first.drain(Duration::from_secs(2)).await);
    assert_eq!(first.hub().room_count().await, 0);

    // Same port, same store: the client's backoff finds the new hub.
    let listener = TcpListener::bind(addr).await.unwrap();
    let second = SyncServer::with_store(ServerConfig::default(), store, editors());
    let serving = second.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });

    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::StateChanged(ConnectionState::Connecting))
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::StateChanged(ConnectionState::Joined))
    })
    .await;
    match wait_for(&mut events, |e| matches!(e, ClientEvent::FullReplace(_))).await {
        ClientEvent::FullReplace(doc) => {
            assert_eq!(doc.nodes.len(), 1);
            assert_eq!(doc.nodes[0].name, "Survivor");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.connection_state().await, ConnectionState::Joined);

    // Edits flow again on the new connection.
    add(&client, "Newcomer").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(second.hub().document(project).await.unwrap().nodes.len(), 2);
    client.disconnect().await;
}

#[tokio::test]
async fn test_lagging_peer_gets_room_snapshot() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let config = ServerConfig {
        broadcast_capacity: 1,
        ..ServerConfig::default()
    };
    let server = SyncServer::with_store(config, Arc::new(MemoryStore::new()), editors());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });

    let project = Uuid::new_v4();
    let mut slow = RawPeer::join(&url, project, Uuid::new_v4()).await;
    let mut writer = RawPeer::join(&url, project, Uuid::new_v4()).await;

    // Large frames back up the slow peer's socket while it is not reading.
    let padding = "x".repeat(200 * 1024);
    let bursts = 128;
    for i in 1..=bursts {
        let mut document = classgraph_core::GraphDocument::new();
        document.nodes.push(classgraph_core::Node::new(
            1,
            format!("{i}{padding}"),
            Position::default(),
        ));
        document.next_id = 2;
        writer.submit(Mutation::ImportDocument { document }).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let frames = slow.collect_for(Duration::from_secs(3)).await;
    let resync = mutations(&frames)
        .into_iter()
        .find(|e| e.origin == HUB_ORIGIN)
        .expect("lagging peer should receive a snapshot");
    assert_eq!(resync.kind(), MutationKind::ImportDocument);
    assert!(server.stats().await.lagged_resyncs >= 1);

    // Whatever arrives last is the writer's final document.
    match &mutations(&frames).last().unwrap().mutation {
        Mutation::ImportDocument { document } => {
            assert!(document.nodes[0].name.starts_with(&bursts.to_string()));
        }
        other => panic!("unexpected {:?}", other.kind()),
    }
}
