//! Persistence through the hub: autosave snapshots, room close, restart.

use std::sync::Arc;

use classgraph_collab::{
    ClientConfig, ClientEvent, DocumentStore, LocalEdit, MemoryStore, RenderPatch, RenderUpdate,
    Role, RocksStore, ServerConfig, StaticMembership, StoreConfig, SyncClient, SyncServer,
};
use classgraph_core::{DisplayId, EdgeKind, Position};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

async fn start(store: Arc<dyn DocumentStore>) -> (String, SyncServer, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = SyncServer::with_store(
        ServerConfig::default(),
        store,
        Arc::new(StaticMembership::new(Role::Editor)),
    );
    let serving = server.clone();
    let handle = tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (url, server, handle)
}

fn client_for(url: &str, project_id: Uuid) -> (SyncClient, mpsc::Receiver<ClientEvent>) {
    let config = ClientConfig {
        server_url: url.to_string(),
        persist_debounce: Duration::from_millis(200),
        ..ClientConfig::default()
    };
    let mut client = SyncClient::new(config, project_id, Uuid::new_v4());
    let events = client.take_event_rx().unwrap();
    (client, events)
}

async fn next_matching<F>(events: &mut mpsc::Receiver<ClientEvent>, mut pred: F) -> ClientEvent
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

async fn add(client: &SyncClient, name: &str) -> DisplayId {
    client
        .edit(LocalEdit::add_node(name, Position::new(10.0, 20.0)))
        .await
        .unwrap()
        .into_iter()
        .find_map(|u| match u {
            RenderUpdate::Patch(RenderPatch::NodeUpserted(node)) => Some(node.display_id),
            _ => None,
        })
        .unwrap()
}

async fn wait_until_closed(server: &SyncServer) {
    timeout(Duration::from_secs(2), async {
        while server.hub().room_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("room did not close");
}

#[tokio::test]
async fn test_autosave_reaches_store_after_quiet_window() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let (url, server, _handle) = start(store.clone()).await;
    let project = Uuid::new_v4();

    let (mut client, mut events) = client_for(&url, project);
    client.connect().await.unwrap();
    next_matching(&mut events, |e| matches!(e, ClientEvent::Welcome { .. })).await;

    let a = add(&client, "Invoice").await;
    let b = add(&client, "Payment").await;
    client
        .edit(LocalEdit::link(a, b, EdgeKind::Aggregation))
        .await
        .unwrap();

    // One snapshot once the edits go quiet, while the room is still open.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(server.hub().room_count().await, 1);
    let saved = store.load(project).unwrap().expect("snapshot saved");
    assert_eq!(saved.nodes.len(), 2);
    assert_eq!(saved.edges.len(), 1);

    let meta = store.load_metadata(project).unwrap().unwrap();
    assert_eq!(meta.save_count, 1);
    assert_eq!(server.stats().await.persisted_snapshots, 1);

    client.disconnect().await;
}

#[tokio::test]
async fn test_restarted_hub_serves_saved_document() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let project = Uuid::new_v4();

    {
        let (url, server, handle) = start(store.clone()).await;
        let (mut client, mut events) = client_for(&url, project);
        client.connect().await.unwrap();
        next_matching(&mut events, |e| matches!(e, ClientEvent::Welcome { .. })).await;

        let a = add(&client, "Account").await;
        let b = add(&client, "Ledger").await;
        client
            .edit(LocalEdit::link(a, b, EdgeKind::Association))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Leave before the autosave fires; the room close saves instead.
        client.disconnect().await;
        wait_until_closed(&server).await;
        handle.abort();
    }

    let (url, server, _handle) = start(store.clone()).await;
    let (mut client, mut events) = client_for(&url, project);
    client.connect().await.unwrap();
    next_matching(&mut events, |e| matches!(e, ClientEvent::FullReplace(_))).await;

    let doc = client.document().await;
    assert_eq!(doc.nodes.len(), 2);
    assert_eq!(doc.edges.len(), 1);
    // New ids continue after the restored ones.
    let c = add(&client, "Journal").await;
    assert!(doc.nodes.iter().all(|n| n.display_id < c));

    client.disconnect().await;
    wait_until_closed(&server).await;
}

#[tokio::test]
async fn test_store_failure_refuses_join() {
    let store = Arc::new(MemoryStore::new());
    store.set_failing(true);
    let (url, server, _handle) = start(store.clone()).await;

    let (mut client, mut events) = client_for(&url, Uuid::new_v4());
    client.connect().await.unwrap();
    match next_matching(&mut events, |e| matches!(e, ClientEvent::Rejected { .. })).await {
        ClientEvent::Rejected { kind, .. } => assert_eq!(kind, None),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(server.hub().room_count().await, 0);

    // Once the store is back, a fresh connection joins normally.
    client.disconnect().await;
    store.set_failing(false);
    let (mut retry, mut retry_events) = client_for(&url, Uuid::new_v4());
    retry.connect().await.unwrap();
    next_matching(&mut retry_events, |e| matches!(e, ClientEvent::Welcome { .. })).await;
    retry.disconnect().await;
}

#[tokio::test]
async fn test_failed_autosave_leaves_room_running() {
    let store = Arc::new(MemoryStore::new());
    let (url, server, _handle) = start(store.clone()).await;
    let project = Uuid::new_v4();

    let (mut client, mut events) = client_for(&url, project);
    client.connect().await.unwrap();
    next_matching(&mut events, |e| matches!(e, ClientEvent::Welcome { .. })).await;

    store.set_failing(true);
    add(&client, "Unsaved").await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.save_count(), 0);
    assert_eq!(server.hub().document(project).await.unwrap().nodes.len(), 1);

    // The next coalesced snapshot goes through.
    store.set_failing(false);
    add(&client, "Saved").await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.save_count(), 1);
    assert_eq!(store.load_document(project).unwrap().unwrap().nodes.len(), 2);

    client.disconnect().await;
}
