//! # classgraph-collab: real-time collaboration for class diagrams
//!
//! Mutation-event synchronization over WebSocket. The hub keeps one live
//! [`GraphDocument`](classgraph_core::GraphDocument) per room, applies
//! every accepted envelope to it and fans it out to the other members.
//! Clients apply remote envelopes on the fast path, one entity at a time.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │  SyncClient  │ ◄────────────────► │  SyncServer  │
//! │  (per user)  │   bincode frames   │  (central)   │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │  Reconciler  │                    │     Hub      │
//! │  + Coalescer │                    │  rooms, live │
//! └──────────────┘                    │  documents   │
//!                                     └──────┬───────┘
//!                                            │
//!                                     ┌──────┴───────┐
//!                                     │ DocumentStore│
//!                                     │  (RocksDB)   │
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: envelopes and the bincode wire format
//! - [`broadcast`]: the hub and its rooms
//! - [`server`]: WebSocket front end for the hub
//! - [`reconciler`]: client-side apply paths and reentrancy guards
//! - [`coalesce`]: move and autosave debouncing
//! - [`client`]: WebSocket client driving a reconciler
//! - [`role`]: role gate and membership boundary
//! - [`presence`]: client-side roster
//! - [`storage`]: document persistence

pub mod broadcast;
pub mod client;
pub mod coalesce;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod reconciler;
pub mod role;
pub mod server;
pub mod storage;

pub use broadcast::{Delivery, Hub, JoinTicket, Room, SessionInfo, Subscription};
pub use client::{backoff_delay, ClientConfig, ClientEvent, SyncClient};
pub use coalesce::{Coalescer, Debouncer, Flushed, MOVE_DEBOUNCE, PERSIST_DEBOUNCE};
pub use error::SyncError;
pub use presence::{PeerPresence, PresenceRoster};
pub use protocol::{Envelope, Member, PresenceEvent, ProtocolError, WireMessage, HUB_ORIGIN};
pub use reconciler::{
    ConnectionState, Effects, Guard, Inbound, LocalEdit, Reconciler, ReentrancyGuards,
    RenderPatch, RenderUpdate,
};
pub use role::{authorize, MembershipService, Role, StaticMembership};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    DocumentMetadata, DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError,
};
