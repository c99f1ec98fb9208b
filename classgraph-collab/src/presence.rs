//! Client-side roster of who else is in the room.
//!
//! Seeded from the `Welcome` member list and kept current by presence
//! events. A user with two open sessions appears once and stays online
//! until both have left.

use std::collections::HashMap;
use std::time::Instant;

use uuid::Uuid;

use crate::protocol::{Member, PresenceEvent};
use crate::role::Role;

#[derive(Debug, Clone)]
pub struct PeerPresence {
    pub user_id: Uuid,
    /// Known only for members listed in `Welcome`.
    pub role: Option<Role>,
    pub sessions: usize,
    pub since: Instant,
}

#[derive(Debug, Default)]
pub struct PresenceRoster {
    peers: HashMap<Uuid, PeerPresence>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster with a fresh member list.
    pub fn reset(&mut self, members: &[Member]) {
        self.peers.clear();
        let now = Instant::now();
        for member in members {
            let peer = self.peers.entry(member.user_id).or_insert(PeerPresence {
                user_id: member.user_id,
                role: Some(member.role),
                sessions: 0,
                since: now,
            });
            peer.sessions += 1;
        }
    }

    /// Apply a presence event. Returns true when the user's online status changed.
    pub fn apply(&mut self, event: &PresenceEvent) -> bool {
        match *event {
            PresenceEvent::Joined { user_id } => {
                let peer = self.peers.entry(user_id).or_insert(PeerPresence {
                    user_id,
                    role: None,
                    sessions: 0,
                    since: Instant::now(),
                });
                peer.sessions += 1;
                peer.sessions == 1
            }
            PresenceEvent::Left { user_id } => {
                let Some(peer) = self.peers.get_mut(&user_id) else {
                    return false;
                };
                peer.sessions = peer.sessions.saturating_sub(1);
                if peer.sessions == 0 {
                    self.peers.remove(&user_id);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn is_online(&self, user_id: &Uuid) -> bool {
        self.peers.contains_key(user_id)
    }

    pub fn peer(&self, user_id: &Uuid) -> Option<&PeerPresence> {
        self.peers.get(user_id)
    }

    /// Online user ids, sorted.
    pub fn online(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.peers.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
