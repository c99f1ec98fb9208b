//! Trailing-edge coalescing of high-frequency local edits.
//!
//! Drags produce a `move_node` per pointer event; only the node's position
//! at the end of a quiet window goes on the wire. Autosave works the same
//! way per document. Timing is injected (`now`), so the debouncers stay
//! pure and the client driver decides when to sleep.
//!
//! ```text
//! touch(k, t0) ── touch(k, t1) ── touch(k, t2) ······ t2 + window ──► ready
//!                                                     (one flush)
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use classgraph_core::{DisplayId, Position};

use crate::protocol::Envelope;
use crate::reconciler::{Effects, Reconciler, RenderUpdate};

pub const MOVE_DEBOUNCE: Duration = Duration::from_millis(120);
pub const PERSIST_DEBOUNCE: Duration = Duration::from_millis(900);

#[derive(Debug)]
struct Pending<V> {
    value: V,
    deadline: Instant,
}

/// Per-key trailing-edge debouncer. The last value wins.
#[derive(Debug)]
pub struct Debouncer<K, V> {
    window: Duration,
    pending: HashMap<K, Pending<V>>,
}

impl<K: Eq + Hash + Copy + Ord, V> Debouncer<K, V> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Record a new value for `key` and push its deadline out.
    pub fn touch(&mut self, key: K, value: V, now: Instant) {
        self.pending.insert(
            key,
            Pending {
                value,
                deadline: now + self.window,
            },
        );
    }

    /// Remove and return every entry whose window has elapsed, oldest first.
    pub fn take_ready(&mut self, now: Instant) -> Vec<(K, V)> {
        let mut ready: Vec<K> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        ready.sort_by_key(|k| (self.pending[k].deadline, *k));
        ready
            .into_iter()
            .filter_map(|k| self.pending.remove(&k).map(|p| (k, p.value)))
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Drop everything pending. Returns how many entries were dropped.
    pub fn cancel(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// What a [`Coalescer::flush`] produced.
#[derive(Debug, Default)]
pub struct Flushed {
    /// Send now.
    pub outbound: Vec<Envelope>,
    /// Nodes put back at their local position.
    pub render: Vec<RenderUpdate>,
}

impl Flushed {
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.render.is_empty()
    }
}

/// Move and autosave debouncers for one client session.
#[derive(Debug)]
pub struct Coalescer {
    moves: Debouncer<DisplayId, Position>,
    persist: Debouncer<(), ()>,
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::new(MOVE_DEBOUNCE, PERSIST_DEBOUNCE)
    }
}

impl Coalescer {
    pub fn new(move_window: Duration, persist_window: Duration) -> Self {
        Self {
            moves: Debouncer::new(move_window),
            persist: Debouncer::new(persist_window),
        }
    }

    /// Schedule the deferred parts of a local edit.
    pub fn record(&mut self, effects: &Effects, now: Instant) {
        for (display_id, position) in &effects.moves {
            self.moves.touch(*display_id, *position, now);
        }
        if effects.persist {
            self.persist.touch((), (), now);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.moves.next_deadline(), self.persist.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Build the envelopes whose windows have elapsed.
    ///
    /// A move carries the last local position, even if a remote move landed
    /// inside the window. Moves for nodes deleted in the meantime are
    /// dropped. Each due entry is taken exactly once.
    pub fn flush(&mut self, reconciler: &mut Reconciler, now: Instant) -> Flushed {
        let mut flushed = Flushed::default();
        for (display_id, position) in self.moves.take_ready(now) {
            if let Some(envelope) =
                reconciler.move_envelope(display_id, position, &mut flushed.render)
            {
                flushed.outbound.push(envelope);
            }
        }
        if !self.persist.take_ready(now).is_empty() {
            flushed.outbound.extend(reconciler.snapshot_envelope());
        }
        flushed
    }

    /// Drop pending work, e.g. when the session leaves the room.
    pub fn cancel(&mut self) {
        let moves = self.moves.cancel();
        let persist = self.persist.cancel();
        if moves + persist > 0 {
            log::debug!("Cancelled {moves} pending moves and {persist} pending snapshots");
        }
    }

    pub fn pending_moves(&self) -> usize {
        self.moves.len()
    }

    pub fn persist_pending(&self) -> bool {
        !self.persist.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);

    #[test]
    fn test_trailing_edge_last_value_wins() {
        let start = Instant::now();
        let mut d: Debouncer<i64, i32> = Debouncer::new(WINDOW);
        for i in 0..50 {
            d.touch(1, i, start + Duration::from_millis(i as u64));
        }
        // Quiet window measured from the last touch at +49ms.
        assert!(d.take_ready(start + Duration::from_millis(120)).is_empty());
        assert_eq!(
            d.take_ready(start + Duration::from_millis(149)),
            vec![(1, 49)]
        );
        assert!(d.is_empty());
    }

    #[test]
    fn test_keys_debounce_independently() {
        let start = Instant::now();
        let mut d: Debouncer<i64, ()> = Debouncer::new(WINDOW);
        d.touch(1, (), start);
        d.touch(2, (), start + Duration::from_millis(60));

        assert_eq!(d.next_deadline(), Some(start + WINDOW));
        assert_eq!(d.take_ready(start + WINDOW), vec![(1, ())]);
        assert_eq!(
            d.next_deadline(),
            Some(start + Duration::from_millis(160))
        );
    }

    #[test]
    fn test_ready_entries_ordered_by_deadline() {
        let start = Instant::now();
        let mut d: Debouncer<i64, ()> = Debouncer::new(WINDOW);
        d.touch(9, (), start);
        d.touch(3, (), start + Duration::from_millis(10));
        d.touch(5, (), start + Duration::from_millis(5));
        let keys: Vec<_> = d
            .take_ready(start + Duration::from_secs(1))
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![9, 5, 3]);
    }

    #[test]
    fn test_cancel_drops_pending() {
        let start = Instant::now();
        let mut d: Debouncer<i64, ()> = Debouncer::new(WINDOW);
        d.touch(1, (), start);
        d.touch(2, (), start);
        assert_eq!(d.cancel(), 2);
        assert!(d.take_ready(start + Duration::from_secs(1)).is_empty());
        assert_eq!(d.next_deadline(), None);
    }

    #[test]
    fn test_coalescer_next_deadline_is_earliest() {
        let start = Instant::now();
        let mut c = Coalescer::default();
        let effects = Effects {
            moves: vec![(1, Position::new(1.0, 1.0))],
            persist: true,
            ..Effects::default()
        };
        c.record(&effects, start);
        assert_eq!(c.next_deadline(), Some(start + MOVE_DEBOUNCE));
        assert_eq!(c.pending_moves(), 1);
        assert!(c.persist_pending());

        c.cancel();
        assert_eq!(c.next_deadline(), None);
    }
}
