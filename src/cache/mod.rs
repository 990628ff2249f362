//! Temporal cache: a hashed timing wheel.
//!
//! Entries are indexed two ways at once: by a 64-bit hash (with full byte-key
//! comparison to tolerate collisions) for O(1) lookup, and by an expiry slot
//! on a fixed-size wheel for TTL-based eviction. The wheel is driven by a
//! virtual clock that only moves when [`TimeWheel::advance`] is called, so
//! state decays exactly as fast as the event stream that drives it.

use std::collections::{HashMap, VecDeque};

/// Capability an entry must expose to live in a [`TimeWheel`].
///
/// The hash places the entry in the index; `matches` disambiguates hash
/// collisions by comparing the opaque key bytes. The key an entry answers for
/// must never change while the entry is resident.
pub trait Keyed {
    /// 64-bit hash used for index bucket placement.
    fn hash(&self) -> u64;

    /// Full byte comparison against a lookup key.
    fn matches(&self, key: &[u8]) -> bool;
}

/// Hashed timing wheel with `W` one-unit expiry slots.
///
/// An entry inserted with TTL `t` (`0 < t < W`) at virtual time `now` stays
/// resident and lookup-able until an `advance` moves the clock to `now + t`
/// or beyond, at which point it lands in the ready queue in
/// oldest-scheduled-first order and must be collected via
/// [`TimeWheel::pop_expired`].
pub struct TimeWheel<T: Keyed> {
    /// slot -> ids scheduled to expire in that slot
    slots: Vec<Vec<u64>>,
    /// entry hash -> ids, chained on collision
    index: HashMap<u64, Vec<u64>>,
    /// id -> resident entry
    resident: HashMap<u64, T>,
    /// swept entries awaiting collection, in eviction order
    ready: VecDeque<T>,
    next_id: u64,
    now: u64,
}

impl<T: Keyed> TimeWheel<T> {
    /// Create a wheel with `slots` one-unit expiry slots.
    ///
    /// # Panics
    ///
    /// Panics if `slots` is zero.
    pub fn new(slots: u64) -> Self {
        assert!(slots > 0, "timing wheel needs at least one slot");
        Self {
            slots: (0..slots).map(|_| Vec::new()).collect(),
            index: HashMap::new(),
            resident: HashMap::new(),
            ready: VecDeque::new(),
            next_id: 0,
            now: 0,
        }
    }

    /// Number of expiry slots `W`.
    pub fn wheel_size(&self) -> u64 {
        self.slots.len() as u64
    }

    /// Current virtual time.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Number of resident entries (excluding the ready queue).
    pub fn len(&self) -> usize {
        self.resident.len()
    }

    /// True if no entries are resident.
    pub fn is_empty(&self) -> bool {
        self.resident.is_empty()
    }

    /// Insert an entry scheduled to expire `ttl` units from now.
    ///
    /// The cache performs no duplicate-key check; callers wanting
    /// first-or-update semantics must `lookup` first.
    ///
    /// # Panics
    ///
    /// Panics unless `0 < ttl < W`. An out-of-range TTL is a programming
    /// error, not a recoverable condition.
    pub fn insert(&mut self, ttl: u64, entry: T) {
        let w = self.wheel_size();
        assert!(ttl > 0 && ttl < w, "TTL {ttl} out of range (wheel size {w})");

        let id = self.next_id;
        self.next_id += 1;

        let slot = ((self.now + ttl) % w) as usize;
        self.slots[slot].push(id);
        self.index.entry(entry.hash()).or_default().push(id);
        self.resident.insert(id, entry);
    }

    /// Find the resident entry whose stored key bytes equal `key`.
    ///
    /// Non-destructive: the entry stays in its bucket and expiry slot.
    pub fn lookup(&self, hash: u64, key: &[u8]) -> Option<&T> {
        let chain = self.index.get(&hash)?;
        chain
            .iter()
            .filter_map(|id| self.resident.get(id))
            .find(|entry| entry.matches(key))
    }

    /// Like [`TimeWheel::lookup`] but grants in-place mutable access.
    ///
    /// The entry remains in its original expiry slot; mutating it does not
    /// extend its lifetime. True renewal is pop-then-reinsert.
    pub fn lookup_mut(&mut self, hash: u64, key: &[u8]) -> Option<&mut T> {
        let chain = self.index.get(&hash)?;
        let id = *chain
            .iter()
            .find(|id| self.resident.get(id).is_some_and(|e| e.matches(key)))?;
        self.resident.get_mut(&id)
    }

    /// Move the virtual clock forward by `delta` units, sweeping every slot
    /// passed over into the ready queue.
    ///
    /// Sweeping preserves slot traversal order, so eviction order is
    /// deterministic (oldest scheduled first). A `delta >= W` performs one
    /// full rotation: every resident entry is swept exactly once.
    pub fn advance(&mut self, delta: u64) {
        let w = self.wheel_size();
        let steps = delta.min(w);
        for step in 1..=steps {
            let slot = ((self.now + step) % w) as usize;
            self.sweep_slot(slot);
        }
        self.now += delta;
    }

    /// Remove and return one swept entry, in eviction order.
    ///
    /// Returns `None` once the ready queue is drained; further calls keep
    /// returning `None` until the next `advance` or `purge`.
    pub fn pop_expired(&mut self) -> Option<T> {
        self.ready.pop_front()
    }

    /// Move every resident entry into the ready queue, regardless of its
    /// scheduled slot. Does not advance the clock. Used for shutdown flushes.
    pub fn purge(&mut self) {
        let w = self.wheel_size();
        for step in 1..=w {
            let slot = ((self.now + step) % w) as usize;
            self.sweep_slot(slot);
        }
    }

    fn sweep_slot(&mut self, slot: usize) {
        let ids = std::mem::take(&mut self.slots[slot]);
        for id in ids {
            // Scheduled ids always have a resident entry; nothing else
            // removes entries from the arena.
            if let Some(entry) = self.resident.remove(&id) {
                self.unlink(entry.hash(), id);
                self.ready.push_back(entry);
            }
        }
    }

    fn unlink(&mut self, hash: u64, id: u64) {
        if let Some(chain) = self.index.get_mut(&hash) {
            chain.retain(|c| *c != id);
            if chain.is_empty() {
                self.index.remove(&hash);
            }
        }
    }
}
