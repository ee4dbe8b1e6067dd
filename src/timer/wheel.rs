use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use slab::Slab;

use super::{Callback, Timer};

struct Node {
    id: usize,
    generation: u64,
    expires: Instant,
    callback: Callback,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Where an id's entry lives. Stale once the slot is freed or reused by a later generation.
#[derive(Debug, Clone, Copy)]
struct Handle {
    slot: usize,
    generation: u64,
}

/// Approximate scheduler: a ring of entries in insertion order, swept from a cursor.
///
/// Refreshing an entry moves it to the tail. A sweep checks the entry under the cursor, steps the
/// cursor forward and stops at the first entry that is still live, so ordering is only roughly
/// by expiry. Every expired entry is still reached once the cursor has gone round the ring.
pub struct WheelTimer {
    nodes: Slab<Node>,
    head: Option<usize>,
    tail: Option<usize>,
    cursor: Option<usize>,
    handles: HashMap<usize, Handle>,
    next_generation: u64,
    cadence: Duration,
}

impl WheelTimer {
    pub fn new(cadence: Duration) -> Self {
        WheelTimer {
            nodes: Slab::with_capacity(64),
            head: None,
            tail: None,
            cursor: None,
            handles: HashMap::new(),
            next_generation: 0,
            cadence,
        }
    }

    /// The live slot for `id`, dropping the handle if it went stale.
    fn live(&mut self, id: usize) -> Option<usize> {
        let handle = *self.handles.get(&id)?;
        match self.nodes.get(handle.slot) {
            Some(node) if node.generation == handle.generation => Some(handle.slot),
            _ => {
                self.handles.remove(&id);
                None
            }
        }
    }

    fn push_back(&mut self, slot: usize) {
        self.nodes[slot].prev = self.tail;
        self.nodes[slot].next = None;
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        if self.cursor.is_none() {
            self.cursor = Some(slot);
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }
        if self.cursor == Some(slot) {
            self.cursor = next.or(self.head);
        }
        self.nodes[slot].prev = None;
        self.nodes[slot].next = None;
    }

    fn remove(&mut self, slot: usize) -> Node {
        self.unlink(slot);
        let node = self.nodes.remove(slot);
        let current = self.handles.get(&node.id).map_or(false, |handle| {
            handle.slot == slot && handle.generation == node.generation
        });
        if current {
            self.handles.remove(&node.id);
        }
        node
    }
}

impl fmt::Debug for WheelTimer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WheelTimer")
            .field("len", &self.nodes.len())
            .field("cursor", &self.cursor)
            .field("cadence", &self.cadence)
            .finish()
    }
}

impl Timer for WheelTimer {
    fn add(&mut self, id: usize, timeout: Duration, callback: Callback) {
        let expires = Instant::now() + timeout;
        if let Some(slot) = self.live(id) {
            self.unlink(slot);
            self.nodes[slot].expires = expires;
            self.nodes[slot].callback = callback;
            self.push_back(slot);
            return;
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        let slot = self.nodes.insert(Node {
            id,
            generation,
            expires,
            callback,
            prev: None,
            next: None,
        });
        self.push_back(slot);
        self.handles.insert(id, Handle { slot, generation });
    }

    fn adjust(&mut self, id: usize, timeout: Duration) {
        if let Some(slot) = self.live(id) {
            self.unlink(slot);
            self.nodes[slot].expires = Instant::now() + timeout;
            self.push_back(slot);
        }
    }

    fn cancel(&mut self, id: usize) -> bool {
        match self.live(id) {
            Some(slot) => {
                self.remove(slot);
                true
            }
            None => false,
        }
    }

    fn tick_at(&mut self, now: Instant) {
        while let Some(slot) = self.cursor {
            self.cursor = self.nodes[slot].next.or(self.head);
            if self.nodes[slot].expires > now {
                break;
            }
            let node = self.remove(slot);
            trace!("Timer {} expired", node.id);
            (node.callback)();
        }
    }

    fn deadline_at(&self, _now: Instant) -> Option<Duration> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(self.cadence)
        }
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}
