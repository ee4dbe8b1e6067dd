use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use super::{Callback, Timer};

struct Node {
    id: usize,
    expires: Instant,
    callback: Callback,
}

/// Binary min-heap of expiries, with an index from id to heap position.
pub struct HeapTimer {
    heap: Vec<Node>,
    positions: HashMap<usize, usize>,
}

impl HeapTimer {
    pub fn new() -> Self {
        HeapTimer {
            heap: Vec::with_capacity(64),
            positions: HashMap::new(),
        }
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.positions.insert(self.heap[i].id, i);
        self.positions.insert(self.heap[j].id, j);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[i].expires >= self.heap[parent].expires {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Returns whether the node moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let len = self.heap.len();
        let mut i = start;
        loop {
            let left = 2 * i + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < len && self.heap[right].expires < self.heap[left].expires {
                child = right;
            }
            if self.heap[child].expires >= self.heap[i].expires {
                break;
            }
            self.swap(i, child);
            i = child;
        }
        i > start
    }

    fn restore(&mut self, i: usize) {
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    fn remove_at(&mut self, i: usize) -> Node {
        assert!(i < self.heap.len(), "heap position {} out of bounds", i);
        let node = self.heap.swap_remove(i);
        self.positions.remove(&node.id);
        if i < self.heap.len() {
            self.positions.insert(self.heap[i].id, i);
            self.restore(i);
        }
        node
    }
}

impl Default for HeapTimer {
    fn default() -> Self {
        HeapTimer::new()
    }
}

impl fmt::Debug for HeapTimer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HeapTimer")
            .field("len", &self.heap.len())
            .finish()
    }
}

impl Timer for HeapTimer {
    fn add(&mut self, id: usize, timeout: Duration, callback: Callback) {
        let expires = Instant::now() + timeout;
        if let Some(&i) = self.positions.get(&id) {
            self.heap[i].expires = expires;
            self.heap[i].callback = callback;
            self.restore(i);
            return;
        }

        let i = self.heap.len();
        self.heap.push(Node {
            id,
            expires,
            callback,
        });
        self.positions.insert(id, i);
        self.sift_up(i);
    }

    fn adjust(&mut self, id: usize, timeout: Duration) {
        if let Some(&i) = self.positions.get(&id) {
            self.heap[i].expires = Instant::now() + timeout;
            self.restore(i);
        }
    }

    fn cancel(&mut self, id: usize) -> bool {
        match self.positions.get(&id).cloned() {
            Some(i) => {
                self.remove_at(i);
                true
            }
            None => false,
        }
    }

    fn tick_at(&mut self, now: Instant) {
        while let Some(expires) = self.heap.first().map(|node| node.expires) {
            if expires > now {
                break;
            }
            let node = self.remove_at(0);
            trace!("Timer {} expired", node.id);
            (node.callback)();
        }
    }

    fn deadline_at(&self, now: Instant) -> Option<Duration> {
        self.heap.first().map(|node| {
            if node.expires > now {
                node.expires - now
            } else {
                Duration::from_millis(0)
            }
        })
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}
