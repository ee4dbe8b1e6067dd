//! Idle connection eviction.
//!
//! Two schedulers share the `Timer` contract. The heap keeps entries in exact expiry order, the
//! wheel walks a ring of entries one slot per step and only promises that everything expired is
//! fired eventually. Which one runs is decided once at startup.

use std::time::{Duration, Instant};

use config::TimerKind;

mod heap;
pub use self::heap::HeapTimer;

mod wheel;
pub use self::wheel::WheelTimer;

/// Run once when an entry expires. Never run for cancelled entries.
pub type Callback = Box<dyn FnOnce() + Send>;

pub trait Timer: Send {
    /// Schedule `callback` to run once `timeout` has passed. An existing entry for `id` is
    /// replaced, so there is never more than one entry per id.
    fn add(&mut self, id: usize, timeout: Duration, callback: Callback);

    /// Push the expiry of an existing entry to `timeout` from now. Unknown ids are ignored.
    fn adjust(&mut self, id: usize, timeout: Duration);

    /// Remove an entry without running its callback. Returns whether it was present.
    fn cancel(&mut self, id: usize) -> bool;

    /// Fire and remove entries that expired at or before `now`.
    fn tick_at(&mut self, now: Instant);

    /// How long the caller may sleep before the next tick is due, None to sleep until woken.
    fn deadline_at(&self, now: Instant) -> Option<Duration>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Tick, then report how long to wait for the next one.
    fn next_deadline(&mut self) -> Option<Duration> {
        let now = Instant::now();
        self.tick_at(now);
        self.deadline_at(now)
    }
}

/// Build the scheduler picked in the config. `cadence` is how often the wheel is swept.
pub fn new_timer(kind: TimerKind, cadence: Duration) -> Box<dyn Timer> {
    match kind {
        TimerKind::Heap => Box::new(HeapTimer::new()),
        TimerKind::Wheel => Box::new(WheelTimer::new(cadence)),
    }
}
