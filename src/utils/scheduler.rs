//! # Timer Wheel
//!
//! Approximate-deadline callbacks used for request timeouts.
//!
//! The wheel has 512 slots of one tick each plus an "immediate" slot. A task
//! scheduled `S` ahead lands `2 + ceil(S / tick)` slots past the current one,
//! together with the wheel revolution it belongs to; it fires when the wheel
//! passes that slot on that revolution. The two extra ticks absorb rounding so
//! a task never fires before its delay has elapsed.
//!
//! Any thread may schedule, unschedule or kill a task. The owning reactor calls
//! [`Scheduler::check_tasks`] once per loop. Callbacks run on the reactor thread,
//! outside the wheel lock, so a callback may freely reschedule or kill tasks.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Regular slots in the wheel.
pub const NUM_SLOTS: usize = 512;

const IMMEDIATE_SLOT: usize = NUM_SLOTS;

/// Slot advances per `check_tasks` call; a stalled reactor catches up over
/// several calls instead of spinning through the whole backlog at once.
const MAX_SLOT_ADVANCE: usize = 128;

type Callback = Box<dyn FnMut() + Send>;

struct Entry {
    // (slot, revolution) while linked
    linked: Option<(usize, u64)>,
    // None while the callback is running
    callback: Option<Callback>,
}

struct WheelState {
    slots: Vec<HashSet<u64>>,
    entries: HashMap<u64, Entry>,
    current_slot: usize,
    current_iteration: u64,
    next_tick: Instant,
    next_id: u64,
}

impl WheelState {
    fn unlink(&mut self, id: u64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if let Some((slot, _)) = entry.linked.take() {
                self.slots[slot].remove(&id);
            }
        }
    }

    fn link(&mut self, id: u64, slot: usize, iteration: u64) -> bool {
        self.unlink(id);
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.linked = Some((slot, iteration));
                self.slots[slot].insert(id);
                true
            }
            None => false,
        }
    }

    fn take_due(&mut self, slot: usize, iteration: Option<u64>, due: &mut Vec<u64>) {
        let ids: Vec<u64> = self.slots[slot].iter().copied().collect();
        for id in ids {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            let fires = match (entry.linked, iteration) {
                (Some((_, stored)), Some(current)) => stored == current,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if fires {
                entry.linked = None;
                self.slots[slot].remove(&id);
                due.push(id);
            }
        }
    }
}

/// Hashed timer wheel owned by one reactor.
pub struct Scheduler {
    tick: Duration,
    state: Mutex<WheelState>,
}

impl Scheduler {
    pub fn new(tick: Duration) -> Arc<Self> {
        Self::with_start(tick, Instant::now())
    }

    /// Wheel whose first tick ends at `start + tick`.
    pub fn with_start(tick: Duration, start: Instant) -> Arc<Self> {
        let tick = tick.max(Duration::from_millis(1));
        Arc::new(Self {
            tick,
            state: Mutex::new(WheelState {
                slots: (0..=NUM_SLOTS).map(|_| HashSet::new()).collect(),
                entries: HashMap::new(),
                current_slot: 0,
                current_iteration: 0,
                next_tick: start + tick,
                next_id: 1,
            }),
        })
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Create an unscheduled task running `callback` each time it fires.
    pub fn create_task<F>(self: &Arc<Self>, callback: F) -> Task
    where
        F: FnMut() + Send + 'static,
    {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert(
            id,
            Entry {
                linked: None,
                callback: Some(Box::new(callback)),
            },
        );
        Task {
            id,
            scheduler: Arc::downgrade(self),
        }
    }

    /// Number of ticks a delay of `delay` occupies on the wheel.
    ///
    /// Two ticks of padding on top of the rounded-up delay: one because the
    /// current slot is already partly elapsed, one so a task never fires
    /// before its deadline. A task therefore fires between `delay` and
    /// `delay + 3 * tick` after scheduling; the lateness bound is three
    /// ticks, not one.
    pub fn ticks_for(&self, delay: Duration) -> u64 {
        let tick = self.tick.as_nanos();
        let whole = delay.as_nanos().div_ceil(tick);
        2 + u64::try_from(whole).unwrap_or(u64::MAX - 2)
    }

    fn schedule(&self, id: u64, delay: Duration) -> bool {
        let ticks = self.ticks_for(delay);
        let mut state = self.state.lock();
        let pos = state.current_slot as u64 + ticks;
        let slot = (pos % NUM_SLOTS as u64) as usize;
        let iteration = state.current_iteration + pos / NUM_SLOTS as u64;
        state.link(id, slot, iteration)
    }

    fn schedule_now(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let iteration = state.current_iteration;
        state.link(id, IMMEDIATE_SLOT, iteration)
    }

    fn unschedule(&self, id: u64) {
        self.state.lock().unlink(id);
    }

    fn kill(&self, id: u64) {
        let mut state = self.state.lock();
        state.unlink(id);
        state.entries.remove(&id);
    }

    fn is_scheduled(&self, id: u64) -> bool {
        self.state
            .lock()
            .entries
            .get(&id)
            .is_some_and(|entry| entry.linked.is_some())
    }

    /// Number of live (not killed) tasks.
    pub fn task_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Advance the wheel to `now` and run every task that came due.
    ///
    /// Returns how many callbacks ran.
    pub fn check_tasks(&self, now: Instant) -> usize {
        let mut due = Vec::new();
        {
            let mut state = self.state.lock();
            state.take_due(IMMEDIATE_SLOT, None, &mut due);
            let mut advanced = 0;
            while now >= state.next_tick && advanced < MAX_SLOT_ADVANCE {
                state.current_slot += 1;
                if state.current_slot == NUM_SLOTS {
                    state.current_slot = 0;
                    state.current_iteration += 1;
                }
                state.next_tick += self.tick;
                advanced += 1;
                let (slot, iteration) = (state.current_slot, state.current_iteration);
                state.take_due(slot, Some(iteration), &mut due);
            }
        }

        let mut fired = 0;
        for id in due {
            let callback = self
                .state
                .lock()
                .entries
                .get_mut(&id)
                .and_then(|entry| entry.callback.take());
            let Some(mut callback) = callback else {
                continue;
            };
            callback();
            fired += 1;
            if let Some(entry) = self.state.lock().entries.get_mut(&id) {
                entry.callback = Some(callback);
            }
        }
        fired
    }
}

/// Handle to a callback living on a [`Scheduler`].
///
/// Dropping the handle kills the task.
pub struct Task {
    id: u64,
    scheduler: Weak<Scheduler>,
}

impl Task {
    /// (Re)schedule to fire after `delay`. Returns false once killed.
    pub fn schedule(&self, delay: Duration) -> bool {
        self.scheduler
            .upgrade()
            .is_some_and(|s| s.schedule(self.id, delay))
    }

    /// (Re)schedule to fire on the next `check_tasks`. Returns false once killed.
    pub fn schedule_now(&self) -> bool {
        self.scheduler
            .upgrade()
            .is_some_and(|s| s.schedule_now(self.id))
    }

    pub fn unschedule(&self) {
        if let Some(s) = self.scheduler.upgrade() {
            s.unschedule(self.id);
        }
    }

    /// Unschedule for good; later `schedule` calls are no-ops.
    pub fn kill(&self) {
        if let Some(s) = self.scheduler.upgrade() {
            s.kill(self.id);
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduler
            .upgrade()
            .is_some_and(|s| s.is_scheduled(self.id))
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.kill();
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish()
    }
}
