//! Timer wheels for per-operation timeouts and scheduled tasks.
//!
//! The engine runs two wheels with the same structure but different
//! resolutions: a high-precision wheel ticking every millisecond for absolute
//! task scheduling, and a low-precision wheel ticking every second for the
//! default I/O timeouts, where huge numbers of tasks with similar deadlines
//! share a slot.
//!
//! [`Wheel`] is generic over the task payload. The worker instantiates it
//! with a small action enum; [`Timer`] specializes it with boxed callbacks
//! for standalone use.

use std::time::{Duration, Instant};

use log::trace;
use slab::Slab;

/// Fired-task callback for [`Timer`]. The flag is true when the task was
/// killed rather than fired at its deadline.
pub type TimerFunc = Box<dyn FnMut(bool) + Send>;

/// A [`Wheel`] carrying boxed callbacks.
pub type Timer = Wheel<TimerFunc>;

type Tick = u64;

const TICK_MAX: Tick = u64::MAX;
const EMPTY: usize = usize::MAX;

/// Handle to a scheduled task, returned by [`Wheel::entry`] and
/// [`Wheel::entry_at`].
///
/// The handle stays valid until the task fires, is killed, or is cancelled;
/// using it afterwards is a no-op.
#[derive(Clone, Debug)]
pub struct TimerTask {
    token: usize,
    tick: Tick,
}

// Doubly linked list of timer entries per wheel slot. Allows for efficient
// insertion / removal of tasks.
struct Entry<T> {
    state: T,
    period: u64,
    killed: bool,
    links: EntryLinks,
}

#[derive(Copy, Clone)]
struct EntryLinks {
    tick: Tick,
    prev: usize,
    next: usize,
}

#[derive(Copy, Clone)]
struct WheelEntry {
    next_tick: Tick,
    head: usize,
}

/// A hashed timer wheel.
///
/// Deadlines are bucketed by tick; each tick, the wheel walks one slot and
/// fires every due entry. One-shot tasks are removed on fire; periodic tasks
/// are rescheduled at `now + period`.
pub struct Wheel<T> {
    // Size of each tick in milliseconds
    tick_ms: u64,
    entries: Slab<Entry<T>>,
    wheel: Vec<WheelEntry>,
    start: Instant,
    // The current tick
    tick: Tick,
    // The next entry to possibly fire
    next: usize,
    // Masks the target tick to get the slot
    mask: u64,
}

impl<T> Wheel<T> {
    /// Creates a wheel with the given tick size and expected task capacity.
    pub fn new(tick: Duration, capacity: usize) -> Wheel<T> {
        let tick_ms = tick.as_millis().max(1) as u64;
        let num_slots = capacity.max(4).next_power_of_two();
        let mask = (num_slots as u64) - 1;
        let wheel = vec![
            WheelEntry {
                next_tick: TICK_MAX,
                head: EMPTY
            };
            num_slots
        ];
        Wheel {
            tick_ms,
            entries: Slab::with_capacity(capacity),
            wheel,
            start: Instant::now(),
            tick: 0,
            next: EMPTY,
            mask,
        }
    }

    /// Milliseconds elapsed on this wheel's clock.
    pub fn now(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Converts an absolute instant to this wheel's clock, saturating at the
    /// wheel epoch.
    pub fn clock(&self, when: Instant) -> u64 {
        when.saturating_duration_since(self.start).as_millis() as u64
    }

    /// Returns true when no task is scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The absolute time (wheel clock, ms) of the next fire, or `None` when
    /// the wheel is empty.
    pub fn top(&self) -> Option<u64> {
        self.next_tick().map(|tick| tick.saturating_mul(self.tick_ms))
    }

    /// Delay until the next fire. `None` means "sleep forever".
    pub fn delay(&self) -> Option<Duration> {
        let top = self.top()?;
        Some(Duration::from_millis(top.saturating_sub(self.now())))
    }

    /// Schedules a task after a delay, returning a handle. A zero `period`
    /// makes the task one-shot.
    pub fn entry(&mut self, delay: Duration, period: Duration, state: T) -> TimerTask {
        let when = self.now() + delay.as_millis() as u64;
        self.entry_at(when, period, state)
    }

    /// Schedules a task at an absolute time on the wheel clock (ms).
    pub fn entry_at(&mut self, when_ms: u64, period: Duration, state: T) -> TimerTask {
        let mut tick = ms_to_tick(when_ms, self.tick_ms);
        // Always target at least one tick in the future
        if tick <= self.tick {
            tick = self.tick + 1;
        }
        self.insert(tick, period.as_millis() as u64, state)
    }

    /// Fire-and-forget variant of [`Wheel::entry`]; no handle is returned.
    pub fn post(&mut self, delay: Duration, period: Duration, state: T) {
        let _ = self.entry(delay, period, state);
    }

    /// Fire-and-forget variant of [`Wheel::entry_at`].
    pub fn post_at(&mut self, when_ms: u64, period: Duration, state: T) {
        let _ = self.entry_at(when_ms, period, state);
    }

    /// Kills a task: it fires on the next spak with the killed flag set and
    /// is then removed, regardless of its deadline.
    pub fn kill(&mut self, task: &TimerTask) {
        let links = match self.entries.get(task.token) {
            Some(e) if e.links.tick == task.tick => e.links,
            _ => return,
        };
        // Requeue at the current tick so the next spak delivers it.
        self.unlink(&links, task.token);
        let entry = &mut self.entries[task.token];
        entry.killed = true;
        entry.period = 0;
        let tick = self.tick + 1;
        self.relink(task.token, tick);
    }

    /// Cancels a task without firing it, returning its state.
    pub fn cancel(&mut self, task: &TimerTask) -> Option<T> {
        let links = match self.entries.get(task.token) {
            Some(e) if e.links.tick == task.tick => e.links,
            _ => return None,
        };
        self.unlink(&links, task.token);
        Some(self.entries.remove(task.token).state)
    }

    /// Fires every due task against the wheel's own clock.
    pub fn spak_with(&mut self, f: impl FnMut(&mut T, bool)) {
        let now = self.now();
        self.spak_at_with(now, f);
    }

    /// Fires every due task against a caller-supplied clock value, for
    /// callers that cache "now" across several wheels.
    pub fn spak_at_with(&mut self, now_ms: u64, mut f: impl FnMut(&mut T, bool)) {
        let target_tick = ms_to_tick(now_ms, self.tick_ms);
        while let Some(token) = self.poll_to(target_tick) {
            let entry = &mut self.entries[token];
            let killed = entry.killed;
            let period = entry.period;
            trace!("timer: firing task={}; killed={}", token, killed);
            f(&mut entry.state, killed);
            if period > 0 && !killed {
                let tick = ms_to_tick(now_ms + period, self.tick_ms).max(self.tick + 1);
                self.relink(token, tick);
            } else {
                self.entries.remove(token);
            }
        }
    }

    fn insert(&mut self, tick: Tick, period: u64, state: T) -> TimerTask {
        let token = self.entries.insert(Entry {
            state,
            period,
            killed: false,
            links: EntryLinks {
                tick,
                prev: EMPTY,
                next: EMPTY,
            },
        });
        self.relink(token, tick);
        trace!("timer: inserted task={}; tick={}", token, tick);
        TimerTask { token, tick }
    }

    // Pushes an existing entry onto the slot list for `tick`.
    fn relink(&mut self, token: usize, tick: Tick) {
        let slot = (tick & self.mask) as usize;
        let curr = self.wheel[slot];
        {
            let links = &mut self.entries[token].links;
            links.tick = tick;
            links.prev = EMPTY;
            links.next = curr.head;
        }
        if curr.head != EMPTY {
            self.entries[curr.head].links.prev = token;
        }
        self.wheel[slot] = WheelEntry {
            next_tick: curr.next_tick.min(tick),
            head: token,
        };
    }

    // Advances the wheel towards `target_tick`, returning one due entry per
    // call; `None` once everything due has fired.
    fn poll_to(&mut self, mut target_tick: Tick) -> Option<usize> {
        if target_tick < self.tick {
            target_tick = self.tick;
        }
        while self.tick <= target_tick {
            let curr = self.next;
            if curr == EMPTY {
                self.tick += 1;
                let slot = self.slot_for(self.tick);
                self.next = self.wheel[slot].head;
                // A slot whose only entry was cancelled keeps a stale
                // next_tick; reset it or the wheel spins forever.
                if self.next == EMPTY {
                    self.wheel[slot].next_tick = TICK_MAX;
                }
            } else {
                let slot = self.slot_for(self.tick);
                if curr == self.wheel[slot].head {
                    self.wheel[slot].next_tick = TICK_MAX;
                }
                let links = self.entries[curr].links;
                if links.tick <= self.tick || self.entries[curr].killed {
                    // Unlink will also advance self.next
                    self.unlink(&links, curr);
                    return Some(curr);
                } else {
                    let next_tick = self.wheel[slot].next_tick;
                    self.wheel[slot].next_tick = next_tick.min(links.tick);
                    self.next = links.next;
                }
            }
        }
        None
    }

    fn unlink(&mut self, links: &EntryLinks, token: usize) {
        if links.prev == EMPTY {
            let slot = self.slot_for(links.tick);
            if self.wheel[slot].head == token {
                self.wheel[slot].head = links.next;
            }
        } else {
            self.entries[links.prev].links.next = links.next;
        }
        if links.next != EMPTY {
            self.entries[links.next].links.prev = links.prev;
            if token == self.next {
                self.next = links.next;
            }
        } else if token == self.next {
            self.next = EMPTY;
        }
    }

    // Next tick containing a task
    fn next_tick(&self) -> Option<Tick> {
        if self.entries.is_empty() {
            return None;
        }
        if self.next != EMPTY {
            let slot = self.slot_for(self.entries[self.next].links.tick);
            if self.wheel[slot].next_tick == self.tick {
                return Some(self.tick);
            }
        }
        let min = self
            .wheel
            .iter()
            .map(|e| e.next_tick)
            .min()
            .unwrap_or(TICK_MAX);
        if min == TICK_MAX {
            None
        } else {
            Some(min)
        }
    }

    fn slot_for(&self, tick: Tick) -> usize {
        (self.mask & tick) as usize
    }
}

impl Wheel<TimerFunc> {
    /// Fires every due callback.
    pub fn spak(&mut self) {
        self.spak_with(|func, killed| func(killed));
    }

    /// [`Timer::spak`] against a cached clock value.
    pub fn spak_at(&mut self, now_ms: u64) {
        self.spak_at_with(now_ms, |func, killed| func(killed));
    }
}

fn ms_to_tick(ms: u64, tick_ms: u64) -> Tick {
    // Round to the closest tick so sub-tick deadlines do not starve.
    ms.saturating_add(tick_ms / 2) / tick_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn one_shot_fires_once() {
        let mut timer = Timer::new(Duration::from_millis(1), 64);
        let (fired, killed) = counter();
        let (f, k) = (fired.clone(), killed.clone());
        timer.post(
            Duration::from_millis(5),
            Duration::ZERO,
            Box::new(move |was_killed| {
                if was_killed {
                    k.fetch_add(1, Ordering::SeqCst);
                } else {
                    f.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        // Not due yet.
        timer.spak_at(1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.spak_at(10);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(killed.load(Ordering::SeqCst), 0);
        // Gone after firing.
        timer.spak_at(20);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timer.is_empty());
    }

    #[test]
    fn periodic_reschedules() {
        let mut timer = Timer::new(Duration::from_millis(1), 64);
        let (fired, _) = counter();
        let f = fired.clone();
        timer.post(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Box::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        timer.spak_at(12);
        timer.spak_at(23);
        timer.spak_at(34);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(!timer.is_empty());
    }

    #[test]
    fn kill_fires_with_flag() {
        let mut timer = Timer::new(Duration::from_millis(1), 64);
        let (fired, killed) = counter();
        let (f, k) = (fired.clone(), killed.clone());
        let task = timer.entry(
            Duration::from_secs(3600),
            Duration::ZERO,
            Box::new(move |was_killed| {
                if was_killed {
                    k.fetch_add(1, Ordering::SeqCst);
                } else {
                    f.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        timer.kill(&task);
        timer.spak_at(5);
        assert_eq!(killed.load(Ordering::SeqCst), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timer.is_empty());
    }

    #[test]
    fn cancel_never_fires() {
        let mut timer = Timer::new(Duration::from_millis(1), 64);
        let (fired, _) = counter();
        let f = fired.clone();
        let task = timer.entry(
            Duration::from_millis(5),
            Duration::ZERO,
            Box::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(timer.cancel(&task).is_some());
        assert!(timer.cancel(&task).is_none());
        timer.spak_at(100);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn delay_tracks_nearest_deadline() {
        let mut timer = Timer::new(Duration::from_millis(1), 64);
        assert!(timer.delay().is_none());
        timer.post(Duration::from_millis(50), Duration::ZERO, Box::new(|_| {}));
        let delay = timer.delay().expect("wheel not empty");
        assert!(delay <= Duration::from_millis(51));
    }

    #[test]
    fn coarse_wheel_buckets_deadlines() {
        // One-second ticks: deadlines 100 ms apart share a bucket.
        let mut timer = Timer::new(Duration::from_secs(1), 16);
        let (fired, _) = counter();
        for i in 0..8 {
            let f = fired.clone();
            timer.post(
                Duration::from_millis(900 + i * 10),
                Duration::ZERO,
                Box::new(move |_| {
                    f.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        timer.spak_at(1600);
        assert_eq!(fired.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn generic_payload_wheel() {
        let mut wheel: Wheel<usize> = Wheel::new(Duration::from_millis(1), 16);
        wheel.post(Duration::from_millis(2), Duration::ZERO, 41);
        wheel.post(Duration::from_millis(3), Duration::ZERO, 42);
        let mut seen = Vec::new();
        wheel.spak_at_with(10, |state, killed| {
            assert!(!killed);
            seen.push(*state);
        });
        seen.sort_unstable();
        assert_eq!(seen, vec![41, 42]);
    }
}
