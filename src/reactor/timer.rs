//! Timer Queue
//!
//! Deadline-ordered software timers driven by the reactor. Ordering is by
//! absolute deadline with the insertion sequence number as a stable
//! tie-break, so two timers due at the same instant fire in the order they
//! were inserted.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// Shortest period a recurring timer may have
///
/// A zero period would make the reinserted deadline equal to `now` and keep
/// `drain_due` spinning.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a timer, stable across reinsertion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Callback run when a timer matures
///
/// It gets the reactor's handler state and the queue itself, so it can
/// insert or cancel other timers (or itself).
pub type TimerCallback<S> = Box<dyn FnMut(&mut S, &mut TimerQueue<S>)>;

pub struct Timer<S> {
    id: TimerId,
    deadline: Instant,
    interval: Option<Duration>,
    callback: TimerCallback<S>,
}

impl<S> Timer<S> {
    /// A timer that fires once at `deadline`
    pub fn oneshot(
        deadline: Instant,
        callback: impl FnMut(&mut S, &mut TimerQueue<S>) + 'static,
    ) -> Self {
        Self::build(deadline, None, Box::new(callback))
    }

    /// A timer that first fires at `deadline`, then every `interval` after
    /// each firing
    pub fn recurring(
        deadline: Instant,
        interval: Duration,
        callback: impl FnMut(&mut S, &mut TimerQueue<S>) + 'static,
    ) -> Self {
        Self::build(deadline, Some(interval.max(MIN_INTERVAL)), Box::new(callback))
    }

    fn build(deadline: Instant, interval: Option<Duration>, callback: TimerCallback<S>) -> Self {
        Self {
            id: TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed)),
            deadline,
            interval,
            callback,
        }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }
}

impl<S> fmt::Debug for Timer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

type OrderKey = (Instant, u64);

/// Earliest-deadline-first collection of timers
pub struct TimerQueue<S> {
    order: BTreeMap<OrderKey, TimerId>,
    timers: HashMap<TimerId, (OrderKey, Timer<S>)>,
    next_seq: u64,
    /// Timer whose callback is running right now
    firing: Option<TimerId>,
    /// Set when the firing timer is removed from inside a callback
    firing_cancelled: bool,
}

impl<S> Default for TimerQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> TimerQueue<S> {
    pub fn new() -> Self {
        Self {
            order: BTreeMap::new(),
            timers: HashMap::new(),
            next_seq: 0,
            firing: None,
            firing_cancelled: false,
        }
    }

    /// Add a timer; returns its identity for later removal
    pub fn insert(&mut self, timer: Timer<S>) -> TimerId {
        let id = timer.id;
        let key = (timer.deadline, self.next_seq);
        self.next_seq += 1;

        if let Some((old_key, _)) = self.timers.remove(&id) {
            self.order.remove(&old_key);
        }

        trace!("Timer {:?} armed", id);
        self.order.insert(key, id);
        self.timers.insert(id, (key, timer));
        id
    }

    /// Take a pending timer out of the queue
    ///
    /// Removing a timer that is not queued is a no-op. Removing the timer
    /// whose callback is currently running cancels its rearm; the timer
    /// itself is owned by the drain loop at that point, so `None` is
    /// returned.
    pub fn remove(&mut self, id: TimerId) -> Option<Timer<S>> {
        if self.firing == Some(id) {
            self.firing_cancelled = true;
            return None;
        }

        let (key, timer) = self.timers.remove(&id)?;
        self.order.remove(&key);
        trace!("Timer {:?} removed", id);
        Some(timer)
    }

    /// Whether `id` is queued, or is firing and has not cancelled itself
    pub fn contains(&self, id: TimerId) -> bool {
        if self.firing == Some(id) {
            return !self.firing_cancelled;
        }
        self.timers.contains_key(&id)
    }

    /// Timer with the nearest deadline
    pub fn peek_earliest(&self) -> Option<&Timer<S>> {
        let (_, id) = self.order.first_key_value()?;
        self.timers.get(id).map(|(_, timer)| timer)
    }

    /// Time left until the earliest deadline; `None` when the queue is empty
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.peek_earliest()
            .map(|timer| timer.deadline.saturating_duration_since(now))
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Fire every timer whose deadline is at or before `now`
    ///
    /// Recurring timers are rearmed at `now + interval` after their callback
    /// returns, so they cannot fire twice within one drain. Returns the
    /// number of callbacks run.
    pub fn drain_due(&mut self, now: Instant, state: &mut S) -> usize {
        let mut fired = 0;

        loop {
            let (key, id) = match self.order.first_key_value() {
                Some((&key, &id)) if key.0 <= now => (key, id),
                _ => break,
            };
            self.order.remove(&key);
            let Some((_, mut timer)) = self.timers.remove(&id) else {
                continue;
            };

            self.firing = Some(id);
            self.firing_cancelled = false;
            (timer.callback)(state, self);
            let cancelled = self.firing_cancelled;
            self.firing = None;
            self.firing_cancelled = false;
            fired += 1;

            match timer.interval {
                Some(interval) if !cancelled => {
                    timer.deadline = now + interval;
                    self.insert(timer);
                }
                _ => debug!("Timer {:?} retired", id),
            }
        }

        fired
    }
}
