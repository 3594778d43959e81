//! # Deadline scheduler for the main event loop.
//!
//! [`TimerService`] keeps one-shot and renewable timers on the monotonic
//! clock. It never reads the clock itself: every operation takes `now` from
//! the caller, so the event loop passes `Instant::now()` and tests pass
//! fabricated instants.
//!
//! The loop drives it with two calls:
//! - [`TimerService::next_deadline`]: how long to sleep;
//! - [`TimerService::take_due`]: pop everything that has expired.
//!
//! A popped timer is gone unless the dispatcher hands it back to
//! [`TimerService::restore`], which re-arms it with the original interval
//! aligned to the previous deadline. That keeps a repeating timer
//! period-aligned: coarse wakeups do not accumulate skew, because the next
//! deadline is computed from the old deadline, not from the moment the
//! callback happened to run.
//!
//! [`TimerService::freeze`] suspends a timer without losing its remaining
//! time; [`TimerService::thaw`] resumes the countdown. Frozen timers are
//! invisible to `next_deadline` and `take_due`.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Handle to a scheduled timer. Never reused within one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// A timer popped by [`TimerService::take_due`].
///
/// Carries enough to either drop the timer (one-shot) or hand it to
/// [`TimerService::restore`] for a period-aligned renewal.
#[derive(Debug)]
pub struct Expired<T> {
    /// The handle the timer was scheduled under.
    pub id: TimerId,
    /// The payload given to [`TimerService::add`].
    pub event: T,
    deadline: Instant,
    interval: Duration,
}

#[derive(Debug)]
struct Entry<T> {
    interval: Duration,
    deadline: Instant,
    /// Remaining run time captured by `freeze`; `None` while ticking.
    frozen: Option<Duration>,
    event: T,
}

/// Monotonic deadline scheduler, generic over the event payload.
#[derive(Debug)]
pub struct TimerService<T> {
    entries: HashMap<TimerId, Entry<T>>,
    next_id: u64,
}

impl<T> Default for TimerService<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerService<T> {
    /// Creates an empty service.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    /// Schedules `event` to fire `interval` after `now`.
    pub fn add(&mut self, now: Instant, interval: Duration, event: T) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.entries.insert(
            id,
            Entry {
                interval,
                deadline: now + interval,
                frozen: None,
                event,
            },
        );
        id
    }

    /// Removes a timer. Returns `false` when the handle is stale.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Restarts a timer with its full original interval, unfreezing it.
    pub fn reset(&mut self, id: TimerId, now: Instant) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.deadline = now + entry.interval;
                entry.frozen = None;
                true
            }
            None => false,
        }
    }

    /// Suspends a timer, retaining its remaining time. No-op when already
    /// frozen.
    pub fn freeze(&mut self, id: TimerId, now: Instant) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                if entry.frozen.is_none() {
                    entry.frozen = Some(entry.deadline.saturating_duration_since(now));
                }
                true
            }
            None => false,
        }
    }

    /// Resumes a frozen timer from its retained remainder. No-op when not
    /// frozen.
    pub fn thaw(&mut self, id: TimerId, now: Instant) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                if let Some(remaining) = entry.frozen.take() {
                    entry.deadline = now + remaining;
                }
                true
            }
            None => false,
        }
    }

    /// Seconds left before the timer fires; the retained remainder for a
    /// frozen timer.
    pub fn pending(&self, id: TimerId, now: Instant) -> Option<Duration> {
        self.entries.get(&id).map(|entry| match entry.frozen {
            Some(remaining) => remaining,
            None => entry.deadline.saturating_duration_since(now),
        })
    }

    /// Extends the remaining time by `by`.
    pub fn delay(&mut self, id: TimerId, by: Duration) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                match entry.frozen.as_mut() {
                    Some(remaining) => *remaining += by,
                    None => entry.deadline += by,
                }
                true
            }
            None => false,
        }
    }

    /// Earliest deadline among ticking timers, for the loop's sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|entry| entry.frozen.is_none())
            .map(|entry| entry.deadline)
            .min()
    }

    /// Removes and returns every ticking timer whose deadline has passed,
    /// ordered by deadline.
    pub fn take_due(&mut self, now: Instant) -> Vec<Expired<T>> {
        let due: Vec<TimerId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.frozen.is_none() && entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut expired: Vec<Expired<T>> = due
            .into_iter()
            .filter_map(|id| {
                self.entries.remove(&id).map(|entry| Expired {
                    id,
                    event: entry.event,
                    deadline: entry.deadline,
                    interval: entry.interval,
                })
            })
            .collect();
        expired.sort_by_key(|exp| exp.deadline);
        expired
    }

    /// Re-arms a popped timer under its original handle.
    ///
    /// The next deadline is the old deadline plus the interval, skipped
    /// forward by whole intervals if that point is already in the past.
    pub fn restore(&mut self, exp: Expired<T>, now: Instant) -> TimerId {
        let mut deadline = exp.deadline + exp.interval;
        if exp.interval.is_zero() {
            deadline = now;
        } else {
            while deadline <= now {
                deadline += exp.interval;
            }
        }
        self.entries.insert(
            exp.id,
            Entry {
                interval: exp.interval,
                deadline,
                frozen: None,
                event: exp.event,
            },
        );
        exp.id
    }

    /// Whether the handle still refers to a scheduled timer.
    pub fn contains(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of scheduled timers, frozen included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Wall-clock timestamp in seconds, as stamped into RPC requests and fault
/// records.
pub fn wall_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn fires_at_deadline() {
        let t0 = Instant::now();
        let mut timers = TimerService::new();
        let id = timers.add(t0, secs(10), "tick");

        assert!(timers.take_due(t0 + secs(9)).is_empty());
        let due = timers.take_due(t0 + secs(10));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);
        assert_eq!(due[0].event, "tick");
        assert!(timers.is_empty());
    }

    #[test]
    fn cancel_is_stale_safe() {
        let t0 = Instant::now();
        let mut timers = TimerService::new();
        let id = timers.add(t0, secs(1), ());
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
    }

    #[test]
    fn freeze_retains_remaining_time() {
        let t0 = Instant::now();
        let mut timers = TimerService::new();
        let id = timers.add(t0, secs(10), ());

        assert!(timers.freeze(id, t0 + secs(4)));
        assert_eq!(timers.pending(id, t0 + secs(4)), Some(secs(6)));
        // Frozen timers neither fire nor drive the sleep.
        assert!(timers.take_due(t0 + secs(60)).is_empty());
        assert_eq!(timers.next_deadline(), None);

        assert!(timers.thaw(id, t0 + secs(60)));
        assert_eq!(timers.pending(id, t0 + secs(60)), Some(secs(6)));
        assert_eq!(timers.take_due(t0 + secs(66)).len(), 1);
    }

    #[test]
    fn delay_extends_deadline() {
        let t0 = Instant::now();
        let mut timers = TimerService::new();
        let id = timers.add(t0, secs(10), ());

        assert!(timers.delay(id, secs(5)));
        assert!(timers.take_due(t0 + secs(10)).is_empty());
        assert_eq!(timers.take_due(t0 + secs(15)).len(), 1);
    }

    #[test]
    fn reset_restarts_full_interval() {
        let t0 = Instant::now();
        let mut timers = TimerService::new();
        let id = timers.add(t0, secs(10), ());

        assert!(timers.reset(id, t0 + secs(8)));
        assert!(timers.take_due(t0 + secs(10)).is_empty());
        assert_eq!(timers.pending(id, t0 + secs(8)), Some(secs(10)));
    }

    #[test]
    fn restore_is_period_aligned() {
        let t0 = Instant::now();
        let mut timers = TimerService::new();
        timers.add(t0, secs(10), ());

        // Fired late: the renewal aligns to the original period, not to the
        // moment of dispatch.
        let mut due = timers.take_due(t0 + secs(13));
        let exp = due.pop().unwrap();
        let id = timers.restore(exp, t0 + secs(13));
        assert_eq!(timers.pending(id, t0 + secs(13)), Some(secs(7)));

        // So late that whole periods elapsed: skip forward, stay on grid.
        let mut due = timers.take_due(t0 + secs(45));
        let exp = due.pop().unwrap();
        let id = timers.restore(exp, t0 + secs(45));
        assert_eq!(timers.pending(id, t0 + secs(45)), Some(secs(5)));
    }

    #[test]
    fn next_deadline_is_earliest() {
        let t0 = Instant::now();
        let mut timers = TimerService::new();
        timers.add(t0, secs(30), "slow");
        timers.add(t0, secs(5), "fast");
        assert_eq!(timers.next_deadline(), Some(t0 + secs(5)));
    }

    #[test]
    fn due_timers_pop_in_deadline_order() {
        let t0 = Instant::now();
        let mut timers = TimerService::new();
        timers.add(t0, secs(20), "second");
        timers.add(t0, secs(10), "first");

        let due = timers.take_due(t0 + secs(25));
        let order: Vec<&str> = due.iter().map(|e| e.event).collect();
        assert_eq!(order, ["first", "second"]);
    }
}
