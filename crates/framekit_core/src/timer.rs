//! Single-threaded timer scheduler.
//!
//! Timers live in a binary min-heap ordered by deadline. Cancellation is
//! lazy: a cancelled id is forgotten, and its heap entry is skipped when it
//! surfaces. The owner drives the scheduler by calling [`TimerScheduler::update`]
//! once per frame.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use tracing::trace;

/// Identifies a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Returns the raw id.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Timer ids are unique across schedulers so timers can move between them.
static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Callback invoked when a timer expires.
pub type TimerCallback = Box<dyn FnMut() + Send>;

struct TimerEntry {
    deadline: Instant,
    id: TimerId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the std max-heap pops the earliest deadline first; ties go
    // to the timer scheduled first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct TimerState {
    period: Option<Duration>,
    callback: TimerCallback,
}

/// Deadline-ordered one-shot and periodic timers.
pub struct TimerScheduler {
    heap: BinaryHeap<TimerEntry>,
    timers: HashMap<TimerId, TimerState>,
}

impl TimerScheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            timers: HashMap::new(),
        }
    }

    /// Schedule `callback` to run `delay` from now.
    ///
    /// With `period` set, the timer re-arms itself after each expiry.
    pub fn schedule(
        &mut self,
        delay: Duration,
        period: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerId {
        self.schedule_at(Instant::now() + delay, period, callback)
    }

    /// Schedule `callback` to run at `deadline`.
    pub fn schedule_at(
        &mut self,
        deadline: Instant,
        period: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerId {
        let id = TimerId(NEXT_TIMER_ID.fetch_add(1, AtomicOrdering::Relaxed));
        self.timers.insert(id, TimerState { period, callback });
        self.heap.push(TimerEntry { deadline, id });
        trace!(timer = id.0, "timer scheduled");
        id
    }

    /// Cancel a timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.timers.remove(&id).is_some()
    }

    /// Run every timer whose deadline is at or before `now`.
    ///
    /// Returns the number of callbacks invoked. A periodic timer fires at most
    /// once per call even if several periods have elapsed.
    pub fn update(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        let mut rearm = Vec::new();

        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let Some(entry) = self.heap.pop() else { break };
            let Some(state) = self.timers.get_mut(&entry.id) else {
                continue;
            };
            (state.callback)();
            fired += 1;
            match state.period {
                Some(period) => rearm.push(TimerEntry {
                    deadline: now + period,
                    id: entry.id,
                }),
                None => {
                    self.timers.remove(&entry.id);
                }
            }
        }

        self.heap.extend(rearm);
        fired
    }

    /// Returns the earliest live deadline, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap
            .iter()
            .filter(|e| self.timers.contains_key(&e.id))
            .map(|e| e.deadline)
            .min()
    }

    /// Returns the number of live timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Returns `true` if no timers are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Move every live timer of `other` into this scheduler. Ids, deadlines
    /// and periods are kept.
    pub fn append(&mut self, other: &mut TimerScheduler) {
        for entry in other.heap.drain() {
            if let Some(state) = other.timers.remove(&entry.id) {
                self.timers.insert(entry.id, state);
                self.heap.push(entry);
            }
        }
        other.timers.clear();
    }

    /// Cancel every timer.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.timers.clear();
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TimerScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerScheduler")
            .field("live", &self.timers.len())
            .field("queued", &self.heap.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn test_fires_in_deadline_order() {
        let mut timers = TimerScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();
        for (n, ms) in [(1, 30), (2, 10), (3, 20)] {
            let log = Arc::clone(&log);
            timers.schedule_at(
                start + Duration::from_millis(ms),
                None,
                Box::new(move || log.lock().push(n)),
            );
        }
        assert_eq!(timers.update(start + Duration::from_millis(25)), 2);
        assert_eq!(*log.lock(), vec![2, 3]);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.update(start + Duration::from_millis(30)), 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mut timers = TimerScheduler::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let start = Instant::now();
        let id = timers.schedule_at(start, None, Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert_eq!(timers.update(start + Duration::from_secs(1)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(timers.next_deadline().is_none());
    }

    #[test]
    fn test_periodic_timer_rearms() {
        let mut timers = TimerScheduler::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let start = Instant::now();
        let period = Duration::from_millis(10);
        let id = timers.schedule_at(start, Some(period), Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(timers.update(start), 1);
        assert_eq!(timers.next_deadline(), Some(start + period));
        assert_eq!(timers.update(start + Duration::from_millis(5)), 0);
        assert_eq!(timers.update(start + period), 1);
        assert!(timers.cancel(id));
        assert_eq!(timers.update(start + Duration::from_secs(1)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_append_moves_live_timers() {
        let mut from = TimerScheduler::new();
        let mut into = TimerScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let l = Arc::clone(&log);
        let kept = from.schedule_at(start, None, Box::new(move || l.lock().push("kept")));
        let dropped = from.schedule_at(start, None, Box::new(|| {}));
        assert!(from.cancel(dropped));
        let l = Arc::clone(&log);
        into.schedule_at(start + Duration::from_millis(5), None, Box::new(move || l.lock().push("own")));

        into.append(&mut from);
        assert!(from.is_empty());
        assert_eq!(into.len(), 2);
        assert_eq!(into.next_deadline(), Some(start));

        assert!(into.cancel(kept));
        assert_eq!(into.update(start + Duration::from_millis(5)), 1);
        assert_eq!(*log.lock(), vec!["own"]);
    }
}
