//! Deadline-ordered deferred callbacks.
//!
//! A [`TimerManager`] keeps timers ordered by absolute wall-clock deadline
//! (milliseconds) with the timer's unique id as tie-break, so distinct
//! timers sharing a deadline coexist. [`add_timer`](TimerManager::add_timer)
//! returns a [`Timer`] handle supporting [`cancel`](Timer::cancel),
//! [`refresh`](Timer::refresh) and [`reset`](Timer::reset).
//!
//! The manager does not run callbacks itself. A driver (the
//! [`Reactor`](crate::reactor)) polls
//! [`next_timeout`](TimerManager::next_timeout) to size its blocking wait
//! and collects due work with
//! [`expired_callbacks`](TimerManager::expired_callbacks). When an insert
//! produces a new front timer, a one-shot-installed notifier is invoked so
//! the driver can re-evaluate its wait; the `tickled` flag coalesces those
//! notifications until the next `next_timeout` call.
//!
//! Deadlines intentionally track the wall clock. A step back of more than
//! one hour is treated as a clock rollover and flushes every timer, which
//! trades early fires for the guarantee that no timer stalls forever.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::clock;

/// Shared, repeatedly callable timer callback.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

struct TimerData {
    period_ms: u64,
    deadline_ms: u64,
    recurring: bool,
    // None marks a cancelled (or drained one-shot) timer.
    cb: Option<TimerCallback>,
}

struct TimerState {
    id: u64,
    manager: Weak<ManagerInner>,
    data: Mutex<TimerData>,
}

struct TimerSet {
    entries: BTreeMap<(u64, u64), Arc<TimerState>>,
    previous_ms: u64,
}

impl TimerSet {
    // A wall clock step back of more than an hour counts as a rollover.
    // `previous_ms` is refreshed on every check.
    fn detect_rollover(&mut self, now_ms: u64) -> bool {
        let rollover = now_ms < self.previous_ms.saturating_sub(ROLLOVER_WINDOW_MS);
        self.previous_ms = now_ms;
        rollover
    }
}

struct ManagerInner {
    set: RwLock<TimerSet>,
    // Coalesces front-insert notifications until the next next_timeout().
    tickled: AtomicBool,
    next_id: AtomicU64,
    front_notify: OnceCell<Box<dyn Fn() + Send + Sync>>,
}

impl ManagerInner {
    fn insert(&self, state: &Arc<TimerState>) {
        let key = (state.data.lock().unwrap().deadline_ms, state.id);
        let at_front = {
            let mut set = self.set.write().unwrap();
            set.entries.insert(key, state.clone());
            *set.entries.keys().next().expect("set cannot be empty here") == key
        };
        if at_front && !self.tickled.swap(true, Ordering::SeqCst) {
            if let Some(notify) = self.front_notify.get() {
                notify();
            }
        }
    }
}

/// An ordered set of deferred callbacks keyed by absolute deadline.
#[derive(Clone)]
pub struct TimerManager {
    inner: Arc<ManagerInner>,
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            inner: Arc::new(ManagerInner {
                set: RwLock::new(TimerSet {
                    entries: BTreeMap::new(),
                    previous_ms: clock::time_ms(),
                }),
                tickled: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                front_notify: OnceCell::new(),
            }),
        }
    }

    /// Installs the callback invoked (outside the set lock) whenever an
    /// insert produced a new front timer. Once-only.
    pub(crate) fn set_front_notify(&self, f: impl Fn() + Send + Sync + 'static) {
        if self.inner.front_notify.set(Box::new(f)).is_err() {
            panic!("front notifier installed twice");
        }
    }

    /// Registers `cb` to fire once (or every, with `recurring`) `period`
    /// from now. Returns the handle controlling the timer.
    pub fn add_timer<F>(&self, period: Duration, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let period_ms = period.as_millis() as u64;
        let state = Arc::new(TimerState {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            manager: Arc::downgrade(&self.inner),
            data: Mutex::new(TimerData {
                period_ms,
                deadline_ms: clock::time_ms() + period_ms,
                recurring,
                cb: Some(Arc::new(cb)),
            }),
        });
        self.inner.insert(&state);
        Timer { state }
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only runs if
    /// `witness` can still be upgraded when the timer fires.
    pub fn add_condition_timer<F, T>(
        &self,
        period: Duration,
        cb: F,
        witness: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.add_timer(
            period,
            move || {
                if witness.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Time until the front timer is due: `None` when the set is empty,
    /// zero when it is already due. Clears the notification-coalescing
    /// flag.
    pub fn next_timeout(&self) -> Option<Duration> {
        let set = self.inner.set.read().unwrap();
        self.inner.tickled.store(false, Ordering::SeqCst);

        let &(deadline, _) = set.entries.keys().next()?;
        let now = clock::time_ms();
        if deadline <= now {
            Some(Duration::ZERO)
        } else {
            Some(Duration::from_millis(deadline - now))
        }
    }

    /// Removes every due timer and hands back its callback, in deadline
    /// order. Recurring timers are rescheduled at `now + period` (they
    /// drift forward, never backward); one-shots are cleared. A clock
    /// rollover drains the whole set.
    pub fn expired_callbacks(&self) -> Vec<TimerCallback> {
        let now = clock::time_ms();
        let mut set = self.inner.set.write().unwrap();
        let rollover = set.detect_rollover(now);

        let mut due = Vec::new();
        loop {
            let key = {
                match set.entries.keys().next() {
                    Some(&key) => key,
                    None => break,
                }
            };
            if !rollover && key.0 > now {
                break;
            }

            let state = set.entries.remove(&key).expect("front entry vanished");
            let mut data = state.data.lock().unwrap();
            if let Some(cb) = data.cb.clone() {
                if data.recurring {
                    data.deadline_ms = now + data.period_ms;
                    let next_key = (data.deadline_ms, state.id);
                    drop(data);
                    due.push(cb);
                    set.entries.insert(next_key, state);
                } else {
                    data.cb = None;
                    due.push(cb);
                }
            }
        }
        due
    }

    pub fn has_timer(&self) -> bool {
        !self.inner.set.read().unwrap().entries.is_empty()
    }

    #[cfg(test)]
    fn timer_count(&self) -> usize {
        self.inner.set.read().unwrap().entries.len()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered timer.
pub struct Timer {
    state: Arc<TimerState>,
}

impl Timer {
    /// Cancels the timer. Returns false when it was already cancelled (or
    /// was a one-shot that has fired).
    pub fn cancel(&self) -> bool {
        let manager = match self.state.manager.upgrade() {
            Some(manager) => manager,
            None => return false,
        };
        let mut set = manager.set.write().unwrap();
        let mut data = self.state.data.lock().unwrap();
        if data.cb.is_none() {
            return false;
        }
        data.cb = None;
        set.entries.remove(&(data.deadline_ms, self.state.id));
        true
    }

    /// Pushes the deadline to `now + period`. Never moves it earlier.
    /// Returns false when the timer is cancelled or no longer registered.
    pub fn refresh(&self) -> bool {
        let manager = match self.state.manager.upgrade() {
            Some(manager) => manager,
            None => return false,
        };
        let mut set = manager.set.write().unwrap();
        let mut data = self.state.data.lock().unwrap();
        if data.cb.is_none() {
            return false;
        }
        if set.entries.remove(&(data.deadline_ms, self.state.id)).is_none() {
            return false;
        }
        data.deadline_ms = clock::time_ms() + data.period_ms;
        set.entries
            .insert((data.deadline_ms, self.state.id), self.state.clone());
        true
    }

    /// Changes the period. With `from_now` the new deadline is anchored at
    /// the current time; otherwise at the timer's original start
    /// (`old_deadline - old_period`). An unchanged period without
    /// `from_now` is a no-op.
    pub fn reset(&self, period: Duration, from_now: bool) -> bool {
        let period_ms = period.as_millis() as u64;
        {
            let data = self.state.data.lock().unwrap();
            if period_ms == data.period_ms && !from_now {
                return true;
            }
        }

        let manager = match self.state.manager.upgrade() {
            Some(manager) => manager,
            None => return false,
        };
        {
            let mut set = manager.set.write().unwrap();
            let mut data = self.state.data.lock().unwrap();
            if data.cb.is_none() {
                return false;
            }
            if set.entries.remove(&(data.deadline_ms, self.state.id)).is_none() {
                return false;
            }
            let start = if from_now {
                clock::time_ms()
            } else {
                data.deadline_ms - data.period_ms
            };
            data.period_ms = period_ms;
            data.deadline_ms = start + period_ms;
        }
        manager.insert(&self.state);
        true
    }

    #[cfg(test)]
    fn deadline_ms(&self) -> u64 {
        self.state.data.lock().unwrap().deadline_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let bump = count.clone();
        (count, move || {
            bump.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn single_shot_fires_once_after_its_deadline() {
        let mgr = TimerManager::new();
        let (fired, bump) = counter();
        let _t = mgr.add_timer(ms(500), bump, false);

        sleep(ms(400));
        assert!(mgr.expired_callbacks().is_empty());

        sleep(ms(200));
        let due = mgr.expired_callbacks();
        assert_eq!(due.len(), 1);
        for cb in &due {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn recurring_timer_goes_quiet_after_cancel() {
        let mgr = TimerManager::new();
        let (fired, bump) = counter();
        let t = mgr.add_timer(ms(100), bump, true);

        for _ in 0..60 {
            sleep(ms(25));
            for cb in mgr.expired_callbacks() {
                cb();
            }
            if fired.load(Ordering::SeqCst) >= 3 {
                break;
            }
        }
        assert!(fired.load(Ordering::SeqCst) >= 3);

        assert!(t.cancel());
        let after_cancel = fired.load(Ordering::SeqCst);

        sleep(ms(250));
        assert!(mgr.expired_callbacks().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), after_cancel);
        assert!(!mgr.has_timer());
        assert!(!t.cancel());
    }

    #[test]
    fn reset_re_anchors_against_the_original_start() {
        let mgr = TimerManager::new();
        let t = mgr.add_timer(ms(200), || {}, false);
        let d0 = t.deadline_ms();

        sleep(ms(50));
        assert!(t.reset(ms(400), false));
        // Anchored at the original start: (d0 - 200) + 400.
        assert_eq!(t.deadline_ms(), d0 + 200);

        // Same period, not from_now: nothing to do.
        assert!(t.reset(ms(400), false));
        assert_eq!(t.deadline_ms(), d0 + 200);

        let now = clock::time_ms();
        assert!(t.reset(ms(400), true));
        let d2 = t.deadline_ms();
        assert!(d2 >= now + 400 && d2 <= now + 450);
    }

    #[test]
    fn refresh_only_moves_the_deadline_later() {
        let mgr = TimerManager::new();
        let t = mgr.add_timer(ms(500), || {}, false);
        let d0 = t.deadline_ms();

        sleep(ms(20));
        assert!(t.refresh());
        let d1 = t.deadline_ms();
        assert!(d1 > d0);

        assert!(t.refresh());
        assert!(t.deadline_ms() >= d1);

        assert!(t.cancel());
        assert!(!t.refresh());
    }

    #[test]
    fn equal_deadlines_coexist_in_the_set() {
        let mgr = TimerManager::new();
        let (fired, bump_a) = counter();
        let bump_b = {
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        };
        let t1 = mgr.add_timer(ms(50), bump_a, false);
        let t2 = mgr.add_timer(ms(50), bump_b, false);

        // Force byte-identical deadlines; only the id keeps them apart.
        {
            let mut set = mgr.inner.set.write().unwrap();
            set.entries.clear();
            for t in &[&t1, &t2] {
                let mut data = t.state.data.lock().unwrap();
                data.deadline_ms = 12_345;
                set.entries.insert((12_345, t.state.id), t.state.clone());
            }
            assert_eq!(set.entries.len(), 2);
        }

        let due = mgr.expired_callbacks();
        assert_eq!(due.len(), 2);
        for cb in &due {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rollover_flushes_the_whole_set() {
        let mgr = TimerManager::new();
        let (fired, bump) = counter();
        let _t = mgr.add_timer(Duration::from_secs(3_600), bump, false);
        assert_eq!(mgr.timer_count(), 1);

        // Pretend the last observation was two hours in the future.
        mgr.inner.set.write().unwrap().previous_ms = clock::time_ms() + 2 * ROLLOVER_WINDOW_MS;

        let due = mgr.expired_callbacks();
        assert_eq!(due.len(), 1);
        for cb in &due {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn next_timeout_reports_the_front_timer() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timeout(), None);

        let _far = mgr.add_timer(ms(10_000), || {}, false);
        let remaining = mgr.next_timeout().unwrap();
        assert!(remaining <= ms(10_000) && remaining >= ms(9_500));

        let _due = mgr.add_timer(ms(0), || {}, false);
        assert_eq!(mgr.next_timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn condition_timer_skips_a_dead_witness() {
        let mgr = TimerManager::new();
        let (fired, bump_live) = counter();
        let bump_dead = {
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        };

        let alive = Arc::new(());
        let _live = mgr.add_condition_timer(ms(10), bump_live, Arc::downgrade(&alive), false);
        let dead_witness = Arc::new(());
        let _dead =
            mgr.add_condition_timer(ms(10), bump_dead, Arc::downgrade(&dead_witness), false);
        drop(dead_witness);

        sleep(ms(30));
        for cb in mgr.expired_callbacks() {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn front_notifications_coalesce_until_observed() {
        let mgr = TimerManager::new();
        let (notified, bump) = counter();
        mgr.set_front_notify(bump);

        let _a = mgr.add_timer(ms(1_000), || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // New front, but the previous notification is still outstanding.
        let _b = mgr.add_timer(ms(500), || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        mgr.next_timeout();
        let _c = mgr.add_timer(ms(100), || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }
}
