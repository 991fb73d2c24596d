//! Readiness reactor over the scheduler and the timer manager.
//!
//! A [`Reactor`] couples a [`Scheduler`](crate::scheduler::Scheduler), a
//! [`TimerManager`](crate::timer::TimerManager) and an epoll instance. A
//! fiber (or plain callback) is parked on a file descriptor with
//! [`add_event`](Reactor::add_event); when the kernel reports readiness,
//! the waiter is handed back to its scheduler. Idle workers block inside
//! `epoll_wait` with the timeout sized by the next timer deadline, so the
//! same loop drives both I/O and timers.
//!
//! Registrations are edge-triggered and one-shot per arm: a fired event is
//! deregistered together with its waiter, and waiting again means arming
//! again. The workflow is: register an event, wait for it to become ready,
//! hand the waiter to the scheduler, deregister, run.
//!
//! Cross-thread wakeups ("tickles") are a byte written to a self-pipe that
//! every worker's epoll set contains. [`cancel_event`](Reactor::cancel_event)
//! fires a parked waiter as if its event had become ready, which is also
//! how timeouts are composed: a timer whose callback cancels the event.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::fiber::{self, Fiber, State};
use crate::scheduler::{Callback, Hooks, Scheduler, Task};
use crate::timer::{Timer, TimerManager};

bitflags::bitflags! {
    /// Readiness events a waiter can be parked on.
    pub struct Event: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

// One waiter slot: where to resume and what to resume.
#[derive(Default)]
struct EventContext {
    scheduler: Option<Scheduler>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<Callback>,
}

impl EventContext {
    fn is_armed(&self) -> bool {
        self.fiber.is_some() || self.cb.is_some()
    }

    fn clear(&mut self) {
        self.scheduler = None;
        self.fiber = None;
        self.cb = None;
    }
}

struct FdInner {
    // Union of the armed slots, mirrored into the kernel's interest list.
    events: Event,
    read: EventContext,
    write: EventContext,
}

impl FdInner {
    fn slot_mut(&mut self, event: Event) -> &mut EventContext {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }
}

struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> FdContext {
        FdContext {
            fd,
            inner: Mutex::new(FdInner {
                events: Event::empty(),
                read: EventContext::default(),
                write: EventContext::default(),
            }),
        }
    }
}

const INITIAL_CONTEXTS: usize = 32;
const MAX_EVENTS: usize = 256;
const MAX_TIMEOUT: Duration = Duration::from_millis(5_000);

struct IoShared {
    epfd: RawFd,
    tickle_rx: RawFd,
    tickle_tx: RawFd,
    // Armed-but-not-yet-fired waiter slots.
    pending: AtomicUsize,
    contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
    timers: TimerManager,
}

impl IoShared {
    fn new() -> Result<IoShared> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut pipe_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err.into());
        }

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe_fds[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) } < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
                libc::close(pipe_fds[0]);
                libc::close(pipe_fds[1]);
            }
            return Err(err.into());
        }

        let mut contexts = Vec::new();
        contexts.resize_with(INITIAL_CONTEXTS, || None);

        Ok(IoShared {
            epfd,
            tickle_rx: pipe_fds[0],
            tickle_tx: pipe_fds[1],
            pending: AtomicUsize::new(0),
            contexts: RwLock::new(contexts),
            timers: TimerManager::new(),
        })
    }

    fn context_of(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts
            .read()
            .unwrap()
            .get(fd as usize)
            .and_then(|slot| slot.clone())
    }

    fn context_or_grow(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "negative file descriptor");
        if let Some(ctx) = self.context_of(fd) {
            return ctx;
        }

        let mut contexts = self.contexts.write().unwrap();
        let idx = fd as usize;
        if idx >= contexts.len() {
            let new_len = std::cmp::max(idx + 1, contexts.len() * 3 / 2);
            contexts.resize_with(new_len, || None);
        }
        contexts[idx]
            .get_or_insert_with(|| Arc::new(FdContext::new(fd)))
            .clone()
    }

    fn epoll_update(&self, op: libc::c_int, fd: RawFd, events: Event) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: events.bits() | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        let ev_ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut ev
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, ev_ptr) } < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    // Hands the armed waiter to its scheduler and clears the slot. The
    // caller has already removed the event from the kernel's interest list.
    fn trigger(&self, inner: &mut FdInner, event: Event) {
        debug_assert!(inner.events.contains(event));
        inner.events -= event;

        let slot = inner.slot_mut(event);
        let sched = slot
            .scheduler
            .take()
            .expect("armed event slot without a scheduler");
        if let Some(cb) = slot.cb.take() {
            sched.schedule(Task::Call(cb));
        } else if let Some(waiter) = slot.fiber.take() {
            sched.schedule(waiter);
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    fn dispatch(&self, fd: RawFd, revents: u32) {
        let ctx = match self.context_of(fd) {
            Some(ctx) => ctx,
            None => return,
        };
        let mut inner = ctx.inner.lock().unwrap();

        let mut revents = revents;
        // A bare error/hangup must still unblock whoever is parked here.
        if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events.bits();
        }

        let mut fired = Event::empty();
        if revents & libc::EPOLLIN as u32 != 0 {
            fired |= Event::READ;
        }
        if revents & libc::EPOLLOUT as u32 != 0 {
            fired |= Event::WRITE;
        }
        fired &= inner.events;
        if fired.is_empty() {
            return;
        }

        let left = inner.events - fired;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if let Err(err) = self.epoll_update(op, fd, left) {
            log::error!("re-arming fd {} failed: {}", fd, err);
            return;
        }

        if fired.contains(Event::READ) {
            self.trigger(&mut inner, Event::READ);
        }
        if fired.contains(Event::WRITE) {
            self.trigger(&mut inner, Event::WRITE);
        }
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.tickle_rx,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Hooks for IoShared {
    // Wake a blocked epoll_wait. Skipped when nobody is parked there; the
    // idle count is read racily and a miss self-heals on the next enqueue.
    fn tickle(&self, sched: &Scheduler) {
        if !sched.has_idle_threads() {
            return;
        }
        let byte = [b'T'];
        let rc = unsafe { libc::write(self.tickle_tx, byte.as_ptr() as *const libc::c_void, 1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // A full pipe already guarantees a pending wakeup.
            if err.kind() != io::ErrorKind::WouldBlock {
                log::error!("tickle write failed: {}", err);
            }
        }
    }

    fn stopping(&self, sched: &Scheduler) -> bool {
        !self.timers.has_timer()
            && self.pending.load(Ordering::SeqCst) == 0
            && sched.base_stopping()
    }

    // Body of every worker's idle fiber: block in epoll_wait, drain due
    // timers, dispatch readiness, yield back to the run loop.
    fn idle(&self, sched: &Scheduler) {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            if self.stopping(sched) {
                log::debug!("reactor {}: idle fiber exits", sched.name());
                break;
            }

            let timeout = self
                .timers
                .next_timeout()
                .map_or(MAX_TIMEOUT, |d| d.min(MAX_TIMEOUT));
            let ready = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    timeout.as_millis() as libc::c_int,
                )
            };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                log::error!("epoll_wait failed: {}", err);
                fiber::yield_now();
                continue;
            }

            for cb in self.timers.expired_callbacks() {
                sched.spawn(move || cb());
            }

            for ev in &events[..ready as usize] {
                let fd = ev.u64 as RawFd;
                if fd == self.tickle_rx {
                    self.drain_tickle_pipe();
                    continue;
                }
                self.dispatch(fd, ev.events);
            }

            fiber::yield_now();
        }
    }
}

impl Drop for IoShared {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_rx);
            libc::close(self.tickle_tx);
        }
    }
}

/// Scheduler + timers + epoll, as one cheap-clone handle.
///
/// Clones share the same reactor; callbacks keep a clone around to arm
/// further events from inside the pool.
#[derive(Clone)]
pub struct Reactor {
    sched: Scheduler,
    io: Arc<IoShared>,
}

impl Reactor {
    /// Builds the epoll instance and the self-pipe, wires the timer
    /// manager's front-insert notification to the tickle pipe, and starts
    /// `threads` workers (the caller being one of them with `use_caller`).
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Result<Reactor> {
        let io = Arc::new(IoShared::new()?);
        let sched = Scheduler::with_hooks(threads, use_caller, name.into(), io.clone());

        // Weak on both ends: the notifier lives inside `io` and must keep
        // neither the reactor nor the pool alive.
        let weak_io = Arc::downgrade(&io);
        let weak_sched = sched.downgrade();
        io.timers.set_front_notify(move || {
            if let (Some(io), Some(sched)) = (weak_io.upgrade(), weak_sched.upgrade()) {
                io.tickle(&sched);
            }
        });

        sched.start()?;
        Ok(Reactor { sched, io })
    }

    #[inline(always)]
    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    #[inline(always)]
    pub fn timers(&self) -> &TimerManager {
        &self.io.timers
    }

    /// Parks the currently running fiber on `event` of `fd`. The fiber is
    /// rescheduled exactly once, when the event fires or is cancelled; it
    /// must yield after arming to actually wait.
    pub fn add_event(&self, fd: RawFd, event: Event) -> Result<()> {
        self.add(fd, event, None)
    }

    /// Like [`add_event`](Self::add_event), but schedules `cb` instead of
    /// resuming the calling fiber.
    pub fn add_event_with<F>(&self, fd: RawFd, event: Event, cb: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add(fd, event, Some(Box::new(cb)))
    }

    fn add(&self, fd: RawFd, event: Event, cb: Option<Callback>) -> Result<()> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "exactly one event bit must be armed at a time"
        );

        let ctx = self.io.context_or_grow(fd);
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events.contains(event) {
            log::error!("fd {} already has a waiter for {:?}", fd, event);
            return Err(Error::EventRegistered { fd, event });
        }

        let op = if inner.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let new_events = inner.events | event;
        self.io.epoll_update(op, fd, new_events).map_err(Error::Io)?;

        self.io.pending.fetch_add(1, Ordering::SeqCst);
        inner.events = new_events;

        let slot = inner.slot_mut(event);
        debug_assert!(!slot.is_armed());
        slot.scheduler = Some(Scheduler::current().unwrap_or_else(|| self.sched.clone()));
        match cb {
            Some(cb) => slot.cb = Some(cb),
            None => {
                let waiter = Fiber::current();
                debug_assert_eq!(waiter.state(), State::Running);
                slot.fiber = Some(waiter);
            }
        }
        Ok(())
    }

    /// Disarms `event` on `fd` without waking the waiter. Returns false
    /// when no such registration exists.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "exactly one event bit must be disarmed at a time"
        );

        let ctx = match self.io.context_of(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }

        let left = inner.events - event;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if let Err(err) = self.io.epoll_update(op, fd, left) {
            log::error!("disarming fd {} failed: {}", ctx.fd, err);
            return false;
        }

        inner.events = left;
        inner.slot_mut(event).clear();
        self.io.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Disarms `event` on `fd` and fires its waiter as if the event had
    /// become ready. Returns false when no such registration exists.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "exactly one event bit must be cancelled at a time"
        );

        let ctx = match self.io.context_of(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }

        let left = inner.events - event;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if let Err(err) = self.io.epoll_update(op, fd, left) {
            log::error!("cancelling fd {} failed: {}", ctx.fd, err);
            return false;
        }

        self.io.trigger(&mut inner, event);
        true
    }

    /// Fires and disarms every waiter on `fd`. Returns false when the fd
    /// has no registrations.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = match self.io.context_of(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events.is_empty() {
            return false;
        }

        if let Err(err) = self.io.epoll_update(libc::EPOLL_CTL_DEL, fd, Event::empty()) {
            log::error!("cancelling fd {} failed: {}", ctx.fd, err);
            return false;
        }

        if inner.events.contains(Event::READ) {
            self.io.trigger(&mut inner, Event::READ);
        }
        if inner.events.contains(Event::WRITE) {
            self.io.trigger(&mut inner, Event::WRITE);
        }
        debug_assert!(inner.events.is_empty());
        true
    }

    /// Armed waiters that have not fired yet.
    pub fn pending_events(&self) -> usize {
        self.io.pending.load(Ordering::SeqCst)
    }

    /// See [`TimerManager::add_timer`]; the callback is run as a scheduler
    /// task when it comes due.
    pub fn add_timer<F>(&self, period: Duration, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.io.timers.add_timer(period, cb, recurring)
    }

    /// See [`TimerManager::add_condition_timer`].
    pub fn add_condition_timer<F, T>(
        &self,
        period: Duration,
        cb: F,
        witness: std::sync::Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.io.timers.add_condition_timer(period, cb, witness, recurring)
    }

    /// Enqueues a closure on the reactor's scheduler.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.spawn(f);
    }

    /// Enqueues a task on the reactor's scheduler.
    pub fn schedule(&self, task: impl Into<Task>) {
        self.sched.schedule(task);
    }

    /// Stops the underlying scheduler. The pool only winds down once every
    /// armed event has fired or been cancelled and no timers remain, so
    /// outstanding registrations and recurring timers keep it alive.
    pub fn stop(&self) {
        self.sched.stop();
    }

    #[cfg(test)]
    fn registered_events(&self, fd: RawFd) -> Event {
        self.io
            .context_of(fd)
            .map(|ctx| ctx.inner.lock().unwrap().events)
            .unwrap_or_else(Event::empty)
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("scheduler", &self.sched)
            .field("pending_events", &self.pending_events())
            .finish_non_exhaustive()
    }
}
