//! N:M task scheduler.
//!
//! A [`Scheduler`] owns a FIFO of pending tasks and a pool of worker
//! threads consuming it. A task is either an existing [`Fiber`] or a plain
//! callback, which the popping worker wraps into a transient fiber. Tasks
//! may be pinned to one worker's kernel tid; everything else is
//! first-come, first-served.
//!
//! With `use_caller` the constructing thread is co-opted as a worker: a
//! dedicated *scheduler fiber* wrapping the run loop is created on it, and
//! [`stop`](Scheduler::stop) drains the queue on the caller before joining
//! the OS workers.
//!
//! The scheduler core knows nothing about I/O or timers. The pieces that
//! differ between a plain thread pool and a reactor (how to wake an idle
//! worker, what an idle worker does, when the pool may shut down) are a
//! capability set (the crate-private `Hooks` trait) consumed by the run
//! loop. The default set polls; the [`Reactor`](crate::reactor) installs
//! an epoll-backed one.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::error::Result;
use crate::fiber::{self, Fiber, State};
use crate::thread::{self, Thread};

/// Target tid meaning "any worker may run this task".
pub const ANY_THREAD: libc::pid_t = -1;

/// A boxed one-shot callback, the non-fiber flavour of a [`Task`].
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// What a scheduler queue slot holds.
pub enum Task {
    /// Resume an existing fiber.
    Fiber(Arc<Fiber>),
    /// Wrap the callback into a transient fiber and run it.
    Call(Callback),
}

impl Task {
    /// Convenience constructor boxing a closure.
    pub fn call<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Call(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Task {
        Task::Fiber(fiber)
    }
}

impl From<Callback> for Task {
    fn from(cb: Callback) -> Task {
        Task::Call(cb)
    }
}

struct ScheduledTask {
    task: Task,
    thread: libc::pid_t,
}

/// Wake/idle/shutdown capabilities consumed by the worker loop.
pub(crate) trait Hooks: Send + Sync + 'static {
    /// Wake one idle worker after an enqueue.
    fn tickle(&self, sched: &Scheduler);
    /// Body of the per-worker idle fiber; returns when the pool may stop.
    fn idle(&self, sched: &Scheduler);
    /// Whether the pool has nothing left to do and was asked to stop.
    fn stopping(&self, sched: &Scheduler) -> bool;
}

// Default capability set: idle workers nap and re-check the queue. No
// tickle is needed because every worker polls.
struct PollIdle;

const IDLE_POLL: Duration = Duration::from_millis(10);

impl Hooks for PollIdle {
    fn tickle(&self, _sched: &Scheduler) {}

    fn idle(&self, sched: &Scheduler) {
        while !self.stopping(sched) {
            std::thread::sleep(IDLE_POLL);
            fiber::yield_now();
        }
    }

    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.base_stopping()
    }
}

struct Shared {
    name: String,
    tasks: Mutex<VecDeque<ScheduledTask>>,
    threads: Mutex<Vec<Thread>>,
    // OS workers to spawn; excludes the co-opted caller.
    thread_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    started: AtomicBool,
    stopping: AtomicBool,
    stopped: AtomicBool,
    use_caller: bool,
    root_tid: libc::pid_t,
    scheduler_fiber: Mutex<Option<Arc<Fiber>>>,
    hooks: Arc<dyn Hooks>,
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Scheduler>> = RefCell::new(None);
}

/// Cheap-clone handle to a worker pool consuming a shared task queue.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Creates a scheduler with `threads` workers in total.
    ///
    /// With `use_caller`, the constructing thread counts as worker zero: it
    /// gets a main fiber and a dedicated scheduler fiber, one fewer OS
    /// thread is spawned, and the queue is drained on the caller during
    /// [`stop`](Self::stop). A thread can host at most one scheduler.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Scheduler {
        Self::with_hooks(threads, use_caller, name.into(), Arc::new(PollIdle))
    }

    pub(crate) fn with_hooks(
        threads: usize,
        use_caller: bool,
        name: String,
        hooks: Arc<dyn Hooks>,
    ) -> Scheduler {
        assert!(threads > 0, "a scheduler needs at least one thread");
        assert!(
            Scheduler::current().is_none(),
            "this thread already belongs to a scheduler"
        );

        let thread_count = if use_caller { threads - 1 } else { threads };
        let root_tid = if use_caller {
            thread::current_tid()
        } else {
            ANY_THREAD
        };

        let sched = Scheduler {
            shared: Arc::new(Shared {
                name,
                tasks: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_count,
                active: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                use_caller,
                root_tid,
                scheduler_fiber: Mutex::new(None),
                hooks,
            }),
        };

        if use_caller {
            Fiber::current();
            // Weak so the scheduler does not keep itself alive through its
            // own fiber.
            let weak = Arc::downgrade(&sched.shared);
            let scheduler_fiber = Fiber::new(
                move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.run();
                    }
                },
                0,
                false,
            );
            fiber::set_scheduler_fiber(&scheduler_fiber);
            *sched.shared.scheduler_fiber.lock().unwrap() = Some(scheduler_fiber);
            CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = Some(sched.clone()));
        }

        sched
    }

    /// The scheduler driving the calling thread, if any.
    pub fn current() -> Option<Scheduler> {
        CURRENT_SCHEDULER.with(|s| s.borrow().clone())
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueues a task for any worker. Non-blocking.
    pub fn schedule(&self, task: impl Into<Task>) {
        self.schedule_to(task, ANY_THREAD);
    }

    /// Enqueues a task pinned to the worker with kernel tid `thread`
    /// ([`ANY_THREAD`] lifts the pin).
    pub fn schedule_to(&self, task: impl Into<Task>, thread: libc::pid_t) {
        let need_tickle = {
            let mut tasks = self.shared.tasks.lock().unwrap();
            let was_empty = tasks.is_empty();
            tasks.push_back(ScheduledTask {
                task: task.into(),
                thread,
            });
            was_empty
        };
        // An empty queue means every worker may be asleep; a non-empty one
        // already has a wakeup in flight.
        if need_tickle {
            self.shared.hooks.tickle(self);
        }
    }

    /// Enqueues a closure for any worker.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_to(Task::call(f), ANY_THREAD);
    }

    /// Enqueues a closure pinned to the worker with kernel tid `thread`.
    pub fn spawn_to<F>(&self, f: F, thread: libc::pid_t)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_to(Task::call(f), thread);
    }

    /// Spawns the OS workers. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("scheduler {}: starting {} workers", self.shared.name, self.shared.thread_count);

        let mut threads = self.shared.threads.lock().unwrap();
        for i in 0..self.shared.thread_count {
            let shared = self.shared.clone();
            threads.push(Thread::new(
                move || shared.run(),
                format!("{}_{}", self.shared.name, i),
            )?);
        }
        Ok(())
    }

    /// Shuts the pool down: asks every worker to finish, drains the queue
    /// on the caller when `use_caller`, and joins all OS workers.
    ///
    /// Once-only; later calls return immediately. A caller-mode scheduler
    /// must be stopped from the thread that created it.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("scheduler {}: stopping", self.shared.name);
        self.shared.stopping.store(true, Ordering::SeqCst);

        let current = Scheduler::current();
        if self.shared.use_caller {
            assert!(
                current.map_or(false, |s| Arc::ptr_eq(&s.shared, &self.shared)),
                "caller-mode scheduler stopped from a foreign thread"
            );
        } else {
            assert!(
                current.map_or(true, |s| !Arc::ptr_eq(&s.shared, &self.shared)),
                "scheduler stopped from inside one of its own workers"
            );
        }

        for _ in 0..self.shared.thread_count {
            self.shared.hooks.tickle(self);
        }

        let scheduler_fiber = self.shared.scheduler_fiber.lock().unwrap().take();
        if let Some(fiber) = scheduler_fiber {
            self.shared.hooks.tickle(self);
            // The caller joins the pool: this returns once stopping() holds.
            fiber.resume();
        }

        let workers = std::mem::take(&mut *self.shared.threads.lock().unwrap());
        for worker in workers {
            worker.join();
        }

        if self.shared.use_caller {
            CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = None);
            fiber::reset_scheduler_fiber();
        }
        log::debug!("scheduler {}: stopped", self.shared.name);
    }

    /// Whether any worker is parked in its idle fiber right now. Racy by
    /// design; a stale answer only delays a wakeup until the next enqueue.
    #[inline(always)]
    pub fn has_idle_threads(&self) -> bool {
        self.shared.idle.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn downgrade(&self) -> WeakScheduler {
        WeakScheduler(Arc::downgrade(&self.shared))
    }

    /// Stop was requested, the queue is empty and no worker holds a task.
    pub(crate) fn base_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
            && self.shared.tasks.lock().unwrap().is_empty()
            && self.shared.active.load(Ordering::SeqCst) == 0
    }
}

/// Non-owning scheduler reference, for callbacks that must not keep the
/// pool alive.
#[derive(Clone)]
pub(crate) struct WeakScheduler(Weak<Shared>);

impl WeakScheduler {
    pub(crate) fn upgrade(&self) -> Option<Scheduler> {
        self.0.upgrade().map(|shared| Scheduler { shared })
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.shared.name)
            .field("threads", &self.shared.thread_count)
            .field("use_caller", &self.shared.use_caller)
            .finish_non_exhaustive()
    }
}

impl Shared {
    // The worker loop. Runs on every OS worker's main fiber and, for a
    // caller-mode scheduler, inside the dedicated scheduler fiber.
    fn run(self: &Arc<Shared>) {
        let tid = thread::current_tid();
        log::debug!("scheduler {}: worker {} enters the run loop", self.name, tid);

        let sched = Scheduler {
            shared: self.clone(),
        };
        CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = Some(sched.clone()));
        if tid != self.root_tid {
            // A plain worker's main fiber doubles as its scheduler fiber.
            Fiber::current();
        }

        let hooks = self.hooks.clone();
        let idle_sched = sched.clone();
        let idle_hooks = hooks.clone();
        let idle_fiber = Fiber::new(move || idle_hooks.idle(&idle_sched), 0, true);

        loop {
            let mut picked = None;
            let mut tickle_me = false;
            {
                let mut tasks = self.tasks.lock().unwrap();
                let mut i = 0;
                while i < tasks.len() {
                    let pinned = tasks[i].thread;
                    if pinned != ANY_THREAD && pinned != tid {
                        // Someone else has to take this one.
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                    picked = tasks.remove(i);
                    self.active.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me = tickle_me || !tasks.is_empty();
            }
            if tickle_me {
                hooks.tickle(&sched);
            }

            match picked {
                Some(ScheduledTask {
                    task: Task::Fiber(task_fiber),
                    ..
                }) => {
                    {
                        let _slice = task_fiber.guard.lock().unwrap();
                        if task_fiber.state() != State::Term {
                            task_fiber.resume();
                        }
                    }
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                Some(ScheduledTask {
                    task: Task::Call(cb),
                    ..
                }) => {
                    let task_fiber = Fiber::new(cb, 0, true);
                    {
                        let _slice = task_fiber.guard.lock().unwrap();
                        task_fiber.resume();
                    }
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    if idle_fiber.state() == State::Term {
                        log::debug!(
                            "scheduler {}: worker {} leaves the run loop",
                            self.name,
                            tid
                        );
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn caller_drains_in_fifo_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sched = Scheduler::new(1, true, "fifo");
        for i in 0..20 {
            let log = log.clone();
            sched.spawn(move || log.lock().unwrap().push(i));
        }
        sched.start().unwrap();
        sched.stop();
        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn workers_complete_every_task() {
        let sched = Scheduler::new(3, false, "pool");
        sched.start().unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let done = done.clone();
            sched.spawn(move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();
        assert_eq!(done.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn pinned_tasks_stay_on_their_thread() {
        let sched = Scheduler::new(2, false, "pinned");
        sched.start().unwrap();

        let (probe_tx, probe_rx) = mpsc::channel();
        sched.spawn(move || {
            probe_tx.send(thread::current_tid()).unwrap();
        });
        let target = probe_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("probe task never ran");

        let (tx, rx) = mpsc::channel();
        for _ in 0..8 {
            let tx = tx.clone();
            sched.spawn_to(
                move || {
                    tx.send(thread::current_tid()).unwrap();
                },
                target,
            );
        }
        for _ in 0..8 {
            let tid = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(tid, target);
        }
        sched.stop();
    }

    #[test]
    fn prebuilt_fibers_are_resumed() {
        let hit = Arc::new(AtomicUsize::new(0));
        let flag = hit.clone();
        let task_fiber = Fiber::new(
            move || {
                flag.fetch_add(1, Ordering::SeqCst);
            },
            0,
            true,
        );

        let sched = Scheduler::new(1, true, "fiber-task");
        sched.schedule(task_fiber.clone());
        sched.start().unwrap();
        sched.stop();

        assert_eq!(hit.load(Ordering::SeqCst), 1);
        assert_eq!(task_fiber.state(), State::Term);
    }

    #[test]
    fn tasks_can_schedule_more_tasks() {
        let sched = Scheduler::new(1, true, "nested");
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner_log = log.clone();
        let inner_sched = sched.clone();
        sched.spawn(move || {
            inner_log.lock().unwrap().push("outer");
            let log = inner_log.clone();
            inner_sched.spawn(move || log.lock().unwrap().push("inner"));
        });

        sched.start().unwrap();
        sched.stop();
        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[test]
    fn stop_is_idempotent() {
        let sched = Scheduler::new(2, false, "twice");
        sched.start().unwrap();
        sched.stop();
        sched.stop();
    }
}
