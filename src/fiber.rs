//! Stackful cooperative coroutines.
//!
//! A [`Fiber`] owns a heap-allocated stack and a saved machine context and
//! is multiplexed onto OS threads by a [`Scheduler`](crate::scheduler).
//! Control transfer is explicit: [`resume`](Fiber::resume) switches into a
//! fiber, [`yield_now`](Fiber::yield_now) switches back out. Nothing is
//! preempted.
//!
//! A fiber has three states: **Ready** (may be resumed), **Running**
//! (executing on some thread right now) and **Term** (its callback
//! returned). A Term fiber with a heap stack can be recycled with
//! [`reset`](Fiber::reset) instead of paying for a new allocation.
//!
//! Every thread that touches fibers has a *main fiber* representing its
//! native stack, created lazily by [`Fiber::current`], and a *scheduler
//! fiber* slot naming the context that `run_in_scheduler` fibers swap
//! against. Until a scheduler takes over a thread, both point at the main
//! fiber.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::{Cell, RefCell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Stack size used when a fiber is created with `stack_size == 0`.
pub const DEFAULT_STACK_SIZE: usize = 128_000;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // Raw pointer to the fiber currently executing on this thread.
    static CURRENT: Cell<*const Fiber> = Cell::new(ptr::null());
    // Owning handle to this thread's main fiber; keeps CURRENT/SCHEDULER
    // valid whenever they point at it.
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    // The context `run_in_scheduler` fibers swap against. Defaults to the
    // main fiber; a scheduler that co-opts the thread overrides it.
    static SCHEDULER_FIBER: Cell<*const Fiber> = Cell::new(ptr::null());
}

/// Execution state of a fiber.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// May be resumed.
    Ready = 0,
    /// Executing on some thread.
    Running = 1,
    /// The callback returned; only [`Fiber::reset`] can revive it.
    Term = 2,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Ready,
            1 => State::Running,
            2 => State::Term,
            _ => unreachable!("invalid fiber state {}", v),
        }
    }
}

struct Stack {
    ptr: *mut u8,
    layout: Layout,
}

impl Stack {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, 16).expect("bad stack size");
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        Self { ptr, layout }
    }

    #[inline(always)]
    fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// A stackful coroutine.
///
/// Fibers are handled through `Arc<Fiber>`: the scheduler queue, event
/// slots and timer callbacks all keep strong handles, and a fiber may
/// migrate between worker threads through the queue between two
/// suspensions.
pub struct Fiber {
    id: u64,
    run_in_scheduler: bool,
    state: AtomicU8,
    // Boxed because glibc's ucontext_t points into itself (the fpstate
    // area); the allocation must not move once getcontext has run.
    ctx: UnsafeCell<Box<libc::ucontext_t>>,
    stack: Option<Stack>,
    cb: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    // Held by a worker for the whole run slice; a second worker that pops
    // the same fiber blocks here until the first slice has yielded.
    pub(crate) guard: Mutex<()>,
}

// SAFETY: `state` is atomic. `ctx`, `stack` and `cb` are only touched by
// the thread currently holding the fiber's run slice: the resuming thread
// before the switch, the fiber's own thread during it. Hand-over between
// threads always goes through a lock (scheduler queue, event slot or timer
// set), which provides the necessary ordering.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a fiber running `cb` on its own stack.
    ///
    /// `stack_size == 0` selects [`DEFAULT_STACK_SIZE`]. When
    /// `run_in_scheduler` is true, resume/yield swap against the thread's
    /// scheduler fiber; otherwise directly against the thread's main fiber.
    /// The new fiber starts out Ready; nothing runs until
    /// [`resume`](Self::resume).
    pub fn new<F>(cb: F, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        let stack = Stack::new(size);

        let mut ctx: Box<libc::ucontext_t> = Box::new(unsafe { std::mem::zeroed() });
        let rc = unsafe { libc::getcontext(&mut *ctx) };
        assert_eq!(rc, 0, "getcontext failed");
        ctx.uc_link = ptr::null_mut();
        ctx.uc_stack.ss_sp = stack.ptr as *mut libc::c_void;
        ctx.uc_stack.ss_size = stack.size();
        unsafe { libc::makecontext(&mut *ctx, trampoline, 0) };

        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            run_in_scheduler,
            state: AtomicU8::new(State::Ready as u8),
            ctx: UnsafeCell::new(ctx),
            stack: Some(stack),
            cb: UnsafeCell::new(Some(Box::new(cb))),
            guard: Mutex::new(()),
        })
    }

    // The main fiber of the calling thread: no heap stack, already Running.
    fn new_main() -> Fiber {
        let mut ctx: Box<libc::ucontext_t> = Box::new(unsafe { std::mem::zeroed() });
        let rc = unsafe { libc::getcontext(&mut *ctx) };
        assert_eq!(rc, 0, "getcontext failed");

        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            run_in_scheduler: false,
            state: AtomicU8::new(State::Running as u8),
            ctx: UnsafeCell::new(ctx),
            stack: None,
            cb: UnsafeCell::new(None),
            guard: Mutex::new(()),
        }
    }

    /// Returns a strong handle to the fiber currently running on this
    /// thread, lazily creating the thread's main fiber on first use.
    pub fn current() -> Arc<Fiber> {
        let ptr = CURRENT.with(|c| c.get());
        if !ptr.is_null() {
            // SAFETY: CURRENT always mirrors Arc::as_ptr of a handle that
            // outlives the run slice (the main-fiber slot, the scheduler's
            // fiber, or the queue/event-slot handle of a task fiber).
            unsafe {
                Arc::increment_strong_count(ptr);
                return Arc::from_raw(ptr);
            }
        }

        let main = Arc::new(Fiber::new_main());
        let raw = Arc::as_ptr(&main);
        CURRENT.with(|c| c.set(raw));
        SCHEDULER_FIBER.with(|s| s.set(raw));
        THREAD_FIBER.with(|t| *t.borrow_mut() = Some(main.clone()));
        main
    }

    /// The id of the fiber running on this thread, or `u64::MAX` when the
    /// thread has not touched fibers yet.
    pub fn current_id() -> u64 {
        let ptr = CURRENT.with(|c| c.get());
        if ptr.is_null() {
            u64::MAX
        } else {
            unsafe { (*ptr).id }
        }
    }

    /// Number of live fibers in the process, main fibers included.
    pub fn count() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Switches execution into this fiber.
    ///
    /// The fiber must be Ready. The call returns when the fiber yields or
    /// terminates; until then the calling context is parked inside the
    /// fiber's swap target (scheduler or main fiber of the current thread).
    pub fn resume(self: &Arc<Self>) {
        assert_eq!(
            self.state(),
            State::Ready,
            "resume of fiber {} in state {:?}",
            self.id,
            self.state()
        );
        ensure_thread_fiber();
        self.set_state(State::Running);

        let target = self.swap_target();
        assert!(!target.is_null(), "no context to resume from");
        CURRENT.with(|c| c.set(Arc::as_ptr(self)));
        unsafe { switch(target, Arc::as_ptr(self)) };
    }

    /// Suspends this fiber, switching back to the context that resumed it.
    ///
    /// Valid while Running (the fiber becomes Ready and may be resumed
    /// again) or Term (the final switch out of the trampoline).
    pub fn yield_now(&self) {
        let state = self.state();
        assert!(
            state == State::Running || state == State::Term,
            "yield of fiber {} in state {:?}",
            self.id,
            state
        );
        if state != State::Term {
            self.set_state(State::Ready);
        }

        let target = self.swap_target();
        assert!(!target.is_null(), "no context to yield to");
        CURRENT.with(|c| c.set(target));
        unsafe { switch(self as *const Fiber, target) };
    }

    /// Reinitialises a Term fiber with a new callback on the existing
    /// stack, making it Ready again.
    pub fn reset<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = self.stack.as_ref().expect("reset of a main fiber");
        assert_eq!(
            self.state(),
            State::Term,
            "reset of fiber {} in state {:?}",
            self.id,
            self.state()
        );

        unsafe {
            *self.cb.get() = Some(Box::new(cb));
            let ctx = &mut **self.ctx.get();
            let rc = libc::getcontext(ctx);
            assert_eq!(rc, 0, "getcontext failed");
            ctx.uc_link = ptr::null_mut();
            ctx.uc_stack.ss_sp = stack.ptr as *mut libc::c_void;
            ctx.uc_stack.ss_size = stack.size();
            libc::makecontext(ctx, trampoline, 0);
        }
        self.set_state(State::Ready);
    }

    // The context this fiber swaps against in resume/yield.
    fn swap_target(&self) -> *const Fiber {
        if self.run_in_scheduler {
            SCHEDULER_FIBER.with(|s| s.get())
        } else {
            THREAD_FIBER.with(|t| {
                t.borrow()
                    .as_ref()
                    .map(|f| Arc::as_ptr(f))
                    .unwrap_or(ptr::null())
            })
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Suspends the fiber currently running on this thread.
///
/// See [`Fiber::yield_now`]. Deliberately takes no strong handle: a handle
/// held across the switch would leak if the fiber were never resumed again.
pub fn yield_now() {
    let ptr = CURRENT.with(|c| c.get());
    assert!(!ptr.is_null(), "yield_now outside of a fiber context");
    unsafe { (*ptr).yield_now() };
}

/// Installs `f` as the swap target for `run_in_scheduler` fibers on this
/// thread. The caller keeps `f` alive until the slot is reset.
pub(crate) fn set_scheduler_fiber(f: &Arc<Fiber>) {
    SCHEDULER_FIBER.with(|s| s.set(Arc::as_ptr(f)));
}

/// Points the scheduler-fiber slot back at the thread's main fiber.
pub(crate) fn reset_scheduler_fiber() {
    let main = THREAD_FIBER.with(|t| {
        t.borrow()
            .as_ref()
            .map(|f| Arc::as_ptr(f))
            .unwrap_or(ptr::null())
    });
    SCHEDULER_FIBER.with(|s| s.set(main));
}

fn ensure_thread_fiber() {
    let missing = THREAD_FIBER.with(|t| t.borrow().is_none());
    if missing {
        drop(Fiber::current());
    }
}

// SAFETY: both pointers name live fibers (kept alive by their owners for
// the duration of the switch); only this thread touches either context.
unsafe fn switch(save: *const Fiber, restore: *const Fiber) {
    let save_ctx: *mut libc::ucontext_t = &mut **(*save).ctx.get();
    let restore_ctx: *const libc::ucontext_t = &**(*restore).ctx.get();
    let rc = libc::swapcontext(save_ctx, restore_ctx);
    assert_eq!(rc, 0, "swapcontext failed");
}

// Entry point of every non-main fiber. Runs the callback, marks the fiber
// Term and switches out for the last time. The strong handle is dropped
// before that final switch so the fiber can be freed from another stack.
// A panic in the callback cannot unwind past this frame; it aborts, which
// is the documented fate of a worker whose task throws.
extern "C" fn trampoline() {
    let current = Fiber::current();
    let cb = unsafe { (*current.cb.get()).take() }.expect("fiber entered without a callback");
    cb();

    current.set_state(State::Term);
    let raw = Arc::as_ptr(&current);
    drop(current);
    unsafe { (*raw).yield_now() };
    unreachable!("terminated fiber was resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn fibers_run_in_creation_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut fibers = Vec::new();
        for i in 0..20 {
            let log = log.clone();
            fibers.push(Fiber::new(
                move || log.lock().unwrap().push(i),
                0,
                false,
            ));
        }

        Fiber::current();
        for f in &fibers {
            f.resume();
        }

        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
        for f in &fibers {
            assert_eq!(f.state(), State::Term);
        }
    }

    #[test]
    fn yield_suspends_and_resume_continues() {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let inner = steps.clone();
        let f = Fiber::new(
            move || {
                inner.lock().unwrap().push("first");
                yield_now();
                inner.lock().unwrap().push("second");
            },
            0,
            false,
        );

        f.resume();
        assert_eq!(*steps.lock().unwrap(), vec!["first"]);
        assert_eq!(f.state(), State::Ready);

        f.resume();
        assert_eq!(*steps.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(f.state(), State::Term);
    }

    #[test]
    fn reset_recycles_the_stack() {
        let f = Fiber::new(|| {}, 0, false);
        f.resume();
        assert_eq!(f.state(), State::Term);
        let id = f.id();

        let hit = Arc::new(AtomicBool::new(false));
        let flag = hit.clone();
        f.reset(move || flag.store(true, Ordering::Relaxed));
        assert_eq!(f.state(), State::Ready);

        f.resume();
        assert_eq!(f.state(), State::Term);
        assert!(hit.load(Ordering::Relaxed));
        assert_eq!(f.id(), id);
    }

    #[test]
    fn current_points_at_the_running_fiber() {
        let seen = Arc::new(Mutex::new((u64::MAX, State::Term)));
        let out = seen.clone();
        let f = Fiber::new(
            move || {
                let me = Fiber::current();
                *out.lock().unwrap() = (me.id(), me.state());
            },
            0,
            false,
        );
        let expected = f.id();
        f.resume();

        let (id, state) = *seen.lock().unwrap();
        assert_eq!(id, expected);
        assert_eq!(state, State::Running);
    }

    #[test]
    fn main_fiber_is_created_once() {
        let a = Fiber::current();
        let b = Fiber::current();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.state(), State::Running);
        assert_eq!(Fiber::current_id(), a.id());
        assert!(a.stack.is_none());
    }

    #[test]
    fn custom_stack_size_is_honoured() {
        let f = Fiber::new(|| {}, 256 * 1024, false);
        assert_eq!(f.stack.as_ref().unwrap().size(), 256 * 1024);
        let d = Fiber::new(|| {}, 0, false);
        assert_eq!(d.stack.as_ref().unwrap().size(), DEFAULT_STACK_SIZE);
        // Leave no Ready fibers behind: run them to completion.
        f.resume();
        d.resume();
    }
}
