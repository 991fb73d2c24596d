//! OS thread wrapper with a start barrier.
//!
//! A [`Thread`] differs from a bare [`std::thread`] spawn in one respect:
//! the constructor does not return until the new thread has published its
//! kernel thread id and name. Worker pools rely on this so that a freshly
//! started worker can immediately be addressed by tid (task pinning).

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::{Error, Result};

thread_local! {
    static TID: Cell<libc::pid_t> = Cell::new(-1);
    static NAME: RefCell<String> = RefCell::new(String::from("unknown"));
}

/// The kernel thread id (`SYS_gettid`) of the calling thread, cached after
/// the first call.
///
/// This is the id tasks are pinned to, not the pthread handle.
pub fn current_tid() -> libc::pid_t {
    TID.with(|tid| {
        if tid.get() == -1 {
            tid.set(unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t });
        }
        tid.get()
    })
}

/// The name the calling thread was registered under, or `"unknown"` for
/// threads not created through [`Thread::new`].
pub fn current_name() -> String {
    NAME.with(|name| name.borrow().clone())
}

pub(crate) fn set_current_name(name: &str) {
    NAME.with(|slot| *slot.borrow_mut() = name.into());
}

/// A counting semaphore built from a mutex and a condition variable.
///
/// Used as the start barrier between a [`Thread`] constructor and the thread
/// it spawns.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Blocks while the count is zero, then decrements it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Increments the count and wakes one waiter.
    pub fn signal(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}

struct StartInfo {
    sem: Semaphore,
    tid: AtomicI32,
}

/// An OS thread with a known kernel tid and a name.
///
/// Dropping a `Thread` without calling [`join`](Self::join) detaches it.
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    tid: libc::pid_t,
    name: String,
}

impl Thread {
    /// Spawns an OS thread running `cb` and waits until it has recorded its
    /// tid and name.
    ///
    /// The thread name is also applied at the OS level (visible in `ps`,
    /// truncated to the kernel's 15-character limit).
    pub fn new<F>(cb: F, name: impl Into<String>) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let info = Arc::new(StartInfo {
            sem: Semaphore::new(0),
            tid: AtomicI32::new(-1),
        });

        let thread_info = info.clone();
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                thread_info.tid.store(current_tid(), Ordering::Release);
                set_current_name(&thread_name);
                thread_info.sem.signal();
                drop(thread_info);
                cb();
            })
            .map_err(|inner| Error::ThreadSpawn {
                name: name.clone(),
                inner,
            })?;

        info.sem.wait();
        let tid = info.tid.load(Ordering::Acquire);

        Ok(Self {
            handle: Some(handle),
            tid,
            name,
        })
    }

    /// Waits for the thread to finish. Consumes the handle, so joining is
    /// once-only by construction.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("thread {} terminated by panic", self.name);
            }
        }
    }

    #[inline(always)]
    pub fn tid(&self) -> libc::pid_t {
        self.tid
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn tid_is_published_before_new_returns() {
        let (tx, rx) = mpsc::channel();
        let t = Thread::new(
            move || {
                tx.send(current_tid()).unwrap();
            },
            "barrier-test",
        )
        .unwrap();

        // The constructor already knows the tid, whether or not the thread
        // body has run yet.
        assert!(t.tid() > 0);
        assert_ne!(t.tid(), current_tid());
        let reported = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reported, t.tid());
        t.join();
    }

    #[test]
    fn name_is_visible_inside_the_thread() {
        let (tx, rx) = mpsc::channel();
        let t = Thread::new(
            move || {
                tx.send(current_name()).unwrap();
            },
            "named-worker",
        )
        .unwrap();
        assert_eq!(t.name(), "named-worker");
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "named-worker");
        t.join();
    }

    #[test]
    fn outside_threads_report_unknown() {
        std::thread::spawn(|| assert_eq!(current_name(), "unknown"))
            .join()
            .unwrap();
    }

    #[test]
    fn semaphore_orders_two_threads() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let (tx, rx) = mpsc::channel();
        let t = std::thread::spawn(move || {
            sem2.wait();
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        sem.signal();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        t.join().unwrap();
    }
}
