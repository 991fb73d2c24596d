//! Stackful fibers, a shared-queue scheduler and an epoll reactor.
//!
//! This library is the execution substrate for servers that want to write
//! blocking-style code while the process stays non-blocking underneath:
//! cooperative [fibers](fiber) are multiplexed M:N over a fixed pool of
//! worker threads, woken by fd readiness or timer deadlines.
//!
//! The layers, leaves first:
//!
//! - [Thread wrapper and semaphore](thread): OS threads with a known kernel
//!   tid and a start barrier.
//! - [Fibers](fiber): stackful coroutines with explicit resume/yield.
//! - [Scheduler](scheduler): a FIFO of fibers-or-callbacks drained by the
//!   worker pool, optionally including the constructing thread.
//! - [Timers](timer): deadline-ordered deferred callbacks with
//!   cancel/refresh/reset and clock-rollover protection.
//! - [Reactor](reactor): epoll on top of scheduler and timers, turning fd
//!   readiness and due deadlines into scheduled tasks.
//! - [Clock](clock) and [error](error) round things out.
//!
//! A task parks itself by arming an event and yielding; whoever causes the
//! wakeup (the kernel, a timer, or an explicit cancel) hands it back to
//! the scheduler:
//!
//! ```no_run
//! use strand::reactor::{Event, Reactor};
//!
//! fn main() -> strand::Result<()> {
//!     let reactor = Reactor::new(2, false, "demo")?;
//!     # let fd = 0;
//!     reactor.spawn({
//!         let reactor = reactor.clone();
//!         move || {
//!             reactor.add_event(fd, Event::READ).unwrap();
//!             strand::fiber::yield_now(); // parked until fd is readable
//!             // ... fd is ready here ...
//!         }
//!     });
//!     reactor.stop();
//!     Ok(())
//! }
//! ```
//!
//! Scheduling is strictly cooperative: between two yields a fiber owns its
//! worker, and nothing is ever preempted or stolen.

pub mod clock;
pub mod error;
pub mod fiber;
pub mod reactor;
pub mod scheduler;
pub mod thread;
pub mod timer;

pub use error::Result;
