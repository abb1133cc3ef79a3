//! Cooperative M:N fiber scheduling runtime.
//!
//! This library multiplexes lightweight user-space tasks ("fibers") with
//! their own stacks over a fixed pool of OS threads:
//!
//! - [Fibers: stackful coroutines with explicit symmetric switching](fiber)
//! - [Scheduler: the dispatch loop, affinity and shutdown protocol](scheduler)
//! - [Threads: named OS threads with a startup hand-shake](mod@thread)
//! - [Synchronization: semaphore and spinlock](sync)
//! - [Configuration registry](config) (`fiber.stack_size`, `log.level`, ...)
//! - [Logging](mod@log) (see <https://docs.rs/log/>)
//! - [Error handling](error)
//!
//! Scheduling is cooperative: a fiber runs until it yields
//! ([`fiber::Fiber::yield_ready`] / [`fiber::Fiber::yield_hold`]) or
//! terminates, and a fiber that never yields monopolises its worker thread.
//! There is no work stealing and no timer layer; an IO manager would plug
//! into the scheduler's [`scheduler::Hooks`] extension point.
//!
//! ```no_run
//! use filament::scheduler::Scheduler;
//!
//! filament::log::init();
//!
//! let scheduler = Scheduler::new(4, false, "pool");
//! scheduler.start();
//! scheduler.schedule(|| println!("running on fiber {}", filament::fiber::id()));
//! scheduler.stop();
//! ```

pub mod config;
pub mod error;
pub mod fiber;
pub mod log;
pub mod scheduler;
pub mod sync;
pub mod thread;
pub mod util;

pub use error::{Error, Result};
pub use fiber::Fiber;
pub use scheduler::Scheduler;
