//! OS thread wrapper with a startup hand-shake.
//!
//! [`Thread::new`] spawns a named thread and blocks until the child has
//! published its OS thread id and its name, so the returned handle is fully
//! usable (in particular, [`Thread::id`] can immediately serve as a
//! scheduling affinity target). `join` is idempotent; dropping an unjoined
//! handle detaches the thread.

use std::cell::RefCell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::Result;
use crate::sync::Semaphore;
use crate::util;

const UNNAMED: &str = "UNKNOWN";

thread_local! {
    static NAME: RefCell<String> = RefCell::new(String::new());
}

/// Name of the calling thread as published through this module
/// (`"UNKNOWN"` when it was never named).
pub fn current_name() -> String {
    NAME.try_with(|name| {
        let name = name.borrow();
        if name.is_empty() {
            UNNAMED.to_string()
        } else {
            name.clone()
        }
    })
    .unwrap_or_else(|_| UNNAMED.to_string())
}

/// Publishes a name for the calling thread.
pub fn set_current_name(name: &str) {
    let _ = NAME.try_with(|slot| *slot.borrow_mut() = name.to_string());
}

/// A named OS thread.
pub struct Thread {
    id: i32,
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawns `callback` on a new named thread and waits for the startup
    /// hand-shake before returning.
    pub fn new<F>(callback: F, name: &str) -> Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        struct StartState {
            ready: Semaphore,
            tid: AtomicI32,
        }

        let name = if name.is_empty() { UNNAMED } else { name }.to_string();
        let start = Arc::new(StartState {
            ready: Semaphore::new(0),
            tid: AtomicI32::new(-1),
        });

        let published = Arc::clone(&start);
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                set_current_name(&thread_name);
                published.tid.store(util::thread_id(), Ordering::SeqCst);
                published.ready.notify();
                callback();
            })?;

        start.ready.wait();
        Ok(Thread {
            id: start.tid.load(Ordering::SeqCst),
            name,
            handle: Some(handle),
        })
    }

    /// OS-level id of the thread (what the thread itself sees through
    /// [`util::thread_id`]).
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until the thread exits. A second call is a no-op.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("thread {} terminated with a panic", self.name);
            }
        }
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
