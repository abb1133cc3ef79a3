//! M:N fiber scheduling.
//!
//! A [`Scheduler`] multiplexes fibers over a fixed pool of worker threads.
//! Work arrives either as a ready [`Fiber`] or as a plain closure (wrapped
//! into a fiber on first dispatch), optionally pinned to one worker's OS
//! thread id. Each worker pulls from a single shared queue: there is no
//! work stealing and no preemption: a fiber that never yields monopolises
//! its worker.
//!
//! With `use_caller` the constructing thread itself is enlisted as a
//! worker: the scheduler builds a *root fiber* running the dispatch loop on
//! the caller's thread, and [`stop`](Scheduler::stop) enters it to help
//! drain the queue before joining the spawned workers.
//!
//! Example:
//! ```no_run
//! use filament::scheduler::Scheduler;
//!
//! let scheduler = Scheduler::new(2, false, "pool");
//! scheduler.start();
//! scheduler.schedule(|| println!("hello from a fiber"));
//! scheduler.stop();
//! ```

use std::cell::Cell;
use std::collections::VecDeque;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use once_cell::sync::OnceCell;

use crate::fiber::{self, Callback, Fiber, State};
use crate::thread::{self, Thread};
use crate::util::{self, fatal_assert};

/// Queue-entry affinity wildcard: any worker may take the entry.
pub const ANY_THREAD: i32 = -1;

thread_local! {
    // scheduler owning the calling thread, if any
    static CURRENT_SCHEDULER: Cell<*const Scheduler> = Cell::new(ptr::null());
    // the fiber workers swap against between tasks on this thread
    static MAIN_FIBER: Cell<*const Fiber> = Cell::new(ptr::null());
}

////////////////////////////////////////////////////////////////////////////////
// Task
////////////////////////////////////////////////////////////////////////////////

/// One entry of the ready queue: a fiber or a closure, plus the id of the
/// worker thread allowed to run it ([`ANY_THREAD`] for no affinity).
pub struct Task {
    work: Work,
    thread: i32,
}

enum Work {
    Fiber(Arc<Fiber>),
    Callback(Callback),
}

impl Task {
    pub fn callback<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            work: Work::Callback(Box::new(f)),
            thread: ANY_THREAD,
        }
    }

    pub fn fiber(fiber: Arc<Fiber>) -> Task {
        Task {
            work: Work::Fiber(fiber),
            thread: ANY_THREAD,
        }
    }

    /// Pins the entry to the worker with the given OS thread id. Only that
    /// worker will execute it; other workers leave it queued.
    pub fn on_thread(mut self, thread: i32) -> Task {
        self.thread = thread;
        self
    }

    pub fn thread(&self) -> i32 {
        self.thread
    }
}

////////////////////////////////////////////////////////////////////////////////
// Hooks
////////////////////////////////////////////////////////////////////////////////

/// Scheduler extension point, meant for an IO manager layered on top.
///
/// The plain scheduler uses [`DefaultHooks`]. An implementation that blocks
/// in [`idle`](Hooks::idle) (e.g. on epoll) must pair it with a
/// [`tickle`](Hooks::tickle) that actually wakes the blocked worker.
pub trait Hooks: Send + Sync + 'static {
    /// Wake-up hint. Contract: after `tickle` returns, at least one worker
    /// sleeping in idle must eventually observe that the queue is non-empty
    /// or that the scheduler is stopping.
    fn tickle(&self, scheduler: &Scheduler);

    /// Body of the per-worker idle fiber, entered whenever the queue has
    /// nothing eligible. Must return once the scheduler is stopping.
    fn idle(&self, scheduler: &Scheduler);

    /// Termination predicate: true when the scheduler may shut down.
    fn stopping(&self, scheduler: &Scheduler) -> bool;
}

/// Hooks of a plain CPU-bound scheduler: idle yields in place (workers
/// re-scan the queue every round, so a log line is a sufficient tickle).
pub struct DefaultHooks;

impl Hooks for DefaultHooks {
    fn tickle(&self, scheduler: &Scheduler) {
        log::debug!("scheduler {}: tickle", scheduler.name());
    }

    fn idle(&self, scheduler: &Scheduler) {
        log::debug!("scheduler {}: idle", scheduler.name());
        while !self.stopping(scheduler) {
            Fiber::yield_hold();
        }
    }

    fn stopping(&self, scheduler: &Scheduler) -> bool {
        scheduler.is_stopped()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler
////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct Inner {
    tasks: VecDeque<Task>,
    threads: Vec<Thread>,
    thread_ids: Vec<i32>,
}

pub struct Scheduler {
    name: String,
    weak_self: Weak<Scheduler>,
    inner: Mutex<Inner>,
    active: AtomicUsize,
    idle: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    // workers spawned by start(); excludes the enlisted caller thread
    thread_count: usize,
    // OS thread id of the constructing thread in use_caller mode, -1 otherwise
    root_thread: i32,
    root_fiber: OnceCell<Arc<Fiber>>,
    hooks: Box<dyn Hooks>,
}

impl Scheduler {
    /// Creates a scheduler with `threads` workers (must be > 0).
    ///
    /// With `use_caller` the constructing thread counts as one of the
    /// workers: one thread less is spawned, and the calling thread joins the
    /// dispatch effort inside [`stop`](Self::stop). At most one scheduler
    /// can enlist any given thread.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Self::with_hooks(threads, use_caller, name, Box::new(DefaultHooks))
    }

    /// Same as [`new`](Self::new) with custom [`Hooks`].
    pub fn with_hooks(
        threads: usize,
        use_caller: bool,
        name: &str,
        hooks: Box<dyn Hooks>,
    ) -> Arc<Scheduler> {
        fatal_assert!(threads > 0, "scheduler needs at least one thread");
        let name = if name.is_empty() { "scheduler" } else { name };

        let (thread_count, root_thread) = if use_caller {
            (threads - 1, util::thread_id())
        } else {
            (threads, -1)
        };

        let scheduler = Arc::new_cyclic(|weak| Scheduler {
            name: name.to_string(),
            weak_self: weak.clone(),
            inner: Mutex::new(Inner::default()),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            thread_count,
            root_thread,
            root_fiber: OnceCell::new(),
            hooks,
        });

        if use_caller {
            // the caller becomes a worker: it needs a bootstrap fiber, a
            // dispatch (root) fiber, and the scheduler bound to its TLS
            Fiber::current();
            fatal_assert!(
                Scheduler::current().is_none(),
                "a scheduler is already bound to this thread"
            );
            set_current_scheduler(Arc::as_ptr(&scheduler));

            let weak = scheduler.weak_self.clone();
            let root = Fiber::new_root(Box::new(move || {
                if let Some(scheduler) = weak.upgrade() {
                    scheduler.run();
                }
            }));
            thread::set_current_name(scheduler.name());
            set_main_fiber(Arc::as_ptr(&root));
            scheduler.lock_inner().thread_ids.push(root_thread);
            let _ = scheduler.root_fiber.set(root);
        }

        scheduler
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The scheduler bound to the calling thread, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        let ptr = CURRENT_SCHEDULER.try_with(Cell::get).ok()?;
        if ptr.is_null() {
            return None;
        }
        // Safety: the slot is set by the scheduler's owner thread / workers
        // while the scheduler is alive and cleared by its destructor
        unsafe {
            Arc::increment_strong_count(ptr);
            Some(Arc::from_raw(ptr))
        }
    }

    /// Spawns the worker threads. A no-op when already running.
    pub fn start(&self) {
        let mut inner = self.lock_inner();
        if !self.stopping.load(Ordering::SeqCst) {
            return;
        }
        self.stopping.store(false, Ordering::SeqCst);
        fatal_assert!(inner.threads.is_empty(), "scheduler already has workers");

        for i in 0..self.thread_count {
            let weak = self.weak_self.clone();
            let worker = Thread::new(
                move || {
                    if let Some(scheduler) = weak.upgrade() {
                        scheduler.run();
                    }
                },
                &format!("{}_{}", self.name, i),
            );
            let worker = match worker {
                Ok(worker) => worker,
                Err(error) => util::fatal(&format!("failed to spawn a worker: {}", error)),
            };
            inner.thread_ids.push(worker.id());
            inner.threads.push(worker);
        }
    }

    /// Queues a closure for execution on any worker.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task::callback(f));
    }

    /// Queues a fiber for execution on any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.submit(Task::fiber(fiber));
    }

    /// Queues one entry, honouring its affinity.
    pub fn submit(&self, task: Task) {
        let need_tickle = {
            let mut inner = self.lock_inner();
            let was_empty = inner.tasks.is_empty();
            inner.tasks.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Queues a batch of entries under one lock acquisition, tickling at
    /// most once.
    pub fn submit_all(&self, tasks: impl IntoIterator<Item = Task>) {
        let need_tickle = {
            let mut inner = self.lock_inner();
            let mut need_tickle = false;
            for task in tasks {
                need_tickle |= inner.tasks.is_empty();
                inner.tasks.push_back(task);
            }
            need_tickle
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Initiates shutdown and blocks until the queue is drained and every
    /// worker has been joined.
    ///
    /// Must be called from the root thread for a `use_caller` scheduler, and
    /// from outside the workers otherwise.
    pub fn stop(&self) {
        self.auto_stop.store(true, Ordering::SeqCst);

        if let Some(root) = self.root_fiber.get() {
            if self.thread_count == 0 && matches!(root.state(), State::Term | State::Init) {
                log::info!("scheduler {}: stopped", self.name);
                self.stopping.store(true, Ordering::SeqCst);
                if self.hooks.stopping(self) {
                    return;
                }
            }
        }

        let current_is_self = match Scheduler::current() {
            Some(current) => ptr::eq(Arc::as_ptr(&current), self as *const Scheduler),
            None => false,
        };
        if self.root_thread != -1 {
            fatal_assert!(
                current_is_self,
                "stop of scheduler {} outside its root thread",
                self.name
            );
        } else {
            fatal_assert!(
                !current_is_self,
                "stop of scheduler {} from inside its own workers",
                self.name
            );
        }

        self.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.thread_count {
            self.tickle();
        }
        if self.root_fiber.get().is_some() {
            self.tickle();
        }

        // the root thread drains the queue too before the workers are joined
        if let Some(root) = self.root_fiber.get() {
            if !self.hooks.stopping(self) {
                root.call();
            }
        }

        let threads = {
            let mut inner = self.lock_inner();
            mem::take(&mut inner.threads)
        };
        for mut worker in threads {
            worker.join();
        }
    }

    /// The termination predicate: shutdown was requested and there is
    /// nothing left to run.
    pub fn is_stopped(&self) -> bool {
        let inner = self.lock_inner();
        self.auto_stop.load(Ordering::SeqCst)
            && self.stopping.load(Ordering::SeqCst)
            && inner.tasks.is_empty()
            && self.active.load(Ordering::SeqCst) == 0
    }

    /// OS thread ids of all workers (the enlisted caller first, when
    /// `use_caller` was set).
    pub fn thread_ids(&self) -> Vec<i32> {
        self.lock_inner().thread_ids.clone()
    }

    /// Workers currently executing a task.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Workers currently parked in their idle fiber.
    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    fn tickle(&self) {
        self.hooks.tickle(self);
    }

    // The dispatch loop. Runs on every spawned worker, and on the root
    // fiber of a use_caller scheduler.
    fn run(self: Arc<Self>) {
        log::info!("scheduler {}: dispatch loop started", self.name);
        set_current_scheduler(Arc::as_ptr(&self));

        let tid = util::thread_id();
        if tid != self.root_thread {
            // spawned workers park between tasks on their bootstrap fiber;
            // the root thread parks on the root fiber installed at
            // construction
            let boot = Fiber::current();
            set_main_fiber(Arc::as_ptr(&boot));
        }

        let idle_owner = Arc::clone(&self);
        let idle_fiber = Fiber::new(move || {
            let scheduler: &Scheduler = &idle_owner;
            scheduler.hooks.idle(scheduler);
        });
        let mut callback_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut tickle_me = false;
            let mut task = None;
            {
                let mut inner = self.lock_inner();
                let mut eligible = None;
                for (index, entry) in inner.tasks.iter().enumerate() {
                    // affinitised entries wait for their designated worker;
                    // whoever skips one makes sure somebody else looks
                    if entry.thread != ANY_THREAD && entry.thread != tid {
                        tickle_me = true;
                        continue;
                    }
                    // guard against double-dispatch of a fiber that was
                    // re-queued while still running
                    if let Work::Fiber(fiber) = &entry.work {
                        if fiber.state() == State::Exec {
                            continue;
                        }
                    }
                    eligible = Some(index);
                    break;
                }
                if let Some(index) = eligible {
                    task = inner.tasks.remove(index);
                    self.active.fetch_add(1, Ordering::SeqCst);
                }
            }

            if tickle_me {
                self.tickle();
            }

            match task {
                Some(Task {
                    work: Work::Fiber(fiber),
                    ..
                }) => {
                    if matches!(fiber.state(), State::Term | State::Except) {
                        // finished fibers are dropped, never resumed
                        self.active.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    fiber.swap_in();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        State::Ready => self.schedule_fiber(fiber),
                        State::Term | State::Except => {}
                        _ => fiber.set_state(State::Hold),
                    }
                }
                Some(Task {
                    work: Work::Callback(callback),
                    ..
                }) => {
                    // closures run on a cached per-worker fiber when the
                    // previous one finished cleanly
                    let fiber = match callback_fiber.take() {
                        Some(fiber) => {
                            fiber.reset_boxed(Some(callback));
                            fiber
                        }
                        None => Fiber::new_boxed(callback),
                    };
                    fiber.swap_in();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        State::Ready => self.schedule_fiber(fiber),
                        State::Term | State::Except => {
                            fiber.reset_boxed(None);
                            callback_fiber = Some(fiber);
                        }
                        // the fiber parked itself; it now belongs to whoever
                        // re-schedules it
                        _ => fiber.set_state(State::Hold),
                    }
                }
                None => {
                    if idle_fiber.state() == State::Term {
                        log::info!("scheduler {}: idle fiber terminated", self.name);
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.swap_in();
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                    if !matches!(idle_fiber.state(), State::Term | State::Except) {
                        idle_fiber.set_state(State::Hold);
                    }
                }
            }
        }

        log::info!("scheduler {}: dispatch loop exited", self.name);
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|_| util::fatal("scheduler queue lock poisoned"))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        fatal_assert!(
            self.stopping.load(Ordering::SeqCst),
            "scheduler {} dropped while still running",
            self.name
        );
        let me = self as *const Scheduler;
        let _ = CURRENT_SCHEDULER.try_with(|slot| {
            if slot.get() == me {
                slot.set(ptr::null());
            }
        });
        if let Some(root) = self.root_fiber.get() {
            let root = Arc::as_ptr(root);
            let _ = MAIN_FIBER.try_with(|slot| {
                if slot.get() == root {
                    slot.set(ptr::null());
                }
            });
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Ambient thread state
////////////////////////////////////////////////////////////////////////////////

// The fiber the calling thread swaps against between tasks: the root fiber
// on the root thread of a use_caller scheduler, the bootstrap fiber
// everywhere else (materialized on demand, so standalone fibers work on
// plain threads too).
pub(crate) fn main_fiber_ptr() -> *const Fiber {
    let installed = MAIN_FIBER.try_with(Cell::get).unwrap_or(ptr::null());
    if !installed.is_null() {
        return installed;
    }
    // the pointer stays valid after the handle is dropped: the bootstrap
    // fiber is owned by its thread-local slot until the thread dies
    let boot = fiber::thread_fiber();
    Arc::as_ptr(&boot)
}

fn set_main_fiber(ptr: *const Fiber) {
    let _ = MAIN_FIBER.try_with(|slot| slot.set(ptr));
}

fn set_current_scheduler(ptr: *const Scheduler) {
    let _ = CURRENT_SCHEDULER.try_with(|slot| slot.set(ptr));
}
