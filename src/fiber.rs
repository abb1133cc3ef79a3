//! Cooperative multitasking primitives.
//!
//! A [`Fiber`] is a stackful coroutine: an execution context with its own
//! stack that is suspended and resumed by explicit context swaps. Fibers
//! never migrate while running (between two yield points a fiber owns its
//! OS thread exclusively) and they never preempt each other: control moves
//! only through [`Fiber::yield_ready`], [`Fiber::yield_hold`] or natural
//! termination.
//!
//! Every OS thread that touches fibers implicitly owns a *bootstrap fiber*
//! representing the thread's native stack. It has id 0, no stack buffer of
//! its own, and is materialized lazily by [`Fiber::current`]. Regular
//! fibers swap against the thread's *main fiber*: the bootstrap fiber,
//! unless a scheduler installed its own dispatch fiber for this thread (see
//! [`crate::scheduler`]).
//!
//! Example (a fiber driven by hand, without a scheduler):
//! ```
//! use filament::fiber::{Fiber, State};
//!
//! let fiber = Fiber::new(|| {
//!     println!("first slice");
//!     Fiber::yield_hold();
//!     println!("second slice");
//! });
//! fiber.swap_in();
//! assert_eq!(fiber.state(), State::Hold);
//! fiber.swap_in();
//! assert_eq!(fiber.state(), State::Term);
//! ```

use std::cell::{Cell, RefCell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::config::{self, ConfigVar};
use crate::util::{self, fatal_assert};

mod context;
mod stack;

use context::Context;
use stack::Stack;
pub use stack::{HeapStackAllocator, StackAllocator};

const DEFAULT_STACK_SIZE: u32 = 128 * 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

static STACK_SIZE_VAR: Lazy<Option<Arc<ConfigVar<u32>>>> =
    Lazy::new(|| config::lookup("fiber.stack_size", DEFAULT_STACK_SIZE, "fiber stack size in bytes"));

thread_local! {
    // fiber currently executing on this thread
    static CURRENT: Cell<*const Fiber> = Cell::new(ptr::null());
    // the fiber representing this thread's native stack
    static BOOTSTRAP: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;

////////////////////////////////////////////////////////////////////////////////
// State
////////////////////////////////////////////////////////////////////////////////

/// Lifecycle state of a fiber.
///
/// ```text
/// Init ──swap_in──▶ Exec ──returns──▶ Term
///   ▲                │ ├─ yield_ready ─▶ Ready
///   │                │ ├─ yield_hold ──▶ Hold
///  reset             │ └─ panics ──────▶ Except
/// ```
///
/// `reset` is accepted only in `Term`, `Init` or `Except`; `Ready` and
/// `Hold` fibers re-enter `Exec` through `swap_in`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init = 0,
    Hold = 1,
    Exec = 2,
    Term = 3,
    Ready = 4,
    Except = 5,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::Init,
            1 => State::Hold,
            2 => State::Exec,
            3 => State::Term,
            4 => State::Ready,
            5 => State::Except,
            _ => util::fatal(&format!("corrupted fiber state: {}", raw)),
        }
    }
}

// Selects the trampoline, i.e. where the fiber returns to when it is done:
// worker fibers swap back to the thread's main fiber, caller fibers to the
// thread's bootstrap fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Worker,
    Caller,
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

/// A stackful cooperative coroutine.
///
/// Handles are `Arc<Fiber>`; the same fiber may be held by the scheduler
/// queue, by the code that created it and by the fiber's own stack at once.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    kind: Kind,
    ctx: Context,
    stack: Option<Stack>,
    // consumed on first entry; only the running thread touches the slot
    callback: UnsafeCell<Option<Callback>>,
}

// Safety: the context and the callback slot are only accessed by the thread
// that currently runs or resumes the fiber, and hand-off between threads
// goes through the scheduler's queue lock; the lifecycle state is atomic.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a fiber executing `callback`, with the configured default
    /// stack size (`fiber.stack_size`, 128 KiB unless overridden).
    ///
    /// The fiber starts in [`State::Init`] and runs only when swapped in.
    pub fn new<F>(callback: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Box::new(callback), 0, Kind::Worker)
    }

    /// Same as [`new`](Self::new) with an explicit stack size in bytes
    /// (0 means the configured default).
    pub fn with_stack_size<F>(callback: F, stack_size: usize) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Box::new(callback), stack_size, Kind::Worker)
    }

    pub(crate) fn new_boxed(callback: Callback) -> Arc<Fiber> {
        Self::build(callback, 0, Kind::Worker)
    }

    pub(crate) fn new_root(callback: Callback) -> Arc<Fiber> {
        Self::build(callback, 0, Kind::Caller)
    }

    fn build(callback: Callback, stack_size: usize, kind: Kind) -> Arc<Fiber> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1;
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        let stack_size = if stack_size == 0 {
            default_stack_size()
        } else {
            stack_size
        };
        let stack = Stack::alloc(stack_size);
        let (bottom, size) = (stack.bottom(), stack.size());

        let fiber = Arc::new(Fiber {
            id,
            state: AtomicU8::new(State::Init as u8),
            kind,
            ctx: Context::zeroed(),
            stack: Some(stack),
            callback: UnsafeCell::new(Some(callback)),
        });

        // Safety: the context now lives at its final heap address; the
        // stack buffer is owned by the fiber and outlives the context
        unsafe { fiber.ctx.prepare(bottom, size, entry_point(kind)) };

        log::debug!("fiber {} created, stack {} bytes", id, size);
        fiber
    }

    // The bootstrap fiber borrows the OS stack: no buffer, no callback,
    // id 0, and it is in Exec for as long as its thread lives.
    fn bootstrap() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        let fiber = Arc::new(Fiber {
            id: 0,
            state: AtomicU8::new(State::Exec as u8),
            kind: Kind::Caller,
            ctx: Context::zeroed(),
            stack: None,
            callback: UnsafeCell::new(None),
        });
        // Safety: captured at its final heap address
        unsafe { fiber.ctx.capture() };
        log::debug!("bootstrap fiber created");
        fiber
    }

    /// Monotonic id of this fiber; 0 is the bootstrap fiber.
    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Re-arms a finished fiber with a new callback, reusing its stack.
    ///
    /// The fiber keeps its id and moves back to [`State::Init`]. Accepted
    /// only in `Term`, `Init` or `Except`; anything else is an invariant
    /// violation and aborts.
    pub fn reset<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Some(Box::new(callback)));
    }

    pub(crate) fn reset_boxed(&self, callback: Option<Callback>) {
        fatal_assert!(self.stack.is_some(), "reset on a stackless fiber");
        let state = self.state();
        fatal_assert!(
            matches!(state, State::Term | State::Init | State::Except),
            "reset of fiber {} in state {:?}",
            self.id,
            state
        );

        // Safety: the fiber is not running (checked above), so this thread
        // is the only one touching the slot and the context
        unsafe {
            *self.callback.get() = callback;
            let (bottom, size) = match &self.stack {
                Some(stack) => (stack.bottom(), stack.size()),
                None => util::fatal("reset on a stackless fiber"),
            };
            self.ctx.prepare(bottom, size, entry_point(self.kind));
        }
        self.set_state(State::Init);
    }

    /// Resumes this fiber from the thread's main fiber.
    ///
    /// Returns when the fiber yields or terminates. The caller must hold a
    /// strong handle for the duration of the call.
    pub fn swap_in(&self) {
        let main = crate::scheduler::main_fiber_ptr();
        set_current(self as *const Fiber);
        fatal_assert!(
            self.state() != State::Exec,
            "fiber {} is already executing",
            self.id
        );
        self.set_state(State::Exec);
        // Safety: `main` is kept alive by its thread-local slot (or by the
        // scheduler that installed it), `self` by the caller's handle
        unsafe { Context::swap(&(*main).ctx, &self.ctx) };
    }

    /// Suspends this fiber, resuming the thread's main fiber.
    pub fn swap_out(&self) {
        let main = crate::scheduler::main_fiber_ptr();
        set_current(main);
        // Safety: as in swap_in
        unsafe { Context::swap(&self.ctx, &(*main).ctx) };
    }

    /// Resumes this fiber from the thread's bootstrap fiber (not the main
    /// fiber). This is how a scheduler's root thread enters its dispatch
    /// fiber.
    pub fn call(&self) {
        let boot = thread_fiber();
        set_current(self as *const Fiber);
        self.set_state(State::Exec);
        let boot_ptr = Arc::as_ptr(&boot);
        drop(boot);
        // Safety: the bootstrap fiber stays alive in its thread-local slot;
        // `self` is kept by the caller
        unsafe { Context::swap(&(*boot_ptr).ctx, &self.ctx) };
    }

    /// Inverse of [`call`](Self::call): suspends back to the thread's
    /// bootstrap fiber.
    pub fn back(&self) {
        let boot = thread_fiber();
        let boot_ptr = Arc::as_ptr(&boot);
        set_current(boot_ptr);
        // the handle must not survive the swap: on the terminal swap of a
        // finished fiber this frame is never resumed
        drop(boot);
        // Safety: as in call
        unsafe { Context::swap(&self.ctx, &(*boot_ptr).ctx) };
    }

    /// Returns the fiber currently executing on this thread, materializing
    /// the thread's bootstrap fiber if there is none yet.
    pub fn current() -> Arc<Fiber> {
        if let Some(current) = Self::try_current() {
            return current;
        }
        let boot = Self::bootstrap();
        set_current(Arc::as_ptr(&boot));
        BOOTSTRAP.with(|slot| *slot.borrow_mut() = Some(Arc::clone(&boot)));
        boot
    }

    /// Returns the fiber currently executing on this thread, if any.
    pub fn try_current() -> Option<Arc<Fiber>> {
        let ptr = CURRENT.try_with(Cell::get).ok()?;
        if ptr.is_null() {
            return None;
        }
        // Safety: CURRENT always points at a live fiber. It is only set
        // while a strong handle exists on this thread (the bootstrap slot,
        // a dispatch frame across swap_in, or the caller of swap_in)
        unsafe {
            Arc::increment_strong_count(ptr);
            Some(Arc::from_raw(ptr))
        }
    }

    /// Suspends the current fiber and marks it [`State::Ready`]: it wants
    /// to run again as soon as a worker is free.
    pub fn yield_ready() {
        let current = Fiber::current();
        current.set_state(State::Ready);
        current.swap_out();
    }

    /// Suspends the current fiber and marks it [`State::Hold`]: it will not
    /// run again until something re-schedules it.
    pub fn yield_hold() {
        let current = Fiber::current();
        current.set_state(State::Hold);
        current.swap_out();
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            let state = self.state();
            fatal_assert!(
                matches!(state, State::Term | State::Init | State::Except),
                "fiber {} dropped in state {:?}",
                self.id,
                state
            );
        } else {
            // the bootstrap fiber dies with its thread
            // Safety: nobody else can hold the fiber at this point
            fatal_assert!(unsafe { (*self.callback.get()).is_none() });
            fatal_assert!(self.state() == State::Exec);
            let me = self as *const Fiber;
            let _ = CURRENT.try_with(|current| {
                if current.get() == me {
                    current.set(ptr::null());
                }
            });
        }
        log::debug!("fiber {} destroyed", self.id);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Trampolines
////////////////////////////////////////////////////////////////////////////////

fn entry_point(kind: Kind) -> extern "C" fn() {
    match kind {
        Kind::Worker => worker_main,
        Kind::Caller => caller_main,
    }
}

// Runs the callback and records the outcome. A panic escaping the callback
// is captured into Except; the hosting worker thread is unaffected.
fn run_callback(current: &Arc<Fiber>) {
    // Safety: this thread is running the fiber, nobody else touches the slot
    let callback = unsafe { (*current.callback.get()).take() };
    let callback = match callback {
        Some(callback) => callback,
        None => util::fatal(&format!("fiber {} entered without a callback", current.id)),
    };
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(()) => current.set_state(State::Term),
        Err(payload) => {
            current.set_state(State::Except);
            log::error!(
                "fiber {} panicked: {}\nbacktrace:\n{}",
                current.id,
                panic_message(payload.as_ref()),
                util::backtrace_to_string(64, 2, "    ")
            );
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

extern "C" fn worker_main() {
    let current = Fiber::current();
    run_callback(&current);

    // this frame is dismantled by the swap below and never resumed, so the
    // owning handle must be released first; the raw pointer stays valid
    // because the resuming side still holds the fiber
    let raw = Arc::as_ptr(&current);
    drop(current);
    // Safety: see above
    unsafe { (*raw).swap_out() };

    util::fatal("terminated fiber was resumed");
}

extern "C" fn caller_main() {
    let current = Fiber::current();
    run_callback(&current);

    let raw = Arc::as_ptr(&current);
    drop(current);
    // Safety: as in worker_main
    unsafe { (*raw).back() };

    util::fatal("terminated fiber was resumed");
}

////////////////////////////////////////////////////////////////////////////////
// Ambient thread state
////////////////////////////////////////////////////////////////////////////////

fn set_current(ptr: *const Fiber) {
    let _ = CURRENT.try_with(|current| current.set(ptr));
}

// The bootstrap fiber of the calling thread, created on demand.
pub(crate) fn thread_fiber() -> Arc<Fiber> {
    let existing = BOOTSTRAP.try_with(|slot| slot.borrow().clone());
    if let Ok(Some(boot)) = existing {
        return boot;
    }
    let current = Fiber::current();
    fatal_assert!(current.id == 0, "no bootstrap fiber on this thread");
    current
}

/// Id of the fiber currently executing on the calling thread, or 0 when the
/// thread runs no fiber (the bootstrap fiber also reports 0).
pub fn id() -> u64 {
    CURRENT
        .try_with(|current| {
            let ptr = current.get();
            if ptr.is_null() {
                0
            } else {
                // Safety: CURRENT points at a live fiber (see try_current)
                unsafe { (*ptr).id }
            }
        })
        .unwrap_or(0)
}

/// Total number of live fibers in the process, bootstrap fibers included.
pub fn count() -> u64 {
    FIBER_COUNT.load(Ordering::Relaxed)
}

fn default_stack_size() -> usize {
    STACK_SIZE_VAR
        .as_ref()
        .map(|var| var.value() as usize)
        .unwrap_or(DEFAULT_STACK_SIZE as usize)
}
