//! Machine context of a fiber.
//!
//! A [`Context`] is an opaque CPU-register snapshot plus the stack it runs
//! on, backed by the host's `ucontext` facility. Three operations cover
//! everything a fiber needs: capture the running state, prepare a fresh
//! state entering a given function on a given stack, and swap between two
//! states. Failure of any of the underlying calls is an invariant
//! violation and aborts.

use std::cell::UnsafeCell;
use std::mem;
use std::ptr;

use crate::util;

pub(crate) struct Context {
    inner: UnsafeCell<libc::ucontext_t>,
}

impl Context {
    /// An all-zero context. Must be captured or prepared before it can be
    /// the target of a swap.
    pub(crate) fn zeroed() -> Self {
        Context {
            // Safety: ucontext_t is a plain C struct, all-zeroes is a valid
            // (if meaningless) bit pattern for it
            inner: UnsafeCell::new(unsafe { mem::zeroed() }),
        }
    }

    /// Snapshots the current CPU state into `self`.
    ///
    /// # Safety
    /// `self` must live at its final address: glibc contexts are
    /// self-referential once captured and must not be moved afterwards.
    pub(crate) unsafe fn capture(&self) {
        if libc::getcontext(self.inner.get()) != 0 {
            util::fatal("getcontext failed");
        }
    }

    /// Initializes `self` so that swapping into it enters `entry` on the
    /// given stack.
    ///
    /// # Safety
    /// Same placement requirement as [`capture`](Self::capture); the stack
    /// buffer must outlive every swap into this context; `entry` must never
    /// return (it has no frame to return into).
    pub(crate) unsafe fn prepare(
        &self,
        stack_bottom: *mut u8,
        stack_size: usize,
        entry: extern "C" fn(),
    ) {
        let ucp = self.inner.get();
        if libc::getcontext(ucp) != 0 {
            util::fatal("getcontext failed");
        }
        (*ucp).uc_link = ptr::null_mut();
        (*ucp).uc_stack.ss_sp = stack_bottom.cast();
        (*ucp).uc_stack.ss_size = stack_size;
        (*ucp).uc_stack.ss_flags = 0;
        libc::makecontext(ucp, entry, 0);
    }

    /// Saves the running registers into `from` and resumes `to`. Returns
    /// when some thread later swaps back into `from`.
    ///
    /// # Safety
    /// `from` must be the context of the currently running fiber; `to` must
    /// have been captured or prepared; both must outlive the suspension.
    pub(crate) unsafe fn swap(from: &Context, to: &Context) {
        if libc::swapcontext(from.inner.get(), to.inner.get()) != 0 {
            util::fatal("swapcontext failed");
        }
    }
}
