//! OS-thread synchronization primitives.
//!
//! [`Semaphore`] backs the worker-thread startup hand-off and has to block
//! the whole OS thread, not a fiber; it is used before any fiber exists on
//! the new thread. [`Spinlock`] is a busy-wait lock for critical sections
//! that are a handful of instructions long (the logger sink, for example);
//! anything that can block for real belongs under [`std::sync::Mutex`].
//!
//! All locks here are non-reentrant.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crate::util;

////////////////////////////////////////////////////////////////////////////////
// Semaphore
////////////////////////////////////////////////////////////////////////////////

/// A counting semaphore.
///
/// [`wait`](Self::wait) decrements the counter, blocking while it is zero;
/// [`notify`](Self::notify) increments it and wakes one waiter.
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: u32) -> Self {
        Semaphore {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let mut count = self
            .count
            .lock()
            .unwrap_or_else(|_| util::fatal("semaphore mutex poisoned"));
        while *count == 0 {
            count = self
                .cond
                .wait(count)
                .unwrap_or_else(|_| util::fatal("semaphore condvar wait failed"));
        }
        *count -= 1;
    }

    pub fn notify(&self) {
        let mut count = self
            .count
            .lock()
            .unwrap_or_else(|_| util::fatal("semaphore mutex poisoned"));
        *count += 1;
        self.cond.notify_one();
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Spinlock
////////////////////////////////////////////////////////////////////////////////

/// A busy-wait mutual exclusion lock around a value of type `T`.
///
/// Locking returns an RAII [`SpinlockGuard`]; the lock is released on every
/// exit path when the guard goes out of scope.
pub struct Spinlock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// Safety: same contract as std::sync::Mutex, the lock serializes access
// to the inner value.
unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(data: T) -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Spinlock<T> {
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinlockGuard { lock: self })
        } else {
            None
        }
    }
}

pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn semaphore_orders_the_handoff() {
        let sem = Arc::new(Semaphore::new(0));
        let flag = Arc::new(AtomicBool::new(false));

        let (sem2, flag2) = (sem.clone(), flag.clone());
        let child = std::thread::spawn(move || {
            flag2.store(true, Ordering::SeqCst);
            sem2.notify();
        });

        sem.wait();
        assert!(flag.load(Ordering::SeqCst));
        child.join().unwrap();
    }

    #[test]
    fn semaphore_counts_permits() {
        let sem = Semaphore::new(2);
        sem.wait();
        sem.wait();
        sem.notify();
        sem.wait();
    }

    #[test]
    fn spinlock_serializes_increments() {
        let lock = Arc::new(Spinlock::new(0u64));
        let mut workers = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            workers.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = Spinlock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
