//! Thread-safe primitives shared across the connection core.
//!
//! Small synchronized wrappers used by the manager and both stream workers:
//! a lock-protected value and an atomic counter. Every operation on a single
//! instance is atomic with respect to the others.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-protected value with atomic get/set/compare-and-set.
#[derive(Debug, Default)]
pub struct ThreadSafeValue<T> {
    inner: Mutex<T>,
}

impl<T: Clone> ThreadSafeValue<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn get(&self) -> T {
        self.inner.lock().clone()
    }

    pub fn set(&self, value: T) {
        *self.inner.lock() = value;
    }
}

impl<T: Clone + PartialEq> ThreadSafeValue<T> {
    /// Replace the value only if it currently equals `expected`.
    /// Returns true when the swap happened.
    pub fn compare_and_set(&self, expected: &T, new: T) -> bool {
        let mut guard = self.inner.lock();
        if *guard == *expected {
            *guard = new;
            true
        } else {
            false
        }
    }
}

/// Atomic counter for attempt counts and frame sequence numbers.
#[derive(Debug, Default)]
pub struct ThreadSafeCounter {
    value: AtomicU64,
}

impl ThreadSafeCounter {
    pub fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
        }
    }

    /// Increment and return the new value.
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrement and return the new value. Callers must not decrement
    /// below zero.
    pub fn decrement(&self) -> u64 {
        self.value.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::SeqCst);
    }
}
