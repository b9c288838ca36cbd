// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The init barrier (§4.8, §4.8a): a condvar-guarded happens-before edge ensuring no unprivileged
//! connection is served before the server process has permanently dropped root.
//!
//! Discipline: a waiter checks the predicate under the mutex, waits on the condvar if it isn't set
//! yet, and re-checks on wake (spurious wakeups and the lost-wakeup race are both handled by
//! looping on the predicate rather than trusting a single `notify`). The broadcaster sets the
//! predicate and calls `notify_all` while still holding the mutex.

use std::sync::{Condvar, Mutex};

pub struct InitBarrier {
    ready: Mutex<bool>,
    condvar: Condvar,
}

impl InitBarrier {
    pub fn new() -> Self {
        Self {
            ready: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Blocks the calling thread until [`open`](Self::open) has been called at least once.
    /// Returns immediately if it already has.
    pub fn wait(&self) {
        let mut ready = self.ready.lock().unwrap();
        while !*ready {
            ready = self.condvar.wait(ready).unwrap();
        }
    }

    /// Marks the barrier open and wakes every thread blocked in [`wait`](Self::wait). Idempotent:
    /// calling it again is a no-op.
    pub fn open(&self) {
        let mut ready = self.ready.lock().unwrap();
        *ready = true;
        self.condvar.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.ready.lock().unwrap()
    }
}

impl Default for InitBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_returns_immediately_once_already_open() {
        let barrier = InitBarrier::new();
        barrier.open();
        barrier.wait();
        assert!(barrier.is_open());
    }

    #[test]
    fn waiters_unblock_only_after_open() {
        let barrier = Arc::new(InitBarrier::new());
        let waiter_barrier = Arc::clone(&barrier);

        let handle = std::thread::spawn(move || {
            waiter_barrier.wait();
        });

        std::thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());

        barrier.open();
        handle.join().unwrap();
    }

    #[test]
    fn multiple_waiters_all_wake() {
        let barrier = Arc::new(InitBarrier::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&barrier);
                std::thread::spawn(move || b.wait())
            })
            .collect();

        std::thread::sleep(Duration::from_millis(20));
        barrier.open();

        for h in handles {
            h.join().unwrap();
        }
    }
}
