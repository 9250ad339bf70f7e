/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The waitable object the verifier parks postponed threads on.
//!
//! A condition variable plus a counter: `post` before `wait` is remembered,
//! which is all the verifier's wake-then-wait protocol requires.

use std::sync::Condvar;
use std::sync::Mutex;

/// A counting semaphore.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    /// Create a semaphore with the given initial count.
    pub fn new(count: u32) -> Self {
        Semaphore {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Increment the count, waking one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }

    /// Block until the count is positive, then decrement it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn post_before_wait_is_remembered() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.wait(); // Must not block.
    }

    #[test]
    fn wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let waiter = thread::spawn(move || {
            sem2.wait();
        });
        // Give the waiter a moment to park before waking it.
        thread::sleep(Duration::from_millis(10));
        sem.post();
        waiter.join().unwrap();
    }
}
