//! A signed counting semaphore.
//!
//! The per-task semaphore is the only primitive that parks user threads.
//! It is signed-counted (can go negative while waiters are parked) so that
//! an `up()` racing a teardown never loses a wakeup: teardown can observe
//! `count() < 0` and drain waiters explicitly instead of guessing how many
//! `down()` calls are stuck. This mirrors the manual token-bucket-on-top-
//! of-an-OS-semaphore the original driver used across epoch transitions.

use parking_lot::{Condvar, Mutex};

pub struct CountingSemaphore {
    count: Mutex<i64>,
    cv: Condvar,
}

impl CountingSemaphore {
    pub fn new() -> Self {
        Self { count: Mutex::new(0), cv: Condvar::new() }
    }

    /// Block the caller until a matching `up()` arrives. Returns once the
    /// count has been incremented back past zero by some other thread, or
    /// immediately if the count was already non-negative.
    pub fn down(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        while *count < 0 {
            self.cv.wait(&mut count);
        }
    }

    /// Release one waiter, or pre-credit a future `down()` if none is
    /// currently parked.
    pub fn up(&self) {
        let mut count = self.count.lock();
        *count += 1;
        if *count <= 0 {
            self.cv.notify_one();
        }
    }

    /// Wake every parked waiter unconditionally. Used at task teardown
    /// ("Cancellation": unblock any thread parked on its
    /// semaphore before tearing down) so an exiting process's thread isn't
    /// left stuck mid-`submit`.
    pub fn drain(&self) {
        let mut count = self.count.lock();
        if *count < 0 {
            *count = 0;
        }
        self.cv.notify_all();
    }

    pub fn count(&self) -> i64 {
        *self.count.lock()
    }
}

impl Default for CountingSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn up_before_down_does_not_block() {
        let sem = CountingSemaphore::new();
        sem.up();
        sem.down(); // must not block, count never goes negative
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn down_blocks_until_up() {
        let sem = Arc::new(CountingSemaphore::new());
        let waiter = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            waiter.down();
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sem.count(), -1);
        sem.up();
        handle.join().unwrap();
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn drain_releases_parked_waiters_without_matching_up() {
        let sem = Arc::new(CountingSemaphore::new());
        let waiter = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            waiter.down();
        });
        thread::sleep(Duration::from_millis(20));
        sem.drain();
        handle.join().unwrap();
    }
}
