//! A counting semaphore used as a rendezvous point between the prefetcher
//! and the notifications that signal a computation node has finished.
//!
//! A `Condvar`-backed counting semaphore keeps the contract simple — one
//! waiter, one wake per completed node — without pulling in an extra
//! dependency.

use std::sync::{Condvar, Mutex};

pub struct Semaphore {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Semaphore {
            count: Mutex::new(initial),
            condvar: Condvar::new(),
        }
    }

    /// Block until a permit is available, then consume it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.condvar.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Release one permit, waking at most one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.condvar.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            sem2.wait();
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        sem.post();
        handle.join().unwrap();
    }

    #[test]
    fn initial_permit_does_not_block() {
        let sem = Semaphore::new(1);
        sem.wait();
    }
}
