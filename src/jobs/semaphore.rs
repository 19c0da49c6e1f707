use parking_lot::{Condvar, Mutex};

/// Counting semaphore used as the worker wake-up signal.
#[derive(Debug, Default)]
pub(crate) struct Semaphore {
    count: Mutex<usize>,
    cvar: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cvar: Condvar::new(),
        }
    }

    /// Block until the count is positive, then decrement it.
    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cvar.wait(&mut count);
        }
        *count -= 1;
    }

    pub fn release(&self) {
        *self.count.lock() += 1;
        self.cvar.notify_one();
    }
}
