//! Close-aware counting semaphore backing the availability signal

use parking_lot::{Condvar, Mutex};

use crate::errors::{PoolError, PoolResult};

struct SemaphoreState {
    permits: usize,
    closed: bool,
}

/// Counting semaphore whose permits are the pool's claimable slots.
///
/// A permit entitles the holder to claim one slot, either by popping an
/// available entry or by creating a new one. `close` wakes every blocked
/// acquirer with a terminal error.
pub(crate) struct Semaphore {
    state: Mutex<SemaphoreState>,
    wakeup: Condvar,
}

impl Semaphore {
    pub(crate) fn new(permits: usize) -> Self {
        Semaphore {
            state: Mutex::new(SemaphoreState {
                permits,
                closed: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Blocks until a permit is available or the semaphore is closed.
    pub(crate) fn acquire(&self) -> PoolResult<()> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PoolError::PoolClosed);
            }
            if state.permits > 0 {
                state.permits -= 1;
                return Ok(());
            }
            self.wakeup.wait(&mut state);
        }
    }

    /// Non-blocking variant; `Ok(false)` means no permit was available.
    pub(crate) fn try_acquire(&self) -> PoolResult<bool> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::PoolClosed);
        }
        if state.permits > 0 {
            state.permits -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        state.permits += 1;
        drop(state);
        self.wakeup.notify_one();
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.wakeup.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.state.lock().permits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn permits_count_down_and_up() {
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire().unwrap());
        assert!(sem.try_acquire().unwrap());
        assert!(!sem.try_acquire().unwrap());
        sem.release();
        assert_eq!(sem.available(), 1);
        assert!(sem.try_acquire().unwrap());
    }

    #[test]
    fn acquire_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(1));
        sem.acquire().unwrap();

        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire())
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        sem.release();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn close_wakes_blocked_acquirers() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire())
        };

        thread::sleep(Duration::from_millis(50));
        sem.close();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(PoolError::PoolClosed)));
        assert!(matches!(sem.try_acquire(), Err(PoolError::PoolClosed)));
    }
}
