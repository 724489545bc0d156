//! Per-key read/write synchronization.
//!
//! [`KeyLock`] is a re-entrant read/write lock with full per-thread hold
//! accounting:
//!
//! - Read mode is shared; write mode is exclusive.
//! - Both modes are re-entrant for the holding thread, and a thread holding
//!   the write lock may also acquire the read lock.
//! - `unlock` is a no-op when the calling thread does not hold the lock.
//! - `is_held_by_current_thread` answers for both modes without blocking.
//!
//! Requesting the write lock while holding only the read lock is not an
//! upgrade: the request blocks until all readers (including the caller)
//! have released. Callers needing both modes acquire write first.
//!
//! The accounting lives behind a [`parking_lot::Mutex`] with a
//! [`parking_lot::Condvar`] for waiters; this keeps the grant logic simple
//! enough to state the re-entrancy rules exactly, at a cost that is
//! acceptable for a lock acquired once per store operation.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Lock acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared mode: any number of concurrent holders while no writer holds.
    Read,
    /// Exclusive mode: a single holding thread.
    Write,
}

#[derive(Default)]
struct HoldState {
    /// Per-thread read hold counts.
    readers: HashMap<ThreadId, usize>,
    /// Write owner and its re-entrant hold count.
    writer: Option<(ThreadId, usize)>,
}

impl HoldState {
    fn read_grantable(&self, me: ThreadId) -> bool {
        match self.writer {
            None => true,
            Some((owner, _)) => owner == me,
        }
    }

    fn write_grantable(&self, me: ThreadId) -> bool {
        match self.writer {
            Some((owner, _)) => owner == me,
            None => self.readers.is_empty(),
        }
    }

    fn grant(&mut self, mode: LockMode, me: ThreadId) {
        match mode {
            LockMode::Read => {
                *self.readers.entry(me).or_insert(0) += 1;
            }
            LockMode::Write => match self.writer {
                Some((owner, holds)) if owner == me => self.writer = Some((owner, holds + 1)),
                _ => self.writer = Some((me, 1)),
            },
        }
    }

    fn grantable(&self, mode: LockMode, me: ThreadId) -> bool {
        match mode {
            LockMode::Read => self.read_grantable(me),
            LockMode::Write => self.write_grantable(me),
        }
    }
}

/// Re-entrant per-key read/write lock.
pub struct KeyLock {
    state: Mutex<HoldState>,
    available: Condvar,
}

impl Default for KeyLock {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyLock {
    /// Create an unheld lock.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HoldState::default()),
            available: Condvar::new(),
        }
    }

    /// Acquire the lock in the given mode, blocking until granted.
    pub fn lock(&self, mode: LockMode) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while !state.grantable(mode, me) {
            self.available.wait(&mut state);
        }
        state.grant(mode, me);
    }

    /// Try to acquire the lock in the given mode within `timeout`.
    ///
    /// Returns whether the lock was acquired. Expiry does not disturb the
    /// lock state.
    pub fn try_lock(&self, mode: LockMode, timeout: Duration) -> bool {
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.grantable(mode, me) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if self.available.wait_for(&mut state, remaining).timed_out()
                && !state.grantable(mode, me)
            {
                return false;
            }
        }
        state.grant(mode, me);
        true
    }

    /// Release one hold in the given mode.
    ///
    /// No-op when the calling thread does not hold the lock in that mode.
    pub fn unlock(&self, mode: LockMode) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let released = match mode {
            LockMode::Read => {
                if let Some(holds) = state.readers.get_mut(&me) {
                    *holds -= 1;
                    if *holds == 0 {
                        state.readers.remove(&me);
                    }
                    true
                } else {
                    false
                }
            }
            LockMode::Write => match state.writer {
                Some((owner, holds)) if owner == me => {
                    state.writer = if holds == 1 {
                        None
                    } else {
                        Some((owner, holds - 1))
                    };
                    true
                }
                _ => false,
            },
        };
        if released && state.writer.is_none() {
            self.available.notify_all();
        }
    }

    /// Whether the calling thread currently holds the lock in `mode`.
    pub fn is_held_by_current_thread(&self, mode: LockMode) -> bool {
        let me = thread::current().id();
        let state = self.state.lock();
        match mode {
            LockMode::Read => state.readers.contains_key(&me),
            LockMode::Write => matches!(state.writer, Some((owner, _)) if owner == me),
        }
    }

    /// Acquire a read hold released when the guard drops.
    pub fn read_guard(&self) -> LockGuard<'_> {
        self.lock(LockMode::Read);
        LockGuard {
            lock: self,
            mode: LockMode::Read,
        }
    }

    /// Acquire a write hold released when the guard drops.
    pub fn write_guard(&self) -> LockGuard<'_> {
        self.lock(LockMode::Write);
        LockGuard {
            lock: self,
            mode: LockMode::Write,
        }
    }

    /// Try to acquire a guard within `timeout`.
    pub fn try_guard(&self, mode: LockMode, timeout: Duration) -> Option<LockGuard<'_>> {
        if self.try_lock(mode, timeout) {
            Some(LockGuard { lock: self, mode })
        } else {
            None
        }
    }
}

/// RAII hold on a [`KeyLock`], released on drop.
pub struct LockGuard<'a> {
    lock: &'a KeyLock,
    mode: LockMode,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock(self.mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_read_reentrant() {
        let lock = KeyLock::new();
        lock.lock(LockMode::Read);
        lock.lock(LockMode::Read);
        assert!(lock.is_held_by_current_thread(LockMode::Read));
        lock.unlock(LockMode::Read);
        assert!(lock.is_held_by_current_thread(LockMode::Read));
        lock.unlock(LockMode::Read);
        assert!(!lock.is_held_by_current_thread(LockMode::Read));
    }

    #[test]
    fn test_write_reentrant() {
        let lock = KeyLock::new();
        lock.lock(LockMode::Write);
        lock.lock(LockMode::Write);
        lock.unlock(LockMode::Write);
        assert!(lock.is_held_by_current_thread(LockMode::Write));
        lock.unlock(LockMode::Write);
        assert!(!lock.is_held_by_current_thread(LockMode::Write));
    }

    #[test]
    fn test_read_under_write() {
        let lock = KeyLock::new();
        lock.lock(LockMode::Write);
        assert!(lock.try_lock(LockMode::Read, Duration::ZERO));
        assert!(lock.is_held_by_current_thread(LockMode::Read));
        lock.unlock(LockMode::Read);
        lock.unlock(LockMode::Write);
    }

    #[test]
    fn test_unlock_not_held_is_noop() {
        let lock = KeyLock::new();
        lock.unlock(LockMode::Read);
        lock.unlock(LockMode::Write);
        assert!(lock.try_lock(LockMode::Write, Duration::ZERO));
        lock.unlock(LockMode::Write);
    }

    #[test]
    fn test_write_excludes_write() {
        let lock = Arc::new(KeyLock::new());
        lock.lock(LockMode::Write);
        let contender = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.try_lock(LockMode::Write, Duration::from_millis(50)))
        };
        assert!(!contender.join().unwrap());
        lock.unlock(LockMode::Write);
    }

    #[test]
    fn test_write_excludes_read_from_other_thread() {
        let lock = Arc::new(KeyLock::new());
        lock.lock(LockMode::Write);
        let contender = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.try_lock(LockMode::Read, Duration::from_millis(50)))
        };
        assert!(!contender.join().unwrap());
        lock.unlock(LockMode::Write);
    }

    #[test]
    fn test_concurrent_readers_granted() {
        let lock = Arc::new(KeyLock::new());
        let holders = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let holders = Arc::clone(&holders);
            let peak = Arc::clone(&peak);
            threads.push(thread::spawn(move || {
                let _guard = lock.read_guard();
                let n = holders.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(n, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                holders.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn test_writer_waits_for_readers() {
        let lock = Arc::new(KeyLock::new());
        lock.lock(LockMode::Read);
        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let acquired = lock.try_lock(LockMode::Write, Duration::from_secs(5));
                if acquired {
                    lock.unlock(LockMode::Write);
                }
                acquired
            })
        };
        thread::sleep(Duration::from_millis(20));
        lock.unlock(LockMode::Read);
        assert!(writer.join().unwrap());
    }
}
