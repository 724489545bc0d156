//! Timeout-aware ("nonstop") lock wrappers.
//!
//! A [`NonstopKeyLock`] wraps a local [`KeyLock`] with a bounded
//! acquisition: operations that would block past the configured timeout
//! fail with [`StoreError::LockTimeout`] instead of blocking indefinitely.
//! Release is validated against a [`TopologyEpoch`] — an epoch counter
//! advanced by the external cluster collaborator on topology changes such
//! as a rejoin. Unlocking a hold acquired under an older epoch fails with
//! [`StoreError::InvalidLockState`] rather than being swallowed, after the
//! local lock state has been cleaned up.

use crate::error::{StoreError, StoreResult};
use crate::sync::{KeyLock, LockMode};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Monotone counter tracking cluster topology generations.
///
/// The core never advances this itself; the external cluster collaborator
/// calls [`advance`](TopologyEpoch::advance) when the topology changes.
/// A process-local deployment simply never advances it.
#[derive(Debug, Default)]
pub struct TopologyEpoch(AtomicU64);

impl TopologyEpoch {
    /// Create an epoch counter at generation zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current generation.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Advance to the next generation. Returns the new generation.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

thread_local! {
    /// Epochs recorded at acquisition, per (lock address, mode), newest last.
    static ACQUISITIONS: RefCell<Vec<(usize, LockMode, u64)>> = const { RefCell::new(Vec::new()) };
}

/// Timeout-bounded view of a [`KeyLock`].
pub struct NonstopKeyLock<'a> {
    delegate: &'a KeyLock,
    timeout: Duration,
    topology: Arc<TopologyEpoch>,
}

impl<'a> NonstopKeyLock<'a> {
    /// Wrap `delegate` with the given timeout and topology watch.
    pub fn new(delegate: &'a KeyLock, timeout: Duration, topology: Arc<TopologyEpoch>) -> Self {
        Self {
            delegate,
            timeout,
            topology,
        }
    }

    fn lock_id(&self) -> usize {
        self.delegate as *const KeyLock as usize
    }

    fn record_acquisition(&self, mode: LockMode) {
        let epoch = self.topology.current();
        let id = self.lock_id();
        ACQUISITIONS.with(|stack| stack.borrow_mut().push((id, mode, epoch)));
    }

    /// Acquire the lock, failing with [`StoreError::LockTimeout`] once the
    /// configured timeout elapses. The lock state is unchanged on timeout.
    pub fn lock(&self, mode: LockMode) -> StoreResult<()> {
        if self.delegate.try_lock(mode, self.timeout) {
            self.record_acquisition(mode);
            Ok(())
        } else {
            Err(StoreError::LockTimeout(self.timeout))
        }
    }

    /// Try to acquire the lock within `timeout`, capped by the configured
    /// nonstop timeout. Returns whether the lock was acquired.
    pub fn try_lock(&self, mode: LockMode, timeout: Duration) -> StoreResult<bool> {
        let bounded = timeout.min(self.timeout);
        if self.delegate.try_lock(mode, bounded) {
            self.record_acquisition(mode);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Release the lock.
    ///
    /// If the topology epoch advanced since acquisition, the local lock
    /// state is still cleaned up but the call reports
    /// [`StoreError::InvalidLockState`] so the caller knows the cluster-side
    /// hold did not survive the topology change. Releasing a lock this
    /// wrapper does not hold is a no-op.
    pub fn unlock(&self, mode: LockMode) -> StoreResult<()> {
        let id = self.lock_id();
        let recorded = ACQUISITIONS.with(|stack| {
            let mut stack = stack.borrow_mut();
            let index = stack
                .iter()
                .rposition(|&(lock, held_mode, _)| lock == id && held_mode == mode);
            index.map(|i| stack.remove(i).2)
        });

        // Clean up the local hold regardless of epoch validity.
        self.delegate.unlock(mode);

        match recorded {
            Some(held) => {
                let current = self.topology.current();
                if held == current {
                    Ok(())
                } else {
                    Err(StoreError::InvalidLockState { held, current })
                }
            }
            None => Ok(()),
        }
    }

    /// Whether the calling thread holds the underlying lock in `mode`.
    pub fn is_held_by_current_thread(&self, mode: LockMode) -> bool {
        self.delegate.is_held_by_current_thread(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn nonstop<'a>(lock: &'a KeyLock, topology: &Arc<TopologyEpoch>) -> NonstopKeyLock<'a> {
        NonstopKeyLock::new(lock, Duration::from_millis(50), Arc::clone(topology))
    }

    #[test]
    fn test_lock_and_unlock() {
        let lock = KeyLock::new();
        let topology = Arc::new(TopologyEpoch::new());
        let ns = nonstop(&lock, &topology);
        ns.lock(LockMode::Write).unwrap();
        assert!(ns.is_held_by_current_thread(LockMode::Write));
        ns.unlock(LockMode::Write).unwrap();
        assert!(!ns.is_held_by_current_thread(LockMode::Write));
    }

    #[test]
    fn test_timeout_is_distinguished() {
        let lock = Arc::new(KeyLock::new());
        let topology = Arc::new(TopologyEpoch::new());
        lock.lock(LockMode::Write);

        let contender = {
            let lock = Arc::clone(&lock);
            let topology = Arc::clone(&topology);
            thread::spawn(move || {
                let ns = nonstop(&lock, &topology);
                ns.lock(LockMode::Write)
            })
        };
        let result = contender.join().unwrap();
        assert!(matches!(result, Err(StoreError::LockTimeout(_))));
        lock.unlock(LockMode::Write);
        // the timed-out acquisition left the lock state unchanged
        assert!(lock.try_lock(LockMode::Write, Duration::ZERO));
        lock.unlock(LockMode::Write);
    }

    #[test]
    fn test_rejoin_invalidates_unlock() {
        let lock = KeyLock::new();
        let topology = Arc::new(TopologyEpoch::new());
        let ns = nonstop(&lock, &topology);
        ns.lock(LockMode::Write).unwrap();
        topology.advance();
        let result = ns.unlock(LockMode::Write);
        assert!(matches!(
            result,
            Err(StoreError::InvalidLockState {
                held: 0,
                current: 1
            })
        ));
        // local state was cleaned up anyway
        assert!(!lock.is_held_by_current_thread(LockMode::Write));
    }

    #[test]
    fn test_unlock_without_hold_is_noop() {
        let lock = KeyLock::new();
        let topology = Arc::new(TopologyEpoch::new());
        let ns = nonstop(&lock, &topology);
        ns.unlock(LockMode::Read).unwrap();
        ns.unlock(LockMode::Write).unwrap();
    }
}
