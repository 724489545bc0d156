//! Error types for store operations.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for operations that can fail with a [`StoreError`].
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by store operations.
///
/// Capacity exhaustion is deliberately absent: a rejected pool charge is
/// reported as [`Charge::Rejected`](crate::pool::Charge) and an eviction
/// shortfall as a `false` return from `free_space`. Both are operating
/// conditions the caller decides how to handle, not errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The element payload could not be serialized for the disk tier.
    ///
    /// This is a permanent rejection: the operation has no side effect and
    /// retrying with the same element will fail again.
    #[error("element is not serializable: {0}")]
    NotSerializable(#[source] bincode::Error),

    /// Reading or writing the data file failed.
    ///
    /// Fatal. Never converted into a cache miss, since that would hide
    /// data-file corruption from the caller.
    #[error("data file I/O failure: {0}")]
    Io(#[from] io::Error),

    /// An on-disk record could not be decoded back into an element.
    ///
    /// Indicates data-file corruption, treated the same as an I/O failure.
    #[error("data file record is corrupt: {0}")]
    Corrupt(#[source] bincode::Error),

    /// A timed lock acquisition expired before the lock was granted.
    ///
    /// The lock state is unchanged and the operation is safe to retry.
    #[error("lock acquisition timed out after {0:?}")]
    LockTimeout(Duration),

    /// A lock was invalidated by an external topology change (for example a
    /// cluster rejoin) between acquisition and release.
    #[error("lock state invalidated by topology change (held epoch {held}, current {current})")]
    InvalidLockState {
        /// Topology epoch observed when the lock was acquired.
        held: u64,
        /// Topology epoch observed at release.
        current: u64,
    },

    /// The store has been disposed and no longer accepts operations.
    #[error("store has been disposed")]
    Disposed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_display() {
        let e = StoreError::LockTimeout(Duration::from_millis(250));
        assert!(e.to_string().contains("250ms"));
    }

    #[test]
    fn test_invalid_lock_state_display() {
        let e = StoreError::InvalidLockState { held: 3, current: 5 };
        let msg = e.to_string();
        assert!(msg.contains("held epoch 3"));
        assert!(msg.contains("current 5"));
    }
}
