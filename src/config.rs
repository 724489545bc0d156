//! Configuration for a compound store.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a compound store instance.
///
/// The store consumes values from this object; it does not parse
/// configuration files. All capacities are element counts; shared byte
/// budgets across stores are configured separately through
/// [`Pool`](crate::pool::Pool) attachment.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum number of elements resident in the memory tier.
    /// `0` means unbounded.
    pub memory_capacity: usize,

    /// Maximum number of elements on disk. `0` means unbounded.
    pub disk_capacity: usize,

    /// Spool buffer size in bytes. When the serialized bytes queued for the
    /// disk writer exceed this bound, `buffer_full()` reports back-pressure.
    pub spool_buffer_bytes: u64,

    /// Interval between expiry sweeps on the disk writer thread.
    pub expiry_interval: Duration,

    /// Number of lock stripes (segments). Rounded up to a power of two.
    pub segment_count: usize,

    /// Path of the data file backing the disk tier.
    pub data_path: PathBuf,

    /// Default time-to-live in seconds applied to elements that carry
    /// none. `0` means no default.
    pub ttl_secs: u32,

    /// Default time-to-idle in seconds applied to elements that carry
    /// none. `0` means no default.
    pub tti_secs: u32,

    /// Timeout applied by nonstop lock wrappers.
    pub nonstop_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 0,
            disk_capacity: 0,
            spool_buffer_bytes: 30 * 1024 * 1024,
            expiry_interval: Duration::from_secs(120),
            segment_count: 64,
            data_path: PathBuf::from("spillcache.data"),
            ttl_secs: 0,
            tti_secs: 0,
            nonstop_timeout: Duration::from_secs(30),
        }
    }
}

impl StoreConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory tier capacity in elements (`0` = unbounded).
    pub fn memory_capacity(mut self, capacity: usize) -> Self {
        self.memory_capacity = capacity;
        self
    }

    /// Set the disk tier capacity in elements (`0` = unbounded).
    pub fn disk_capacity(mut self, capacity: usize) -> Self {
        self.disk_capacity = capacity;
        self
    }

    /// Set the spool buffer bound in bytes.
    pub fn spool_buffer_bytes(mut self, bytes: u64) -> Self {
        self.spool_buffer_bytes = bytes;
        self
    }

    /// Set the expiry sweep interval.
    pub fn expiry_interval(mut self, interval: Duration) -> Self {
        self.expiry_interval = interval;
        self
    }

    /// Set the number of lock stripes. Rounded up to a power of two.
    pub fn segment_count(mut self, count: usize) -> Self {
        self.segment_count = count;
        self
    }

    /// Set the data file path for the disk tier.
    pub fn data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = path.into();
        self
    }

    /// Set the default time-to-live in seconds (`0` = none).
    pub fn ttl_secs(mut self, ttl_secs: u32) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Set the default time-to-idle in seconds (`0` = none).
    pub fn tti_secs(mut self, tti_secs: u32) -> Self {
        self.tti_secs = tti_secs;
        self
    }

    /// Set the nonstop lock timeout.
    pub fn nonstop_timeout(mut self, timeout: Duration) -> Self {
        self.nonstop_timeout = timeout;
        self
    }

    /// Effective stripe count: `segment_count` rounded up to a power of two,
    /// minimum 1.
    pub fn stripes(&self) -> usize {
        self.segment_count.max(1).next_power_of_two()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stripes_rounded_to_power_of_two() {
        assert_eq!(StoreConfig::new().segment_count(1).stripes(), 1);
        assert_eq!(StoreConfig::new().segment_count(3).stripes(), 4);
        assert_eq!(StoreConfig::new().segment_count(64).stripes(), 64);
        assert_eq!(StoreConfig::new().segment_count(65).stripes(), 128);
        assert_eq!(StoreConfig::new().segment_count(0).stripes(), 1);
    }

    #[test]
    fn test_builder_chain() {
        let config = StoreConfig::new()
            .memory_capacity(100)
            .disk_capacity(1000)
            .spool_buffer_bytes(1024)
            .data_path("/tmp/cache.data");
        assert_eq!(config.memory_capacity, 100);
        assert_eq!(config.disk_capacity, 1000);
        assert_eq!(config.spool_buffer_bytes, 1024);
        assert_eq!(config.data_path, PathBuf::from("/tmp/cache.data"));
    }
}
