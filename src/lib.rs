//! spillcache: a tiered in-process cache store.
//!
//! This crate provides the core building blocks for caches that span a
//! fast in-memory tier and a slower disk-backed overflow tier under shared
//! resource budgets:
//!
//! - **Element**: immutable `(key, value, timing, hit count)` snapshot
//! - **KeyLock**: re-entrant per-key read/write lock, with a nonstop
//!   (timeout-bounded) variant for distributed callers
//! - **Pool / PoolAccessor**: cross-cache byte or element-count budgets
//! - **BalancedEvictor**: cost-ranked selection of which cache to shrink
//! - **Disk overflow**: placeholder/marker substitution over a
//!   log-structured data file with an asynchronous writer
//! - **CompoundStore**: the key→element map façade over both tiers
//!
//! # Architecture
//!
//! ```text
//!            +-----------------------------+
//!            |        CompoundStore        |
//!            |  (striped segments + locks) |
//!            +-------------+---------------+
//!                          |
//!            +-------------+---------------+
//!            |                             |
//!            v                             v
//!     +-------------+              +---------------+
//!     | memory tier |  overflow -> | disk factory  |
//!     | (residents) | <- fault     | (data file +  |
//!     +------+------+              | writer thread)|
//!            |                     +-------+-------+
//!            |  charges                    | charges
//!            v                             v
//!     +-------------+              +---------------+
//!     |  heap Pool  |              |   disk Pool   |
//!     +------+------+              +-------+-------+
//!            |                             |
//!            +---------> Evictor <---------+
//!                   (balanced, sampled)
//! ```
//!
//! A `put` lands in the memory tier; over capacity, cold residents are
//! substituted with placeholders and spooled to disk, where a completed
//! write installs a marker. A `get` follows whichever representation the
//! key has, faulting disk copies back into memory on read. Pools track
//! aggregate usage across every attached cache and drive the balanced
//! evictor when a budget is exceeded.
//!
//! # Example
//!
//! ```ignore
//! use spillcache::{CompoundStore, Element, StoreConfig};
//!
//! let store: CompoundStore<String, Vec<u8>> = CompoundStore::new(
//!     StoreConfig::new()
//!         .memory_capacity(10_000)
//!         .disk_capacity(1_000_000)
//!         .data_path("/var/cache/app.data"),
//! )?;
//!
//! store.put(Element::new("key".to_string(), vec![1, 2, 3]).with_ttl(300))?;
//! let hit = store.get(&"key".to_string())?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod disk;
mod element;
mod error;
mod eviction;
mod listener;
mod nonstop;
mod pool;
mod store;
mod sync;

pub use config::StoreConfig;
pub use element::{CacheKey, CacheValue, Element, ETERNAL};
pub use error::{StoreError, StoreResult};
pub use eviction::BalancedEvictor;
pub use listener::{NullListener, StoreListener};
pub use nonstop::{NonstopKeyLock, TopologyEpoch};
pub use pool::{Charge, CountSizer, ElementSizer, Pool, PoolAccessor, PoolParticipant, ShallowSizer};
pub use store::compound::{CompoundStore, StoreBuilder, Tier};
pub use sync::{KeyLock, LockGuard, LockMode};
