//! Eviction policies.
//!
//! - [`BalancedEvictor`]: cost-ranked cross-cache eviction for shared pools.
//!
//! Per-store eviction of individual entries (lowest-hit-count sampling) is
//! implemented by the tiers themselves; this module decides *which cache*
//! to shrink when a shared budget is exceeded.

mod balanced;

pub use balanced::BalancedEvictor;
