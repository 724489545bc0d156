//! Balanced cost-based pool eviction.
//!
//! When a shared pool must free space, candidates are processed in
//! fixed-size random samples rather than globally sorted: with thousands of
//! caches sharing one pool, sampling bounds the number of cost-function
//! evaluations per reclaim. Within each sample, stores are ranked by an
//! eviction cost and tried cheapest-first until one reports success.
//!
//! The cost of evicting from a store is
//!
//! ```text
//! cost = (hits / count) * fill_level^(-ALPHA)
//! fill_level = hits / (hits + misses)
//! ```
//!
//! so stores with many rarely-hit elements rank cheap and hot, well-filled
//! stores rank expensive. Two special cases:
//!
//! - A store with zero accesses costs `-inf` when it holds more than the
//!   pool's unloaded average (evict first), `+inf` otherwise (never evict
//!   first). Preferring large-but-idle stores here is an inherited policy
//!   choice worth re-validating against real workloads.
//! - A store with zero hits but nonzero misses costs `+inf`, protecting
//!   cold-but-requested stores.
//!
//! A `NaN` cost means the store's statistics are inconsistent; that is a
//! defect, not an operating condition, and panics.

use crate::pool::PoolParticipant;
use rand::seq::SliceRandom;
use std::sync::Arc;

/// Stores ranked per sample batch.
const SAMPLE_SIZE: usize = 5;

/// Exponent applied to the fill level in the cost function.
const ALPHA: f64 = 1.0;

/// Cost-ranking evictor for shared pools.
#[derive(Debug, Default)]
pub struct BalancedEvictor;

impl BalancedEvictor {
    /// Create an evictor.
    pub fn new() -> Self {
        Self
    }

    /// Free `bytes` across `stores`.
    ///
    /// Shuffles the candidates, then walks them in batches of
    /// [`SAMPLE_SIZE`], ranking each batch by eviction cost and asking the
    /// cheapest stores to evict until the reclaim target is met or every
    /// store has been tried once. Each successful store eviction requests a
    /// proportional element count (`bytes * count / byte_size`, minimum 1)
    /// alongside the raw byte amount.
    ///
    /// Returns `true` when the pass released any space; a full pass that
    /// frees nothing returns `false`. Retry policy belongs to the caller.
    pub fn free_space(
        &self,
        stores: &[Arc<dyn PoolParticipant>],
        bytes: u64,
        unloaded_average: f64,
    ) -> bool {
        if bytes == 0 {
            return true;
        }
        if stores.is_empty() {
            return false;
        }

        let initial = total_bytes(stores);
        let target = initial.saturating_sub(bytes);

        let mut candidates: Vec<Arc<dyn PoolParticipant>> = stores.to_vec();
        candidates.shuffle(&mut rand::thread_rng());

        for sample in candidates.chunks(SAMPLE_SIZE) {
            let mut ranked: Vec<(f64, &Arc<dyn PoolParticipant>)> = sample
                .iter()
                .map(|store| (eviction_cost(store.as_ref(), unloaded_average), store))
                .collect();
            ranked.sort_by(|a, b| a.0.total_cmp(&b.0));

            for (_, store) in ranked {
                let count_size = store.count_size();
                let byte_size = store.byte_size();
                let count = if byte_size == 0 {
                    1
                } else {
                    (bytes.saturating_mul(count_size) / byte_size).max(1)
                };
                if store.evict(count, bytes) {
                    if total_bytes(stores) <= target {
                        return true;
                    }
                    break;
                }
            }
        }

        total_bytes(stores) < initial
    }
}

fn total_bytes(stores: &[Arc<dyn PoolParticipant>]) -> u64 {
    stores.iter().map(|s| s.byte_size()).sum()
}

/// Rank a store for eviction. Lower is cheaper to evict.
fn eviction_cost(store: &dyn PoolParticipant, unloaded_average: f64) -> f64 {
    let hits = store.hit_count() as f64;
    let misses = store.miss_count() as f64;
    let accesses = hits + misses;

    if accesses == 0.0 {
        return if store.byte_size() as f64 > unloaded_average {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
    }
    if hits == 0.0 {
        return f64::INFINITY;
    }

    let count = store.count_size() as f64;
    let fill_level = hits / accesses;
    let cost = (hits / count) * fill_level.powf(-ALPHA);
    assert!(
        !cost.is_nan(),
        "eviction cost is NaN: store statistics are inconsistent"
    );
    cost
}
