//! Split the pending list into one contiguous shard per credential.
//!
//! Shards are contiguous ranges of the scan order, not round-robin, so the
//! pages of one book stay with one worker. Sizes are balanced: the first
//! `M mod N` shards hold `ceil(M/N)` units and the rest `floor(M/N)`, which
//! keeps every pair of shards within one unit of each other. Ten pages over
//! three keys gives 4, 3, 3.

use crate::catalog::WorkUnit;
use crate::error::PipelineError;

/// Ordered units owned by exactly one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shard {
    /// 1-based worker number that owns this shard.
    pub worker_id: usize,
    pub units: Vec<WorkUnit>,
}

impl Shard {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Sizes of `n` balanced contiguous shards over `m` units.
pub fn shard_sizes(m: usize, n: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let base = m / n;
    let extra = m % n;
    (0..n).map(|i| base + usize::from(i < extra)).collect()
}

/// Partition `units` into exactly `workers` shards, preserving order.
///
/// Shards may be empty when there are more workers than units.
pub fn partition(units: Vec<WorkUnit>, workers: usize) -> Result<Vec<Shard>, PipelineError> {
    if workers == 0 {
        return Err(PipelineError::InvalidConfig(
            "Cannot partition work across zero credentials".into(),
        ));
    }

    let sizes = shard_sizes(units.len(), workers);
    let mut remaining = units.into_iter();
    let shards = sizes
        .into_iter()
        .enumerate()
        .map(|(i, size)| Shard {
            worker_id: i + 1,
            units: remaining.by_ref().take(size).collect(),
        })
        .collect();
    Ok(shards)
}
