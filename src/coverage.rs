//! Edge coverage built on top of [`Counter`].
//!
//! The same type serves two roles. As *run coverage* it records raw per-run
//! counts, incremented on each branch or call event and cleared before every
//! run. As *cumulative coverage* it stores one saturated bucket per edge:
//! the bucket of a run count `c` is the highest power of two that is ≤ `c`
//! (and `bucket(0) = 0`), so each edge carries at most 32 count classes and
//! merging is a bitwise or.

use crate::counter::Counter;

/// Highest one bit of `num`, or 0 for 0.
const fn hob(num: u32) -> u32 {
    if num == 0 {
        0
    } else {
        1 << (31 - num.leading_zeros())
    }
}

/// Cache of `hob` for small counts, which cover almost every merge.
const BUCKET_CACHE: [u32; 1024] = {
    let mut table = [0u32; 1024];
    let mut i = 0;
    while i < 1024 {
        table[i] = hob(i as u32);
        i += 1;
    }
    table
};

/// The saturation bucket of a run count.
pub fn bucket(count: u32) -> u32 {
    if (count as usize) < BUCKET_CACHE.len() {
        BUCKET_CACHE[count as usize]
    } else {
        hob(count)
    }
}

pub struct Coverage {
    counter: Counter,
}

impl Coverage {
    pub fn new() -> Self {
        Self {
            counter: Counter::new(),
        }
    }

    /// Records a branch event: edge key is `(iid << 2) | arm`.
    pub fn handle_branch(&self, iid: i32, arm: i32) {
        self.counter.increment(((iid as u32) << 2) | (arm as u32));
    }

    /// Records a call event: edge key is `(iid << 2) | 3`.
    pub fn handle_call(&self, iid: i32) {
        self.counter.increment(((iid as u32) << 2) | 3);
    }

    /// Direct edge log with the additive key `iid + arm`.
    ///
    /// This is the collision-tolerant path used when a probe cannot be placed
    /// at the precise branch target: distinct arms of nearby switches may map
    /// to the same key, and that collision is part of the recorded format.
    pub fn log_coverage(&self, iid: i32, arm: i32) {
        self.counter.increment((iid as u32).wrapping_add(arm as u32));
    }

    pub fn get(&self, key: u32) -> u32 {
        self.counter.get(key)
    }

    /// Number of distinct edges with a non-zero count.
    pub fn non_zero_count(&self) -> usize {
        self.counter.non_zero_size()
    }

    /// The distinct keys with a non-zero count.
    pub fn non_zero_keys(&self) -> Vec<u32> {
        let mut keys = self.counter.non_zero_keys();
        keys.sort_unstable();
        keys.dedup();
        keys.retain(|&k| self.counter.get(k) != 0);
        keys
    }

    /// The keys that are non-zero here but zero in `baseline`.
    pub fn compute_new_coverage(&self, baseline: &Coverage) -> Vec<u32> {
        self.non_zero_keys()
            .into_iter()
            .filter(|&k| baseline.get(k) == 0)
            .collect()
    }

    /// Ors the saturation bucket of every non-zero count in `other` into this
    /// map. Returns whether any bit was added.
    ///
    /// Both locks are held for the whole merge so that no reader can observe
    /// a half-merged cumulative map.
    pub fn update_bits(&self, other: &Coverage) -> bool {
        let mut this = self.counter.lock();
        let that = other.counter.lock();
        let mut changed = false;
        for &key in &that.non_zero_keys {
            let run_count = that.get(key);
            if run_count == 0 {
                continue;
            }
            let old = this.get(key);
            let new = old | bucket(run_count);
            if new != old {
                changed = true;
                this.counts.insert(key, new);
                if old == 0 {
                    this.non_zero_keys.push(key);
                }
            }
        }
        changed
    }

    pub fn clear(&self) {
        self.counter.clear();
    }
}

impl Default for Coverage {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Coverage {
    fn clone(&self) -> Self {
        Self {
            counter: self.counter.clone(),
        }
    }
}
