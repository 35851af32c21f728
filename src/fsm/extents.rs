//! Level-2 free extents: coalesced `(start_page, run_length)` runs.

use std::collections::BTreeMap;

use crate::config::AllocationStrategy;

/// Sorted, non-overlapping, non-adjacent free runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeExtents {
    /// start page → run length
    runs: BTreeMap<u64, u64>,
    total_free: u64,
}

impl FreeExtents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from already-maximal runs
    pub fn from_runs(runs: impl IntoIterator<Item = (u64, u64)>) -> Self {
        let mut extents = Self::new();
        for (start, len) in runs {
            extents.insert(start, len);
        }
        extents
    }

    /// Total pages covered by all runs
    pub fn total_free(&self) -> u64 {
        self.total_free
    }

    /// Number of runs
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn largest(&self) -> u64 {
        self.runs.values().copied().max().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.runs.iter().map(|(&s, &l)| (s, l))
    }

    /// Add a free run, merging with neighbours
    ///
    /// The run must not overlap an existing one.
    pub fn insert(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        self.total_free += len;
        let mut start = start;
        let mut len = len;

        if let Some((&prev_start, &prev_len)) = self.runs.range(..start).next_back() {
            debug_assert!(prev_start + prev_len <= start, "overlapping free extents");
            if prev_start + prev_len == start {
                self.runs.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.runs.remove(&(start + len)) {
            len += next_len;
        }

        self.runs.insert(start, len);
    }

    /// Pick and remove `count` pages according to `strategy`
    pub fn take(&mut self, count: u64, strategy: AllocationStrategy) -> Option<u64> {
        let chosen = match strategy {
            AllocationStrategy::FirstFit => self
                .runs
                .iter()
                .find(|(_, &len)| len >= count)
                .map(|(&start, &len)| (start, len)),
            AllocationStrategy::BestFit => self
                .runs
                .iter()
                .filter(|(_, &len)| len >= count)
                .min_by_key(|(&start, &len)| (len, start))
                .map(|(&start, &len)| (start, len)),
        };

        let (start, len) = chosen?;
        self.runs.remove(&start);
        if len > count {
            self.runs.insert(start + count, len - count);
        }
        self.total_free -= count;
        Some(start)
    }

    /// Carve `[start, start+count)` out of whatever runs overlap it
    ///
    /// Returns the number of pages that were free and are now removed.
    pub fn remove_range(&mut self, start: u64, count: u64) -> u64 {
        let end = start + count;
        let overlapping: Vec<(u64, u64)> = self
            .runs
            .range(..end)
            .rev()
            .take_while(|(&s, &l)| s + l > start)
            .map(|(&s, &l)| (s, l))
            .collect();

        let mut removed = 0;
        for (run_start, run_len) in overlapping {
            let run_end = run_start + run_len;
            self.runs.remove(&run_start);
            if run_start < start {
                self.runs.insert(run_start, start - run_start);
            }
            if run_end > end {
                self.runs.insert(end, run_end - end);
            }
            removed += run_end.min(end) - run_start.max(start);
        }
        self.total_free -= removed;
        removed
    }
}
