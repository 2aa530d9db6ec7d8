//! Split of the concurrency budget between batches and searches

/// Preferred searches-per-batch ratio of the recommend workflow
pub const PREFERRED_SEARCH_RATIO: f64 = 0.5;

/// Two-level parallelism of the analysis stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parallelism {
    /// Concurrent searches within one batch
    pub searches: usize,
    /// Concurrent batches
    pub batches: usize,
}

/// Factor `concurrency` into `searches * batches` with `searches / batches`
/// as close as possible to `preferred_ratio`.
///
/// Divisors are tried in ascending order of `searches`; the first minimum
/// wins. The product always equals the budget exactly.
pub fn plan_parallelism(concurrency: usize, preferred_ratio: f64) -> Parallelism {
    let concurrency = concurrency.max(1);
    let mut best = Parallelism {
        searches: 1,
        batches: concurrency,
    };
    let mut min_diff = f64::MAX;

    for searches in (1..=concurrency).filter(|s| concurrency % s == 0) {
        let batches = concurrency / searches;
        let diff = (searches as f64 / batches as f64 - preferred_ratio).abs();
        if diff < min_diff {
            min_diff = diff;
            best = Parallelism { searches, batches };
        }
    }

    best
}
