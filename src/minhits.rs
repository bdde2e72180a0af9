//! Monte Carlo calibration of the minimum seed-hit threshold.
//!
//! For a query with `validKmers` usable k-mers, `min_hits` answers: how many
//! seed hits must be observed so that a true indel-free alignment within the
//! substitution and clipping budgets is detected with probability at least
//! `min_prob`? A result of 0 means this K cannot satisfy the target for that
//! query length; the caller reacts by selecting a smaller K.

use rand::{Rng, SeedableRng, XorShiftRng};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::kmer::KmerSpec;

/// Monte Carlo minimum-seed-hit calculator for one K; shared across workers.
pub struct MinHitsCalculator {
    k: u32,
    mid_mask_len: u32,
    wildcard_mask: u64,
    max_subs: u32,
    min_identity: f64,
    min_prob: f64,
    max_clip: f64,
    k_step: usize,
    iters: usize,
    cache: Mutex<HashMap<usize, u32>>,
}

impl MinHitsCalculator {
    /// Build a calculator for one K bucket.
    pub fn new(spec: &KmerSpec,
               mid_mask_len: u32,
               max_subs: u32,
               min_identity: f64,
               min_prob: f64,
               max_clip: f64,
               k_step: usize,
               iters: usize)
               -> MinHitsCalculator {
        MinHitsCalculator {
            k: spec.k,
            mid_mask_len: mid_mask_len,
            wildcard_mask: spec.wildcard_mask,
            max_subs: max_subs,
            min_identity: min_identity,
            min_prob: min_prob,
            max_clip: max_clip,
            k_step: k_step.max(1),
            iters: iters,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Minimum seed hits required for a query with `valid_kmers` usable
    /// k-mers. Memoized per key; the simulation runs at most once per key.
    pub fn min_hits(&self, valid_kmers: usize) -> u32 {
        if valid_kmers == 0 {
            return 0;
        }

        let mut cache = self.cache.lock().unwrap();
        if let Some(&cached) = cache.get(&valid_kmers) {
            return cached;
        }
        let computed = self.compute(valid_kmers);
        cache.insert(valid_kmers, computed);
        computed
    }

    /// Budgets derived from the query length implied by `valid_kmers`.
    fn budgets(&self, valid_kmers: usize) -> (usize, u32, u32) {
        let query_len = valid_kmers + self.k as usize - 1;
        let ident_cap = (query_len as f64 * (1.0 - self.min_identity)).floor() as u32;
        let max_subs = self.max_subs.min(ident_cap);
        let max_clips = if self.max_clip < 1.0 {
            (self.max_clip * query_len as f64).floor() as u32
        } else {
            self.max_clip.floor() as u32
        };
        (query_len, max_subs, max_clips)
    }

    fn compute(&self, valid_kmers: usize) -> u32 {
        let (query_len, max_subs, max_clips) = self.budgets(valid_kmers);
        let span = (self.k - self.mid_mask_len) as i64;

        // deterministic shortcuts
        if self.min_prob >= 1.0 {
            let floor = valid_kmers as i64
                - span.max(2) * max_subs as i64
                - max_clips as i64;
            return floor.max(1) as u32;
        }
        if self.min_prob == 0.0 {
            return valid_kmers as u32;
        }
        if self.min_prob < 0.0 {
            return 1;
        }

        let expected_upper =
            (valid_kmers as f64 - 0.45 * span as f64 * max_subs as f64).max(0.0).ceil();
        if expected_upper < 1.0 {
            return 0;
        }

        self.simulate(valid_kmers, query_len, max_subs, max_clips)
    }

    /// Place `max_subs` random errors, count error-free sampled k-mers, and
    /// read the threshold off the high tail of the histogram.
    fn simulate(&self,
                valid_kmers: usize,
                query_len: usize,
                max_subs: u32,
                max_clips: u32)
                -> u32 {
        let iters = self.iters;
        let max_failures = (iters as f64 * (1.0 - self.min_prob)) as usize;
        let early_window = iters / 16;

        let mut rng = seeded_rng(valid_kmers as u32, self.k);
        let mut errors = vec![false; query_len];
        let mut hist = vec![0usize; valid_kmers + 1];
        let mut failures = 0usize;

        for iter in 0..iters {
            for e in errors.iter_mut() {
                *e = false;
            }
            for _ in 0..max_subs {
                let pos = rng.gen_range(0, query_len);
                errors[pos] = true;
            }

            let hits = self.count_clean_kmers(&errors, valid_kmers);
            hist[hits] += 1;

            if hits == 0 {
                failures += 1;
                if failures > max_failures {
                    return 0;
                }
                if iter < early_window && failures * 4 > max_failures {
                    return 0;
                }
            }
        }

        let target = (iters as f64 * self.min_prob) as usize;
        let mut cumulative = 0usize;
        let mut threshold = 0usize;
        for hits in (0..=valid_kmers).rev() {
            cumulative += hist[hits];
            if cumulative >= target {
                threshold = hits;
                break;
            }
        }

        let cap = valid_kmers as i64 - max_subs as i64 - max_clips as i64;
        (threshold as i64).min(cap).max(0) as u32
    }

    /// Branchless error-free-k-mer counter: shift a new error bit in per
    /// position and test the non-wildcard window against zero.
    fn count_clean_kmers(&self, errors: &[bool], valid_kmers: usize) -> usize {
        let k = self.k as usize;
        let bits_mask = (1u64 << k) - 1;
        let phase = (k - 1) % self.k_step;
        let mut pattern = 0u64;
        let mut hits = 0usize;

        for (pos, &e) in errors.iter().enumerate() {
            pattern = ((pattern << 1) | e as u64) & bits_mask;
            if pos + 1 >= k && pos % self.k_step == phase {
                hits += ((pattern & self.wildcard_mask) == 0) as usize;
            }
        }

        hits.min(valid_kmers)
    }
}

/// Deterministic per-key generator so thresholds are reproducible run to run.
fn seeded_rng(a: u32, b: u32) -> XorShiftRng {
    XorShiftRng::from_seed([0x193a_6754 ^ a,
                            0xa8a7_d469,
                            0x9783_0e05 ^ b,
                            0x113b_a7bb])
}
