//! Preprocessed query records and per-K bucketing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::AlignConfig;
use crate::kmer::{KmerSpec, BAD_KMER};
use crate::minhits::MinHitsCalculator;
use crate::util::{normalize_bases, revcomp};

/// A read prepared for alignment: both orientations, k-mer arrays under the
/// selected K, and the derived seed/substitution/clipping budgets. Immutable
/// after construction except for the primary-alignment claim.
pub struct Query {
    /// Read name as it will appear in SAM QNAME.
    pub name: String,
    /// Uppercased ACGTN bases.
    pub bases: Vec<u8>,
    /// Reverse complement of `bases`.
    pub rbases: Vec<u8>,
    /// ASCII-encoded qualities when the input was FASTQ.
    pub quals: Option<Vec<u8>>,
    /// Index of the selected K in the candidate list (last = fallback).
    pub k_index: usize,
    /// Forward masked k-mer array; `BAD_KMER` marks invalid windows.
    pub kmers: Vec<i64>,
    /// K-mer array of the reverse complement, stored reversed so index `i`
    /// covers the same forward window on either strand.
    pub rkmers: Vec<i64>,
    /// Count of valid entries in `kmers`.
    pub valid_kmers: u32,
    /// Calibrated seed-hit threshold; 0 means brute force only.
    pub min_hits: u32,
    /// Seed misses tolerated before a (query, strand) pass is abandoned.
    pub max_misses: i64,
    /// Clipping budget in bases.
    pub max_clips: u32,
    primary_taken: AtomicBool,
}

impl Query {
    /// Build a query, selecting the largest candidate K whose calibrated
    /// threshold meets the global floor. Falls back to the smallest K when
    /// none qualifies.
    pub fn new(name: String,
               seq: &[u8],
               quals: Option<Vec<u8>>,
               cfg: &AlignConfig,
               specs: &[KmerSpec],
               calculators: &[MinHitsCalculator])
               -> Query {
        let bases = normalize_bases(seq);
        let rbases = revcomp(&bases);

        let mut k_index = specs.len().saturating_sub(1);
        let mut min_hits = 0u32;
        for (idx, spec) in specs.iter().enumerate() {
            let candidate_valid = spec.count_valid(&bases) as u32;
            if candidate_valid == 0 {
                continue;
            }
            let hits = calculators[idx].min_hits(candidate_valid as usize);
            if hits >= cfg.min_hits && hits > 0 {
                k_index = idx;
                min_hits = hits;
                break;
            }
        }

        let (kmers, rkmers, valid_kmers) = match specs.get(k_index) {
            Some(spec) => {
                let kmers = spec.kmers(&bases);
                let mut rkmers = spec.kmers(&rbases);
                rkmers.reverse();
                let valid = kmers.iter().filter(|&&k| k != BAD_KMER).count() as u32;
                (kmers, rkmers, valid)
            },
            None => (Vec::new(), Vec::new(), 0),
        };

        // the fallback bucket may still have selected min_hits = 0; recompute
        // for the K actually built so budgets line up with the arrays
        if min_hits == 0 && valid_kmers > 0 && !calculators.is_empty() {
            min_hits = calculators[k_index].min_hits(valid_kmers as usize);
        }

        let max_misses = if min_hits == 0 {
            0
        } else {
            (valid_kmers as usize / cfg.q_step) as i64 - min_hits as i64
        };

        Query {
            name: name,
            max_clips: cfg.max_clips_for(bases.len()),
            bases: bases,
            rbases: rbases,
            quals: quals,
            k_index: k_index,
            kmers: kmers,
            rkmers: rkmers,
            valid_kmers: valid_kmers,
            min_hits: min_hits,
            max_misses: max_misses,
            primary_taken: AtomicBool::new(false),
        }
    }

    /// Query length in bases.
    pub fn len(&self) -> usize {
        self.bases.len()
    }

    /// True for zero-length queries.
    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    /// True when this query can be served by the k-mer index.
    pub fn indexable(&self) -> bool {
        self.valid_kmers > 0 && self.min_hits > 0
    }

    /// Claim the primary-alignment slot; true exactly once per run.
    pub fn claim_primary(&self) -> bool {
        !self.primary_taken.swap(true, Ordering::SeqCst)
    }

    /// Per-query substitution cap.
    pub fn max_subs(&self, cfg: &AlignConfig) -> u32 {
        cfg.max_subs_for(self.len())
    }
}

/// Queries grouped by their selected K; bucket order matches the candidate
/// list, and the last bucket doubles as the brute-force fallback.
pub struct QueryBuckets {
    /// One bucket per candidate K (a single bucket when indexing is off).
    pub buckets: Vec<Vec<Arc<Query>>>,
    /// Longest query seen; sets the fused-reference padding.
    pub max_query_len: usize,
}

impl QueryBuckets {
    /// Allocate empty buckets for `n_ks` candidates.
    pub fn new(n_ks: usize) -> QueryBuckets {
        QueryBuckets {
            buckets: vec![Vec::new(); n_ks.max(1)],
            max_query_len: 0,
        }
    }

    /// File a query under its selected K.
    pub fn push(&mut self, query: Query) {
        self.max_query_len = self.max_query_len.max(query.len());
        let idx = query.k_index.min(self.buckets.len() - 1);
        self.buckets[idx].push(Arc::new(query));
    }

    /// Total query count across buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// True when no queries were loaded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use crate::config::AlignConfig;
    use crate::kmer::KmerSpec;
    use crate::minhits::MinHitsCalculator;
    use super::*;

    fn setup(cfg: &AlignConfig) -> (Vec<KmerSpec>, Vec<MinHitsCalculator>) {
        let specs: Vec<KmerSpec> = cfg.ks.iter()
            .map(|&k| KmerSpec::new(k, cfg.mid_mask_len, cfg.blacklist))
            .collect();
        let calcs: Vec<MinHitsCalculator> = specs.iter()
            .map(|spec| {
                MinHitsCalculator::new(spec,
                                       cfg.mid_mask_len,
                                       cfg.max_subs,
                                       cfg.min_identity,
                                       cfg.min_prob,
                                       cfg.max_clip,
                                       cfg.q_step,
                                       cfg.mc_iters)
            })
            .collect();
        (specs, calcs)
    }

    fn query(seq: &[u8], cfg: &AlignConfig) -> Query {
        let (specs, calcs) = setup(cfg);
        Query::new("q".to_string(), seq, None, cfg, &specs, &calcs)
    }

    #[test]
    fn arrays_are_index_aligned() {
        let mut cfg = AlignConfig::default();
        cfg.ks = vec![6];
        cfg.min_prob = 1.0;
        let q = query(b"ACGTACGTACGTACGT", &cfg);
        let expect = 16 - 6 + 1;
        assert_eq!(expect, q.kmers.len());
        assert_eq!(expect, q.rkmers.len());
        assert_eq!(expect as u32, q.valid_kmers);
    }

    #[test]
    fn reverse_array_is_reversed_forward_of_revcomp() {
        let mut cfg = AlignConfig::default();
        cfg.ks = vec![5];
        cfg.min_prob = 1.0;
        let q = query(b"ACGTTGCAGGTT", &cfg);

        let spec = KmerSpec::new(5, 0, 0);
        let mut expect = spec.kmers(&q.rbases);
        expect.reverse();
        assert_eq!(expect, q.rkmers);
    }

    #[test]
    fn largest_feasible_k_wins() {
        let mut cfg = AlignConfig::default();
        cfg.ks = vec![11, 7];
        cfg.min_prob = 1.0;
        cfg.max_subs = 0;
        cfg.min_identity = 1.0;
        let q = query(b"ACGTTGCAGGTTACGTTGCAGGTT", &cfg);
        assert_eq!(0, q.k_index);
        assert!(q.indexable());
    }

    #[test]
    fn short_query_falls_back_to_smallest_k() {
        let mut cfg = AlignConfig::default();
        cfg.ks = vec![11, 7];
        cfg.min_prob = 1.0;
        let q = query(b"ACGTTGCAG", &cfg); // 9 bp: no 11-mers
        assert_eq!(1, q.k_index);
        assert!(q.indexable());
    }

    #[test]
    fn all_n_query_goes_brute_force() {
        let mut cfg = AlignConfig::default();
        cfg.ks = vec![7];
        let q = query(b"NNNNNNNNNNNN", &cfg);
        assert_eq!(0, q.valid_kmers);
        assert_eq!(0, q.min_hits);
        assert!(!q.indexable());
    }

    #[test]
    fn empty_query_has_no_kmers() {
        let mut cfg = AlignConfig::default();
        cfg.ks = vec![7];
        let q = query(b"", &cfg);
        assert!(q.is_empty());
        assert!(q.kmers.is_empty());
        assert!(!q.indexable());
    }

    #[test]
    fn primary_claim_happens_once() {
        let mut cfg = AlignConfig::default();
        cfg.ks = vec![6];
        cfg.min_prob = 1.0;
        let q = query(b"ACGTACGTACGT", &cfg);
        assert!(q.claim_primary());
        assert!(!q.claim_primary());
        assert!(!q.claim_primary());
    }

    #[test]
    fn buckets_route_by_selected_k() {
        let mut cfg = AlignConfig::default();
        cfg.ks = vec![11, 7];
        cfg.min_prob = 1.0;
        cfg.max_subs = 0;
        cfg.min_identity = 1.0;

        let (specs, calcs) = setup(&cfg);
        let mut buckets = QueryBuckets::new(cfg.ks.len());
        buckets.push(Query::new("long".into(), b"ACGTTGCAGGTTACGTTGCAGGTT",
                                None, &cfg, &specs, &calcs));
        buckets.push(Query::new("short".into(), b"ACGTTGCAG",
                                None, &cfg, &specs, &calcs));

        assert_eq!(1, buckets.buckets[0].len());
        assert_eq!(1, buckets.buckets[1].len());
        assert_eq!(24, buckets.max_query_len);
        assert_eq!(2, buckets.len());
    }
}
