//! Seed collection: projecting query k-mer matches onto candidate alignment
//! starts, with an optional cheap prescan.
//!
//! Two collectors share one contract: one candidate start per distinct
//! diagonal with at least `min_hits` supporting k-mers. Map mode counts in a
//! hash map and emits on the threshold transition; list mode materializes
//! every projection, sorts, and condenses runs. Map mode is the canonical
//! semantics; list mode is kept selectable and must agree on the emitted
//! start set.

use fxhash::FxHashMap;
use itertools::Itertools;

use crate::kmer::BAD_KMER;
use crate::packed_index::{PackedIndex, NOT_FOUND};

/// Reusable per-worker scratch space for seed collection.
pub struct SeedBuffers {
    /// Raw projected starts (list mode).
    pub starts: Vec<i64>,
    /// Diagonal support counts (map mode).
    pub counts: FxHashMap<i64, u32>,
    /// Condensed candidate starts, ready for the kernels.
    pub out: Vec<i64>,
}

impl SeedBuffers {
    /// Fresh, empty buffers.
    pub fn new() -> SeedBuffers {
        SeedBuffers {
            starts: Vec::new(),
            counts: FxHashMap::default(),
            out: Vec::new(),
        }
    }
}

impl Default for SeedBuffers {
    fn default() -> Self {
        SeedBuffers::new()
    }
}

/// The query offset a k-mer array slot corresponds to. Reverse-strand arrays
/// are stored reversed, so slot `i` maps back to offset `len-1-i`.
#[inline]
fn query_offset(i: usize, len: usize, reversed_layout: bool) -> i64 {
    if reversed_layout {
        (len - 1 - i) as i64
    } else {
        i as i64
    }
}

/// Cheap hit/miss scan before any positions are touched. Walks the k-mer
/// array at stride `q_step` (both phases when striding), charging absent keys
/// against the miss budget. Returns false when the remaining k-mers cannot
/// reach `effective_min_hits`.
pub fn prescan(kmers: &[i64],
               index: &PackedIndex,
               q_step: usize,
               max_misses: i64,
               effective_min_hits: u32,
               base_min_hits: u32)
               -> bool {
    if kmers.is_empty() {
        return false;
    }

    let budget = max_misses - (effective_min_hits as i64 - base_min_hits as i64);
    let phases = if q_step > 1 { 2 } else { 1 };

    let mut total = 0i64;
    let mut misses = 0i64;
    for phase in 0..phases {
        for i in (phase..kmers.len()).step(q_step) {
            let key = kmers[i];
            if key == BAD_KMER {
                continue;
            }
            total += 1;
            if !index.contains(key) {
                misses += 1;
                if misses > budget {
                    return false;
                }
            }
        }
    }

    total - misses >= effective_min_hits as i64
}

/// Project one k-mer's index entry onto candidate starts.
#[inline]
fn project<F>(index: &PackedIndex, key: i64, offset: i64, mut push: F)
    where F: FnMut(i64)
{
    let packed = index.get(key);
    if packed == NOT_FOUND {
        return;
    }
    let count = packed as u64 & 0xffff_ffff;
    if count == 1 {
        push((packed as u64 >> 32) as i64 - offset);
    } else {
        for &p in index.positions_at(packed) {
            push(p as i64 - offset);
        }
    }
}

/// List-mode collection: materialize every projected start, sort, and keep
/// one copy of each value whose multiplicity reaches `min_hits`.
pub fn collect_list(kmers: &[i64],
                    reversed_layout: bool,
                    index: &PackedIndex,
                    q_step: usize,
                    min_hits: u32,
                    buf: &mut SeedBuffers) {
    buf.starts.clear();
    buf.out.clear();
    let n = kmers.len();

    for i in (0..n).step(q_step) {
        let key = kmers[i];
        if key != BAD_KMER {
            let offset = query_offset(i, n, reversed_layout);
            let starts = &mut buf.starts;
            project(index, key, offset, |s| starts.push(s));
        }
    }

    buf.starts.sort();
    condense(&buf.starts, min_hits, &mut buf.out);
}

/// Keep one copy of each sorted value with run length >= `min_copies`.
fn condense(sorted: &[i64], min_copies: u32, out: &mut Vec<i64>) {
    let mut i = 0usize;
    while i < sorted.len() {
        let value = sorted[i];
        let mut j = i + 1;
        while j < sorted.len() && sorted[j] == value {
            j += 1;
        }
        if (j - i) as u32 >= min_copies.max(1) {
            out.push(value);
        }
        i = j;
    }
}

/// Map-mode collection: count support per diagonal and emit a start exactly
/// when its count first reaches `min_hits`. No sort, no duplicates.
pub fn collect_map(kmers: &[i64],
                   reversed_layout: bool,
                   index: &PackedIndex,
                   q_step: usize,
                   min_hits: u32,
                   buf: &mut SeedBuffers) {
    buf.counts.clear();
    buf.out.clear();
    let n = kmers.len();
    let threshold = min_hits.max(1);

    for i in (0..n).step(q_step) {
        let key = kmers[i];
        if key != BAD_KMER {
            let offset = query_offset(i, n, reversed_layout);
            let counts = &mut buf.counts;
            let out = &mut buf.out;
            project(index, key, offset, |s| {
                let c = counts.entry(s).or_insert(0);
                *c += 1;
                if *c == threshold {
                    out.push(s);
                }
            });
        }
    }
}
