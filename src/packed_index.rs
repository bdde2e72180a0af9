//! Per-reference k-mer position index, built in two passes with prefix-sum
//! packing into a single flat positions array.
//!
//! Each map value packs `(offset << 32) | count`; `positions[offset..offset+count]`
//! holds the alignment-start coordinates for that key. Keys that occur exactly
//! once skip the indirection: the accessor returns the position itself in the
//! high 32 bits.

use fxhash::FxHashMap;

use crate::kmer::{base_code, KmerSpec, BAD_KMER};

/// Absent-key result from [`PackedIndex::get`].
pub const NOT_FOUND: i64 = -1;

/// K-mer → positions index over one reference sequence. Built per reference,
/// queried read-only, and dropped when the reference batch is done.
pub struct PackedIndex {
    map: FxHashMap<u32, u64>,
    positions: Vec<u32>,
}

impl PackedIndex {
    /// Build the index over `reference` for one K at reference stride
    /// `r_step` (a power of two; stride 1 indexes every eligible window).
    pub fn build(reference: &[u8], spec: &KmerSpec, r_step: usize) -> PackedIndex {
        let mut map: FxHashMap<u32, u64> = FxHashMap::default();

        // count pass
        scan(reference, spec, r_step, |key, _| {
            *map.entry(key).or_insert(0) += 1;
        });

        // prefix-sum pass: repurpose each value as (offset << 32), with the
        // low 32 bits left zeroed as the fill cursor
        let mut offset = 0u64;
        for value in map.values_mut() {
            let count = *value;
            *value = offset << 32;
            offset += count;
        }
        let mut positions = vec![0u32; offset as usize];

        // fill pass: bump the cursor and write the alignment-start coordinate
        scan(reference, spec, r_step, |key, start| {
            let value = map.get_mut(&key).unwrap();
            let cursor = (*value & 0xffff_ffff) + 1;
            *value = (*value & !0xffff_ffff) | cursor;
            let slot = (*value >> 32) + cursor - 1;
            positions[slot as usize] = start;
        });

        PackedIndex {
            map: map,
            positions: positions,
        }
    }

    /// Look up a masked k-mer. Returns [`NOT_FOUND`] when absent; otherwise a
    /// packed value whose low 32 bits are the count and whose high 32 bits are
    /// either the position itself (count 1) or an offset into the positions
    /// array.
    #[inline]
    pub fn get(&self, kmer: i64) -> i64 {
        if kmer == BAD_KMER {
            return NOT_FOUND;
        }
        match self.map.get(&(kmer as u32)) {
            Some(&value) => {
                let count = value & 0xffff_ffff;
                if count == 1 {
                    let pos = self.positions[(value >> 32) as usize];
                    (((pos as u64) << 32) | 1) as i64
                } else {
                    value as i64
                }
            },
            None => NOT_FOUND,
        }
    }

    /// True when the key is present, without touching the positions array.
    #[inline]
    pub fn contains(&self, kmer: i64) -> bool {
        kmer != BAD_KMER && self.map.contains_key(&(kmer as u32))
    }

    /// The positions slice for a non-singleton packed value.
    #[inline]
    pub fn positions_at(&self, packed: i64) -> &[u32] {
        let offset = (packed as u64 >> 32) as usize;
        let count = (packed as u64 & 0xffff_ffff) as usize;
        &self.positions[offset..offset + count]
    }

    /// Total indexed positions across all keys.
    pub fn total_hits(&self) -> usize {
        self.positions.len()
    }

    /// Number of distinct keys.
    pub fn distinct_keys(&self) -> usize {
        self.map.len()
    }
}

/// One rolling pass over the reference, invoking `emit(masked_key, start)` at
/// each stride-aligned window with enough contiguous valid bases.
fn scan<F>(reference: &[u8], spec: &KmerSpec, r_step: usize, mut emit: F)
    where F: FnMut(u32, u32)
{
    let k = spec.k as usize;
    if reference.len() < k {
        return;
    }

    let phase_mask = (r_step - 1) as u64;
    let phase = (k as u64 - 1) & phase_mask;
    let mut kmer = 0u64;
    let mut valid_len = 0usize;

    for (pos, &b) in reference.iter().enumerate() {
        match base_code(b) {
            Some(code) => {
                kmer = ((kmer << 2) | code) & spec.kmer_mask;
                valid_len += 1;
            },
            None => {
                valid_len = 0;
            },
        }

        if valid_len >= k && (pos as u64 & phase_mask) == phase {
            emit(spec.mask(kmer) as u32, (pos + 1 - k) as u32);
        }
    }
}

#[cfg(test)]
mod test {
    use crate::kmer::{KmerSpec, BAD_KMER};
    use super::*;

    fn eligible_starts(reference: &[u8], spec: &KmerSpec, r_step: usize) -> Vec<u32> {
        let mut starts = Vec::new();
        scan(reference, spec, r_step, |_, start| starts.push(start));
        starts
    }

    #[test]
    fn every_eligible_position_is_indexed_once() {
        let spec = KmerSpec::new(6, 0, 0);
        let reference = b"ACGTACGGTTACGTACGTNNACGTACGA";
        let index = PackedIndex::build(reference, &spec, 1);

        let starts = eligible_starts(reference, &spec, 1);
        assert_eq!(starts.len(), index.total_hits());

        for &start in &starts {
            let window = &reference[start as usize..start as usize + 6];
            let key = spec.kmers(window)[0];
            assert_ne!(BAD_KMER, key);

            let packed = index.get(key);
            assert_ne!(NOT_FOUND, packed);
            let count = (packed as u64 & 0xffff_ffff) as usize;
            let found = if count == 1 {
                vec![(packed as u64 >> 32) as u32]
            } else {
                index.positions_at(packed).to_vec()
            };
            assert_eq!(1,
                       found.iter().filter(|&&p| p == start).count(),
                       "start {} must appear exactly once", start);
        }
    }

    #[test]
    fn counts_sum_to_positions_len() {
        let spec = KmerSpec::new(4, 0, 0);
        let reference = b"ACGTACGTACGTACGT";
        let index = PackedIndex::build(reference, &spec, 1);

        let mut sum = 0usize;
        for key in 0..(1u64 << 8) {
            let packed = index.get(key as i64);
            if packed != NOT_FOUND {
                sum += (packed as u64 & 0xffff_ffff) as usize;
            }
        }
        assert_eq!(index.total_hits(), sum);
        assert_eq!(eligible_starts(reference, &spec, 1).len(), index.total_hits());
    }

    #[test]
    fn singleton_returns_position_directly() {
        let spec = KmerSpec::new(5, 0, 0);
        // GGGGG occurs once, at start 4
        let reference = b"ACGTGGGGGACGTT";
        let index = PackedIndex::build(reference, &spec, 1);

        let key = spec.kmers(b"GGGGG")[0];
        let packed = index.get(key);
        assert_ne!(NOT_FOUND, packed);
        assert_eq!(1, packed as u64 & 0xffff_ffff);
        assert_eq!(4, (packed as u64 >> 32) as u32);
    }

    #[test]
    fn repeated_kmer_lists_every_start() {
        let spec = KmerSpec::new(4, 0, 0);
        let reference = b"ACGTACGTACGT";
        let index = PackedIndex::build(reference, &spec, 1);

        let key = spec.kmers(b"ACGT")[0];
        let packed = index.get(key);
        assert_eq!(3, packed as u64 & 0xffff_ffff);
        let mut starts = index.positions_at(packed).to_vec();
        starts.sort();
        assert_eq!(vec![0, 4, 8], starts);
    }

    #[test]
    fn absent_key_is_not_found() {
        let spec = KmerSpec::new(4, 0, 0);
        let index = PackedIndex::build(b"AAAAAAAA", &spec, 1);
        let key = spec.kmers(b"TTTT")[0];
        assert_eq!(NOT_FOUND, index.get(key));
        assert_eq!(NOT_FOUND, index.get(BAD_KMER));
    }

    #[test]
    fn reference_shorter_than_k_builds_empty() {
        let spec = KmerSpec::new(8, 0, 0);
        let index = PackedIndex::build(b"ACGT", &spec, 1);
        assert_eq!(0, index.total_hits());
        assert_eq!(0, index.distinct_keys());
    }

    #[test]
    fn stride_keeps_only_the_canonical_phase() {
        let spec = KmerSpec::new(4, 0, 0);
        let reference = b"ACGTACGTACGTACGT";
        let index = PackedIndex::build(reference, &spec, 4);

        // phase: pos & 3 == 3, i.e. window starts 0, 4, 8, 12
        let key = spec.kmers(b"ACGT")[0];
        let packed = index.get(key);
        assert_ne!(NOT_FOUND, packed);
        let count = packed as u64 & 0xffff_ffff;
        assert_eq!(4, count);
        let mut starts = index.positions_at(packed).to_vec();
        starts.sort();
        assert_eq!(vec![0, 4, 8, 12], starts);
        assert_eq!(4, index.total_hits());
    }

    #[test]
    fn ambiguity_resets_the_window() {
        let spec = KmerSpec::new(4, 0, 0);
        let reference = b"ACGNACGT";
        let index = PackedIndex::build(reference, &spec, 1);
        // only the final window (start 4) is eligible
        assert_eq!(1, index.total_hits());
        let key = spec.kmers(b"ACGT")[0];
        let packed = index.get(key);
        assert_eq!(1, packed as u64 & 0xffff_ffff);
        assert_eq!(4, (packed as u64 >> 32) as u32);
    }

    #[test]
    fn mid_mask_collapses_center_variants() {
        let spec = KmerSpec::new(5, 1, 0);
        let reference = b"ACGTATTTTTACATA";
        let index = PackedIndex::build(reference, &spec, 1);

        let a = spec.kmers(b"ACGTA")[0];
        let b = spec.kmers(b"ACATA")[0];
        assert_eq!(a, b);
        let packed = index.get(a);
        assert_ne!(NOT_FOUND, packed);
        // both ACGTA (start 0) and ACATA (start 10) land under one key
        let count = packed as u64 & 0xffff_ffff;
        assert_eq!(2, count);
    }
}
