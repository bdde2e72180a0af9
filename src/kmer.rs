//! 2-bit k-mer packing, masks and rolling scanners.
//!
//! K-mers are packed two bits per base (`A=0 C=1 G=2 T=3`) into the low
//! `2K` bits of an integer. Invalid windows (any non-ACGT base, blacklisted
//! homopolymer, or not enough contiguous valid bases) are encoded with the
//! sentinel `-1` so downstream arrays stay index-aligned with the sequence.

/// Sentinel marking an invalid k-mer array slot.
pub const BAD_KMER: i64 = -1;

/// 2-bit code for an ASCII base; `None` for anything outside ACGT.
#[inline]
pub fn base_code(b: u8) -> Option<u64> {
    match b {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

/// Masks and parameters for one K; built once per run per candidate K.
#[derive(Debug, Clone)]
pub struct KmerSpec {
    /// K-mer length.
    pub k: u32,
    /// Low `2K` bits set.
    pub kmer_mask: u64,
    /// `2K`-bit mask with the middle `mid_mask_len` bases cleared.
    pub mid_mask: u64,
    /// `K`-bit mask with the middle `mid_mask_len` positions cleared; used by
    /// the Monte Carlo error kernel, where one bit tracks one base.
    pub wildcard_mask: u64,
    /// Homopolymer run length at which a window is blacklisted; 0 disables.
    pub blacklist: u32,
}

impl KmerSpec {
    /// Build the masks for `(k, mid_mask_len, blacklist)`. The wildcard window
    /// is centered; `mid_mask_len` must be < `k - 1` (validated by the config).
    pub fn new(k: u32, mid_mask_len: u32, blacklist: u32) -> KmerSpec {
        let kmer_mask = if k == 32 { !0u64 } else { (1u64 << (2 * k)) - 1 };
        let base_bits = (1u64 << k) - 1;

        let (mid_mask, wildcard_mask) = if mid_mask_len == 0 {
            (kmer_mask, base_bits)
        } else {
            let lo = (k - mid_mask_len) / 2;
            let mid2 = ((1u64 << (2 * mid_mask_len)) - 1) << (2 * lo);
            let mid1 = ((1u64 << mid_mask_len) - 1) << lo;
            (kmer_mask & !mid2, base_bits & !mid1)
        };

        KmerSpec {
            k: k,
            kmer_mask: kmer_mask,
            mid_mask: mid_mask,
            wildcard_mask: wildcard_mask,
            blacklist: blacklist,
        }
    }

    /// Apply the middle mask to a packed k-mer.
    #[inline]
    pub fn mask(&self, kmer: u64) -> u64 {
        kmer & self.mid_mask
    }

    /// Number of k-mer slots for a sequence of `len` bases.
    #[inline]
    pub fn slots(&self, len: usize) -> usize {
        (len + 1).saturating_sub(self.k as usize)
    }

    /// Build the masked k-mer array for `bases`, one slot per window start,
    /// with `BAD_KMER` in every invalid slot.
    pub fn kmers(&self, bases: &[u8]) -> Vec<i64> {
        let k = self.k as usize;
        let n = self.slots(bases.len());
        let mut out = vec![BAD_KMER; n];
        if n == 0 {
            return out;
        }

        let mut kmer = 0u64;
        let mut valid_len = 0usize;
        let mut run = 0u32;
        let mut prev = 0u8;
        // last position completing a blacklisted homopolymer run
        let mut last_poly: i64 = -1;

        for (pos, &b) in bases.iter().enumerate() {
            match base_code(b) {
                Some(code) => {
                    kmer = ((kmer << 2) | code) & self.kmer_mask;
                    valid_len += 1;
                    run = if b == prev { run + 1 } else { 1 };
                },
                None => {
                    valid_len = 0;
                    run = 0;
                },
            }
            prev = b;
            if self.blacklist > 0 && run >= self.blacklist {
                last_poly = pos as i64;
            }

            if pos + 1 >= k && valid_len >= k {
                let start = pos + 1 - k;
                let poly_hit = self.blacklist > 0
                    && last_poly >= (start + self.blacklist as usize - 1) as i64;
                if !poly_hit {
                    out[start] = self.mask(kmer) as i64;
                }
            }
        }

        out
    }

    /// Count the valid windows of `bases` without materializing the array.
    /// Used to probe candidate K values before committing to one.
    pub fn count_valid(&self, bases: &[u8]) -> usize {
        let k = self.k as usize;
        if bases.len() < k {
            return 0;
        }

        let mut count = 0usize;
        let mut valid_len = 0usize;
        let mut run = 0u32;
        let mut prev = 0u8;
        let mut last_poly: i64 = -1;

        for (pos, &b) in bases.iter().enumerate() {
            if base_code(b).is_some() {
                valid_len += 1;
                run = if b == prev { run + 1 } else { 1 };
            } else {
                valid_len = 0;
                run = 0;
            }
            prev = b;
            if self.blacklist > 0 && run >= self.blacklist {
                last_poly = pos as i64;
            }

            if pos + 1 >= k && valid_len >= k {
                let start = pos + 1 - k;
                if !(self.blacklist > 0
                     && last_poly >= (start + self.blacklist as usize - 1) as i64) {
                    count += 1;
                }
            }
        }

        count
    }
}

/// Decode a packed k-mer back into ASCII bases (high bits first).
pub fn unpack(kmer: u64, k: u32) -> Vec<u8> {
    let mut out = vec![0u8; k as usize];
    for i in 0..k {
        let shift = 2 * (k - 1 - i);
        out[i as usize] = match (kmer >> shift) & 3 {
            0 => b'A',
            1 => b'C',
            2 => b'G',
            _ => b'T',
        };
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn masks_cover_the_middle() {
        let spec = KmerSpec::new(7, 3, 0);
        // bases 2,3,4 cleared: 2-bit mask loses bits 4..10, 1-bit loses 2..5
        assert_eq!((1u64 << 14) - 1, spec.kmer_mask);
        assert_eq!(spec.kmer_mask & !(0b111111 << 4), spec.mid_mask);
        assert_eq!(((1u64 << 7) - 1) & !(0b111 << 2), spec.wildcard_mask);
    }

    #[test]
    fn no_mid_mask_is_identity() {
        let spec = KmerSpec::new(9, 0, 0);
        assert_eq!(spec.kmer_mask, spec.mid_mask);
        assert_eq!((1u64 << 9) - 1, spec.wildcard_mask);
    }

    #[test]
    fn rolling_kmers_match_packing() {
        let spec = KmerSpec::new(4, 0, 0);
        let kmers = spec.kmers(b"ACGTAC");
        assert_eq!(3, kmers.len());
        // ACGT = 00 01 10 11
        assert_eq!(0b00011011, kmers[0]);
        // CGTA
        assert_eq!(0b01101100, kmers[1]);
        // GTAC
        assert_eq!(0b10110001, kmers[2]);
    }

    #[test]
    fn ambiguous_bases_poison_their_windows() {
        let spec = KmerSpec::new(3, 0, 0);
        let kmers = spec.kmers(b"ACNGTA");
        assert_eq!(4, kmers.len());
        assert_eq!(BAD_KMER, kmers[0]);
        assert_eq!(BAD_KMER, kmers[1]);
        assert_eq!(BAD_KMER, kmers[2]);
        assert_ne!(BAD_KMER, kmers[3]);
    }

    #[test]
    fn all_n_yields_no_valid_kmers() {
        let spec = KmerSpec::new(4, 0, 0);
        assert!(spec.kmers(b"NNNNNNNN").iter().all(|&k| k == BAD_KMER));
        assert_eq!(0, spec.count_valid(b"NNNNNNNN"));
    }

    #[test]
    fn sequence_shorter_than_k_has_no_slots() {
        let spec = KmerSpec::new(8, 0, 0);
        assert!(spec.kmers(b"ACGT").is_empty());
        assert_eq!(0, spec.count_valid(b"ACGT"));
    }

    #[test]
    fn homopolymer_blacklist_marks_covering_windows() {
        let spec = KmerSpec::new(4, 0, 3);
        //         0123456789
        let seq = b"ACGAAATGCA";
        let kmers = spec.kmers(seq);
        // the AAA run ends at index 5; windows [2..6), [3..7), [4..8) contain it
        // only partially or fully — exactly those whose span covers indices 3..=5
        for (i, &km) in kmers.iter().enumerate() {
            let window = &seq[i..i + 4];
            let has_run = window.windows(3).any(|w| w[0] == w[1] && w[1] == w[2]);
            assert_eq!(has_run, km == BAD_KMER, "window {}", i);
        }
    }

    #[test]
    fn count_matches_array() {
        let spec = KmerSpec::new(5, 2, 3);
        let seq = b"ACGTACGTNNACGTTTTTACGTACGT";
        let arr = spec.kmers(seq);
        let n = arr.iter().filter(|&&k| k != BAD_KMER).count();
        assert_eq!(n, spec.count_valid(seq));
    }

    #[test]
    fn unpack_round_trips() {
        let spec = KmerSpec::new(6, 0, 0);
        let kmers = spec.kmers(b"TGCATG");
        assert_eq!(b"TGCATG".to_vec(), unpack(kmers[0] as u64, 6));
    }

    #[test]
    fn mid_mask_equates_center_variants() {
        let spec = KmerSpec::new(5, 1, 0);
        let a = spec.kmers(b"ACGTA");
        let b = spec.kmers(b"ACATA");
        // middle base differs; masked keys agree
        assert_eq!(a[0], b[0]);
        let c = spec.kmers(b"TCGTA");
        assert_ne!(a[0], c[0]);
    }
}
