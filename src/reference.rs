//! Reference records, the shared reference stream, fused pseudo-references
//! and the low-complexity entropy mask.

use bio::io::fasta;
use std::io;
use std::sync::Mutex;

use crate::error::*;

/// One reference sequence as pulled off the input stream.
#[derive(Debug, Clone)]
pub struct RefRecord {
    /// Sequence name (FASTA id), as emitted in SAM RNAME and `@SQ` lines.
    pub id: String,
    /// Uppercased bases; ambiguity codes collapse to N.
    pub bases: Vec<u8>,
}

impl RefRecord {
    /// Sequence length in bases.
    pub fn len(&self) -> usize {
        self.bases.len()
    }

    /// True for zero-length records.
    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }
}

/// Shared, internally synchronized stream of reference batches. Workers call
/// [`RefStream::next_batch`] until it returns `None`; a batch closes once its
/// cumulative base count reaches the configured chunk size.
pub struct RefStream {
    records: Mutex<fasta::Records<io::BufReader<Box<dyn io::Read + Send>>>>,
    chunk_bases: usize,
    min_ref_len: usize,
}

impl RefStream {
    /// Wrap a FASTA source. `chunk_bases` is the target batch size in bases;
    /// records shorter than `min_ref_len` are skipped with a warning.
    pub fn new(reader: Box<dyn io::Read + Send>,
               chunk_bases: usize,
               min_ref_len: usize)
               -> RefStream {
        RefStream {
            records: Mutex::new(fasta::Reader::new(reader).records()),
            chunk_bases: chunk_bases.max(1),
            min_ref_len: min_ref_len,
        }
    }

    /// Pull the next batch of reference records; `None` at end of input.
    pub fn next_batch(&self) -> SkaldResult<Option<Vec<RefRecord>>> {
        let mut records = self.records.lock().unwrap();
        let mut batch = Vec::new();
        let mut bases = 0usize;

        while bases < self.chunk_bases {
            match records.next() {
                Some(record) => {
                    let record = record?;
                    if record.id().is_empty() {
                        return Err(SkaldError::InvalidHeader(
                            "empty FASTA header in reference input".to_string()));
                    }
                    if record.seq().len() < self.min_ref_len {
                        debug!("skipping reference {} ({} bp < minrlen {})",
                               record.id(), record.seq().len(), self.min_ref_len);
                        continue;
                    }
                    bases += record.seq().len();
                    batch.push(RefRecord {
                        id: record.id().to_string(),
                        bases: crate::util::normalize_bases(record.seq()),
                    });
                },
                None => break,
            }
        }

        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}

/// Several reference records concatenated with N padding into one
/// pseudo-reference, plus the range list mapping fused coordinates back.
pub struct FusedRef {
    /// Padded concatenation.
    pub bases: Vec<u8>,
    /// Flat sorted `[start0, end0, start1, end1, ...]` of record spans.
    pub ranges: Vec<usize>,
    /// Record names, parallel to the range pairs.
    pub names: Vec<String>,
}

impl FusedRef {
    /// Fuse `records` with `pad` Ns between and around them. The padding must
    /// be at least the longest query so no alignment bridges two records.
    pub fn build(records: &[RefRecord], pad: usize) -> FusedRef {
        let total: usize = records.iter().map(|r| r.len()).sum();
        let mut bases = Vec::with_capacity(total + pad * (records.len() + 1));
        let mut ranges = Vec::with_capacity(records.len() * 2);
        let mut names = Vec::with_capacity(records.len());

        for record in records {
            bases.resize(bases.len() + pad, b'N');
            ranges.push(bases.len());
            bases.extend_from_slice(&record.bases);
            ranges.push(bases.len());
            names.push(record.id.clone());
        }
        bases.resize(bases.len() + pad, b'N');

        FusedRef {
            bases: bases,
            ranges: ranges,
            names: names,
        }
    }

    /// Translate a fused coordinate to `(record index, local coordinate)`.
    /// `None` when the coordinate lands in padding.
    pub fn locate(&self, coord: usize) -> Option<(usize, usize)> {
        // count of range boundaries <= coord; odd means inside a record span
        let n_below = self.ranges.partition_point(|&bound| bound <= coord);
        if n_below % 2 == 1 {
            let record = (n_below - 1) / 2;
            Some((record, coord - self.ranges[n_below - 1]))
        } else {
            None
        }
    }
}

/// Mask low-entropy windows of `bases` to N in place. The filter slides a
/// `window`-base frame, counting `k`-mer frequencies; frames whose normalized
/// Shannon entropy falls below `cutoff` are overwritten.
pub fn entropy_mask(bases: &mut [u8], window: usize, k: usize, cutoff: f64) {
    if bases.len() < window || window < k || k == 0 {
        return;
    }

    let kmers_per_window = window - k + 1;
    let max_entropy = (kmers_per_window as f64).ln();
    if max_entropy <= 0.0 {
        return;
    }

    let mut counts: fxhash::FxHashMap<u64, u32> = fxhash::FxHashMap::default();
    let spec = crate::kmer::KmerSpec::new(k as u32, 0, 0);
    let codes = spec.kmers(bases);

    let mut mask_spans: Vec<(usize, usize)> = Vec::new();
    for start in 0..=(bases.len() - window) {
        counts.clear();
        let mut valid = 0u32;
        for slot in start..start + kmers_per_window {
            let code = codes[slot];
            if code != crate::kmer::BAD_KMER {
                *counts.entry(code as u64).or_insert(0) += 1;
                valid += 1;
            }
        }

        let entropy = if valid == 0 {
            0.0
        } else {
            let n = valid as f64;
            let mut h = 0.0;
            for &c in counts.values() {
                let p = c as f64 / n;
                h -= p * p.ln();
            }
            h / max_entropy
        };

        if entropy < cutoff {
            match mask_spans.last_mut() {
                Some(last) if last.1 >= start => last.1 = start + window,
                _ => mask_spans.push((start, start + window)),
            }
        }
    }

    for (from, to) in mask_spans {
        for b in &mut bases[from..to] {
            *b = b'N';
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;
    use super::*;

    fn stream(fasta_text: &str, chunk: usize, min_len: usize) -> RefStream {
        let boxed: Box<dyn io::Read + Send> =
            Box::new(Cursor::new(fasta_text.as_bytes().to_vec()));
        RefStream::new(boxed, chunk, min_len)
    }

    #[test]
    fn batches_close_at_the_base_target() {
        let s = stream(">a\nACGTACGT\n>b\nACGTACGT\n>c\nACGT\n", 10, 0);
        let first = s.next_batch().unwrap().unwrap();
        assert_eq!(2, first.len());
        let second = s.next_batch().unwrap().unwrap();
        assert_eq!(1, second.len());
        assert!(s.next_batch().unwrap().is_none());
    }

    #[test]
    fn short_references_are_skipped() {
        let s = stream(">a\nACG\n>b\nACGTACGTACGT\n", 1 << 20, 5);
        let batch = s.next_batch().unwrap().unwrap();
        assert_eq!(1, batch.len());
        assert_eq!("b", batch[0].id);
    }

    #[test]
    fn stream_normalizes_bases() {
        let s = stream(">a\nacgtrY\n", 1 << 20, 0);
        let batch = s.next_batch().unwrap().unwrap();
        assert_eq!(b"ACGTNN".to_vec(), batch[0].bases);
    }

    #[test]
    fn fused_layout_and_ranges() {
        let records = vec![
            RefRecord { id: "a".into(), bases: b"ACGT".to_vec() },
            RefRecord { id: "b".into(), bases: b"GGCC".to_vec() },
        ];
        let fused = FusedRef::build(&records, 3);

        assert_eq!(3 + 4 + 3 + 4 + 3, fused.bases.len());
        assert_eq!(vec![3, 7, 10, 14], fused.ranges);
        assert_eq!(b"NNNACGTNNNGGCCNNN".to_vec(), fused.bases);
    }

    #[test]
    fn locate_maps_records_and_rejects_padding() {
        let records = vec![
            RefRecord { id: "a".into(), bases: b"ACGT".to_vec() },
            RefRecord { id: "b".into(), bases: b"GGCC".to_vec() },
        ];
        let fused = FusedRef::build(&records, 3);

        assert_eq!(None, fused.locate(0));
        assert_eq!(None, fused.locate(2));
        assert_eq!(Some((0, 0)), fused.locate(3));
        assert_eq!(Some((0, 3)), fused.locate(6));
        assert_eq!(None, fused.locate(7));
        assert_eq!(None, fused.locate(9));
        assert_eq!(Some((1, 0)), fused.locate(10));
        assert_eq!(Some((1, 3)), fused.locate(13));
        assert_eq!(None, fused.locate(14));
        assert_eq!(None, fused.locate(100));
    }

    #[test]
    fn entropy_mask_hits_homopolymers_only() {
        let mut bases = Vec::new();
        bases.extend_from_slice(&[b'A'; 60]);
        // a patterned but diverse tail
        for i in 0..60usize {
            bases.push(match (i * 7 + i / 3) % 4 {
                0 => b'A',
                1 => b'C',
                2 => b'G',
                _ => b'T',
            });
        }

        entropy_mask(&mut bases, 40, 5, 0.45);
        assert!(bases[..50].iter().all(|&b| b == b'N'),
                "the poly-A head should be masked");
        assert!(bases[100..].iter().any(|&b| b != b'N'),
                "the diverse tail should survive");
    }

    #[test]
    fn entropy_mask_ignores_short_input() {
        let mut bases = b"AAAA".to_vec();
        entropy_mask(&mut bases, 40, 5, 0.9);
        assert_eq!(b"AAAA".to_vec(), bases);
    }
}
