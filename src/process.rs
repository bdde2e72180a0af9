//! The alignment worker: pulls reference batches off the shared stream,
//! builds per-K indexes, walks every query on both strands and emits SAM.

use std::io::{self, Write};
use std::sync::Mutex;

use crate::align::{brute_force, score_candidate, AlignmentHit};
use crate::config::AlignConfig;
use crate::error::*;
use crate::kmer::KmerSpec;
use crate::packed_index::PackedIndex;
use crate::query::{Query, QueryBuckets};
use crate::reference::{entropy_mask, FusedRef, RefRecord, RefStream};
use crate::sam;
use crate::seed::{collect_list, collect_map, prescan, SeedBuffers};
use crate::stats::AlignStats;

/// A byte-stream writer that synchronizes appends internally so workers can
/// share it. Callers hand over pre-formatted chunks.
pub struct SyncWriter {
    inner: Mutex<Box<dyn Write + Send>>,
}

impl SyncWriter {
    /// Wrap any writer.
    pub fn new(writer: Box<dyn Write + Send>) -> SyncWriter {
        SyncWriter {
            inner: Mutex::new(writer),
        }
    }

    /// Append one chunk atomically.
    pub fn append(&self, chunk: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.write_all(chunk)
    }

    /// Flush the underlying writer.
    pub fn flush(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.flush()
    }
}

/// What a batch aligns against: individual records, or one fused
/// pseudo-reference with coordinate back-translation.
enum Target<'a> {
    Plain {
        name: &'a str,
        bases: &'a [u8],
    },
    Fused(&'a FusedRef),
}

impl<'a> Target<'a> {
    fn bases(&self) -> &'a [u8] {
        match *self {
            Target::Plain { bases, .. } => bases,
            Target::Fused(fused) => &fused.bases,
        }
    }

    /// Resolve a hit to `(rname, record-local reference, local start)`.
    /// Fused hits landing in padding resolve to `None` and are discarded.
    fn resolve(&self, hit: &AlignmentHit, qlen: usize)
               -> Option<(&'a str, &'a [u8], i64)> {
        match *self {
            Target::Plain { name, bases } => Some((name, bases, hit.start)),
            Target::Fused(fused) => {
                let center = hit.start + (qlen / 2) as i64;
                if center < 0 {
                    return None;
                }
                let (record, _) = fused.locate(center as usize)?;
                let span_start = fused.ranges[record * 2];
                let span_end = fused.ranges[record * 2 + 1];
                let local = &fused.bases[span_start..span_end];
                Some((fused.names[record].as_str(), local,
                      hit.start - span_start as i64))
            },
        }
    }
}

/// One alignment worker. Queries and configuration are shared read-only; the
/// seed buffers and statistics are worker-local.
pub struct Worker<'a> {
    cfg: &'a AlignConfig,
    specs: &'a [KmerSpec],
    buckets: &'a QueryBuckets,
    stream: &'a RefStream,
    out: &'a SyncWriter,
    headers: &'a Mutex<Vec<(String, usize)>>,
    /// Counters merged by the driver at shutdown.
    pub stats: AlignStats,
    buf: SeedBuffers,
}

impl<'a> Worker<'a> {
    /// Wire a worker up to the shared run state.
    pub fn new(cfg: &'a AlignConfig,
               specs: &'a [KmerSpec],
               buckets: &'a QueryBuckets,
               stream: &'a RefStream,
               out: &'a SyncWriter,
               headers: &'a Mutex<Vec<(String, usize)>>)
               -> Worker<'a> {
        Worker {
            cfg: cfg,
            specs: specs,
            buckets: buckets,
            stream: stream,
            out: out,
            headers: headers,
            stats: AlignStats::default(),
            buf: SeedBuffers::new(),
        }
    }

    /// Process batches until the stream runs dry.
    pub fn run(&mut self) -> SkaldResult<()> {
        while let Some(mut batch) = self.stream.next_batch()? {
            self.stats.batches += 1;
            if self.cfg.entropy_mask {
                for record in &mut batch {
                    entropy_mask(&mut record.bases,
                                 self.cfg.entropy_window,
                                 self.cfg.entropy_k,
                                 self.cfg.entropy_cutoff);
                }
            }
            self.note_headers(&batch);
            self.stats.references += batch.len() as u64;
            self.stats.ref_bases += batch.iter().map(|r| r.len() as u64).sum::<u64>();

            if self.cfg.fuse && batch.len() > 1 {
                let pad = self.cfg.padding.max(self.buckets.max_query_len);
                let fused = FusedRef::build(&batch, pad);
                self.align_target(&Target::Fused(&fused))?;
            } else {
                for record in &batch {
                    self.align_target(&Target::Plain {
                        name: &record.id,
                        bases: &record.bases,
                    })?;
                }
            }
        }
        Ok(())
    }

    fn note_headers(&self, batch: &[RefRecord]) {
        let mut headers = self.headers.lock().unwrap();
        for record in batch {
            headers.push((record.id.clone(), record.len()));
        }
    }

    fn align_target(&mut self, target: &Target) -> SkaldResult<()> {
        // shared run state outlives the worker borrow
        let buckets: &'a QueryBuckets = self.buckets;
        let specs: &'a [KmerSpec] = self.specs;

        let reference = target.bases();
        let mut lines = String::new();

        for (k_idx, bucket) in buckets.buckets.iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }

            let index = if bucket.iter().any(|q| q.indexable()) {
                specs.get(k_idx)
                    .map(|spec| PackedIndex::build(reference, spec, self.cfg.r_step))
            } else {
                None
            };

            for query in bucket.iter() {
                for &reverse in &[false, true] {
                    self.align_query(query, reverse, target, index.as_ref(), &mut lines);
                }
            }
        }

        if !lines.is_empty() {
            self.out.append(lines.as_bytes())?;
        }
        Ok(())
    }

    /// Align one (query, strand) pair against the target.
    fn align_query(&mut self,
                   query: &Query,
                   reverse: bool,
                   target: &Target,
                   index: Option<&PackedIndex>,
                   lines: &mut String) {
        if query.is_empty() {
            return;
        }

        let reference = target.bases();
        let seq = if reverse { &query.rbases } else { &query.bases };
        let max_subs = query.max_subs(self.cfg);
        let max_clips = query.max_clips;

        if let (Some(index), true) = (index, query.indexable()) {
            let kmers = if reverse { &query.rkmers } else { &query.kmers };
            let effective = effective_min_hits(self.cfg, query.min_hits);

            if self.cfg.prescan
               && !prescan(kmers, index, self.cfg.q_step, query.max_misses,
                           effective, query.min_hits) {
                self.stats.prescan_rejects += 1;
                return;
            }

            if self.cfg.seed_map {
                collect_map(kmers, reverse, index, self.cfg.q_step, effective,
                            &mut self.buf);
            } else {
                collect_list(kmers, reverse, index, self.cfg.q_step, effective,
                             &mut self.buf);
            }

            for i in 0..self.buf.out.len() {
                let start = self.buf.out[i];
                self.stats.candidates += 1;
                match score_candidate(seq, reference, start, max_subs, max_clips,
                                      self.cfg.simd) {
                    Some(hit) => {
                        emit(query, &hit, reverse, target, seq,
                             &mut self.stats, lines);
                    },
                    None => self.stats.rejected += 1,
                }
            }
        } else {
            // brute force: indexing off, or no K suited this query
            let hits = brute_force(seq, reference, max_subs, max_clips,
                                   self.cfg.simd);
            self.stats.candidates += hits.len() as u64;
            for hit in &hits {
                emit(query, hit, reverse, target, seq, &mut self.stats, lines);
            }
        }
    }
}

/// The seed threshold actually applied for a query: the calibrated value,
/// scaled down under a reference stride (only every rstep-th reference k-mer
/// is indexed) and floored by the global knob.
fn effective_min_hits(cfg: &AlignConfig, base: u32) -> u32 {
    let scaled = if cfg.r_step > 1 {
        (base / cfg.r_step as u32).max(1)
    } else {
        base
    };
    scaled.max(cfg.min_hits).max(1)
}

/// Resolve, format and append one accepted hit. Substitutions are recounted
/// against the resolved record so fused-coordinate hits report the same NM a
/// direct alignment would.
fn emit(query: &Query,
        hit: &AlignmentHit,
        reverse: bool,
        target: &Target,
        seq: &[u8],
        stats: &mut AlignStats,
        lines: &mut String) {
    let (rname, local_ref, local_start) = match target.resolve(hit, seq.len()) {
        Some(resolved) => resolved,
        None => return, // padding hit in fused mode
    };

    let local_hit = AlignmentHit {
        start: local_start,
        subs: hit.subs,
        clip_left: hit.clip_left,
        clip_right: hit.clip_right,
    };

    let quals: Option<Vec<u8>> = query.quals.as_ref().map(|q| {
        if reverse {
            q.iter().rev().cloned().collect()
        } else {
            q.clone()
        }
    });

    let primary = query.claim_primary();
    let line = sam::record_for_hit(&query.name,
                                   &local_hit,
                                   reverse,
                                   primary,
                                   rname,
                                   seq,
                                   quals.as_deref(),
                                   local_ref);
    lines.push_str(&line);
    lines.push('\n');

    stats.alignments += 1;
    if primary {
        stats.primary += 1;
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;
    use std::sync::Mutex;

    use crate::config::AlignConfig;
    use crate::kmer::KmerSpec;
    use crate::minhits::MinHitsCalculator;
    use crate::query::{Query, QueryBuckets};
    use crate::reference::RefStream;
    use super::*;

    struct Fixture {
        cfg: AlignConfig,
        specs: Vec<KmerSpec>,
        buckets: QueryBuckets,
    }

    fn fixture(cfg: AlignConfig, queries: &[(&str, &[u8])]) -> Fixture {
        let specs: Vec<KmerSpec> = cfg.ks.iter()
            .map(|&k| KmerSpec::new(k, cfg.mid_mask_len, cfg.blacklist))
            .collect();
        let calcs: Vec<MinHitsCalculator> = specs.iter()
            .map(|spec| {
                MinHitsCalculator::new(spec, cfg.mid_mask_len, cfg.max_subs,
                                       cfg.min_identity, cfg.min_prob,
                                       cfg.max_clip, cfg.q_step, cfg.mc_iters)
            })
            .collect();

        let mut buckets = QueryBuckets::new(specs.len());
        for &(name, seq) in queries {
            buckets.push(Query::new(name.to_string(), seq, None, &cfg, &specs,
                                    &calcs));
        }

        Fixture {
            cfg: cfg,
            specs: specs,
            buckets: buckets,
        }
    }

    fn run_to_sam(fx: &Fixture, fasta_text: &str) -> Vec<String> {
        let boxed: Box<dyn std::io::Read + Send> =
            Box::new(Cursor::new(fasta_text.as_bytes().to_vec()));
        let stream = RefStream::new(boxed, fx.cfg.chunk_size, fx.cfg.min_ref_len);

        let collected = std::sync::Arc::new(Mutex::new(Vec::<u8>::new()));
        struct VecSink(std::sync::Arc<Mutex<Vec<u8>>>);
        impl std::io::Write for VecSink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let out = SyncWriter::new(Box::new(VecSink(collected.clone())));
        let headers = Mutex::new(Vec::new());
        let mut worker = Worker::new(&fx.cfg, &fx.specs, &fx.buckets, &stream,
                                     &out, &headers);
        worker.run().unwrap();

        let bytes = collected.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    fn base_cfg() -> AlignConfig {
        let mut cfg = AlignConfig::default();
        cfg.ks = vec![6];
        cfg.min_prob = 1.0;
        cfg.max_subs = 0;
        cfg.min_identity = 1.0;
        cfg.min_hits = 1;
        cfg.simd = false;
        cfg
    }

    #[test]
    fn happy_path_finds_every_repeat_placement() {
        let fx = fixture(base_cfg(), &[("q1", b"ACGTACGTACGT")]);
        let lines = run_to_sam(&fx, ">r\nACGTACGTACGTACGTACGTACGTACGT\n");

        let fwd: Vec<&String> = lines.iter()
            .filter(|l| {
                let flag: u16 = l.split('\t').nth(1).unwrap().parse().unwrap();
                flag & sam::FLAG_REVERSE == 0
            })
            .collect();

        let mut positions: Vec<i64> = fwd.iter()
            .map(|l| l.split('\t').nth(3).unwrap().parse().unwrap())
            .collect();
        positions.sort();
        assert_eq!(vec![1, 5, 9, 13, 17], positions);

        for line in &fwd {
            let fields: Vec<&str> = line.split('\t').collect();
            assert_eq!("12M", fields[5]);
            assert_eq!("NM:i:0", fields[11]);
        }
    }

    #[test]
    fn exactly_one_primary_across_both_strands() {
        let fx = fixture(base_cfg(), &[("q1", b"ACGTACGTACGT")]);
        let lines = run_to_sam(&fx, ">r\nACGTACGTACGTACGTACGTACGTACGT\n");

        let primaries = lines.iter()
            .filter(|l| {
                let flag: u16 = l.split('\t').nth(1).unwrap().parse().unwrap();
                flag & sam::FLAG_SECONDARY == 0
            })
            .count();
        assert_eq!(1, primaries);
        assert!(lines.len() > 1);
    }

    #[test]
    fn substitution_budget_boundary() {
        let mut cfg = base_cfg();
        cfg.ks = vec![5];
        let fx = fixture(cfg, &[("q1", b"CCCCCGGGGG")]);
        let lines = run_to_sam(&fx, ">r\nAAAAACCCCCGGGGGTTTTT\n");

        let fwd: Vec<&String> = lines.iter()
            .filter(|l| {
                let flag: u16 = l.split('\t').nth(1).unwrap().parse().unwrap();
                flag & sam::FLAG_REVERSE == 0
            })
            .collect();
        assert_eq!(1, fwd.len());
        let fields: Vec<&str> = fwd[0].split('\t').collect();
        assert_eq!("6", fields[3]);
        assert_eq!("10M", fields[5]);
        assert_eq!("NM:i:0", fields[11]);
    }

    #[test]
    fn clipped_alignment_emits_soft_clips() {
        let mut cfg = base_cfg();
        cfg.ks = vec![5];
        cfg.max_clip = 0.3;
        cfg.min_identity = 0.7;
        let fx = fixture(cfg, &[("q1", b"AAACCGGGGG")]);
        let lines = run_to_sam(&fx, ">r\nCCGGGGGTTT\n");

        let clipped: Vec<&String> = lines.iter()
            .filter(|l| l.split('\t').nth(5).unwrap().starts_with("3S"))
            .collect();
        assert_eq!(1, clipped.len());
        let fields: Vec<&str> = clipped[0].split('\t').collect();
        assert_eq!("1", fields[3]);
        assert_eq!("3S7M", fields[5]);
        assert_eq!("NM:i:0", fields[11]);
    }

    #[test]
    fn reverse_strand_hit_carries_the_flag() {
        let mut cfg = base_cfg();
        cfg.ks = vec![5];
        // query is the reverse complement of a reference stretch
        let fx = fixture(cfg, &[("q1", b"CCCCCAATTGG")]);
        let lines = run_to_sam(&fx, ">r\nTTTCCAATTGGGGGTTT\n");

        let rev: Vec<&String> = lines.iter()
            .filter(|l| {
                let flag: u16 = l.split('\t').nth(1).unwrap().parse().unwrap();
                flag & sam::FLAG_REVERSE != 0
            })
            .collect();
        assert_eq!(1, rev.len());
        let fields: Vec<&str> = rev[0].split('\t').collect();
        // SEQ is emitted in reference orientation (the reverse complement)
        assert_eq!("CCAATTGGGGG", fields[9]);
        assert_eq!("4", fields[3]);
    }

    #[test]
    fn all_n_query_emits_nothing() {
        let fx = fixture(base_cfg(), &[("q1", b"NNNNNNNNNNNN")]);
        let lines = run_to_sam(&fx, ">r\nACGTACGTACGTACGTACGTACGTACGT\n");
        assert!(lines.is_empty());
    }

    #[test]
    fn reference_shorter_than_k_emits_nothing_indexed() {
        let mut cfg = base_cfg();
        cfg.ks = vec![11];
        let fx = fixture(cfg, &[("q1", b"ACGTACGTACGTACG")]);
        let lines = run_to_sam(&fx, ">r\nACGTACG\n");
        assert!(lines.is_empty());
    }

    #[test]
    fn brute_force_when_indexing_disabled() {
        let mut cfg = base_cfg();
        cfg.ks = Vec::new();
        let fx = fixture(cfg, &[("q1", b"ACGTACGTACGT")]);
        let lines = run_to_sam(&fx, ">r\nTTTTACGTACGTACGTTTTT\n");

        let fwd: Vec<&String> = lines.iter()
            .filter(|l| {
                let flag: u16 = l.split('\t').nth(1).unwrap().parse().unwrap();
                flag & sam::FLAG_REVERSE == 0
            })
            .collect();
        let positions: Vec<i64> = fwd.iter()
            .map(|l| l.split('\t').nth(3).unwrap().parse().unwrap())
            .collect();
        assert!(positions.contains(&5));
    }

    #[test]
    fn fused_batch_translates_coordinates() {
        let mut cfg = base_cfg();
        cfg.ks = vec![5];
        cfg.fuse = true;
        cfg.padding = 16;
        let fx = fixture(cfg, &[("q1", b"CCCCCGGGGG")]);
        let lines = run_to_sam(&fx,
                               ">a\nTTTTTTTTTTTTTTTTTTTT\n>b\nAAAAACCCCCGGGGGTTTTT\n");

        let fwd: Vec<&String> = lines.iter()
            .filter(|l| {
                let flag: u16 = l.split('\t').nth(1).unwrap().parse().unwrap();
                flag & sam::FLAG_REVERSE == 0
            })
            .collect();
        assert_eq!(1, fwd.len());
        let fields: Vec<&str> = fwd[0].split('\t').collect();
        assert_eq!("b", fields[2]);
        assert_eq!("6", fields[3]);
        assert_eq!("10M", fields[5]);
    }

    #[test]
    fn headers_collect_every_reference() {
        let fx = fixture(base_cfg(), &[("q1", b"ACGTACGTACGT")]);
        let boxed: Box<dyn std::io::Read + Send> =
            Box::new(Cursor::new(b">a\nACGTACGT\n>b\nTTTTCCCC\n".to_vec()));
        let stream = RefStream::new(boxed, fx.cfg.chunk_size, 0);
        let out = SyncWriter::new(Box::new(std::io::sink()));
        let headers = Mutex::new(Vec::new());

        let mut worker = Worker::new(&fx.cfg, &fx.specs, &fx.buckets, &stream,
                                     &out, &headers);
        worker.run().unwrap();

        let collected = headers.lock().unwrap();
        assert_eq!(2, collected.len());
        assert_eq!(("a".to_string(), 8), collected[0]);
        assert_eq!(("b".to_string(), 8), collected[1]);
    }
}
