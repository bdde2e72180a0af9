//! The aligner driver: loads queries into K buckets, spawns workers over the
//! shared reference stream, merges statistics and surfaces worker failures.

use bio::io::{fasta, fastq};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use crate::config::AlignConfig;
use crate::error::*;
use crate::kmer::KmerSpec;
use crate::minhits::MinHitsCalculator;
use crate::process::{SyncWriter, Worker};
use crate::query::{Query, QueryBuckets};
use crate::reference::RefStream;
use crate::stats::AlignStats;
use crate::util::open_maybe_gz;

/// Query input flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFormat {
    /// FASTA reads, no qualities.
    Fasta,
    /// FASTQ reads with qualities.
    Fastq,
}

/// One alignment run, paths included.
pub struct AlignJob<'a> {
    /// Validated configuration.
    pub cfg: &'a AlignConfig,
    /// Query reads path (plain or gzip).
    pub query_path: &'a str,
    /// Query input flavor.
    pub query_format: QueryFormat,
    /// Reference FASTA path (plain or gzip).
    pub ref_path: &'a str,
    /// SAM output path.
    pub out_path: &'a str,
    /// Optional `@SQ` sidecar path.
    pub header_path: Option<&'a str>,
    /// Optional JSON statistics sidecar path.
    pub stats_path: Option<&'a str>,
}

/// Build the per-K masks from the configured candidate list.
pub fn build_specs(cfg: &AlignConfig) -> Vec<KmerSpec> {
    cfg.ks.iter()
        .map(|&k| KmerSpec::new(k, cfg.mid_mask_len, cfg.blacklist))
        .collect()
}

/// One Monte Carlo calculator per K bucket.
pub fn build_calculators(cfg: &AlignConfig, specs: &[KmerSpec]) -> Vec<MinHitsCalculator> {
    specs.iter()
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
        .collect()
}

/// Parse all queries in one pass and file them into K buckets.
pub fn load_queries(path: &str,
                    format: QueryFormat,
                    cfg: &AlignConfig,
                    specs: &[KmerSpec],
                    calculators: &[MinHitsCalculator])
                    -> SkaldResult<QueryBuckets> {
    let mut buckets = QueryBuckets::new(specs.len());
    let mut skipped = 0usize;

    match format {
        QueryFormat::Fasta => {
            let reader = fasta::Reader::new(open_maybe_gz(path)?);
            for record in reader.records() {
                let record = record?;
                if record.seq().len() < cfg.min_query_len {
                    skipped += 1;
                    continue;
                }
                buckets.push(Query::new(record.id().to_string(), record.seq(),
                                        None, cfg, specs, calculators));
            }
        },
        QueryFormat::Fastq => {
            let reader = fastq::Reader::new(open_maybe_gz(path)?);
            for record in reader.records() {
                let record = record?;
                if record.seq().len() < cfg.min_query_len {
                    skipped += 1;
                    continue;
                }
                buckets.push(Query::new(record.id().to_string(), record.seq(),
                                        Some(record.qual().to_vec()), cfg, specs,
                                        calculators));
            }
        },
    }

    if skipped > 0 {
        warn!("{} queries below minqlen were skipped", skipped);
    }
    info!("loaded {} queries into {} K buckets",
          buckets.len(), buckets.buckets.len());
    Ok(buckets)
}

/// Run the full alignment pipeline. Returns the merged statistics; any worker
/// failure surfaces after all threads have been joined and partial output
/// must be considered corrupt.
pub fn run(job: &AlignJob) -> SkaldResult<AlignStats> {
    job.cfg.validate()?;

    let timer = Instant::now();
    let specs = build_specs(job.cfg);
    let calculators = build_calculators(job.cfg, &specs);
    let buckets = load_queries(job.query_path, job.query_format, job.cfg,
                               &specs, &calculators)?;

    let stream = RefStream::new(open_maybe_gz(job.ref_path)?,
                                job.cfg.chunk_size,
                                job.cfg.min_ref_len);
    let out_file = File::create(Path::new(job.out_path))?;
    let out = SyncWriter::new(Box::new(BufWriter::new(out_file)));
    let headers: Mutex<Vec<(String, usize)>> = Mutex::new(Vec::new());

    info!("spawning {} alignment workers", job.cfg.threads);
    let mut merged = AlignStats::default();
    let mut failure: Option<SkaldError> = None;

    thread::scope(|scope| {
        let cfg = job.cfg;
        let specs = &specs;
        let buckets = &buckets;
        let stream = &stream;
        let out = &out;
        let headers = &headers;

        let handles: Vec<_> = (0..cfg.threads)
            .map(|_| {
                scope.spawn(move || {
                    let mut worker = Worker::new(cfg, specs, buckets, stream,
                                                 out, headers);
                    let result = worker.run();
                    (result, worker.stats)
                })
            })
            .collect();

        for handle in handles {
            match handle.join() {
                Ok((result, stats)) => {
                    merged.merge(&stats);
                    if let Err(e) = result {
                        error!("worker failed: {}", e);
                        if failure.is_none() {
                            failure = Some(e);
                        }
                    }
                },
                Err(_) => {
                    if failure.is_none() {
                        failure = Some(SkaldError::WorkerFailed(
                            "worker thread panicked".to_string()));
                    }
                },
            }
        }
    });

    out.flush()?;
    merged.report();
    info!("alignment finished in {:.3} s",
          timer.elapsed().as_millis() as f64 / 1000.0);

    if let Some(e) = failure {
        return Err(SkaldError::WorkerFailed(e.to_string()));
    }

    if let Some(header_path) = job.header_path {
        write_header_sidecar(header_path, &headers.lock().unwrap())?;
    }
    if let Some(stats_path) = job.stats_path {
        merged.write_json(stats_path)?;
    }

    Ok(merged)
}

/// Write the `@SQ` sidecar, one line per distinct reference in first-seen
/// order.
fn write_header_sidecar(path: &str, entries: &[(String, usize)]) -> SkaldResult<()> {
    let file = File::create(Path::new(path))?;
    let mut writer = BufWriter::new(file);
    let mut seen = HashSet::new();

    for &(ref name, len) in entries {
        if seen.insert(name.clone()) {
            writeln!(writer, "{}", crate::sam::sq_header_line(name, len))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::Write;
    use tempfile::NamedTempFile;

    use crate::config::AlignConfig;
    use super::*;

    fn write_temp(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    fn strict_cfg() -> AlignConfig {
        let mut cfg = AlignConfig::default();
        cfg.ks = vec![6];
        cfg.min_prob = 1.0;
        cfg.max_subs = 0;
        cfg.min_identity = 1.0;
        cfg.threads = 2;
        cfg.simd = false;
        cfg
    }

    #[test]
    fn end_to_end_alignment_run() {
        let queries = write_temp(">q1\nACGTACGTACGT\n>q2\nGGGGGGGGGGGG\n");
        let refs = write_temp(">r1\nACGTACGTACGTACGTACGTACGTACGT\n");
        let out = NamedTempFile::new().unwrap();
        let header = NamedTempFile::new().unwrap();
        let stats_file = NamedTempFile::new().unwrap();

        let cfg = strict_cfg();
        let job = AlignJob {
            cfg: &cfg,
            query_path: queries.path().to_str().unwrap(),
            query_format: QueryFormat::Fasta,
            ref_path: refs.path().to_str().unwrap(),
            out_path: out.path().to_str().unwrap(),
            header_path: Some(header.path().to_str().unwrap()),
            stats_path: Some(stats_file.path().to_str().unwrap()),
        };

        let stats = run(&job).unwrap();
        assert!(stats.alignments > 0);
        assert_eq!(1, stats.primary);
        assert_eq!(1, stats.references);

        let sam_text = fs::read_to_string(out.path()).unwrap();
        assert!(sam_text.lines().all(|l| l.starts_with("q1\t")),
                "only q1 matches this reference");
        assert!(sam_text.lines().any(|l| l.contains("\t12M\t")));

        let header_text = fs::read_to_string(header.path()).unwrap();
        assert_eq!("@SQ\tSN:r1\tLN:28\n", header_text);

        let stats_text = fs::read_to_string(stats_file.path()).unwrap();
        assert!(stats_text.contains("alignments"));
    }

    #[test]
    fn fastq_queries_carry_qualities() {
        let queries = write_temp("@q1\nACGTACGTACGT\n+\nIIIIIIIIIIII\n");
        let refs = write_temp(">r1\nACGTACGTACGTACGT\n");
        let out = NamedTempFile::new().unwrap();

        let cfg = strict_cfg();
        let job = AlignJob {
            cfg: &cfg,
            query_path: queries.path().to_str().unwrap(),
            query_format: QueryFormat::Fastq,
            ref_path: refs.path().to_str().unwrap(),
            out_path: out.path().to_str().unwrap(),
            header_path: None,
            stats_path: None,
        };

        run(&job).unwrap();
        let sam_text = fs::read_to_string(out.path()).unwrap();
        let first = sam_text.lines().next().unwrap();
        let fields: Vec<&str> = first.split('\t').collect();
        assert_eq!("IIIIIIIIIIII", fields[10]);
    }

    #[test]
    fn invalid_config_fails_before_io() {
        let mut cfg = strict_cfg();
        cfg.r_step = 3;
        let job = AlignJob {
            cfg: &cfg,
            query_path: "/nonexistent",
            query_format: QueryFormat::Fasta,
            ref_path: "/nonexistent",
            out_path: "/nonexistent",
            header_path: None,
            stats_path: None,
        };
        match run(&job) {
            Err(SkaldError::InvalidConfig(_)) => (),
            other => panic!("expected InvalidConfig, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_query_file_is_reported() {
        let refs = write_temp(">r1\nACGT\n");
        let cfg = strict_cfg();
        let job = AlignJob {
            cfg: &cfg,
            query_path: "/definitely/not/here.fa",
            query_format: QueryFormat::Fasta,
            ref_path: refs.path().to_str().unwrap(),
            out_path: "/tmp/skald-test-unused.sam",
            header_path: None,
            stats_path: None,
        };
        assert!(run(&job).is_err());
    }

    #[test]
    fn min_query_len_filters_reads() {
        let mut cfg = strict_cfg();
        cfg.min_query_len = 10;
        let specs = build_specs(&cfg);
        let calcs = build_calculators(&cfg, &specs);

        let queries = write_temp(">short\nACGT\n>long\nACGTACGTACGT\n");
        let buckets = load_queries(queries.path().to_str().unwrap(),
                                   QueryFormat::Fasta, &cfg, &specs, &calcs)
            .unwrap();
        assert_eq!(1, buckets.len());
    }
}
