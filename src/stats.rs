//! Run statistics: per-worker counters merged at shutdown, optionally
//! serialized to a JSON sidecar.

use chrono::Local;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::*;

/// Counters accumulated while aligning; one instance per worker, merged by
/// the driver.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AlignStats {
    /// Reference records processed.
    pub references: u64,
    /// Reference bases scanned.
    pub ref_bases: u64,
    /// Batches pulled off the reference stream.
    pub batches: u64,
    /// (query, strand) passes rejected by the prescan.
    pub prescan_rejects: u64,
    /// Candidate diagonals scored by the kernels.
    pub candidates: u64,
    /// Candidates rejected over budget.
    pub rejected: u64,
    /// SAM records emitted.
    pub alignments: u64,
    /// Alignments flagged primary.
    pub primary: u64,
}

impl AlignStats {
    /// Fold another worker's counters into this one.
    pub fn merge(&mut self, other: &AlignStats) {
        self.references += other.references;
        self.ref_bases += other.ref_bases;
        self.batches += other.batches;
        self.prescan_rejects += other.prescan_rejects;
        self.candidates += other.candidates;
        self.rejected += other.rejected;
        self.alignments += other.alignments;
        self.primary += other.primary;
    }

    /// Log a one-screen summary.
    pub fn report(&self) {
        info!("references processed: {} ({} bases in {} batches)",
              self.references, self.ref_bases, self.batches);
        info!("candidates scored: {} ({} rejected, {} prescan rejects)",
              self.candidates, self.rejected, self.prescan_rejects);
        info!("alignments emitted: {} ({} primary)", self.alignments, self.primary);
    }

    /// Serialize the counters (plus a run date) to a JSON sidecar.
    pub fn write_json(&self, path: &str) -> SkaldResult<()> {
        #[derive(Serialize)]
        struct Sidecar<'a> {
            run_date: String,
            stats: &'a AlignStats,
        }

        let sidecar = Sidecar {
            run_date: Local::now().to_rfc3339(),
            stats: self,
        };

        let file = File::create(Path::new(path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &sidecar)
            .map_err(|e| SkaldError::AnyhowError(e.to_string()))?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use tempfile::NamedTempFile;
    use super::*;

    #[test]
    fn merge_adds_fieldwise() {
        let mut a = AlignStats::default();
        a.references = 2;
        a.alignments = 5;
        a.primary = 1;

        let mut b = AlignStats::default();
        b.references = 3;
        b.alignments = 7;
        b.candidates = 11;

        a.merge(&b);
        assert_eq!(5, a.references);
        assert_eq!(12, a.alignments);
        assert_eq!(11, a.candidates);
        assert_eq!(1, a.primary);
    }

    #[test]
    fn json_sidecar_round_trips() {
        let mut stats = AlignStats::default();
        stats.alignments = 42;
        stats.references = 7;

        let out = NamedTempFile::new().unwrap();
        stats.write_json(out.path().to_str().unwrap()).unwrap();

        let text = std::fs::read_to_string(out.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(42, value["stats"]["alignments"].as_u64().unwrap());
        assert_eq!(7, value["stats"]["references"].as_u64().unwrap());
        assert!(value["run_date"].is_string());
    }
}
