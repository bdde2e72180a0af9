//! Run configuration for the aligner and the BGZF/BAM tools.
//!
//! All process-wide knobs live in explicit config values constructed once per
//! run and passed by reference; there is no global mutable state.

use crate::error::*;

/// Largest K the 2-bit packed representation supports.
pub const MAX_K: u32 = 15;

/// Aligner configuration, one value per run.
#[derive(Debug, Clone)]
pub struct AlignConfig {
    /// Candidate K values, descending. Empty disables k-mer indexing entirely.
    pub ks: Vec<u32>,
    /// Global substitution cap.
    pub max_subs: u32,
    /// Identity floor in [0,1].
    pub min_identity: f64,
    /// Global seed-hit floor.
    pub min_hits: u32,
    /// Detection probability target for the Monte Carlo calibration.
    pub min_prob: f64,
    /// Clipping budget: a fraction of the query length when < 1, else absolute.
    pub max_clip: f64,
    /// Query k-mer stride.
    pub q_step: usize,
    /// Reference k-mer stride; must be a power of two.
    pub r_step: usize,
    /// Number of middle k-mer bases ignored in seed equality.
    pub mid_mask_len: u32,
    /// Homopolymer run length at which a k-mer is blacklisted; 0 disables.
    pub blacklist: u32,
    /// Cheap hit/miss prescan before seed collection.
    pub prescan: bool,
    /// Map-mode seed collection (canonical); false selects list mode.
    pub seed_map: bool,
    /// Fuse batch references into one padded pseudo-reference.
    pub fuse: bool,
    /// N-padding between fused references; raised to the longest query.
    pub padding: usize,
    /// Target reference bases per worker batch.
    pub chunk_size: usize,
    /// Queries shorter than this are dropped at load time.
    pub min_query_len: usize,
    /// References shorter than this are skipped.
    pub min_ref_len: usize,
    /// Mask low-entropy reference windows to N before indexing.
    pub entropy_mask: bool,
    /// Window length for the entropy filter.
    pub entropy_window: usize,
    /// K-mer length for the entropy filter.
    pub entropy_k: usize,
    /// Normalized entropy below which a window is masked.
    pub entropy_cutoff: f64,
    /// Use the SIMD substitution kernel when the host supports it.
    pub simd: bool,
    /// Worker thread count.
    pub threads: usize,
    /// Monte Carlo iterations per minHits calibration.
    pub mc_iters: usize,
}

impl Default for AlignConfig {
    fn default() -> Self {
        AlignConfig {
            ks: vec![13],
            max_subs: 3,
            min_identity: 0.9,
            min_hits: 1,
            min_prob: 0.9995,
            max_clip: 0.0,
            q_step: 1,
            r_step: 1,
            mid_mask_len: 0,
            blacklist: 0,
            prescan: true,
            seed_map: true,
            fuse: false,
            padding: 128,
            chunk_size: 4 << 20,
            min_query_len: 0,
            min_ref_len: 0,
            entropy_mask: false,
            entropy_window: 80,
            entropy_k: 5,
            entropy_cutoff: 0.55,
            simd: true,
            threads: 4,
            mc_iters: 200_000,
        }
    }
}

impl AlignConfig {
    /// Validate the configuration, failing fast on anything the pipeline
    /// cannot run with.
    pub fn validate(&self) -> SkaldResult<()> {
        for &k in &self.ks {
            if k < 1 || k > MAX_K {
                return Err(SkaldError::InvalidConfig(format!(
                    "k={} out of range (1..={})", k, MAX_K)));
            }
            if k > 1 && self.mid_mask_len >= k - 1 {
                return Err(SkaldError::InvalidConfig(format!(
                    "midmasklen={} must be < k-1 for k={}", self.mid_mask_len, k)));
            }
        }
        for w in self.ks.windows(2) {
            if w[0] <= w[1] {
                return Err(SkaldError::InvalidConfig(
                    "k candidates must be strictly descending".to_string()));
            }
        }
        if !self.r_step.is_power_of_two() {
            return Err(SkaldError::InvalidConfig(format!(
                "rstep={} must be a power of two", self.r_step)));
        }
        if self.q_step > 1 && self.r_step > 1 {
            return Err(SkaldError::InvalidConfig(
                "at most one of qstep and rstep may exceed 1".to_string()));
        }
        if self.q_step == 0 || self.r_step == 0 {
            return Err(SkaldError::InvalidConfig("strides must be >= 1".to_string()));
        }
        if self.min_identity < 0.0 || self.min_identity > 1.0 {
            return Err(SkaldError::InvalidConfig(format!(
                "minid={} must lie in [0,1]", self.min_identity)));
        }
        if self.max_clip < 0.0 {
            return Err(SkaldError::InvalidConfig("maxclip must be >= 0".to_string()));
        }
        if self.threads == 0 {
            return Err(SkaldError::InvalidConfig("threads must be >= 1".to_string()));
        }
        if self.entropy_mask {
            if self.entropy_k == 0 || self.entropy_k > 10 {
                return Err(SkaldError::InvalidConfig(format!(
                    "entropyk={} out of range (1..=10)", self.entropy_k)));
            }
            if self.entropy_window < self.entropy_k {
                return Err(SkaldError::InvalidConfig(
                    "entropywindow must be >= entropyk".to_string()));
            }
        }
        if self.mc_iters == 0 {
            return Err(SkaldError::InvalidConfig("Monte Carlo iterations must be >= 1"
                .to_string()));
        }
        Ok(())
    }

    /// The per-query substitution cap for a query of `len` bases.
    pub fn max_subs_for(&self, len: usize) -> u32 {
        let ident_cap = (len as f64 * (1.0 - self.min_identity)).floor() as u32;
        self.max_subs.min(ident_cap)
    }

    /// The clipping budget for a query of `len` bases.
    pub fn max_clips_for(&self, len: usize) -> u32 {
        if self.max_clip < 1.0 {
            (self.max_clip * len as f64).floor() as u32
        } else {
            self.max_clip.floor() as u32
        }
    }

    /// True when k-mer indexing is in play at all.
    pub fn indexing_enabled(&self) -> bool {
        !self.ks.is_empty()
    }
}

/// Parse the `k=` knob: a single value, a comma list, or a `hi-lo` range.
/// `0` or `-1` disables indexing. The result is sorted descending and deduped.
pub fn parse_k_set(s: &str) -> SkaldResult<Vec<u32>> {
    let s = s.trim();
    if s == "0" || s == "-1" {
        return Ok(Vec::new());
    }

    let mut ks = Vec::new();
    if let Some(idx) = s.find('-') {
        let hi = s[..idx].trim().parse::<u32>()
            .map_err(|_| SkaldError::InvalidInteger(s.to_string()))?;
        let lo = s[idx + 1..].trim().parse::<u32>()
            .map_err(|_| SkaldError::InvalidInteger(s.to_string()))?;
        if lo > hi {
            return Err(SkaldError::InvalidConfig(format!(
                "k range {} is inverted", s)));
        }
        for k in (lo..=hi).rev() {
            ks.push(k);
        }
    } else {
        for tok in s.split(',') {
            let k = tok.trim().parse::<u32>()
                .map_err(|_| SkaldError::InvalidInteger(tok.to_string()))?;
            ks.push(k);
        }
        ks.sort_by(|a, b| b.cmp(a));
        ks.dedup();
    }

    Ok(ks)
}

/// BGZF codec configuration.
#[derive(Debug, Clone)]
pub struct BgzfConfig {
    /// Uncompressed payload cap per block; at most 65280.
    pub block_size: usize,
    /// Deflate level, 0..=9.
    pub level: u32,
    /// Codec worker threads for the multithreaded variants.
    pub threads: usize,
    /// Output-heap capacity; back-pressures codec workers.
    pub queue_capacity: usize,
}

impl Default for BgzfConfig {
    fn default() -> Self {
        BgzfConfig {
            block_size: crate::bgzf::DEFAULT_BLOCK_SIZE,
            level: 6,
            threads: 2,
            queue_capacity: 16,
        }
    }
}

impl BgzfConfig {
    /// Validate block size and level bounds.
    pub fn validate(&self) -> SkaldResult<()> {
        if self.block_size == 0 || self.block_size > crate::bgzf::DEFAULT_BLOCK_SIZE {
            return Err(SkaldError::InvalidConfig(format!(
                "BGZF block size {} out of range (1..={})",
                self.block_size,
                crate::bgzf::DEFAULT_BLOCK_SIZE)));
        }
        if self.level > 9 {
            return Err(SkaldError::InvalidConfig(format!(
                "deflate level {} out of range (0..=9)", self.level)));
        }
        if self.threads == 0 || self.queue_capacity == 0 {
            return Err(SkaldError::InvalidConfig(
                "BGZF threads and queue capacity must be >= 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn k_set_single_list_range() {
        assert_eq!(vec![13], parse_k_set("13").unwrap());
        assert_eq!(vec![15, 13, 11], parse_k_set("15,11,13").unwrap());
        assert_eq!(vec![14, 13, 12, 11], parse_k_set("14-11").unwrap());
        assert!(parse_k_set("abc").is_err());
    }

    #[test]
    fn k_set_disabled() {
        assert!(parse_k_set("0").unwrap().is_empty());
        assert!(parse_k_set("-1").unwrap().is_empty());
    }

    #[test]
    fn validate_rejects_bad_k() {
        let mut cfg = AlignConfig::default();
        cfg.ks = vec![16];
        assert!(cfg.validate().is_err());

        cfg.ks = vec![13, 13];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_wide_mid_mask() {
        let mut cfg = AlignConfig::default();
        cfg.ks = vec![7];
        cfg.mid_mask_len = 6;
        assert!(cfg.validate().is_err());
        cfg.mid_mask_len = 5;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_stride_conflicts() {
        let mut cfg = AlignConfig::default();
        cfg.r_step = 3;
        assert!(cfg.validate().is_err());

        cfg.r_step = 4;
        cfg.q_step = 2;
        assert!(cfg.validate().is_err());

        cfg.q_step = 1;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn subs_and_clip_budgets() {
        let mut cfg = AlignConfig::default();
        cfg.max_subs = 5;
        cfg.min_identity = 0.9;
        // identity floor wins for short queries
        assert_eq!(2, cfg.max_subs_for(20));
        assert_eq!(5, cfg.max_subs_for(100));

        cfg.max_clip = 0.3;
        assert_eq!(3, cfg.max_clips_for(10));
        cfg.max_clip = 7.0;
        assert_eq!(7, cfg.max_clips_for(10));
    }

    #[test]
    fn bgzf_config_bounds() {
        let mut cfg = BgzfConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.level = 10;
        assert!(cfg.validate().is_err());
        cfg.level = 1;
        cfg.block_size = 1 << 17;
        assert!(cfg.validate().is_err());
    }
}
