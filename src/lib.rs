//! skald: an indel-free seed-and-extend read aligner and a BGZF/BAM toolkit.
//!
//! The aligner maps short query sequences against a streamed reference corpus
//! using multi-K k-mer indexing with Monte-Carlo-calibrated seed thresholds,
//! and emits SAM. The BAM side provides a BGZF codec (single- and
//! multi-threaded), a SAM/BAM record transcoder and a BAI index builder.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

extern crate anyhow;
extern crate bio;
extern crate byteorder;
extern crate chrono;
extern crate env_logger;
extern crate flate2;
extern crate fxhash;
extern crate itertools;
extern crate rand;
extern crate serde;
extern crate serde_json;

#[cfg(test)]
extern crate tempfile;
#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod align;
pub mod bai;
pub mod bam;
pub mod bam_record;
pub mod bgzf;
pub mod bgzf_mt;
pub mod config;
pub mod driver;
pub mod error;
pub mod kmer;
pub mod minhits;
pub mod ordered_queue;
pub mod packed_index;
pub mod process;
pub mod query;
pub mod reference;
pub mod sam;
pub mod seed;
pub mod stats;
pub mod util;
