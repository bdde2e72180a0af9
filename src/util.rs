//! Shared helpers: logging setup, transparent gzip input, small parsers.

use chrono::Local;
use env_logger::LogBuilder;
use flate2::read::MultiGzDecoder;
use log::{LogLevelFilter, LogRecord};
use std::env;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::*;

/// Initialize the process-wide logger, printing timestamped records to stderr.
///
/// `RUST_LOG` overrides the level passed here, matching the usual env_logger
/// behavior.
pub fn init_logging(level: LogLevelFilter) {
    let format = |record: &LogRecord| {
        format!("{} - {} - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args())
    };

    let mut builder = LogBuilder::new();
    builder.format(format).filter(None, level);

    if let Ok(spec) = env::var("RUST_LOG") {
        builder.parse(&spec);
    }

    // tests may initialize more than once
    let _ = builder.init();
}

/// Open a file, transparently decoding gzip if the magic bytes match.
pub fn open_maybe_gz(path: &str) -> SkaldResult<Box<dyn Read + Send>> {
    if !Path::new(path).exists() {
        return Err(SkaldError::MissingFile(path.to_string()));
    }

    let mut file = File::open(Path::new(path))?;
    let mut magic = [0u8; 2];
    let read_len = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    if read_len == 2 && magic == [0x1f, 0x8b] {
        Ok(Box::new(MultiGzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Parse an integer knob that may carry a k/m/g suffix (e.g. `64k`, `2m`).
pub fn parse_size(s: &str) -> SkaldResult<usize> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SkaldError::InvalidInteger(s.to_string()));
    }

    let (digits, mult) = match s.as_bytes()[s.len() - 1] {
        b'k' | b'K' => (&s[..s.len() - 1], 1usize << 10),
        b'm' | b'M' => (&s[..s.len() - 1], 1usize << 20),
        b'g' | b'G' => (&s[..s.len() - 1], 1usize << 30),
        _ => (s, 1),
    };

    match digits.parse::<usize>() {
        Ok(n) => Ok(n * mult),
        Err(_) => Err(SkaldError::InvalidInteger(s.to_string())),
    }
}

/// Parse a fraction knob; values above 1 are interpreted as percentages.
pub fn parse_fraction(s: &str) -> SkaldResult<f64> {
    let v = s.trim()
        .parse::<f64>()
        .map_err(|_| SkaldError::InvalidInteger(s.to_string()))?;
    if v > 1.0 { Ok(v / 100.0) } else { Ok(v) }
}

/// Reverse complement of an ASCII DNA sequence; non-ACGT bases map to `N`.
pub fn revcomp(bases: &[u8]) -> Vec<u8> {
    bases.iter()
        .rev()
        .map(|&b| complement(b))
        .collect()
}

/// Complement of a single ASCII base; non-ACGT maps to `N`.
#[inline]
pub fn complement(b: u8) -> u8 {
    match b {
        b'A' | b'a' => b'T',
        b'C' | b'c' => b'G',
        b'G' | b'g' => b'C',
        b'T' | b't' => b'A',
        _ => b'N',
    }
}

/// Fold a raw read sequence to uppercase ACGTN.
pub fn normalize_bases(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .map(|b| {
            match *b {
                b'A' | b'a' => b'A',
                b'C' | b'c' => b'C',
                b'G' | b'g' => b'G',
                b'T' | b't' => b'T',
                _ => b'N',
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::{Read, Write};
    use tempfile::NamedTempFile;
    use super::*;

    #[test]
    fn parse_size_plain_and_suffixed() {
        assert_eq!(512, parse_size("512").unwrap());
        assert_eq!(64 * 1024, parse_size("64k").unwrap());
        assert_eq!(2 * 1024 * 1024, parse_size("2M").unwrap());
        assert!(parse_size("").is_err());
        assert!(parse_size("12q").is_err());
    }

    #[test]
    fn parse_fraction_percent() {
        assert_eq!(0.9, parse_fraction("0.9").unwrap());
        assert_eq!(0.9, parse_fraction("90").unwrap());
    }

    #[test]
    fn revcomp_simple() {
        assert_eq!(b"ACGT".to_vec(), revcomp(b"ACGT"));
        assert_eq!(b"CCNAA".to_vec(), revcomp(b"TTXGG"));
    }

    #[test]
    fn normalize_folds_case_and_ambiguity() {
        assert_eq!(b"ACGTN".to_vec(), normalize_bases(b"acgtR"));
    }

    #[test]
    fn open_maybe_gz_reads_plain_and_gz() {
        let content = b">r1\nACGT\n";

        let mut plain = NamedTempFile::new().unwrap();
        plain.write_all(content).unwrap();
        let mut plain_reader = open_maybe_gz(plain.path().to_str().unwrap()).unwrap();
        let mut plain_buf = Vec::new();
        plain_reader.read_to_end(&mut plain_buf).unwrap();
        assert_eq!(content.as_ref(), plain_buf.as_slice());

        let mut gz = NamedTempFile::new().unwrap();
        {
            let mut encoder = GzEncoder::new(gz.as_file_mut(), Compression::default());
            encoder.write_all(content).unwrap();
            encoder.finish().unwrap();
        }
        let mut gz_reader = open_maybe_gz(gz.path().to_str().unwrap()).unwrap();
        let mut gz_buf = Vec::new();
        gz_reader.read_to_end(&mut gz_buf).unwrap();
        assert_eq!(content.as_ref(), gz_buf.as_slice());
    }

    #[test]
    fn open_missing_file_is_an_error() {
        assert!(open_maybe_gz("/definitely/not/here.fa").is_err());
    }
}
