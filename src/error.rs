//! Result and Error types for all skald code.
use std::fmt;
use std::io;
use std::num::ParseIntError;
use std::str;

#[allow(missing_docs)]
pub type SkaldResult<T> = Result<T, SkaldError>;

#[allow(missing_docs)]
#[derive(Debug)]
pub enum SkaldError {
    Io(io::Error),
    InvalidConfig(String),
    InvalidHeader(String),
    InvalidInteger(String),
    MissingFile(String),
    Bgzf(String),
    BamRecord(String),
    SamParse(String),
    Utf8(str::Utf8Error),
    FastqReadError,
    WorkerFailed(String),
    AnyhowError(String),
}

impl fmt::Display for SkaldError {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {

        match self {
            &SkaldError::Io(ref e) => write!(f, "I/O problem: {}", e),
            &SkaldError::InvalidConfig(ref s) => write!(f, "Invalid configuration: {}", s),
            &SkaldError::InvalidHeader(ref h) => {
                write!(f, "Incorrectly formatted FASTA/FASTQ header: {}", h)
            },
            &SkaldError::InvalidInteger(ref s) => write!(f, "Unable to parse \"{}\" as integer", s),
            &SkaldError::MissingFile(ref p) => write!(f, "Unable to find file {}", p),
            &SkaldError::Bgzf(ref s) => write!(f, "BGZF stream error: {}", s),
            &SkaldError::BamRecord(ref s) => write!(f, "Malformed BAM record: {}", s),
            &SkaldError::SamParse(ref s) => write!(f, "Unable to parse SAM record: {}", s),
            &SkaldError::Utf8(ref e) => write!(f, "Found invalid UTF8 input ({})", e),
            &SkaldError::FastqReadError => write!(f, "Error reading FASTQ file"),
            &SkaldError::WorkerFailed(ref s) => write!(f, "Worker thread failed: {}", s),
            &SkaldError::AnyhowError(ref s) => write!(f, "Error: {}", s),
        }
    }
}

impl From<io::Error> for SkaldError {
    fn from(e: io::Error) -> Self {
        SkaldError::Io(e)
    }
}

impl From<str::Utf8Error> for SkaldError {
    fn from(e: str::Utf8Error) -> Self {
        SkaldError::Utf8(e)
    }
}

impl From<ParseIntError> for SkaldError {
    fn from(e: ParseIntError) -> Self {
        SkaldError::InvalidInteger(e.to_string())
    }
}

impl From<anyhow::Error> for SkaldError {
    fn from(e: anyhow::Error) -> Self {
        SkaldError::AnyhowError(e.to_string())
    }
}

impl From<bio::io::fastq::Error> for SkaldError {
    fn from(_: bio::io::fastq::Error) -> Self {
        SkaldError::FastqReadError
    }
}
