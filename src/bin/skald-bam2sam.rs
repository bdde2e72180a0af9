#[macro_use]
extern crate log;

extern crate clap;

extern crate skald;

use clap::{App, Arg};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use skald::bam::BamReader;
use skald::bgzf::{BgzfReader, BlockRead};
use skald::bgzf_mt::BgzfReaderMt;
use skald::config::BgzfConfig;
use skald::error::SkaldResult;

fn main() {
    let args = App::new("skald-bam2sam")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Convert BAM back to SAM text.")
        .arg(Arg::with_name("INPUT")
            .short("i")
            .long("in")
            .help("Path to BAM input.")
            .takes_value(true)
            .required(true))
        .arg(Arg::with_name("OUTPUT")
            .short("o")
            .long("out")
            .help("Path to SAM output.")
            .takes_value(true)
            .required(true))
        .arg(Arg::with_name("NUM_THREADS")
            .short("t")
            .long("threads")
            .help("Inflate worker threads; 1 selects the single-threaded codec.")
            .takes_value(true)
            .default_value("1"))
        .arg(Arg::with_name("VERBOSE")
            .short("v")
            .help("Include this flag to trigger debug-level logging."))
        .get_matches();

    skald::util::init_logging(if args.is_present("VERBOSE") {
        log::LogLevelFilter::Debug
    } else {
        log::LogLevelFilter::Info
    });

    let threads = match args.value_of("NUM_THREADS").unwrap().parse::<usize>() {
        Ok(t) if t >= 1 => t,
        _ => {
            error!("Invalid thread count");
            std::process::exit(3);
        },
    };

    let input = args.value_of("INPUT").unwrap();
    let output = args.value_of("OUTPUT").unwrap();

    match convert(input, output, threads) {
        Ok(records) => {
            info!("wrote {} records to {}", records, output);
            std::process::exit(0);
        },
        Err(why) => {
            error!("Error converting {}: {}", input, why);
            error!("Partial output should be discarded.");
            std::process::exit(2);
        },
    }
}

fn convert(input: &str, output: &str, threads: usize) -> SkaldResult<u64> {
    let in_file = BufReader::new(File::open(Path::new(input))?);
    let src: Box<dyn BlockRead> = if threads > 1 {
        let mut cfg = BgzfConfig::default();
        cfg.threads = threads;
        cfg.validate()?;
        Box::new(BgzfReaderMt::new(in_file, &cfg))
    } else {
        Box::new(BgzfReader::new(in_file))
    };

    let mut reader = BamReader::new(src)?;
    let mut out = BufWriter::new(File::create(Path::new(output))?);

    let header_text = reader.header().text.clone();
    if !header_text.is_empty() {
        out.write_all(header_text.as_bytes())?;
        if !header_text.ends_with('\n') {
            out.write_all(b"\n")?;
        }
    }

    let refs = reader.header().refs.clone();
    let mut records = 0u64;
    while let Some(record) = reader.next_record()? {
        let line = record.to_sam(&refs)?;
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        records += 1;
    }

    Ok(records)
}
