#[macro_use]
extern crate log;

extern crate clap;

extern crate skald;

use clap::{App, Arg};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use skald::bai::BaiIndex;
use skald::bam::BamReader;
use skald::bgzf::BgzfReader;
use skald::error::SkaldResult;

fn main() {
    let args = App::new("skald-bamindex")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Build a .bai index from a BAM file.")
        .arg(Arg::with_name("INPUT")
            .short("i")
            .long("in")
            .help("Path to BAM input.")
            .takes_value(true)
            .required(true))
        .arg(Arg::with_name("OUTPUT")
            .short("o")
            .long("out")
            .help("Path to .bai output (defaults to <input>.bai).")
            .takes_value(true))
        .arg(Arg::with_name("VERBOSE")
            .short("v")
            .help("Include this flag to trigger debug-level logging."))
        .get_matches();

    skald::util::init_logging(if args.is_present("VERBOSE") {
        log::LogLevelFilter::Debug
    } else {
        log::LogLevelFilter::Info
    });

    let input = args.value_of("INPUT").unwrap().to_string();
    let output = match args.value_of("OUTPUT") {
        Some(path) => path.to_string(),
        None => format!("{}.bai", input),
    };

    match build(&input, &output) {
        Ok(no_coord) => {
            info!("index written to {} ({} reads without coordinate)",
                  output, no_coord);
            std::process::exit(0);
        },
        Err(why) => {
            error!("Error indexing {}: {}", input, why);
            error!("Partial output should be discarded.");
            std::process::exit(2);
        },
    }
}

fn build(input: &str, output: &str) -> SkaldResult<u64> {
    let in_file = BufReader::new(File::open(Path::new(input))?);
    let mut reader = BamReader::new(Box::new(BgzfReader::new(in_file)))?;

    let index = BaiIndex::build(&mut reader)?;

    let mut out = BufWriter::new(File::create(Path::new(output))?);
    index.write_to(&mut out)?;
    Ok(index.reads_without_coordinate())
}
