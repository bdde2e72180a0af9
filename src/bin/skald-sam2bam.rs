#[macro_use]
extern crate log;

extern crate clap;

extern crate skald;

use clap::{App, Arg};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::Path;

use skald::bam::{parse_sam_header, BamWriter};
use skald::bgzf::{BgzfWriter, BlockWrite};
use skald::bgzf_mt::BgzfWriterMt;
use skald::config::BgzfConfig;
use skald::error::SkaldResult;

fn main() {
    let args = App::new("skald-sam2bam")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Convert SAM text to BGZF-compressed BAM.")
        .arg(Arg::with_name("INPUT")
            .short("i")
            .long("in")
            .help("Path to SAM input (header lines first).")
            .takes_value(true)
            .required(true))
        .arg(Arg::with_name("OUTPUT")
            .short("o")
            .long("out")
            .help("Path to BAM output.")
            .takes_value(true)
            .required(true))
        .arg(Arg::with_name("NUM_THREADS")
            .short("t")
            .long("threads")
            .help("Deflate worker threads; 1 selects the single-threaded codec.")
            .takes_value(true)
            .default_value("1"))
        .arg(Arg::with_name("LEVEL")
            .long("level")
            .help("Deflate level (0-9).")
            .takes_value(true)
            .default_value("6"))
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
    let level = match args.value_of("LEVEL").unwrap().parse::<u32>() {
        Ok(l) if l <= 9 => l,
        _ => {
            error!("Invalid deflate level");
            std::process::exit(3);
        },
    };

    let input = args.value_of("INPUT").unwrap();
    let output = args.value_of("OUTPUT").unwrap();

    match convert(input, output, threads, level) {
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

fn convert(input: &str, output: &str, threads: usize, level: u32)
           -> SkaldResult<u64> {
    let sam_text = std::fs::read_to_string(Path::new(input))?;
    let (header_lines, refs) = parse_sam_header(&sam_text)?;
    info!("parsed {} header lines, {} references",
          header_lines.len(), refs.len());

    let out_file = BufWriter::new(File::create(Path::new(output))?);
    let sink: Box<dyn BlockWrite + Send> = if threads > 1 {
        let mut cfg = BgzfConfig::default();
        cfg.threads = threads;
        cfg.level = level;
        cfg.validate()?;
        Box::new(BgzfWriterMt::new(out_file, &cfg))
    } else {
        Box::new(BgzfWriter::with_params(out_file,
                                         skald::bgzf::DEFAULT_BLOCK_SIZE,
                                         level))
    };

    let mut writer = BamWriter::new(sink, &header_lines, refs)?;
    let mut records = 0u64;

    let reader = BufReader::new(File::open(Path::new(input))?);
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() || line.starts_with('@') {
            continue;
        }
        writer.write_sam_line(&line)?;
        records += 1;
    }

    writer.finish()?;
    Ok(records)
}
