#[macro_use]
extern crate log;

extern crate clap;

extern crate skald;

use clap::{App, Arg};

use skald::config::{parse_k_set, AlignConfig};
use skald::driver::{self, AlignJob, QueryFormat};
use skald::util::{parse_fraction, parse_size};

fn main() {
    let args = App::new("skald-align")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Indel-free seed-and-extend read aligner.")
        .arg(Arg::with_name("FASTA")
            .long("fasta")
            .help("Path to FASTA query reads.")
            .takes_value(true)
            .required_unless("FASTQ")
            .conflicts_with("FASTQ"))
        .arg(Arg::with_name("FASTQ")
            .long("fastq")
            .help("Path to FASTQ query reads.")
            .takes_value(true)
            .required_unless("FASTA")
            .conflicts_with("FASTA"))
        .arg(Arg::with_name("REFERENCE")
            .short("r")
            .long("reference")
            .help("Path to reference FASTA (streamed, never preloaded).")
            .takes_value(true)
            .required(true))
        .arg(Arg::with_name("OUT")
            .short("o")
            .long("out")
            .help("Path to write SAM records.")
            .takes_value(true)
            .required(true))
        .arg(Arg::with_name("HEADER_OUT")
            .long("header-out")
            .help("Optional sidecar file for @SQ header lines.")
            .takes_value(true))
        .arg(Arg::with_name("STATS_OUT")
            .long("stats-out")
            .help("Optional JSON statistics sidecar.")
            .takes_value(true))
        .arg(Arg::with_name("K")
            .short("k")
            .help("Candidate K set: one value, a comma list, or hi-lo. 0 disables indexing.")
            .takes_value(true)
            .default_value("13"))
        .arg(Arg::with_name("MAXSUBS")
            .long("maxsubs")
            .help("Global substitution cap.")
            .takes_value(true)
            .default_value("3"))
        .arg(Arg::with_name("MINID")
            .long("minid")
            .help("Identity floor in [0,1]; values above 1 are percentages.")
            .takes_value(true)
            .default_value("0.9"))
        .arg(Arg::with_name("MINHITS")
            .long("minhits")
            .help("Global seed-hit floor.")
            .takes_value(true)
            .default_value("1"))
        .arg(Arg::with_name("MINPROB")
            .long("minprob")
            .help("Detection probability target for seed calibration.")
            .takes_value(true)
            .default_value("0.9995"))
        .arg(Arg::with_name("MAXCLIP")
            .long("maxclip")
            .help("Clipping budget: fraction of read length, or absolute when >= 1.")
            .takes_value(true)
            .default_value("0"))
        .arg(Arg::with_name("QSTEP")
            .long("qstep")
            .help("Query k-mer stride.")
            .takes_value(true)
            .default_value("1"))
        .arg(Arg::with_name("RSTEP")
            .long("rstep")
            .help("Reference k-mer stride (power of two).")
            .takes_value(true)
            .default_value("1"))
        .arg(Arg::with_name("MIDMASK")
            .long("mm")
            .help("Middle k-mer bases ignored in seed equality.")
            .takes_value(true)
            .default_value("0"))
        .arg(Arg::with_name("BLACKLIST")
            .long("blacklist")
            .help("Homopolymer run length that blacklists a k-mer; 0 disables.")
            .takes_value(true)
            .default_value("0"))
        .arg(Arg::with_name("NO_PRESCAN")
            .long("no-prescan")
            .help("Disable the cheap hit/miss prescan."))
        .arg(Arg::with_name("SEEDLIST")
            .long("seedlist")
            .help("Use list-mode seed collection instead of the counting map."))
        .arg(Arg::with_name("FUSE")
            .long("fuse")
            .help("Fuse each reference batch into one padded pseudo-reference."))
        .arg(Arg::with_name("PADDING")
            .long("padding")
            .help("Padding between fused references (raised to the longest read).")
            .takes_value(true)
            .default_value("128"))
        .arg(Arg::with_name("CHUNKSIZE")
            .long("chunksize")
            .help("Target reference bases per worker batch (k/m/g suffixes).")
            .takes_value(true)
            .default_value("4m"))
        .arg(Arg::with_name("MINQLEN")
            .long("minqlen")
            .help("Skip queries shorter than this.")
            .takes_value(true)
            .default_value("0"))
        .arg(Arg::with_name("MINRLEN")
            .long("minrlen")
            .help("Skip references shorter than this.")
            .takes_value(true)
            .default_value("0"))
        .arg(Arg::with_name("ENTROPYMASK")
            .long("entropymask")
            .help("Mask low-entropy reference windows before indexing."))
        .arg(Arg::with_name("ENTROPYWINDOW")
            .long("entropywindow")
            .help("Entropy filter window length.")
            .takes_value(true)
            .default_value("80"))
        .arg(Arg::with_name("ENTROPYK")
            .long("entropyk")
            .help("Entropy filter k-mer length.")
            .takes_value(true)
            .default_value("5"))
        .arg(Arg::with_name("ENTROPYCUTOFF")
            .long("entropycutoff")
            .help("Normalized entropy below which a window is masked.")
            .takes_value(true)
            .default_value("0.55"))
        .arg(Arg::with_name("NO_SIMD")
            .long("no-simd")
            .help("Force the scalar substitution kernel."))
        .arg(Arg::with_name("NUM_THREADS")
            .short("t")
            .long("threads")
            .help("Number of worker threads to spawn.")
            .takes_value(true)
            .default_value("4"))
        .arg(Arg::with_name("VERBOSE")
            .short("v")
            .help("Include this flag to trigger debug-level logging."))
        .get_matches();

    // setup logger
    skald::util::init_logging(if args.is_present("VERBOSE") {
        log::LogLevelFilter::Debug
    } else {
        log::LogLevelFilter::Info
    });

    let exit_code = {
        let mut cfg = AlignConfig::default();

        cfg.ks = match parse_k_set(args.value_of("K").unwrap()) {
            Ok(ks) => ks,
            Err(why) => {
                error!("Invalid k set: {}", why);
                std::process::exit(3);
            },
        };

        cfg.max_subs = parse_or_exit(args.value_of("MAXSUBS").unwrap(), "maxsubs");
        cfg.min_hits = parse_or_exit(args.value_of("MINHITS").unwrap(), "minhits");
        cfg.mid_mask_len = parse_or_exit(args.value_of("MIDMASK").unwrap(), "mm");
        cfg.blacklist = parse_or_exit(args.value_of("BLACKLIST").unwrap(), "blacklist");
        cfg.q_step = parse_or_exit(args.value_of("QSTEP").unwrap(), "qstep");
        cfg.r_step = parse_or_exit(args.value_of("RSTEP").unwrap(), "rstep");
        cfg.padding = parse_or_exit(args.value_of("PADDING").unwrap(), "padding");
        cfg.min_query_len = parse_or_exit(args.value_of("MINQLEN").unwrap(), "minqlen");
        cfg.min_ref_len = parse_or_exit(args.value_of("MINRLEN").unwrap(), "minrlen");
        cfg.threads = parse_or_exit(args.value_of("NUM_THREADS").unwrap(), "threads");
        cfg.entropy_window =
            parse_or_exit(args.value_of("ENTROPYWINDOW").unwrap(), "entropywindow");
        cfg.entropy_k = parse_or_exit(args.value_of("ENTROPYK").unwrap(), "entropyk");

        cfg.min_identity = match parse_fraction(args.value_of("MINID").unwrap()) {
            Ok(v) => v,
            Err(why) => {
                error!("Invalid minid: {}", why);
                std::process::exit(3);
            },
        };
        cfg.min_prob = match args.value_of("MINPROB").unwrap().parse::<f64>() {
            Ok(v) => v,
            Err(_) => {
                error!("Invalid minprob");
                std::process::exit(3);
            },
        };
        cfg.max_clip = match args.value_of("MAXCLIP").unwrap().parse::<f64>() {
            Ok(v) => v,
            Err(_) => {
                error!("Invalid maxclip");
                std::process::exit(3);
            },
        };
        cfg.entropy_cutoff =
            match args.value_of("ENTROPYCUTOFF").unwrap().parse::<f64>() {
                Ok(v) => v,
                Err(_) => {
                    error!("Invalid entropycutoff");
                    std::process::exit(3);
                },
            };
        cfg.chunk_size = match parse_size(args.value_of("CHUNKSIZE").unwrap()) {
            Ok(v) => v,
            Err(why) => {
                error!("Invalid chunksize: {}", why);
                std::process::exit(3);
            },
        };

        cfg.prescan = !args.is_present("NO_PRESCAN");
        cfg.seed_map = !args.is_present("SEEDLIST");
        cfg.fuse = args.is_present("FUSE");
        cfg.entropy_mask = args.is_present("ENTROPYMASK");
        cfg.simd = !args.is_present("NO_SIMD");

        if let Err(why) = cfg.validate() {
            error!("{}", why);
            std::process::exit(3);
        }

        let (query_path, query_format) = if let Some(path) = args.value_of("FASTA") {
            (path, QueryFormat::Fasta)
        } else {
            (args.value_of("FASTQ").unwrap(), QueryFormat::Fastq)
        };

        let job = AlignJob {
            cfg: &cfg,
            query_path: query_path,
            query_format: query_format,
            ref_path: args.value_of("REFERENCE").unwrap(),
            out_path: args.value_of("OUT").unwrap(),
            header_path: args.value_of("HEADER_OUT"),
            stats_path: args.value_of("STATS_OUT"),
        };

        match driver::run(&job) {
            Ok(_) => 0,
            Err(why) => {
                error!("Error running alignment: {}", why);
                error!("Partial output should be discarded.");
                2
            },
        }
    };

    std::process::exit(exit_code);
}

fn parse_or_exit<T: std::str::FromStr>(value: &str, name: &str) -> T {
    match value.parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            error!("Invalid value for {}: {}", name, value);
            std::process::exit(3);
        },
    }
}
