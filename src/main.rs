use replimpute::process::{run, Args};

use clap::Parser;
use colored::Colorize;
use env_logger::Builder;
use log::{error, info, LevelFilter};
use rayon::ThreadPoolBuilder;

fn main() {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    Builder::new().filter_level(level).parse_default_env().init();

    if args.threads == 0 {
        eprintln!("{}", "Error: --threads must be at least 1".red());
        std::process::exit(2);
    }
    if let Err(e) = ThreadPoolBuilder::new().num_threads(args.threads).build_global() {
        error!("Failed to configure the thread pool: {}", e);
        std::process::exit(2);
    }
    info!("Using {} worker threads", args.threads);

    if let Err(e) = run(args) {
        eprintln!("{}", format!("Error: {}", e).red());
        std::process::exit(1);
    }
}
