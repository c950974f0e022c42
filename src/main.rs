//! kform CLI: run KRM block graphs.

use clap::Parser;
use kform::cli::{logging, Cli};

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_format);
    if let Err(e) = kform::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
