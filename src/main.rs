use std::process::ExitCode;

use bananaslice::{cli, logger};
use clap::Parser;

fn main() -> ExitCode {
    // Initialize session log (overwrites previous session log)
    logger::init();

    let args = cli::CliArgs::parse();
    cli::run(args)
}
