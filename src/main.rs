// Headless entry point. Interactive hosts link the `retouchfe` library
// directly; this binary runs the batch pipeline in `cli`.
#![allow(clippy::too_many_arguments)]

use std::process::ExitCode;

use clap::Parser;
use tracing::Level;

use retouchfe::{cli, logger};

fn main() -> ExitCode {
    let args = cli::CliArgs::parse();

    // --verbose mirrors the log to the terminal instead of the session file.
    if args.verbose {
        logger::init_stderr(Level::DEBUG);
    } else {
        logger::init();
    }

    cli::run(args)
}
