mod app;
mod args;
mod logging;
#[cfg(feature = "onnx")]
mod onnx;
mod prompt;
mod resources;

use crate::args::Cli;
use clap::Parser;
use tracing::error;

fn main() {
    let cli = Cli::parse();
    logging::init(cli.quiet);
    if let Err(err) = app::run(cli) {
        error!(error = %err, "CLI failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
