//! baggageclaim - Manage ephemeral copy-on-write volumes

mod cli;
mod commands;
mod logging;

use clap::Parser;
use cli::Cli;
use console::style;

fn main() {
    let cli = Cli::parse();

    logging::init_logger(cli.verbose);

    if let Err(e) = commands::execute(cli) {
        eprintln!("{} {}", style("error:").red().bold(), e);
        std::process::exit(1);
    }
}
