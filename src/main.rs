use std::process::ExitCode;

use clap::Parser;

use paintstack::cli::{self, CliArgs};
use paintstack::settings::CoreSettings;

fn main() -> ExitCode {
    let args = CliArgs::parse();
    let settings = CoreSettings::load();
    paintstack::logger::init(&settings);
    paintstack::log_info!("PaintStack {} starting", env!("CARGO_PKG_VERSION"));
    cli::run(args)
}
