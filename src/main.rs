use std::process::ExitCode;

use clap::Parser;

mod cli;
mod commands;

use cli::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Some(mode) = cli.color {
        devctl::set_color_mode(mode);
    }
    devctl::logging::init(cli.verbose);

    match commands::dispatch(&cli) {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            devctl::log_error_stderr(devctl::color_enabled_stderr(), &format!("devctl: {e}"));
            ExitCode::from(devctl::exit_code_for(&e))
        }
    }
}
