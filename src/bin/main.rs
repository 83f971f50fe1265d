// SPDX-License-Identifier: GPL-3.0-or-later

use ccache::{args, modes};
use std::process::ExitCode;

/// Driver function of the application.
fn main() -> ExitCode {
    // Initialize the logging system.
    env_logger::init();
    let pkg_name = env!("CARGO_PKG_NAME");
    let pkg_version = env!("CARGO_PKG_VERSION");
    log::debug!("=== {pkg_name} {pkg_version} started ===");

    let argv: Vec<String> = std::env::args().collect();
    let invocation = args::classify_invocation(&argv);

    let mode = match modes::Mode::configure(invocation) {
        Ok(mode) => mode,
        Err(error) => {
            eprintln!("{}: error: {error}", ccache::MYNAME);
            return ExitCode::FAILURE;
        }
    };
    mode.run()
}
