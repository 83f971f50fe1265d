// SPDX-License-Identifier: GPL-3.0-or-later

//! The two modes of the application: caching a compilation, and managing
//! the cache.

pub mod admin;
pub mod compile;

use crate::args::{self, Invocation, Management};
use crate::config::Config;
use std::process::ExitCode;

pub enum Mode {
    /// Wrap a compiler invocation; element 0 names the compiler.
    Compile(Vec<String>),
    Management(Management),
}

impl Mode {
    /// Turn a classified invocation into a runnable mode. Invalid
    /// management options terminate here with a usage message.
    pub fn configure(invocation: Invocation) -> anyhow::Result<Self> {
        match invocation {
            Invocation::Compile(arguments) => {
                log::debug!("Mode: compile");
                Ok(Mode::Compile(arguments))
            }
            Invocation::Management(arguments) => {
                log::debug!("Mode: management");
                let matches = args::cli()
                    .try_get_matches_from(arguments)
                    .unwrap_or_else(|error| error.exit());
                let management = Management::try_from(matches)?;
                Ok(Mode::Management(management))
            }
        }
    }

    pub fn run(self) -> ExitCode {
        match self {
            Mode::Compile(arguments) => compile::run(arguments),
            Mode::Management(management) => {
                let config = match Config::setup() {
                    Ok(config) => config,
                    Err(error) => {
                        eprintln!("{}: error: {error}", crate::MYNAME);
                        return ExitCode::FAILURE;
                    }
                };
                match admin::run(&management, &config) {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(error) => {
                        eprintln!("{}: error: {error}", crate::MYNAME);
                        ExitCode::FAILURE
                    }
                }
            }
        }
    }
}
