// SPDX-License-Identifier: GPL-3.0-or-later

//! The command line interface of the program itself.
//!
//! The binary is invoked in one of three ways: as itself with a compiler
//! name as the first argument, through a symlink or hard link carrying a
//! compiler's name, or as itself with an option flag for cache management.
//! Only the management mode is parsed with `clap`; compiler invocations
//! pass through untouched.

use clap::{arg, crate_version, ArgAction, ArgMatches, Command};
use std::path::Path;

/// How this process was invoked.
#[derive(Debug, PartialEq)]
pub enum Invocation {
    /// A compiler command line; element 0 names the compiler.
    Compile(Vec<String>),
    /// Management options, to be parsed by `cli()`.
    Management(Vec<String>),
}

/// Decide the invocation kind from the raw argument vector.
pub fn classify_invocation(argv: &[String]) -> Invocation {
    let base_name = Path::new(&argv[0])
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if base_name == crate::MYNAME {
        match argv.get(1) {
            // No arguments: the management parser will print usage.
            None => Invocation::Management(argv.to_vec()),
            Some(first) if first.starts_with('-') => Invocation::Management(argv.to_vec()),
            // The first argument names the compiler.
            Some(_) => Invocation::Compile(argv[1..].to_vec()),
        }
    } else {
        // Invoked through a compiler-named link; the whole argv is the
        // compiler command line.
        Invocation::Compile(argv.to_vec())
    }
}

/// The management operations in the order they are executed.
#[derive(Debug, Default, PartialEq)]
pub struct Management {
    pub dump_manifest: Option<String>,
    pub dump_result: Option<String>,
    pub hash_file: Option<String>,
    pub print_stats: bool,
    pub cleanup: bool,
    pub clear: bool,
    pub get_config: Option<String>,
    pub max_files: Option<String>,
    pub max_size: Option<String>,
    pub set_config: Option<String>,
    pub show_config: bool,
    pub show_stats: bool,
    pub show_compression: bool,
    pub recompress: Option<String>,
    pub zero_stats: bool,
}

impl TryFrom<ArgMatches> for Management {
    type Error = anyhow::Error;

    fn try_from(matches: ArgMatches) -> Result<Self, Self::Error> {
        let get_string =
            |name: &str| matches.get_one::<String>(name).map(String::to_string);
        Ok(Management {
            dump_manifest: get_string("dump-manifest"),
            dump_result: get_string("dump-result"),
            hash_file: get_string("hash-file"),
            print_stats: matches.get_flag("print-stats"),
            cleanup: matches.get_flag("cleanup"),
            clear: matches.get_flag("clear"),
            get_config: get_string("get-config"),
            max_files: get_string("max-files"),
            max_size: get_string("max-size"),
            set_config: get_string("set-config"),
            show_config: matches.get_flag("show-config"),
            show_stats: matches.get_flag("show-stats"),
            show_compression: matches.get_flag("show-compression"),
            recompress: get_string("recompress"),
            zero_stats: matches.get_flag("zero-stats"),
        })
    }
}

/// The management command line.
pub fn cli() -> Command {
    Command::new(crate::MYNAME)
        .version(crate_version!())
        .about("a transparent compiler cache")
        .override_usage(format!(
            "{name} [options]\n       \
             {name} compiler [compiler options]\n       \
             compiler [compiler options]          (via symbolic link)",
            name = crate::MYNAME
        ))
        .arg_required_else_help(true)
        .args(&[
            arg!(-c --cleanup "delete old files and recalculate size counters")
                .action(ArgAction::SetTrue),
            arg!(-C --clear "clear the cache completely (except configuration)")
                .action(ArgAction::SetTrue),
            arg!(-F --"max-files" <NUM> "set maximum number of files in cache to NUM (use 0 for no limit)"),
            arg!(-M --"max-size" <SIZE>
                "set maximum size of cache to SIZE (use 0 for no limit); \
                 available suffixes: k, M, G, T (decimal) and Ki, Mi, Gi, Ti (binary); \
                 default suffix: G"),
            arg!(-X --recompress <LEVEL> "recompress the cache to LEVEL (integer level or \"uncompressed\")"),
            arg!(-x --"show-compression" "show compression statistics")
                .action(ArgAction::SetTrue),
            arg!(-p --"show-config" "show current configuration options in human-readable format")
                .action(ArgAction::SetTrue),
            arg!(-s --"show-stats" "show summary of configuration and statistics counters in human-readable format")
                .action(ArgAction::SetTrue),
            arg!(-z --"zero-stats" "zero statistics counters").action(ArgAction::SetTrue),
            arg!(-k --"get-config" <KEY> "print the value of configuration key KEY"),
            arg!(-o --"set-config" <KEYVAL> "set configuration item KEY to value VAL")
                .value_name("KEY=VAL"),
            arg!(--"dump-manifest" <PATH> "dump manifest file at PATH in text format"),
            arg!(--"dump-result" <PATH> "dump result file at PATH in text format"),
            arg!(--"hash-file" <PATH> "print the hash (160 bit BLAKE3) of the file at PATH (- for stdin)"),
            arg!(--"print-stats" "print statistics counter IDs and corresponding values in machine-parsable format")
                .action(ArgAction::SetTrue),
        ])
}
