// SPDX-License-Identifier: GPL-3.0-or-later

//! Hashing of inputs shared by the direct and preprocessor modes.
//!
//! The common hash covers everything that influences compilation output but
//! is not part of the argument vector or the source text: the compiler
//! binary itself, locale, working directory, output-path-dependent side
//! files and user-configured extra files. It is computed once and forked
//! for the two lookup modes.

use crate::context::Context;
use crate::environment;
use crate::hashing::{Hasher, HASH_PREFIX};
use crate::stats::{Failure, StatKind};
use log::debug;
use std::fs::Metadata;
use std::path::Path;
use std::process::Command;

/// Hash the compiler identity according to the `compiler_check` policy.
///
/// `allow_command` guards against recursion when a check command itself
/// names a compiler.
pub fn hash_compiler(
    ctx: &Context,
    hash: &mut Hasher,
    metadata: &Metadata,
    path: &str,
    allow_command: bool,
) -> Result<(), Failure> {
    let check = ctx.config.compiler_check.as_str();
    if check == "none" {
        return Ok(());
    }
    if check == "mtime" {
        hash.delimiter("cc_mtime");
        hash.update_int(metadata.len() as i64);
        hash.update_int(mtime_seconds(metadata));
        return Ok(());
    }
    if let Some(literal) = check.strip_prefix("string:") {
        hash.delimiter("cc_hash");
        hash.update_str(literal);
        return Ok(());
    }
    if check == "content" || !allow_command {
        hash.delimiter("cc_content");
        hash.hash_file(Path::new(path)).map_err(|error| {
            debug!("Failed to hash compiler {path}: {error}");
            Failure::new(StatKind::CompilerCheckFailed)
        })?;
        return Ok(());
    }

    // A custom check command; its output identifies the compiler.
    hash_command_output(hash, check, path)
}

/// Run a compiler check command with `%compiler%` substituted and hash its
/// stdout and stderr.
fn hash_command_output(hash: &mut Hasher, command: &str, compiler: &str) -> Result<(), Failure> {
    let command_line = command.replace("%compiler%", compiler);
    debug!("Running compiler check command: {command_line}");
    let output = Command::new("sh")
        .arg("-c")
        .arg(&command_line)
        .output()
        .map_err(|error| {
            debug!("Failure running compiler check command: {error}");
            Failure::new(StatKind::CompilerCheckFailed)
        })?;
    if !output.status.success() {
        debug!("Compiler check command returned {:?}", output.status.code());
        return Err(Failure::new(StatKind::CompilerCheckFailed));
    }
    hash.delimiter("cc_check_command");
    hash.update(&output.stdout);
    hash.update(&output.stderr);
    Ok(())
}

/// Absorb the inputs common to both lookup modes, in a fixed order under
/// distinct labels. `args` is the argument vector whose first element is
/// the resolved compiler.
pub fn hash_common_info(
    ctx: &Context,
    args: &[String],
    hash: &mut Hasher,
) -> Result<(), Failure> {
    hash.update_str(HASH_PREFIX);

    // A .i file is not treated the same as a .ii file by the compiler.
    hash.delimiter("ext");
    hash.update_str(&ctx.config.cpp_extension);

    let compiler_path = &args[0];
    let metadata = std::fs::metadata(compiler_path).map_err(|error| {
        debug!("Failed to stat compiler {compiler_path}: {error}");
        Failure::new(StatKind::CouldNotFindCompiler)
    })?;
    hash_compiler(ctx, hash, &metadata, compiler_path, true)?;

    // Some compilers are hard links of each other and behave according to
    // their invocation name.
    hash.delimiter("cc_name");
    let base_name = Path::new(compiler_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    hash.update_str(&base_name);

    if !ctx
        .config
        .sloppiness
        .contains(crate::config::Sloppiness::LOCALE)
    {
        for key in environment::LOCALE_KEYS {
            if let Ok(value) = std::env::var(key) {
                hash.delimiter(key);
                hash.update_str(&value);
            }
        }
    }

    if ctx.args_info.generating_debuginfo && ctx.config.hash_dir {
        // Debug info embeds the compilation directory. Apply the prefix
        // maps first so mapped checkouts still share entries.
        let mut dir_to_hash = ctx.apparent_cwd.to_string_lossy().into_owned();
        for map in &ctx.args_info.debug_prefix_maps {
            if let Some((old_path, new_path)) = map.split_once('=') {
                if dir_to_hash.starts_with(old_path) {
                    debug!("Relocating debuginfo from {old_path} to {new_path}");
                    let rest = dir_to_hash[old_path.len()..].to_string();
                    dir_to_hash = format!("{new_path}{rest}");
                }
            }
        }
        debug!("Hashing CWD {dir_to_hash}");
        hash.delimiter("cwd");
        hash.update_str(&dir_to_hash);
    }

    if ctx.args_info.generating_dependencies || ctx.args_info.seen_split_dwarf {
        // The object path ends up inside the dependency file, and split
        // dwarf objects link back to the target object file name.
        hash.delimiter("object file");
        hash.update_str(&ctx.args_info.output_obj);
    }

    if ctx.args_info.generating_coverage && ctx.args_info.profile_arcs {
        // The object built with -fprofile-arcs bakes in the path of the
        // .gcda file it will write at run time.
        let dir = if !ctx.args_info.profile_path.is_empty() {
            ctx.args_info.profile_path.clone()
        } else {
            let parent = Path::new(&ctx.args_info.output_obj)
                .parent()
                .unwrap_or(Path::new("."));
            std::fs::canonicalize(parent)
                .unwrap_or_else(|_| parent.to_path_buf())
                .to_string_lossy()
                .into_owned()
        };
        let stem = Path::new(&ctx.args_info.output_obj)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let gcda_path = format!("{dir}/{stem}.gcda");
        debug!("Hashing coverage path {gcda_path}");
        hash.delimiter("gcda");
        hash.update_str(&gcda_path);
    }

    for blacklist in &ctx.args_info.sanitize_blacklists {
        debug!("Hashing sanitize blacklist {blacklist}");
        hash.delimiter("sanitizeblacklist");
        hash.hash_file(Path::new(blacklist)).map_err(|error| {
            debug!("Failed to hash {blacklist}: {error}");
            Failure::new(StatKind::MissingExtraFileToHash)
        })?;
    }

    if !ctx.config.extra_files_to_hash.is_empty() {
        for path in ctx.config.extra_files_to_hash.split(':') {
            if path.is_empty() {
                continue;
            }
            debug!("Hashing extra file {path}");
            hash.delimiter("extrafile");
            hash.hash_file(Path::new(path)).map_err(|error| {
                debug!("Failed to hash {path}: {error}");
                Failure::new(StatKind::MissingExtraFileToHash)
            })?;
        }
    }

    if ctx.guessed_compiler == crate::context::GuessedCompiler::Gcc {
        if let Ok(colors) = std::env::var(environment::KEY_GCC_COLORS) {
            hash.delimiter("gcccolors");
            hash.update_str(&colors);
        }
    }

    Ok(())
}

/// Hash the profile data consumed by -fprofile-use and friends. The file
/// location varies per compiler and version, so every candidate is tried.
pub fn hash_profile_data_file(ctx: &Context, hash: &mut Hasher) -> bool {
    let profile_path = &ctx.args_info.profile_path;
    let base_name = stem_of(&ctx.args_info.output_obj);
    let hashified_cwd = ctx
        .apparent_cwd
        .to_string_lossy()
        .replace('/', "#");

    let paths_to_try = [
        // -fprofile-use[=dir]/-fbranch-probabilities (GCC <9)
        format!("{profile_path}/{base_name}.gcda"),
        // -fprofile-use[=dir]/-fbranch-probabilities (GCC >=9)
        format!("{profile_path}/{hashified_cwd}#{base_name}.gcda"),
        // -fprofile(-instr)-use=file (Clang), -fauto-profile=file (GCC >=5)
        profile_path.clone(),
        // -fprofile(-instr)-use=dir (Clang)
        format!("{profile_path}/default.profdata"),
        // -fauto-profile (GCC >=5)
        "fbdata.afdo".to_string(),
    ];

    let mut found = false;
    for path in &paths_to_try {
        debug!("Checking for profile data file {path}");
        let Ok(metadata) = std::fs::metadata(path) else {
            continue;
        };
        if metadata.is_dir() {
            continue;
        }
        debug!("Adding profile data {path} to the hash");
        hash.delimiter("-fprofile-use");
        if hash.hash_file(Path::new(path)).is_ok() {
            found = true;
        }
    }
    found
}

fn stem_of(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn mtime_seconds(metadata: &Metadata) -> i64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        metadata.mtime()
    }
    #[cfg(not(unix))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::GuessedCompiler;

    fn context_with_compiler(dir: &Path) -> (Context, Vec<String>) {
        let compiler = dir.join("cc");
        std::fs::write(&compiler, b"#!/bin/sh\n").unwrap();
        let compiler = compiler.to_string_lossy().into_owned();
        let mut config = Config::default();
        config.cpp_extension = "i".to_string();
        let ctx = Context::capture(config, vec![compiler.clone()]).unwrap();
        (ctx, vec![compiler])
    }

    #[test]
    fn test_common_info_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, args) = context_with_compiler(dir.path());

        let mut first = Hasher::new();
        hash_common_info(&ctx, &args, &mut first).unwrap();
        let mut second = Hasher::new();
        hash_common_info(&ctx, &args, &mut second).unwrap();
        assert_eq!(first.finalize(), second.finalize());
    }

    #[test]
    fn test_compiler_check_policies_differ() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, args) = context_with_compiler(dir.path());
        let metadata = std::fs::metadata(&args[0]).unwrap();

        let mut mtime_hash = Hasher::new();
        hash_compiler(&ctx, &mut mtime_hash, &metadata, &args[0], true).unwrap();

        ctx.config.compiler_check = "content".to_string();
        let mut content_hash = Hasher::new();
        hash_compiler(&ctx, &mut content_hash, &metadata, &args[0], true).unwrap();

        ctx.config.compiler_check = "string:release-7".to_string();
        let mut string_hash = Hasher::new();
        hash_compiler(&ctx, &mut string_hash, &metadata, &args[0], true).unwrap();

        ctx.config.compiler_check = "none".to_string();
        let mut none_hash = Hasher::new();
        hash_compiler(&ctx, &mut none_hash, &metadata, &args[0], true).unwrap();

        let digests = [
            mtime_hash.finalize(),
            content_hash.finalize(),
            string_hash.finalize(),
            none_hash.finalize(),
        ];
        for (i, a) in digests.iter().enumerate() {
            for b in digests.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_compiler_check_command() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, args) = context_with_compiler(dir.path());
        let metadata = std::fs::metadata(&args[0]).unwrap();

        ctx.config.compiler_check = "echo fixed-version".to_string();
        let mut first = Hasher::new();
        hash_compiler(&ctx, &mut first, &metadata, &args[0], true).unwrap();
        let mut second = Hasher::new();
        hash_compiler(&ctx, &mut second, &metadata, &args[0], true).unwrap();
        assert_eq!(first.finalize(), second.finalize());

        ctx.config.compiler_check = "exit 1".to_string();
        let mut failing = Hasher::new();
        let error = hash_compiler(&ctx, &mut failing, &metadata, &args[0], true).unwrap_err();
        assert_eq!(error.stat, StatKind::CompilerCheckFailed);
    }

    #[test]
    fn test_missing_extra_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, args) = context_with_compiler(dir.path());
        ctx.config.extra_files_to_hash = "/nonexistent/extra".to_string();

        let mut hash = Hasher::new();
        let error = hash_common_info(&ctx, &args, &mut hash).unwrap_err();
        assert_eq!(error.stat, StatKind::MissingExtraFileToHash);
    }

    #[test]
    fn test_cwd_hashed_only_with_debuginfo() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, args) = context_with_compiler(dir.path());

        let mut without = Hasher::new();
        hash_common_info(&ctx, &args, &mut without).unwrap();

        ctx.args_info.generating_debuginfo = true;
        let mut with = Hasher::new();
        hash_common_info(&ctx, &args, &mut with).unwrap();

        assert_ne!(without.finalize(), with.finalize());
    }

    #[test]
    fn test_debug_prefix_map_rewrites_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, args) = context_with_compiler(dir.path());
        ctx.args_info.generating_debuginfo = true;
        ctx.apparent_cwd = std::path::PathBuf::from("/src/checkout-a/project");
        ctx.args_info.debug_prefix_maps = vec!["/src/checkout-a=/build".to_string()];

        let mut first = Hasher::new();
        hash_common_info(&ctx, &args, &mut first).unwrap();

        ctx.apparent_cwd = std::path::PathBuf::from("/src/checkout-b/project");
        ctx.args_info.debug_prefix_maps = vec!["/src/checkout-b=/build".to_string()];
        let mut second = Hasher::new();
        hash_common_info(&ctx, &args, &mut second).unwrap();

        assert_eq!(first.finalize(), second.finalize());
    }

    #[test]
    fn test_guessed_compiler_affects_gcc_colors() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, args) = context_with_compiler(dir.path());

        // Only relevant when GCC_COLORS is exported; make it so for the
        // duration of the test.
        std::env::set_var(environment::KEY_GCC_COLORS, "error=01;31");
        let mut unknown = Hasher::new();
        hash_common_info(&ctx, &args, &mut unknown).unwrap();

        ctx.guessed_compiler = GuessedCompiler::Gcc;
        let mut gcc = Hasher::new();
        hash_common_info(&ctx, &args, &mut gcc).unwrap();
        std::env::remove_var(environment::KEY_GCC_COLORS);

        assert_ne!(unknown.finalize(), gcc.finalize());
    }
}
