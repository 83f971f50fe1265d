// SPDX-License-Identifier: GPL-3.0-or-later

//! Extraction and hashing of include files.
//!
//! Two entry points feed the preprocessor-mode hash and the per-invocation
//! map of included files: one scans preprocessed compiler output for
//! linemarkers, the other splits a dependency file. Every referenced file is
//! stat-checked, content-hashed and recorded; any file that fails a check
//! disables direct mode for the rest of the invocation so a stale manifest
//! can never be written from it.

use crate::config::Sloppiness;
use crate::context::{Context, IncludedFile};
use crate::hashing::source::{hash_source_code_data, HASH_SOURCE_CODE_ERROR};
use crate::hashing::Hasher;
use crate::stats::{Failure, StatKind};
use log::debug;
use std::path::Path;

/// Scan preprocessed output at `path` while feeding `hash`.
///
/// Recognized linemarkers (N a positive integer):
///
///   # N "file" flags            (GCC; flag 3 marks a system header)
///   #pragma GCC pch_preprocess "file"
///   #line N "file"              (HP and AIX compilers)
///
/// Bytes between markers are hashed verbatim. `pump` strips the banner
/// lines the distcc-pump wrapper writes to standard output.
pub fn scan_preprocessed(
    ctx: &mut Context,
    hash: &mut Hasher,
    path: &Path,
    pump: bool,
) -> Result<(), Failure> {
    let mut data = std::fs::read(path).map_err(|error| {
        debug!("Failed to read {}: {error}", path.display());
        Failure::new(StatKind::InternalError)
    })?;
    let end = data.len();

    // Bytes in data[p..q] are pending to be hashed.
    let mut p = 0usize;
    let mut q = 0usize;

    // There must be at least 7 characters (# 1 "x") left to potentially
    // hold an include file path.
    while q + 7 < end {
        let at_line_start = q == 0 || data[q - 1] == b'\n';
        let looks_like_marker = data[q] == b'#'
            && at_line_start
            && ((data[q + 1] == b' ' && data[q + 2].is_ascii_digit())
                || (data[q + 1] == b'p'
                    && data[q + 2..].starts_with(b"ragma GCC pch_preprocess "))
                || (data[q + 1..q + 5] == *b"line" && data[q + 5] == b' '));

        if looks_like_marker {
            // Workarounds for linemarker bugs in GCC version 6.
            if data[q + 2] == b'3' {
                if data[q..].starts_with(b"# 31 \"<command-line>\"\n") {
                    // Bogus extra line with #31, after the regular #1: ignore
                    // the whole line and continue parsing.
                    hash.update(&data[p..q]);
                    while q < end && data[q] != b'\n' {
                        q += 1;
                    }
                    q += 1;
                    p = q;
                    continue;
                } else if data[q..].starts_with(b"# 32 \"<command-line>\" 2\n") {
                    // Bogus wrong line with #32, instead of regular #1:
                    // replace the line number with the usual one.
                    hash.update(&data[p..q]);
                    q += 1;
                    data[q] = b'#';
                    data[q + 1] = b' ';
                    data[q + 2] = b'1';
                    p = q;
                }
            }

            while q < end && data[q] != b'"' && data[q] != b'\n' {
                q += 1;
            }
            if q < end && data[q] == b'\n' {
                // A newline before the quotation mark: no match.
                continue;
            }
            q += 1;
            if q >= end {
                debug!("Failed to parse included file path");
                return Err(Failure::new(StatKind::InternalError));
            }
            // q is at the beginning of an include file path.
            hash.update(&data[p..q]);
            p = q;
            while q < end && data[q] != b'"' {
                q += 1;
            }
            // Look for preprocessor flags after the closing quote.
            let mut system = false;
            let mut r = q + 1;
            while r < end && data[r] != b'\n' {
                if data[r] == b'3' {
                    system = true;
                }
                r += 1;
            }

            let inc_path = String::from_utf8_lossy(&data[p..q]).into_owned();
            if !ctx.has_absolute_include_headers {
                ctx.has_absolute_include_headers = Path::new(&inc_path).is_absolute();
            }
            let inc_path = ctx.make_relative_path(&inc_path);

            let mut should_hash_inc_path = true;
            if !ctx.config.hash_dir {
                // When compiling with -g or similar, GCC adds the absolute
                // path to the working directory as a "CWD//" linemarker. If
                // the user opted out of hashing the directory, leave it out.
                let apparent = ctx.apparent_cwd.to_string_lossy();
                if inc_path.starts_with(apparent.as_ref()) && inc_path.ends_with("//") {
                    should_hash_inc_path = false;
                }
            }
            if should_hash_inc_path {
                hash.update(inc_path.as_bytes());
            }

            remember_include_file(ctx, inc_path, hash, system, false);
            p = q;
        } else if data[q..].starts_with(b".incbin") {
            // An assembler directive pulling in an external file the cache
            // cannot track.
            debug!("Found unsupported .incbin directive in source code");
            return Err(Failure::new(StatKind::UnsupportedCodeDirective));
        } else if pump && data[q..].starts_with(b"_________") {
            // The distcc-pump wrapper writes banner lines to stdout; they
            // are not part of the translation unit.
            while q < end && data[q] != b'\n' {
                q += 1;
            }
            if q < end {
                q += 1;
            }
            p = q;
        } else {
            q += 1;
        }
    }

    hash.update(&data[p..end]);

    // Clang does not mention an included precompiled header in its
    // preprocessed output, so check it explicitly.
    if let Some(pch) = ctx.included_pch_file.clone() {
        let pch_path = ctx.make_relative_path(&pch);
        hash.update(pch_path.as_bytes());
        remember_include_file(ctx, pch_path, hash, false, false);
    }

    if std::env::var_os(crate::environment::KEY_DEBUG_INCLUDED).is_some() {
        print_included_files(ctx);
    }

    Ok(())
}

/// Derive the include set from a dependency file instead of preprocessor
/// output. System headers cannot be distinguished here.
pub fn scan_depfile(ctx: &mut Context, hash: &mut Hasher, path: &Path) -> Result<(), Failure> {
    let content = std::fs::read_to_string(path).map_err(|error| {
        debug!("Cannot open dependency file {}: {error}", path.display());
        Failure::new(StatKind::InternalError)
    })?;

    for token in content.split_whitespace() {
        if token == "\\" || token.ends_with(':') {
            continue;
        }
        if !ctx.has_absolute_include_headers {
            ctx.has_absolute_include_headers = Path::new(token).is_absolute();
        }
        let file_path = ctx.make_relative_path(token);
        remember_include_file(ctx, file_path, hash, false, true);
    }

    // The precompiled header may not be mentioned in the dependency output.
    if let Some(pch) = ctx.included_pch_file.clone() {
        let pch_path = ctx.make_relative_path(&pch);
        hash.update(pch_path.as_bytes());
        remember_include_file(ctx, pch_path, hash, false, false);
    }

    if std::env::var_os(crate::environment::KEY_DEBUG_INCLUDED).is_some() {
        print_included_files(ctx);
    }

    Ok(())
}

fn print_included_files(ctx: &Context) {
    for path in ctx.included_files.keys() {
        println!("{path}");
    }
}

/// A `.gch`/`.pch`/`.pth` file, or a file inside a `.gch` directory.
pub fn is_precompiled_header(path: &str) -> bool {
    let path = Path::new(path);
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if matches!(extension, "gch" | "pch" | "pth") {
        return true;
    }
    let parent_extension = path
        .parent()
        .and_then(|d| d.extension())
        .and_then(|e| e.to_str())
        .unwrap_or("");
    parent_extension == "gch"
}

/// Record one include file: check it, hash its content and remember the
/// `(path, digest)` pair. On any refused check direct mode is disabled for
/// the rest of the invocation.
///
/// `record_in_hash` additionally feeds each file's digest into `hash`,
/// which is how depend mode derives a result digest without running the
/// preprocessor.
pub fn remember_include_file(
    ctx: &mut Context,
    path: String,
    hash: &mut Hasher,
    system: bool,
    record_in_hash: bool,
) {
    if !do_remember_include_file(ctx, path, hash, system, record_in_hash)
        && ctx.config.direct_mode
    {
        debug!("Disabling direct mode");
        ctx.config.direct_mode = false;
    }
}

fn do_remember_include_file(
    ctx: &mut Context,
    mut path: String,
    hash: &mut Hasher,
    system: bool,
    record_in_hash: bool,
) -> bool {
    if path.len() >= 2 && path.starts_with('<') && path.ends_with('>') {
        // Typically <built-in> or <command-line>.
        return true;
    }

    if path == ctx.args_info.input_file {
        // The input file is hashed through the source branch already.
        return true;
    }

    if system && ctx.config.sloppiness.contains(Sloppiness::SYSTEM_HEADERS) {
        return true;
    }

    // Clang emits paths like ./header.h.
    if let Some(stripped) = path.strip_prefix("./") {
        path = stripped.to_string();
    }

    if ctx.included_files.contains_key(&path) {
        return true;
    }

    let metadata = match std::fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(error) => {
            debug!("Failed to stat include file {path}: {error}");
            return false;
        }
    };
    if metadata.is_dir() {
        // Typically the working directory from a -g linemarker.
        return true;
    }
    if !metadata.is_file() {
        debug!("Non-regular include file {path}");
        return false;
    }

    for prefix in &ctx.ignore_header_paths {
        if matches_dir_prefix_or_file(prefix, &path) {
            return true;
        }
    }

    let (mtime, ctime) = times(&metadata);
    // The comparison using >= is intentional: the file may have been
    // written in the same second the compilation started.
    if !ctx
        .config
        .sloppiness
        .contains(Sloppiness::INCLUDE_FILE_MTIME)
        && mtime >= ctx.time_of_compilation
    {
        debug!("Include file {path} too new");
        return false;
    }
    if !ctx
        .config
        .sloppiness
        .contains(Sloppiness::INCLUDE_FILE_CTIME)
        && ctime >= ctx.time_of_compilation
    {
        debug!("Include file {path} ctime too new");
        return false;
    }

    let mut file_hasher = Hasher::new();
    let is_pch = is_precompiled_header(&path);
    let mut hashed_path = path.clone();
    if is_pch {
        if ctx.included_pch_file.is_none() {
            debug!("Detected use of precompiled header: {path}");
        }
        let mut using_pch_sum = false;
        if ctx.config.pch_external_checksum {
            // Hash pch.sum instead of the very large precompiled header
            // when it exists.
            let pch_sum_path = format!("{path}.sum");
            if Path::new(&pch_sum_path).is_file() {
                debug!("Using pch.sum file {pch_sum_path}");
                hashed_path = pch_sum_path;
                using_pch_sum = true;
            }
        }

        if file_hasher.hash_file(Path::new(&hashed_path)).is_err() {
            return false;
        }
        hash.delimiter(if using_pch_sum { "pch_sum_hash" } else { "pch_hash" });
        hash.update_str(&file_hasher.finalize().to_hex());
    }

    if ctx.config.direct_mode {
        if !is_pch {
            // Not already hashed above.
            let data = match std::fs::read(&path) {
                Ok(data) => data,
                Err(error) => {
                    debug!("Failed to read include file {path}: {error}");
                    return false;
                }
            };
            let flags = hash_source_code_data(&ctx.config, &mut file_hasher, &data);
            if flags != 0 {
                if flags & HASH_SOURCE_CODE_ERROR == 0 {
                    debug!("Include file {path} contains a time macro");
                }
                return false;
            }
        }

        let digest = file_hasher.finalize();
        ctx.included_files.insert(
            path,
            IncludedFile {
                digest,
                size: metadata.len(),
                mtime,
                ctime,
            },
        );

        if record_in_hash {
            hash.delimiter("include");
            hash.update_str(&digest.to_hex());
        }
    }

    true
}

fn matches_dir_prefix_or_file(prefix: &str, path: &str) -> bool {
    path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

fn times(metadata: &std::fs::Metadata) -> (i64, i64) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        (metadata.mtime(), metadata.ctime())
    }
    #[cfg(not(unix))]
    {
        (0, 0)
    }
}
