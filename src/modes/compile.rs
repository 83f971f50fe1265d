// SPDX-License-Identifier: GPL-3.0-or-later

//! The compilation orchestrator.
//!
//! Drives one cached compilation attempt through its modes: the direct
//! lookup keyed by source and arguments, the preprocessor lookup keyed by
//! preprocessed output, and the depend-mode variant that derives the key
//! from the compiler's own dependency output. Every recoverable problem
//! raises a `Failure`; the driver then records the statistic and runs the
//! real compiler in place of this process.

use crate::classify::{self, ProcessedArgs};
use crate::config::{Config, Sloppiness};
use crate::context::{Context, GuessedCompiler};
use crate::digest::Digest;
use crate::environment;
use crate::execute;
use crate::hashing::common::{hash_common_info, hash_compiler, hash_profile_data_file};
use crate::hashing::inclusions::{scan_depfile, scan_preprocessed};
use crate::hashing::source::{
    hash_source_code_file, HASH_SOURCE_CODE_ERROR,
};
use crate::hashing::Hasher;
use crate::stats::{self, Failure, StatKind};
use crate::storage::header::{MANIFEST_VERSION, RESULT_VERSION};
use crate::storage::result::FileType;
use crate::storage::{self, manifest, result, EntryKind};
use crate::tmpfiles;
use log::{debug, info};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// The entry point for a compiler invocation. Never returns to the caller
/// on the fallback path, where the real compiler replaces this process.
pub fn run(orig_args: Vec<String>) -> ExitCode {
    tmpfiles::setup_signal_handlers();

    let config = match Config::setup() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{}: error: {error}", crate::MYNAME);
            return ExitCode::FAILURE;
        }
    };
    if let Some(mask) = config.umask {
        #[cfg(unix)]
        unsafe {
            libc::umask(mask as libc::mode_t);
        }
    }

    let mut ctx = match Context::capture(config, orig_args) {
        Ok(ctx) => ctx,
        Err(error) => {
            eprintln!("{}: error: {error}", crate::MYNAME);
            return ExitCode::FAILURE;
        }
    };

    if let Err(failure) = execute::find_compiler(&mut ctx) {
        finalize_stats(&mut ctx, failure.stat);
        if let Some(code) = failure.exit_code {
            tmpfiles::cleanup_pending();
            return ExitCode::from(code as u8);
        }
        // Without a compiler there is nothing to fall back to.
        eprintln!(
            "{}: error: could not find compiler \"{}\" in PATH",
            crate::MYNAME,
            ctx.orig_args[0]
        );
        tmpfiles::cleanup_pending();
        return ExitCode::FAILURE;
    }

    match do_cache_compilation(&mut ctx) {
        Ok(stat) => {
            finalize_stats(&mut ctx, stat);
            tmpfiles::cleanup_pending();
            ExitCode::SUCCESS
        }
        Err(failure) => {
            if failure.stat != StatKind::None {
                finalize_stats(&mut ctx, failure.stat);
            }
            if let Some(code) = failure.exit_code {
                tmpfiles::cleanup_pending();
                return ExitCode::from(code as u8);
            }
            debug!("Failed; falling back to running the real compiler");
            let args = ctx.orig_args.clone();
            tmpfiles::cleanup_pending();
            ExitCode::from(execute::exec_original(&args) as u8)
        }
    }
}

fn finalize_stats(ctx: &mut Context, stat: StatKind) {
    if !ctx.config.stats {
        return;
    }
    if stat != StatKind::None {
        ctx.counter_updates.increment(stat);
    }
    let digest = ctx.result_digest.or(ctx.manifest_digest);
    let path = match digest {
        Some(digest) => storage::stats_file_for_digest(&ctx.config, &digest),
        None => ctx.config.cache_dir.join("0").join("stats"),
    };
    if let Err(error) = stats::flush_to_file(&path, &ctx.counter_updates) {
        debug!("Failed to flush statistics: {error}");
    }
}

fn do_cache_compilation(ctx: &mut Context) -> Result<StatKind, Failure> {
    if ctx.config.disable {
        debug!("{} is disabled", crate::MYNAME);
        return Err(Failure::new(StatKind::CacheDisabled));
    }

    if ctx.config.temporary_dir.is_empty() {
        storage::clean_up_internal_tempdir(&ctx.config);
    }

    set_up_uncached_err()?;

    if std::env::var_os(environment::KEY_INTERNAL_TRACE).is_some() {
        let trace_dir = std::env::var(environment::KEY_TMPDIR)
            .unwrap_or_else(|_| "/tmp".to_string());
        debug!("Tracing to {trace_dir} requested, but tracing is not compiled in");
    }

    debug!("Command line: {}", ctx.orig_args.join(" "));
    debug!("Working directory: {}", ctx.actual_cwd.display());
    if ctx.apparent_cwd != ctx.actual_cwd {
        debug!("Apparent working directory: {}", ctx.apparent_cwd.display());
    }

    ctx.config.limit_multiple = ctx.config.limit_multiple.clamp(0.0, 1.0);
    ctx.guessed_compiler = GuessedCompiler::from_path(&ctx.orig_args[0]);

    let ProcessedArgs {
        preprocessor_args,
        extra_args_to_hash,
        mut compiler_args,
    } = classify::process_args(ctx)?;

    if ctx.config.depend_mode
        && (!ctx.args_info.generating_dependencies
            || ctx.args_info.output_dep == "/dev/null"
            || !ctx.config.run_second_cpp)
    {
        debug!("Disabling depend mode");
        ctx.config.depend_mode = false;
    }

    debug!("Source file: {}", ctx.args_info.input_file);
    if ctx.args_info.generating_dependencies {
        debug!("Dependency file: {}", ctx.args_info.output_dep);
    }
    debug!("Object file: {}", ctx.args_info.output_obj);

    let mut common_hash = Hasher::new();
    hash_common_info(ctx, &preprocessor_args, &mut common_hash)?;

    let mut args_to_hash = preprocessor_args.clone();
    args_to_hash.extend(extra_args_to_hash.iter().cloned());

    let mut direct_hash = common_hash.fork();
    let mut put_result_in_manifest = false;
    let mut result_digest_from_manifest = None;

    if ctx.config.direct_mode {
        debug!("Trying direct lookup");
        let mut unused = Vec::new();
        let found =
            calculate_result_digest(ctx, &args_to_hash, &mut unused, &mut direct_hash, true)?;
        match found {
            Some(digest) => {
                ctx.result_digest = Some(digest);
                if let Some(stat) = from_cache(ctx, true) {
                    return Ok(stat);
                }
                // Found in the manifest but the result could not be
                // fetched; no need to re-add the manifest entry later.
                result_digest_from_manifest = Some(digest);
            }
            None => {
                put_result_in_manifest = true;
            }
        }
    }

    if ctx.config.read_only_direct {
        debug!("Read-only direct mode; running real compiler");
        return Err(Failure::new(StatKind::CacheMiss));
    }

    if !ctx.config.depend_mode {
        let mut cpp_hash = common_hash.fork();
        let mut cpp_args = preprocessor_args.clone();
        let found =
            calculate_result_digest(ctx, &args_to_hash, &mut cpp_args, &mut cpp_hash, false)?;
        let result_digest = found.expect("preprocessor mode always yields a digest");
        ctx.result_digest = Some(result_digest);

        if let Some(from_manifest) = result_digest_from_manifest {
            if from_manifest != result_digest {
                // The manifest candidate disagrees with the preprocessor
                // output, most likely because another base directory was
                // used. The stale manifest must not linger.
                debug!("Hash from manifest doesn't match preprocessor output");
                debug!("Removing manifest as a safety measure");
                let manifest_path = manifest_path(ctx);
                let _ = std::fs::remove_file(manifest_path);
                put_result_in_manifest = true;
            }
        }

        if let Some(stat) = from_cache(ctx, false) {
            if put_result_in_manifest {
                update_manifest_file(ctx);
            }
            return Ok(stat);
        }
    }

    if ctx.config.read_only {
        debug!("Read-only mode; running real compiler");
        return Err(Failure::new(StatKind::CacheMiss));
    }

    let mut depend_mode_hash = ctx.config.depend_mode.then_some(direct_hash);
    to_cache(ctx, &mut compiler_args, depend_mode_hash.as_mut())?;
    update_manifest_file(ctx);

    Ok(StatKind::CacheMiss)
}

fn manifest_path(ctx: &Context) -> PathBuf {
    let digest = ctx
        .manifest_digest
        .expect("direct mode computed a manifest digest");
    storage::cache_entry_path(&ctx.config, &digest, EntryKind::Manifest)
}

fn result_path(ctx: &Context) -> PathBuf {
    let digest = ctx.result_digest.expect("result digest computed");
    storage::cache_entry_path(&ctx.config, &digest, EntryKind::Result)
}

/// Make a copy of stderr available to downstream processes, so tools like
/// distcc can report errors past the capture.
fn set_up_uncached_err() -> Result<(), Failure> {
    let fd = unsafe { libc::dup(2) };
    if fd == -1 {
        debug!("dup(2) failed");
        return Err(Failure::new(StatKind::InternalError));
    }
    std::env::set_var(environment::KEY_UNCACHED_ERR_FD, fd.to_string());
    Ok(())
}

/// Create a temporary file in the cache's temporary directory, registered
/// for deletion on any exit path.
fn create_temp_file(ctx: &Context, prefix: &str) -> Result<PathBuf, Failure> {
    let dir = ctx.config.temporary_dir();
    std::fs::create_dir_all(&dir).map_err(|error| {
        debug!("Failed to create {}: {error}", dir.display());
        Failure::new(StatKind::InternalError)
    })?;
    let file = tempfile::Builder::new()
        .prefix(prefix)
        .tempfile_in(&dir)
        .map_err(|error| {
            debug!("Failed to create temporary file: {error}");
            Failure::new(StatKind::InternalError)
        })?;
    let (_, path) = file.keep().map_err(|error| {
        debug!("Failed to keep temporary file: {error}");
        Failure::new(StatKind::InternalError)
    })?;
    tmpfiles::add_pending(&path);
    Ok(path)
}

/// Update `hash` with mode-specific inputs and produce the lookup digest.
///
/// In direct mode the digest names a manifest, which is consulted for a
/// result digest. In preprocessor mode the preprocessor runs and the
/// digest names the result itself.
fn calculate_result_digest(
    ctx: &mut Context,
    args_to_hash: &[String],
    preprocessor_args: &mut Vec<String>,
    hash: &mut Hasher,
    direct_mode: bool,
) -> Result<Option<Digest>, Failure> {
    hash.delimiter("result version");
    hash.update_int(RESULT_VERSION as i64);
    if direct_mode {
        hash.delimiter("manifest version");
        hash.update_int(MANIFEST_VERSION as i64);
    }

    // Clang emits warnings for unused linker flags, so they stay in the
    // hash for it.
    let is_clang = ctx.guessed_compiler.treat_as_clang();

    let mut i = 1;
    while i < args_to_hash.len() {
        let arg = &args_to_hash[i];

        // Linker options do not affect compilation output.
        if !is_clang {
            if arg == "-L" {
                i += 2;
                continue;
            }
            if arg.starts_with("-L") || arg.starts_with("-Wl,") {
                i += 1;
                continue;
            }
        }

        // Prefix-map options: the presence matters, the value must not,
        // so different base directories can share results.
        if let Some(option) = ["-fdebug-prefix-map=", "-ffile-prefix-map=", "-fmacro-prefix-map="]
            .iter()
            .find(|option| arg.starts_with(**option))
        {
            hash.delimiter("arg");
            hash.update_str(option);
            i += 1;
            continue;
        }

        // With the preprocessor run, options that only affect its output
        // need not be hashed: any effect shows up in the preprocessed
        // text. Precompiled headers hide that effect, so they disable the
        // shortcut.
        if !direct_mode
            && !ctx.args_info.output_is_precompiled_header
            && !ctx.args_info.using_precompiled_header
        {
            if crate::classify::compopt::affects_cpp(arg) {
                if crate::classify::compopt::takes_arg(arg) {
                    i += 1;
                }
                i += 1;
                continue;
            }
            if crate::classify::compopt::affects_cpp_glued(arg) {
                i += 1;
                continue;
            }
        }

        // The dependency target file name does not influence the object.
        if ctx.args_info.generating_dependencies {
            if let Some(rest) = arg.strip_prefix("-Wp,-MD,") {
                if !rest.contains(',') {
                    hash.update(&arg.as_bytes()[..8]);
                    i += 1;
                    continue;
                }
            }
            if let Some(rest) = arg.strip_prefix("-Wp,-MMD,") {
                if !rest.contains(',') {
                    hash.update(&arg.as_bytes()[..9]);
                    i += 1;
                    continue;
                }
            }
            if arg.starts_with("-MF") {
                hash.delimiter("arg");
                hash.update_str("-MF");
                if ctx.args_info.output_dep != "/dev/null" && arg.len() == 3 {
                    // Separate form; skip the file name.
                    i += 1;
                }
                i += 1;
                continue;
            }
        }

        // An explicit specs file changes the compilation; hash its content
        // instead of its path.
        let specs_path = arg
            .strip_prefix("-specs=")
            .or_else(|| arg.strip_prefix("--specs="));
        if let Some(path) = specs_path {
            if let Ok(metadata) = std::fs::metadata(path) {
                hash.delimiter("specs");
                hash_compiler(ctx, hash, &metadata, path, false)?;
                i += 1;
                continue;
            }
        }

        if let Some(path) = arg.strip_prefix("-fplugin=") {
            if let Ok(metadata) = std::fs::metadata(path) {
                hash.delimiter("plugin");
                hash_compiler(ctx, hash, &metadata, path, false)?;
                i += 1;
                continue;
            }
        }

        if arg == "-Xclang"
            && i + 3 < args_to_hash.len()
            && args_to_hash[i + 1] == "-load"
            && args_to_hash[i + 2] == "-Xclang"
        {
            if let Ok(metadata) = std::fs::metadata(&args_to_hash[i + 3]) {
                hash.delimiter("plugin");
                hash_compiler(ctx, hash, &metadata, &args_to_hash[i + 3], false)?;
                i += 4;
                continue;
            }
        }

        if (arg == "-ccbin" || arg == "--compiler-bindir") && i + 1 < args_to_hash.len() {
            if let Ok(metadata) = std::fs::metadata(&args_to_hash[i + 1]) {
                hash.delimiter("ccbin");
                hash_compiler(ctx, hash, &metadata, &args_to_hash[i + 1], false)?;
                i += 2;
                continue;
            }
        }

        // All other arguments are part of the hash.
        hash.delimiter("arg");
        hash.update_str(arg);
        if i + 1 < args_to_hash.len() && crate::classify::compopt::takes_arg(arg) {
            i += 1;
            hash.delimiter("arg");
            hash.update_str(&args_to_hash[i]);
        }
        i += 1;
    }

    // Make results with a /dev/null dependency file distinct from results
    // without one.
    if ctx.args_info.generating_dependencies && ctx.args_info.output_dep == "/dev/null" {
        hash.delimiter("/dev/null dependency file");
    }

    if ctx.args_info.profile_generate {
        debug!(
            "Adding profile directory {} to our hash",
            ctx.args_info.profile_path
        );
        hash.delimiter("-fprofile-dir");
        hash.update_str(&ctx.args_info.profile_path);
    }
    if ctx.args_info.profile_use && !hash_profile_data_file(ctx, hash) {
        debug!("No profile data file found");
        return Err(Failure::new(StatKind::NoInputFile));
    }

    // The preprocessor output is affected by -arch.
    for arch in &ctx.args_info.arch_args {
        hash.delimiter("-arch");
        hash.update_str(arch);
    }

    if direct_mode {
        // Without a preprocessor run, include-search environment variables
        // can change the result.
        for key in environment::INCLUDE_PATH_KEYS {
            if let Ok(value) = std::env::var(key) {
                hash.delimiter(key);
                hash.update_str(&value);
            }
        }

        // Different input paths sharing identical content must not share a
        // manifest: the include sets may differ relative to each path, and
        // __FILE__ expands differently.
        hash.delimiter("inputfile");
        hash.update_str(&ctx.args_info.input_file);

        hash.delimiter("sourcecode");
        let input_file = ctx.args_info.input_file.clone();
        let flags = hash_source_code_file(&ctx.config, hash, Path::new(&input_file));
        if flags & HASH_SOURCE_CODE_ERROR != 0 {
            return Err(Failure::new(StatKind::InternalError));
        }
        if flags != 0 {
            debug!("Disabling direct mode");
            ctx.config.direct_mode = false;
            return Ok(None);
        }

        let manifest_digest = hash.finalize();
        ctx.manifest_digest = Some(manifest_digest);
        let path = manifest_path(ctx);
        debug!("Looking for result digest in {}", path.display());
        let found = manifest::get(&ctx.config, &path);
        if found.is_some() {
            debug!("Got result digest from manifest");
        } else {
            debug!("Did not find result digest in manifest");
        }
        Ok(found)
    } else if ctx.args_info.arch_args.is_empty() {
        let digest = get_result_digest_from_cpp(ctx, preprocessor_args.clone(), hash)?;
        debug!("Got result digest from preprocessor");
        Ok(Some(digest))
    } else {
        let mut digest = None;
        for arch in ctx.args_info.arch_args.clone() {
            let mut args = preprocessor_args.clone();
            args.push("-arch".to_string());
            args.push(arch.clone());
            digest = Some(get_result_digest_from_cpp(ctx, args, hash)?);
            debug!("Got result digest from preprocessor with -arch {arch}");
        }
        Ok(digest)
    }
}

/// Run the preprocessor (unless the input already is preprocessed) and
/// hash its output and stderr.
fn get_result_digest_from_cpp(
    ctx: &mut Context,
    mut args: Vec<String>,
    hash: &mut Hasher,
) -> Result<Digest, Failure> {
    ctx.time_of_compilation = now_seconds();

    let mut stderr_path = None;
    let stdout_path;
    if ctx.args_info.direct_i_file {
        // Already preprocessed input; skip the preprocessor stage.
        stdout_path = PathBuf::from(&ctx.args_info.input_file);
    } else {
        let base = truncated_base_name(&ctx.args_info.input_file);
        stdout_path = create_temp_file(ctx, &format!("{base}.stdout"))?;
        let cpp_stderr = create_temp_file(ctx, "cpp_stderr")?;

        args.push("-E".to_string());
        if ctx.config.keep_comments_cpp {
            args.push("-C".to_string());
        }
        args.push(ctx.args_info.input_file.clone());
        debug!("Running preprocessor");
        let status = execute::execute(&args, &stdout_path, &cpp_stderr)?;
        if status != 0 {
            debug!("Preprocessor gave exit status {status}");
            return Err(Failure::new(StatKind::PreprocessorError));
        }
        stderr_path = Some(cpp_stderr);
    }

    hash.delimiter("cpp");
    let pump = ctx.guessed_compiler == GuessedCompiler::Pump;
    scan_preprocessed(ctx, hash, &stdout_path, pump)?;

    hash.delimiter("cppstderr");
    if let Some(path) = &stderr_path {
        hash.hash_file(path).map_err(|error| {
            // Somebody removed the temporary file?
            debug!("Failed to open {}: {error}", path.display());
            Failure::new(StatKind::InternalError)
        })?;
    }

    if ctx.args_info.direct_i_file {
        ctx.i_tmpfile = Some(PathBuf::from(&ctx.args_info.input_file));
    } else {
        // The preprocessed file needs the right extension for the compiler
        // to treat it correctly.
        let i_path = PathBuf::from(format!(
            "{}.{}",
            stdout_path.display(),
            ctx.config.cpp_extension
        ));
        std::fs::rename(&stdout_path, &i_path).map_err(|error| {
            debug!("Failed to rename preprocessed file: {error}");
            Failure::new(StatKind::InternalError)
        })?;
        tmpfiles::add_pending(&i_path);
        ctx.i_tmpfile = Some(i_path);
    }

    if !ctx.config.run_second_cpp {
        // The preprocessor's stderr is replayed before the compiler's own
        // on a hit, so it becomes part of the result identity.
        ctx.cpp_stderr = stderr_path;
        hash.delimiter("runsecondcpp");
        hash.update_str("false");
    }

    Ok(hash.finalize())
}

/// Try to reproduce the outputs from the cache. Returns the hit statistic
/// on success and `None` on any miss.
fn from_cache(ctx: &mut Context, direct_mode: bool) -> Option<StatKind> {
    // The user may have disabled cache hits.
    if ctx.config.recache {
        return None;
    }

    // A precompiled header fetched via the preprocessor lookup cannot be
    // trusted with clang: it errors out when any included file is newer
    // than the precompiled header.
    if ctx.guessed_compiler.treat_as_clang()
        && ctx.args_info.output_is_precompiled_header
        && !direct_mode
    {
        debug!("Not considering cached precompiled header in preprocessor mode");
        return None;
    }

    let tmp_stderr = create_temp_file(ctx, "stderr").ok()?;

    let mut files: BTreeMap<FileType, PathBuf> = BTreeMap::new();
    if ctx.args_info.output_obj != "/dev/null" {
        files.insert(FileType::Object, PathBuf::from(&ctx.args_info.output_obj));
        if ctx.args_info.seen_split_dwarf {
            files.insert(
                FileType::DwarfObject,
                PathBuf::from(&ctx.args_info.output_dwo),
            );
        }
    }
    files.insert(FileType::StderrOutput, tmp_stderr.clone());
    if ctx.args_info.generating_dependencies && ctx.args_info.output_dep != "/dev/null" {
        files.insert(
            FileType::Dependency,
            PathBuf::from(&ctx.args_info.output_dep),
        );
    }
    if ctx.args_info.generating_coverage {
        files.insert(FileType::Coverage, PathBuf::from(&ctx.args_info.output_cov));
    }
    if ctx.args_info.generating_stackusage {
        files.insert(FileType::Stackusage, PathBuf::from(&ctx.args_info.output_su));
    }
    if ctx.args_info.generating_diagnostics {
        files.insert(FileType::Diagnostic, PathBuf::from(&ctx.args_info.output_dia));
    }

    let path = result_path(ctx);
    if !result::get(&path, &files) {
        debug!("Failed to get result from cache");
        let _ = std::fs::remove_file(&tmp_stderr);
        return None;
    }

    send_cached_stderr(&tmp_stderr);
    let _ = std::fs::remove_file(&tmp_stderr);

    debug!("Succeeded getting cached result");
    Some(if direct_mode {
        StatKind::DirectCacheHit
    } else {
        StatKind::PreprocessedCacheHit
    })
}

/// Run the real compiler and ingest its outputs into the cache.
fn to_cache(
    ctx: &mut Context,
    compiler_args: &mut Vec<String>,
    depend_mode_hash: Option<&mut Hasher>,
) -> Result<(), Failure> {
    let mut args;
    if ctx.config.depend_mode {
        // The dependency options are part of the original command line, so
        // it can be used as is.
        args = ctx.orig_args.clone();
        ctx.time_of_compilation = now_seconds();
    } else {
        args = compiler_args.clone();
        args.push("-o".to_string());
        args.push(ctx.args_info.output_obj.clone());
        if ctx.args_info.generating_diagnostics {
            args.push("--serialize-diagnostics".to_string());
            args.push(ctx.args_info.output_dia.clone());
        }
        if ctx.config.run_second_cpp {
            args.push(ctx.args_info.input_file.clone());
        } else {
            let i_tmpfile = ctx.i_tmpfile.clone().ok_or_else(|| {
                debug!("No preprocessed file to compile");
                Failure::new(StatKind::InternalError)
            })?;
            args.push(i_tmpfile.to_string_lossy().into_owned());
        }
    }

    // These would make the compiler emit an extra dependency line for the
    // temporary input file.
    for key in environment::DEPENDENCY_KEYS {
        std::env::remove_var(key);
    }

    if ctx.config.hard_link && ctx.args_info.output_obj != "/dev/null" {
        // Clang overwrites an existing object in place when compiling
        // assembler input, which would corrupt a hard-linked cache entry.
        let _ = std::fs::remove_file(&ctx.args_info.output_obj);
    }

    if ctx.args_info.seen_split_dwarf {
        if let Err(error) = std::fs::remove_file(&ctx.args_info.output_dwo) {
            if error.kind() != io::ErrorKind::NotFound {
                debug!(
                    "Failed to unlink {}: {error}",
                    ctx.args_info.output_dwo
                );
                return Err(Failure::new(StatKind::BadOutputFile));
            }
        }
    }

    debug!("Running real compiler");
    let tmp_stdout = create_temp_file(ctx, "stdout")?;
    let tmp_stderr = create_temp_file(ctx, "stderr")?;
    let status = execute::execute(&args, &tmp_stdout, &tmp_stderr)?;

    let stdout_size = match std::fs::metadata(&tmp_stdout) {
        Ok(metadata) => metadata.len(),
        Err(_) => {
            // The stdout file was removed; cleanup in progress? Better
            // bail out.
            return Err(Failure::new(StatKind::MissingCacheFile));
        }
    };
    if stdout_size != 0 && ctx.guessed_compiler != GuessedCompiler::Pump {
        debug!("Compiler produced stdout");
        return Err(Failure::new(StatKind::CompilerProducedStdout));
    }

    // Merge stderr from the preprocessor (if any) with stderr from the
    // real compiler, preprocessor part first.
    if let Some(cpp_stderr) = ctx.cpp_stderr.clone() {
        let result: io::Result<()> = (|| {
            let mut merged = std::fs::read(&cpp_stderr)?;
            merged.extend(std::fs::read(&tmp_stderr)?);
            std::fs::write(&tmp_stderr, merged)
        })();
        result.map_err(|error| {
            debug!("Failed to merge preprocessor stderr: {error}");
            Failure::new(StatKind::InternalError)
        })?;
    }

    if status != 0 {
        debug!("Compiler gave exit status {status}");
        // The captured stderr can be replayed instead of rerunning the
        // compiler.
        send_cached_stderr(&tmp_stderr);
        return Err(Failure::with_exit_code(StatKind::CompileFailed, status));
    }

    if ctx.config.depend_mode {
        let hash = depend_mode_hash.ok_or_else(|| {
            debug!("Depend mode without a hash to extend");
            Failure::new(StatKind::InternalError)
        })?;
        let dep_path = PathBuf::from(&ctx.args_info.output_dep);
        scan_depfile(ctx, hash, &dep_path)?;
        ctx.result_digest = Some(hash.finalize());
    }

    let object_metadata = std::fs::metadata(&ctx.args_info.output_obj).map_err(|_| {
        debug!("Compiler didn't produce an object file");
        Failure::new(StatKind::CompilerProducedNoOutput)
    })?;
    if object_metadata.len() == 0 {
        debug!("Compiler produced an empty object file");
        return Err(Failure::new(StatKind::CompilerProducedEmptyOutput));
    }

    let stderr_size = std::fs::metadata(&tmp_stderr)
        .map_err(|_| Failure::new(StatKind::InternalError))?
        .len();

    let mut files: BTreeMap<FileType, PathBuf> = BTreeMap::new();
    if stderr_size > 0 {
        files.insert(FileType::StderrOutput, tmp_stderr.clone());
    }
    files.insert(FileType::Object, PathBuf::from(&ctx.args_info.output_obj));
    if ctx.args_info.generating_dependencies {
        files.insert(
            FileType::Dependency,
            PathBuf::from(&ctx.args_info.output_dep),
        );
    }
    if ctx.args_info.generating_coverage {
        files.insert(FileType::Coverage, PathBuf::from(&ctx.args_info.output_cov));
    }
    if ctx.args_info.generating_stackusage {
        files.insert(FileType::Stackusage, PathBuf::from(&ctx.args_info.output_su));
    }
    if ctx.args_info.generating_diagnostics {
        files.insert(FileType::Diagnostic, PathBuf::from(&ctx.args_info.output_dia));
    }
    if ctx.args_info.seen_split_dwarf && Path::new(&ctx.args_info.output_dwo).is_file() {
        // Only store the .dwo file if the compiler created one; GCC and
        // Clang differ for combinations like -gsplit-dwarf -g1.
        files.insert(
            FileType::DwarfObject,
            PathBuf::from(&ctx.args_info.output_dwo),
        );
    }

    let path = result_path(ctx);
    let old_size = std::fs::metadata(&path)
        .map(|m| storage::size_on_disk(&m))
        .ok();
    if !result::put(&ctx.config, &path, &files) {
        return Err(Failure::new(StatKind::InternalError));
    }
    info!("Stored in cache: {}", path.display());

    let new_metadata =
        std::fs::metadata(&path).map_err(|_| Failure::new(StatKind::InternalError))?;
    let new_size = storage::size_on_disk(&new_metadata);
    ctx.counter_updates.update_size(
        new_size as i64 - old_size.unwrap_or(0) as i64,
        if old_size.is_some() { 0 } else { 1 },
    );

    // Keep backup tools out of the cache tree.
    let result_digest = ctx.result_digest.expect("result digest computed");
    let first_level = storage::first_level_dir(&ctx.config, &result_digest);
    if let Err(error) = storage::create_cachedir_tag(&first_level) {
        debug!(
            "Failed to create {}/CACHEDIR.TAG: {error}",
            first_level.display()
        );
    }

    send_cached_stderr(&tmp_stderr);
    Ok(())
}

/// Create or update the manifest entry for this compilation.
fn update_manifest_file(ctx: &mut Context) {
    if !ctx.config.direct_mode || ctx.config.read_only || ctx.config.read_only_direct {
        return;
    }
    let (Some(_), Some(result_digest)) = (ctx.manifest_digest, ctx.result_digest) else {
        return;
    };

    // Timestamps enable the fast stat-based candidate check. They are
    // forced on for precompiled headers, whose content hashing would
    // defeat the point of the cache.
    let save_timestamp = ctx
        .config
        .sloppiness
        .contains(Sloppiness::FILE_STAT_MATCHES)
        || ctx.args_info.output_is_precompiled_header;

    let path = manifest_path(ctx);
    let old_size = std::fs::metadata(&path)
        .map(|m| storage::size_on_disk(&m))
        .ok();

    debug!("Adding result digest to {}", path.display());
    if !manifest::put(
        &ctx.config,
        &path,
        result_digest,
        &ctx.included_files,
        save_timestamp,
    ) {
        debug!("Failed to add result digest to {}", path.display());
        return;
    }

    let Ok(new_metadata) = std::fs::metadata(&path) else {
        return;
    };
    let size_delta = storage::size_on_disk(&new_metadata) as i64
        - old_size.unwrap_or(0) as i64;
    let files_delta = if old_size.is_some() { 0 } else { 1 };

    let manifest_digest = ctx.manifest_digest.expect("checked above");
    let manifest_stats = storage::stats_file_for_digest(&ctx.config, &manifest_digest);
    let result_stats = storage::stats_file_for_digest(&ctx.config, &result_digest);
    if manifest_stats == result_stats {
        ctx.counter_updates.update_size(size_delta, files_delta);
    } else {
        // The manifest lives under another first-level directory; account
        // its size there directly.
        let mut counters = stats::Counters::default();
        counters.update_size(size_delta, files_delta);
        if let Err(error) = stats::flush_to_file(&manifest_stats, &counters) {
            debug!("Failed to flush manifest size delta: {error}");
        }
    }
}

/// Replay captured stderr. The preprocessor part, when there is one, was
/// merged in before storing.
fn send_cached_stderr(stderr_path: &Path) {
    if let Ok(mut file) = std::fs::File::open(stderr_path) {
        let _ = io::copy(&mut file, &mut io::stderr());
    }
}

fn truncated_base_name(path: &str) -> String {
    let base = Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    // Cope with file systems with small maximum file name lengths.
    base.chars().take(10).collect()
}

fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
