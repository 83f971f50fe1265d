// SPDX-License-Identifier: GPL-3.0-or-later

//! The argument classifier.
//!
//! Partitions a compiler command line into the arguments that go to the
//! preprocessor, the arguments that are only hashed, and the arguments for
//! the real compile, while extracting the semantic fields the rest of the
//! pipeline needs: input file, language, output paths, dependency and
//! coverage settings, precompiled header use.
//!
//! Anything the cache cannot handle reliably ends the classification with a
//! failure; the orchestrator then runs the real compiler unchanged.

pub mod compopt;
pub mod language;

use crate::context::Context;
use crate::stats::{Failure, StatKind};
use compopt::OptTraits;
use log::debug;
use std::path::Path;

/// Semantic facts inferred from the command line.
#[derive(Debug, Default, Clone)]
pub struct ArgsInfo {
    pub input_file: String,
    pub output_obj: String,
    pub output_dep: String,
    pub output_cov: String,
    pub output_su: String,
    pub output_dia: String,
    pub output_dwo: String,
    pub actual_language: String,
    /// The input is already preprocessed, so the preprocessor stage can be
    /// skipped entirely.
    pub direct_i_file: bool,
    pub generating_debuginfo: bool,
    pub generating_dependencies: bool,
    pub generating_coverage: bool,
    pub generating_stackusage: bool,
    pub generating_diagnostics: bool,
    pub profile_arcs: bool,
    pub profile_generate: bool,
    pub profile_use: bool,
    pub profile_path: String,
    pub seen_split_dwarf: bool,
    pub using_precompiled_header: bool,
    pub output_is_precompiled_header: bool,
    pub arch_args: Vec<String>,
    /// Values of -fdebug-prefix-map and friends; their presence is hashed,
    /// their value is not.
    pub debug_prefix_maps: Vec<String>,
    pub sanitize_blacklists: Vec<String>,
}

/// The three argument partitions handed to the orchestrator. Index 0 of the
/// argument vectors is the compiler executable.
#[derive(Debug, Default, Clone)]
pub struct ProcessedArgs {
    /// Arguments for the preprocessor invocation (without -E).
    pub preprocessor_args: Vec<String>,
    /// Arguments not sent to the preprocessor but part of the hash.
    pub extra_args_to_hash: Vec<String>,
    /// Arguments for the real compiler (without -o and the input file).
    pub compiler_args: Vec<String>,
}

/// Classify `ctx.orig_args`. Fills in `ctx.args_info` and may disable
/// direct mode or record a precompiled header on the context.
pub fn process_args(ctx: &mut Context) -> Result<ProcessedArgs, Failure> {
    let args = expand_response_files(&ctx.orig_args)?;
    let compiler = args[0].clone();

    let mut info = ArgsInfo::default();
    let mut common_args: Vec<String> = Vec::new();
    let mut cpp_args: Vec<String> = Vec::new();
    let mut dep_args: Vec<String> = Vec::new();

    let mut found_c = false;
    let mut found_s = false;
    let mut explicit_language: Option<String> = None;
    let mut output_obj: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].clone();

        match arg.as_str() {
            "-E" => {
                return Err(Failure::new(StatKind::CalledForPreprocessing));
            }
            "-M" | "-MM" => {
                // Dependency listing to stdout stops after preprocessing.
                return Err(Failure::new(StatKind::CalledForPreprocessing));
            }
            "-c" => {
                found_c = true;
                i += 1;
                continue;
            }
            "-S" => {
                found_s = true;
                i += 1;
                continue;
            }
            "-x" => {
                let value = args.get(i + 1).ok_or_else(|| {
                    debug!("Missing argument to -x");
                    Failure::new(StatKind::BadCompilerArguments)
                })?;
                if info.input_file.is_empty() {
                    explicit_language = Some(value.clone());
                }
                common_args.push(arg);
                common_args.push(value.clone());
                i += 2;
                continue;
            }
            "-o" => {
                let value = args.get(i + 1).ok_or_else(|| {
                    debug!("Missing argument to -o");
                    Failure::new(StatKind::BadCompilerArguments)
                })?;
                output_obj = Some(value.clone());
                i += 2;
                continue;
            }
            "-gsplit-dwarf" => {
                info.seen_split_dwarf = true;
                info.generating_debuginfo = true;
                common_args.push(arg);
                i += 1;
                continue;
            }
            "--coverage" | "-coverage" => {
                info.generating_coverage = true;
                info.profile_arcs = true;
                common_args.push(arg);
                i += 1;
                continue;
            }
            "-ftest-coverage" => {
                info.generating_coverage = true;
                common_args.push(arg);
                i += 1;
                continue;
            }
            "-fprofile-arcs" => {
                info.profile_arcs = true;
                common_args.push(arg);
                i += 1;
                continue;
            }
            "-fstack-usage" => {
                info.generating_stackusage = true;
                common_args.push(arg);
                i += 1;
                continue;
            }
            "--serialize-diagnostics" => {
                let value = args.get(i + 1).ok_or_else(|| {
                    debug!("Missing argument to --serialize-diagnostics");
                    Failure::new(StatKind::BadCompilerArguments)
                })?;
                info.generating_diagnostics = true;
                info.output_dia = value.clone();
                i += 2;
                continue;
            }
            "-arch" => {
                let value = args.get(i + 1).ok_or_else(|| {
                    debug!("Missing argument to -arch");
                    Failure::new(StatKind::BadCompilerArguments)
                })?;
                info.arch_args.push(value.clone());
                i += 2;
                continue;
            }
            "-MD" | "-MMD" => {
                info.generating_dependencies = true;
                dep_args.push(arg);
                i += 1;
                continue;
            }
            "-MG" | "-MP" => {
                dep_args.push(arg);
                i += 1;
                continue;
            }
            _ => {}
        }

        // The glued output form, -ofile. Objective-C runtime flags also
        // start with -o and must not be mistaken for it.
        if let Some(value) = arg.strip_prefix("-o") {
            if !value.is_empty() && !arg.starts_with("-objc") {
                output_obj = Some(value.to_string());
                i += 1;
                continue;
            }
        }
        if let Some(value) = arg.strip_prefix("-MF") {
            let value = if value.is_empty() {
                let value = args.get(i + 1).ok_or_else(|| {
                    debug!("Missing argument to -MF");
                    Failure::new(StatKind::BadCompilerArguments)
                })?;
                dep_args.push(arg.clone());
                dep_args.push(value.clone());
                i += 2;
                value.clone()
            } else {
                dep_args.push(arg.clone());
                i += 1;
                value.to_string()
            };
            info.output_dep = value;
            continue;
        }
        if arg.starts_with("-MQ") || arg.starts_with("-MT") {
            if arg.len() == 3 {
                let value = args.get(i + 1).ok_or_else(|| {
                    debug!("Missing argument to {arg}");
                    Failure::new(StatKind::BadCompilerArguments)
                })?;
                dep_args.push(arg.clone());
                dep_args.push(value.clone());
                i += 2;
            } else {
                dep_args.push(arg.clone());
                i += 1;
            }
            continue;
        }
        if let Some(rest) = arg.strip_prefix("-Wp,") {
            if let Some(path) = rest.strip_prefix("-MD,") {
                if !path.contains(',') {
                    info.generating_dependencies = true;
                    info.output_dep = path.to_string();
                    dep_args.push(arg.clone());
                    i += 1;
                    continue;
                }
            }
            if let Some(path) = rest.strip_prefix("-MMD,") {
                if !path.contains(',') {
                    info.generating_dependencies = true;
                    info.output_dep = path.to_string();
                    dep_args.push(arg.clone());
                    i += 1;
                    continue;
                }
            }
            // Direct preprocessor options the cache cannot see through.
            debug!("Unsupported compiler option: {arg}");
            return Err(Failure::new(StatKind::UnsupportedCompilerOption));
        }
        if arg.starts_with("-fdebug-prefix-map=")
            || arg.starts_with("-ffile-prefix-map=")
            || arg.starts_with("-fmacro-prefix-map=")
        {
            let value = arg.split_once('=').map(|(_, v)| v).unwrap_or_default();
            info.debug_prefix_maps.push(value.to_string());
            common_args.push(arg);
            i += 1;
            continue;
        }
        if let Some(value) = arg.strip_prefix("-fsanitize-blacklist=") {
            info.sanitize_blacklists.push(value.to_string());
            common_args.push(arg);
            i += 1;
            continue;
        }
        if arg == "-g0" {
            info.generating_debuginfo = false;
            common_args.push(arg);
            i += 1;
            continue;
        }
        if arg.starts_with("-g") && !arg.starts_with("-gz") {
            info.generating_debuginfo = true;
            common_args.push(arg);
            i += 1;
            continue;
        }
        if arg.starts_with("-fprofile-")
            || arg == "-fbranch-probabilities"
            || arg.starts_with("-fauto-profile")
        {
            classify_profile_argument(&arg, &mut info);
            common_args.push(arg);
            i += 1;
            continue;
        }
        if arg == "-include" || arg == "-include-pch" {
            let value = args.get(i + 1).ok_or_else(|| {
                debug!("Missing argument to {arg}");
                Failure::new(StatKind::BadCompilerArguments)
            })?;
            detect_pch(ctx, &mut info, &arg, value)?;
            cpp_args.push(arg.clone());
            cpp_args.push(value.clone());
            i += 2;
            continue;
        }

        if let Some(rule) = compopt::lookup(&arg) {
            if rule.traits.contains(OptTraits::TOO_HARD) {
                debug!("Unsupported compiler option: {arg}");
                return Err(Failure::new(StatKind::UnsupportedCompilerOption));
            }
            if rule.traits.contains(OptTraits::TOO_HARD_DIRECT) && ctx.config.direct_mode {
                debug!("{arg} is unsupported in direct mode; disabling direct mode");
                ctx.config.direct_mode = false;
            }
            if rule.traits.contains(OptTraits::TAKES_ARG) && arg == rule.name {
                let value = args.get(i + 1).ok_or_else(|| {
                    debug!("Missing argument to {arg}");
                    Failure::new(StatKind::BadCompilerArguments)
                })?;
                let destination = if rule.traits.contains(OptTraits::AFFECTS_CPP) {
                    &mut cpp_args
                } else {
                    &mut common_args
                };
                destination.push(arg.clone());
                destination.push(value.clone());
                i += 2;
            } else {
                // Equals form or a plain option.
                let destination = if rule.traits.contains(OptTraits::AFFECTS_CPP) {
                    &mut cpp_args
                } else {
                    &mut common_args
                };
                destination.push(arg.clone());
                i += 1;
            }
            continue;
        }
        if arg.starts_with('-') {
            if compopt::affects_cpp_glued(&arg) {
                cpp_args.push(arg.clone());
            } else {
                common_args.push(arg.clone());
            }
            i += 1;
            continue;
        }

        // Not an option: an input file candidate.
        if !info.input_file.is_empty() {
            let extension = file_extension(&arg);
            if language::language_for_extension(extension).is_some() {
                debug!("Multiple input files: {} and {arg}", info.input_file);
                return Err(Failure::new(StatKind::MultipleSourceFiles));
            }
            debug!("Object file argument {arg}; this looks like a link");
            return Err(Failure::new(StatKind::CalledForLink));
        }
        if arg == "-" {
            debug!("Source from stdin is not supported");
            return Err(Failure::new(StatKind::NoInputFile));
        }
        info.input_file = arg;
        i += 1;
    }

    if info.input_file.is_empty() {
        debug!("No input file found");
        return Err(Failure::new(StatKind::NoInputFile));
    }

    let language = match explicit_language.filter(|l| l != "none") {
        Some(language) => language,
        None => {
            let extension = file_extension(&info.input_file);
            language::language_for_extension(extension)
                .unwrap_or_default()
                .to_string()
        }
    };
    if language.is_empty() || !language::language_is_supported(&language) {
        debug!(
            "Unsupported source language for {}: {language}",
            info.input_file
        );
        return Err(Failure::new(StatKind::UnsupportedSourceLanguage));
    }
    info.actual_language = language.clone();
    info.direct_i_file = language::language_is_preprocessed(&language);

    info.output_is_precompiled_header = language::language_is_header(&language)
        || output_obj
            .as_deref()
            .map(|o| crate::hashing::inclusions::is_precompiled_header(o))
            .unwrap_or(false);

    if info.output_is_precompiled_header
        && !ctx
            .config
            .sloppiness
            .contains(crate::config::Sloppiness::PCH_DEFINES)
    {
        debug!("Creating a precompiled header requires the pch_defines sloppiness");
        return Err(Failure::new(StatKind::CouldNotUsePrecompiledHeader));
    }
    if info.using_precompiled_header
        && !ctx
            .config
            .sloppiness
            .contains(crate::config::Sloppiness::TIME_MACROS)
    {
        debug!("Using a precompiled header requires the time_macros sloppiness");
        return Err(Failure::new(StatKind::CouldNotUsePrecompiledHeader));
    }
    if info.arch_args.len() > 1
        && (info.using_precompiled_header || info.output_is_precompiled_header)
    {
        debug!("Multiple -arch options with a precompiled header");
        return Err(Failure::new(StatKind::CouldNotUsePrecompiledHeader));
    }

    if !found_c && !found_s && !info.output_is_precompiled_header {
        debug!("No -c option found; this looks like a link");
        return Err(Failure::new(StatKind::CalledForLink));
    }

    let output_obj = match output_obj {
        Some(output) => output,
        None => default_output_name(&info.input_file, found_s),
    };
    if output_obj == "-" {
        debug!("Output to stdout is not supported");
        return Err(Failure::new(StatKind::OutputToStdout));
    }
    if output_obj.ends_with('/') || Path::new(&output_obj).is_dir() {
        debug!("Output file {output_obj} is a directory");
        return Err(Failure::new(StatKind::BadOutputFile));
    }
    info.output_obj = output_obj;

    let output_stem = strip_extension(&info.output_obj);
    if info.generating_dependencies && info.output_dep.is_empty() {
        info.output_dep = format!("{output_stem}.d");
    }
    if info.generating_coverage {
        info.output_cov = format!("{output_stem}.gcno");
    }
    if info.generating_stackusage {
        info.output_su = format!("{output_stem}.su");
    }
    if info.seen_split_dwarf {
        info.output_dwo = format!("{output_stem}.dwo");
    }

    if ctx.config.cpp_extension.is_empty() {
        ctx.config.cpp_extension =
            language::extension_for_preprocessed(&language).to_string();
    }

    // Assemble the three partitions.
    let mut preprocessor_args = vec![compiler.clone()];
    preprocessor_args.extend(common_args.iter().cloned());
    preprocessor_args.extend(cpp_args.iter().cloned());

    let mut compiler_args = vec![compiler];
    compiler_args.extend(common_args.iter().cloned());
    if ctx.config.run_second_cpp {
        // The real compile starts from the original source, so it needs the
        // preprocessor arguments again. Compiling the saved preprocessor
        // output must not repeat them.
        compiler_args.extend(cpp_args.iter().cloned());
    }
    for arch in &info.arch_args {
        compiler_args.push("-arch".to_string());
        compiler_args.push(arch.clone());
    }
    if found_c {
        compiler_args.push("-c".to_string());
    }
    if found_s {
        compiler_args.push("-S".to_string());
    }
    if ctx.config.run_second_cpp {
        compiler_args.extend(dep_args.iter().cloned());
    }

    ctx.args_info = info;
    Ok(ProcessedArgs {
        preprocessor_args,
        extra_args_to_hash: dep_args,
        compiler_args,
    })
}

fn classify_profile_argument(arg: &str, info: &mut ArgsInfo) {
    let (name, value) = match arg.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (arg, None),
    };
    match name {
        "-fprofile-dir" => {
            if let Some(value) = value {
                info.profile_path = value.to_string();
            }
        }
        "-fprofile-generate" | "-fprofile-instr-generate" => {
            info.profile_generate = true;
            if let Some(value) = value {
                info.profile_path = value.to_string();
            } else if info.profile_path.is_empty() {
                info.profile_path = ".".to_string();
            }
        }
        "-fprofile-use" | "-fprofile-instr-use" | "-fbranch-probabilities"
        | "-fauto-profile" => {
            info.profile_use = true;
            if let Some(value) = value {
                info.profile_path = value.to_string();
            } else if info.profile_path.is_empty() {
                info.profile_path = ".".to_string();
            }
        }
        _ => {}
    }
}

/// Recognize a precompiled header pulled in with -include or -include-pch.
fn detect_pch(
    ctx: &mut Context,
    info: &mut ArgsInfo,
    option: &str,
    value: &str,
) -> Result<(), Failure> {
    let mut pch_file = None;
    if option == "-include-pch" {
        if Path::new(value).is_file() {
            pch_file = Some(value.to_string());
        }
    } else {
        for extension in ["gch", "pch", "pth"] {
            let candidate = format!("{value}.{extension}");
            if Path::new(&candidate).is_file() {
                pch_file = Some(candidate);
                break;
            }
        }
    }
    if let Some(pch_file) = pch_file {
        if ctx.included_pch_file.is_some() {
            debug!("Multiple precompiled headers used: {pch_file}");
            return Err(Failure::new(StatKind::BadCompilerArguments));
        }
        debug!("Detected use of precompiled header: {pch_file}");
        info.using_precompiled_header = true;
        ctx.included_pch_file = Some(pch_file);
    }
    Ok(())
}

/// Inline `@file` response files. Arguments are whitespace separated; an
/// unreadable file makes the command line unusable.
fn expand_response_files(args: &[String]) -> Result<Vec<String>, Failure> {
    let mut expanded = Vec::with_capacity(args.len());
    for arg in args {
        if let Some(path) = arg.strip_prefix('@') {
            let content = std::fs::read_to_string(path).map_err(|error| {
                debug!("Failed to read response file {path}: {error}");
                Failure::new(StatKind::BadCompilerArguments)
            })?;
            expanded.extend(content.split_whitespace().map(str::to_string));
        } else {
            expanded.push(arg.clone());
        }
    }
    Ok(expanded)
}

fn file_extension(path: &str) -> &str {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
}

fn default_output_name(input: &str, assembly: bool) -> String {
    let stem = Path::new(input)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| input.to_string());
    if assembly {
        format!("{stem}.s")
    } else {
        format!("{stem}.o")
    }
}

fn strip_extension(path: &str) -> String {
    match path.rfind('.') {
        Some(position) if !path[position + 1..].contains('/') => path[..position].to_string(),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Sloppiness};

    fn context_for(args: &[&str]) -> Context {
        let args = args.iter().map(|s| s.to_string()).collect();
        Context::capture(Config::default(), args).unwrap()
    }

    fn process(args: &[&str]) -> Result<(Context, ProcessedArgs), StatKind> {
        let mut ctx = context_for(args);
        match process_args(&mut ctx) {
            Ok(processed) => Ok((ctx, processed)),
            Err(failure) => Err(failure.stat),
        }
    }

    fn process_err(args: &[&str]) -> StatKind {
        match process(args) {
            Ok(_) => panic!("expected classification to fail"),
            Err(stat) => stat,
        }
    }

    #[test]
    fn test_simple_compilation() {
        let (ctx, processed) = process(&["gcc", "-c", "main.c", "-o", "main.o"]).unwrap();
        assert_eq!(ctx.args_info.input_file, "main.c");
        assert_eq!(ctx.args_info.output_obj, "main.o");
        assert_eq!(ctx.args_info.actual_language, "c");
        assert!(!ctx.args_info.direct_i_file);
        assert_eq!(processed.preprocessor_args, vec!["gcc"]);
        assert_eq!(processed.compiler_args, vec!["gcc", "-c"]);
        assert!(processed.extra_args_to_hash.is_empty());
    }

    #[test]
    fn test_default_output_name() {
        let (ctx, _) = process(&["gcc", "-c", "src/main.c"]).unwrap();
        assert_eq!(ctx.args_info.output_obj, "main.o");
    }

    #[test]
    fn test_no_input_file() {
        assert_eq!(process_err(&["gcc", "-c"]), StatKind::NoInputFile);
    }

    #[test]
    fn test_multiple_source_files() {
        let error = process_err(&["gcc", "-c", "a.c", "b.c"]);
        assert_eq!(error, StatKind::MultipleSourceFiles);
    }

    #[test]
    fn test_object_argument_means_link() {
        let error = process_err(&["gcc", "-c", "a.c", "b.o"]);
        assert_eq!(error, StatKind::CalledForLink);
    }

    #[test]
    fn test_missing_dash_c_means_link() {
        let error = process_err(&["gcc", "a.c"]);
        assert_eq!(error, StatKind::CalledForLink);
    }

    #[test]
    fn test_preprocess_only_bails_out() {
        assert_eq!(
            process_err(&["gcc", "-E", "a.c"]),
            StatKind::CalledForPreprocessing
        );
        assert_eq!(
            process_err(&["gcc", "-M", "a.c"]),
            StatKind::CalledForPreprocessing
        );
    }

    #[test]
    fn test_output_to_stdout_bails_out() {
        let error = process_err(&["gcc", "-c", "a.c", "-o", "-"]);
        assert_eq!(error, StatKind::OutputToStdout);
    }

    #[test]
    fn test_unsupported_language() {
        let error = process_err(&["gcc", "-c", "a.rs"]);
        assert_eq!(error, StatKind::UnsupportedSourceLanguage);
    }

    #[test]
    fn test_explicit_language() {
        let (ctx, processed) = process(&["gcc", "-c", "-x", "c++", "weird.inp"]).unwrap();
        assert_eq!(ctx.args_info.actual_language, "c++");
        assert!(processed.preprocessor_args.contains(&"-x".to_string()));
        assert!(processed.preprocessor_args.contains(&"c++".to_string()));
    }

    #[test]
    fn test_preprocessed_input() {
        let (ctx, _) = process(&["gcc", "-c", "main.i"]).unwrap();
        assert!(ctx.args_info.direct_i_file);
        assert_eq!(ctx.args_info.actual_language, "cpp-output");
    }

    #[test]
    fn test_too_hard_option() {
        let error = process_err(&["gcc", "--save-temps", "-c", "a.c"]);
        assert_eq!(error, StatKind::UnsupportedCompilerOption);
    }

    #[test]
    fn test_cpp_only_options_partitioned() {
        let (_, processed) =
            process(&["gcc", "-c", "-I", "/usr/include", "-DFOO=1", "-Wall", "a.c"]).unwrap();
        // Preprocessor sees everything.
        assert!(processed.preprocessor_args.contains(&"-I".to_string()));
        assert!(processed.preprocessor_args.contains(&"-DFOO=1".to_string()));
        assert!(processed.preprocessor_args.contains(&"-Wall".to_string()));
        // The compile of preprocessed output still gets the common flags.
        assert!(processed.compiler_args.contains(&"-Wall".to_string()));
    }

    #[test]
    fn test_dependency_arguments() {
        let (ctx, processed) =
            process(&["gcc", "-c", "-MD", "-MF", "deps/main.d", "main.c"]).unwrap();
        assert!(ctx.args_info.generating_dependencies);
        assert_eq!(ctx.args_info.output_dep, "deps/main.d");
        assert_eq!(
            processed.extra_args_to_hash,
            vec!["-MD", "-MF", "deps/main.d"]
        );
        // With run_second_cpp the real compile produces the dep file.
        assert!(processed.compiler_args.contains(&"-MD".to_string()));
    }

    #[test]
    fn test_dependency_default_path() {
        let (ctx, _) = process(&["gcc", "-c", "-MMD", "main.c", "-o", "out/main.o"]).unwrap();
        assert_eq!(ctx.args_info.output_dep, "out/main.d");
    }

    #[test]
    fn test_wp_dependency_forms() {
        let (ctx, _) = process(&["gcc", "-c", "-Wp,-MD,x.d", "main.c"]).unwrap();
        assert!(ctx.args_info.generating_dependencies);
        assert_eq!(ctx.args_info.output_dep, "x.d");

        let error = process_err(&["gcc", "-c", "-Wp,-P", "main.c"]);
        assert_eq!(error, StatKind::UnsupportedCompilerOption);
    }

    #[test]
    fn test_split_dwarf() {
        let (ctx, _) =
            process(&["gcc", "-c", "-gsplit-dwarf", "main.c", "-o", "main.o"]).unwrap();
        assert!(ctx.args_info.seen_split_dwarf);
        assert!(ctx.args_info.generating_debuginfo);
        assert_eq!(ctx.args_info.output_dwo, "main.dwo");
    }

    #[test]
    fn test_coverage_and_stackusage() {
        let (ctx, _) = process(&[
            "gcc",
            "-c",
            "--coverage",
            "-fstack-usage",
            "main.c",
            "-o",
            "obj/main.o",
        ])
        .unwrap();
        assert!(ctx.args_info.generating_coverage);
        assert!(ctx.args_info.profile_arcs);
        assert!(ctx.args_info.generating_stackusage);
        assert_eq!(ctx.args_info.output_cov, "obj/main.gcno");
        assert_eq!(ctx.args_info.output_su, "obj/main.su");
    }

    #[test]
    fn test_debug_info_flags() {
        let (ctx, _) = process(&["gcc", "-c", "-g", "main.c"]).unwrap();
        assert!(ctx.args_info.generating_debuginfo);

        let (ctx, _) = process(&["gcc", "-c", "-g", "-g0", "main.c"]).unwrap();
        assert!(!ctx.args_info.generating_debuginfo);
    }

    #[test]
    fn test_prefix_map_values_collected() {
        let (ctx, processed) = process(&[
            "gcc",
            "-c",
            "-fdebug-prefix-map=/src=/build",
            "main.c",
        ])
        .unwrap();
        assert_eq!(ctx.args_info.debug_prefix_maps, vec!["/src=/build"]);
        assert!(processed
            .preprocessor_args
            .contains(&"-fdebug-prefix-map=/src=/build".to_string()));
    }

    #[test]
    fn test_profile_flags() {
        let (ctx, _) =
            process(&["gcc", "-c", "-fprofile-generate=/prof", "main.c"]).unwrap();
        assert!(ctx.args_info.profile_generate);
        assert_eq!(ctx.args_info.profile_path, "/prof");

        let (ctx, _) = process(&["gcc", "-c", "-fprofile-use", "main.c"]).unwrap();
        assert!(ctx.args_info.profile_use);
    }

    #[test]
    fn test_arch_arguments() {
        let (ctx, processed) = process(&[
            "clang", "-c", "-arch", "x86_64", "-arch", "arm64", "main.c",
        ])
        .unwrap();
        assert_eq!(ctx.args_info.arch_args, vec!["x86_64", "arm64"]);
        // arch options reach the compiler but not the preprocessor; the
        // orchestrator appends them there one at a time.
        assert!(processed.compiler_args.contains(&"-arch".to_string()));
        assert!(!processed.preprocessor_args.contains(&"-arch".to_string()));
    }

    #[test]
    fn test_pch_creation_needs_sloppiness() {
        let error = process_err(&["gcc", "-c", "-x", "c-header", "all.h"]);
        assert_eq!(error, StatKind::CouldNotUsePrecompiledHeader);

        let mut ctx = context_for(&["gcc", "-c", "-x", "c-header", "all.h"]);
        ctx.config.sloppiness.insert(Sloppiness::PCH_DEFINES);
        ctx.config.sloppiness.insert(Sloppiness::TIME_MACROS);
        let processed = process_args(&mut ctx);
        assert!(processed.is_ok());
        assert!(ctx.args_info.output_is_precompiled_header);
    }

    #[test]
    fn test_pch_use_needs_time_macros_sloppiness() {
        let dir = tempfile::tempdir().unwrap();
        let pch = dir.path().join("all.h.gch");
        std::fs::write(&pch, b"gch").unwrap();
        let header = dir.path().join("all.h").to_string_lossy().into_owned();

        let args = ["gcc", "-c", "-include", header.as_str(), "main.c"];
        let mut ctx = context_for(&args);
        let error = process_args(&mut ctx).unwrap_err();
        assert_eq!(error.stat, StatKind::CouldNotUsePrecompiledHeader);

        let mut ctx = context_for(&args);
        ctx.config.sloppiness.insert(Sloppiness::TIME_MACROS);
        process_args(&mut ctx).unwrap();
        assert!(ctx.args_info.using_precompiled_header);
        assert_eq!(
            ctx.included_pch_file.as_deref(),
            Some(format!("{header}.gch").as_str())
        );
    }

    #[test]
    fn test_response_file_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let response = dir.path().join("args.rsp");
        std::fs::write(&response, "-c -O2\nmain.c").unwrap();
        let at_arg = format!("@{}", response.display());

        let (ctx, processed) = process(&["gcc", at_arg.as_str()]).unwrap();
        assert_eq!(ctx.args_info.input_file, "main.c");
        assert!(processed.preprocessor_args.contains(&"-O2".to_string()));
    }

    #[test]
    fn test_missing_response_file() {
        let error = process_err(&["gcc", "@/nonexistent.rsp", "-c", "main.c"]);
        assert_eq!(error, StatKind::BadCompilerArguments);
    }

    #[test]
    fn test_xpreprocessor_disables_direct_mode() {
        let (ctx, _) =
            process(&["gcc", "-c", "-Xpreprocessor", "-DVIA_CPP", "main.c"]).unwrap();
        assert!(!ctx.config.direct_mode);
    }

    #[test]
    fn test_assembly_output() {
        let (ctx, processed) = process(&["gcc", "-S", "main.c"]).unwrap();
        assert_eq!(ctx.args_info.output_obj, "main.s");
        assert!(processed.compiler_args.contains(&"-S".to_string()));
    }
}
