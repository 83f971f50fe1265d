// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-invocation state.
//!
//! The context owns everything with the lifetime of one compilation attempt:
//! the configuration snapshot, the original argument vector, the accumulated
//! set of included files, and the digests computed along the way. It is
//! created once by the driver and handed to the orchestrator; nothing in it
//! is persisted.

use crate::classify::ArgsInfo;
use crate::config::Config;
use crate::digest::Digest;
use crate::stats::Counters;
use anyhow::{Context as AnyhowContext, Result};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// The compiler family guessed from the executable name. Some hashing and
/// fallback decisions differ per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuessedCompiler {
    Gcc,
    Clang,
    Nvcc,
    Pump,
    Unknown,
}

impl GuessedCompiler {
    pub fn from_path(path: &str) -> Self {
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match name.as_str() {
            "clang" | "clang++" => GuessedCompiler::Clang,
            "gcc" | "g++" => GuessedCompiler::Gcc,
            "nvcc" => GuessedCompiler::Nvcc,
            "pump" | "distcc-pump" => GuessedCompiler::Pump,
            _ => GuessedCompiler::Unknown,
        }
    }

    /// Clang warns about unused linker flags, so linker arguments stay part
    /// of the hash for it. Unknown compilers are treated the same way to be
    /// safe.
    pub fn treat_as_clang(self) -> bool {
        matches!(self, GuessedCompiler::Clang | GuessedCompiler::Unknown)
    }
}

/// An include file observed during one compilation, with the stat fields
/// needed for the `file_stat_matches` shortcut.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludedFile {
    pub digest: Digest,
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
}

/// Everything owned by a single invocation.
pub struct Context {
    /// Where the process actually runs.
    pub actual_cwd: PathBuf,
    /// The directory the user believes they are in ($PWD when it points at
    /// the same place, e.g. through a symlink).
    pub apparent_cwd: PathBuf,
    /// The unmodified compiler command line, with the real compiler at
    /// index 0.
    pub orig_args: Vec<String>,
    pub config: Config,
    pub args_info: ArgsInfo,
    pub guessed_compiler: GuessedCompiler,
    /// Accumulated include files, canonical path to content record.
    pub included_files: BTreeMap<String, IncludedFile>,
    /// Precompiled header referenced by the command line, if any.
    pub included_pch_file: Option<String>,
    pub has_absolute_include_headers: bool,
    /// Seconds since the epoch when the compilation (or preprocessing)
    /// started; include files at least this new are refused.
    pub time_of_compilation: i64,
    /// Preprocessed output kept for a second compiler pass.
    pub i_tmpfile: Option<PathBuf>,
    /// Captured preprocessor stderr, replayed before the compiler's own.
    pub cpp_stderr: Option<PathBuf>,
    pub manifest_digest: Option<Digest>,
    pub result_digest: Option<Digest>,
    /// Header path prefixes excluded from manifests.
    pub ignore_header_paths: Vec<String>,
    /// Counter updates flushed to the stats file at process end.
    pub counter_updates: Counters,
}

impl Context {
    pub fn capture(config: Config, orig_args: Vec<String>) -> Result<Self> {
        let actual_cwd =
            std::env::current_dir().with_context(|| "Failed to get current working directory")?;
        let apparent_cwd = apparent_cwd(&actual_cwd);
        let ignore_header_paths = config
            .ignore_headers_in_manifest
            .split(':')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Context {
            actual_cwd,
            apparent_cwd,
            orig_args,
            config,
            args_info: ArgsInfo::default(),
            guessed_compiler: GuessedCompiler::Unknown,
            included_files: BTreeMap::new(),
            included_pch_file: None,
            has_absolute_include_headers: false,
            time_of_compilation: now_seconds(),
            i_tmpfile: None,
            cpp_stderr: None,
            manifest_digest: None,
            result_digest: None,
            ignore_header_paths,
            counter_updates: Counters::default(),
        })
    }

    /// Rewrite `path` relative to the apparent working directory when it
    /// falls under the configured base directory. This is what lets two
    /// checkouts in different places share cache entries.
    pub fn make_relative_path(&self, path: &str) -> String {
        if self.config.base_dir.is_empty()
            || !Path::new(path).is_absolute()
            || !path.starts_with(&self.config.base_dir)
        {
            return path.to_string();
        }
        relativize(Path::new(path), &self.apparent_cwd)
    }
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// $PWD, when it names the same directory as the real one.
fn apparent_cwd(actual: &Path) -> PathBuf {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(pwd) = std::env::var("PWD") {
            let pwd = PathBuf::from(pwd);
            if let (Ok(a), Ok(b)) = (std::fs::metadata(&pwd), std::fs::metadata(actual)) {
                if a.dev() == b.dev() && a.ino() == b.ino() {
                    return pwd;
                }
            }
        }
    }
    actual.to_path_buf()
}

/// Purely lexical relative path from `base` to `target`.
fn relativize(target: &Path, base: &Path) -> String {
    let target_parts: Vec<Component> = target.components().collect();
    let base_parts: Vec<Component> = base.components().collect();
    let common = target_parts
        .iter()
        .zip(base_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in common..base_parts.len() {
        result.push("..");
    }
    for part in &target_parts[common..] {
        result.push(part);
    }
    if result.as_os_str().is_empty() {
        ".".to_string()
    } else {
        result.to_string_lossy().into_owned()
    }
}
