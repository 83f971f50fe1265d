// SPDX-License-Identifier: GPL-3.0-or-later

//! Statistics counters and the failure channel of the compilation pipeline.
//!
//! Every abandoned caching attempt is accounted for by a counter. The
//! counters live in a `stats` file inside each first-level cache directory;
//! positions in that file are part of the on-disk format and must not be
//! reordered.

use crate::config::Config;
use fs2::FileExt;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Number of counter slots in a stats file. Unknown trailing counters from
/// newer versions are preserved on rewrite.
pub const NUM_STATS: usize = 32;

/// One counter per way a run can end, plus a few gauges maintained by the
/// storage layer. The discriminant is the position in the stats file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StatKind {
    None = 0,
    CompilerProducedStdout = 1,
    CompileFailed = 2,
    InternalError = 3,
    CacheMiss = 4,
    PreprocessorError = 5,
    CouldNotFindCompiler = 6,
    MissingCacheFile = 7,
    PreprocessedCacheHit = 8,
    BadCompilerArguments = 9,
    CalledForLink = 10,
    FilesInCache = 11,
    CacheSizeKibibyte = 12,
    ObsoleteMaxFiles = 13,
    ObsoleteMaxSize = 14,
    UnsupportedSourceLanguage = 15,
    BadOutputFile = 16,
    NoInputFile = 17,
    MultipleSourceFiles = 18,
    AutoconfTest = 19,
    UnsupportedCompilerOption = 20,
    OutputToStdout = 21,
    DirectCacheHit = 22,
    CompilerProducedNoOutput = 23,
    CompilerProducedEmptyOutput = 24,
    MissingExtraFileToHash = 25,
    CompilerCheckFailed = 26,
    CouldNotUsePrecompiledHeader = 27,
    CalledForPreprocessing = 28,
    CleanupsPerformed = 29,
    UnsupportedCodeDirective = 30,
    CacheDisabled = 31,
}

impl StatKind {
    pub fn index(self) -> usize {
        self as usize
    }

    /// Human readable description used by `--show-stats`.
    pub fn message(self) -> &'static str {
        match self {
            StatKind::None => "",
            StatKind::CompilerProducedStdout => "compiler produced stdout",
            StatKind::CompileFailed => "compile failed",
            StatKind::InternalError => "ccache internal error",
            StatKind::CacheMiss => "cache miss",
            StatKind::PreprocessorError => "preprocessor error",
            StatKind::CouldNotFindCompiler => "couldn't find the compiler",
            StatKind::MissingCacheFile => "cache file missing",
            StatKind::PreprocessedCacheHit => "cache hit (preprocessed)",
            StatKind::BadCompilerArguments => "bad compiler arguments",
            StatKind::CalledForLink => "called for link",
            StatKind::FilesInCache => "files in cache",
            StatKind::CacheSizeKibibyte => "cache size",
            StatKind::ObsoleteMaxFiles => "OBSOLETE",
            StatKind::ObsoleteMaxSize => "OBSOLETE",
            StatKind::UnsupportedSourceLanguage => "unsupported source language",
            StatKind::BadOutputFile => "could not write to output file",
            StatKind::NoInputFile => "no input file",
            StatKind::MultipleSourceFiles => "multiple source files",
            StatKind::AutoconfTest => "autoconf compile/link",
            StatKind::UnsupportedCompilerOption => "unsupported compiler option",
            StatKind::OutputToStdout => "output to stdout",
            StatKind::DirectCacheHit => "cache hit (direct)",
            StatKind::CompilerProducedNoOutput => "compiler produced no output",
            StatKind::CompilerProducedEmptyOutput => "compiler produced empty output",
            StatKind::MissingExtraFileToHash => "error hashing extra file",
            StatKind::CompilerCheckFailed => "compiler check failed",
            StatKind::CouldNotUsePrecompiledHeader => "preprocessor can't use precompiled header",
            StatKind::CalledForPreprocessing => "called for preprocessing",
            StatKind::CleanupsPerformed => "cleanups performed",
            StatKind::UnsupportedCodeDirective => "unsupported code directive",
            StatKind::CacheDisabled => "cache disabled by configuration",
        }
    }

    /// Counters that track sizes rather than events.
    pub fn is_gauge(self) -> bool {
        matches!(
            self,
            StatKind::FilesInCache | StatKind::CacheSizeKibibyte
        )
    }

    /// All counters in display order for `--show-stats`.
    pub fn display_order() -> &'static [StatKind] {
        &[
            StatKind::DirectCacheHit,
            StatKind::PreprocessedCacheHit,
            StatKind::CacheMiss,
            StatKind::CacheDisabled,
            StatKind::CalledForLink,
            StatKind::CalledForPreprocessing,
            StatKind::MultipleSourceFiles,
            StatKind::CompilerProducedStdout,
            StatKind::CompilerProducedNoOutput,
            StatKind::CompilerProducedEmptyOutput,
            StatKind::CompileFailed,
            StatKind::InternalError,
            StatKind::PreprocessorError,
            StatKind::CouldNotUsePrecompiledHeader,
            StatKind::CouldNotFindCompiler,
            StatKind::CompilerCheckFailed,
            StatKind::MissingCacheFile,
            StatKind::BadCompilerArguments,
            StatKind::UnsupportedSourceLanguage,
            StatKind::UnsupportedCompilerOption,
            StatKind::UnsupportedCodeDirective,
            StatKind::OutputToStdout,
            StatKind::BadOutputFile,
            StatKind::NoInputFile,
            StatKind::MissingExtraFileToHash,
            StatKind::AutoconfTest,
            StatKind::CleanupsPerformed,
            StatKind::FilesInCache,
            StatKind::CacheSizeKibibyte,
        ]
    }

    /// Machine readable identifier used by `--print-stats`.
    pub fn id(self) -> &'static str {
        match self {
            StatKind::None => "none",
            StatKind::CompilerProducedStdout => "compiler_produced_stdout",
            StatKind::CompileFailed => "compile_failed",
            StatKind::InternalError => "internal_error",
            StatKind::CacheMiss => "cache_miss",
            StatKind::PreprocessorError => "preprocessor_error",
            StatKind::CouldNotFindCompiler => "could_not_find_compiler",
            StatKind::MissingCacheFile => "missing_cache_file",
            StatKind::PreprocessedCacheHit => "preprocessed_cache_hit",
            StatKind::BadCompilerArguments => "bad_compiler_arguments",
            StatKind::CalledForLink => "called_for_link",
            StatKind::FilesInCache => "files_in_cache",
            StatKind::CacheSizeKibibyte => "cache_size_kibibyte",
            StatKind::ObsoleteMaxFiles => "obsolete_max_files",
            StatKind::ObsoleteMaxSize => "obsolete_max_size",
            StatKind::UnsupportedSourceLanguage => "unsupported_source_language",
            StatKind::BadOutputFile => "bad_output_file",
            StatKind::NoInputFile => "no_input_file",
            StatKind::MultipleSourceFiles => "multiple_source_files",
            StatKind::AutoconfTest => "autoconf_test",
            StatKind::UnsupportedCompilerOption => "unsupported_compiler_option",
            StatKind::OutputToStdout => "output_to_stdout",
            StatKind::DirectCacheHit => "direct_cache_hit",
            StatKind::CompilerProducedNoOutput => "compiler_produced_no_output",
            StatKind::CompilerProducedEmptyOutput => "compiler_produced_empty_output",
            StatKind::MissingExtraFileToHash => "missing_extra_file_to_hash",
            StatKind::CompilerCheckFailed => "compiler_check_failed",
            StatKind::CouldNotUsePrecompiledHeader => "could_not_use_precompiled_header",
            StatKind::CalledForPreprocessing => "called_for_preprocessing",
            StatKind::CleanupsPerformed => "cleanups_performed",
            StatKind::UnsupportedCodeDirective => "unsupported_code_directive",
            StatKind::CacheDisabled => "cache_disabled",
        }
    }
}

impl fmt::Display for StatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A staged function raises `Failure` to abandon caching. The top level
/// records the statistic and either exits with the carried code or executes
/// the real compiler in place of this process.
#[derive(Debug, Error)]
#[error("{}", .stat.message())]
pub struct Failure {
    pub stat: StatKind,
    pub exit_code: Option<i32>,
}

impl Failure {
    pub fn new(stat: StatKind) -> Self {
        Failure {
            stat,
            exit_code: None,
        }
    }

    pub fn with_exit_code(stat: StatKind, exit_code: i32) -> Self {
        Failure {
            stat,
            exit_code: Some(exit_code),
        }
    }
}

impl From<StatKind> for Failure {
    fn from(stat: StatKind) -> Self {
        Failure::new(stat)
    }
}

/// In-memory counter updates, flushed to one stats file at process end.
#[derive(Debug, Clone)]
pub struct Counters {
    values: Vec<u64>,
}

impl Default for Counters {
    fn default() -> Self {
        Counters {
            values: vec![0; NUM_STATS],
        }
    }
}

impl Counters {
    pub fn get(&self, stat: StatKind) -> u64 {
        self.values.get(stat.index()).copied().unwrap_or(0)
    }

    pub fn set(&mut self, stat: StatKind, value: u64) {
        self.values[stat.index()] = value;
    }

    pub fn increment(&mut self, stat: StatKind) {
        self.values[stat.index()] += 1;
    }

    pub fn add(&mut self, stat: StatKind, delta: u64) {
        self.values[stat.index()] += delta;
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(|v| *v == 0)
    }

    /// Record that `size_delta` bytes and `files_delta` files were added to
    /// (positive) or removed from (negative) the cache.
    pub fn update_size(&mut self, size_delta: i64, files_delta: i64) {
        let size = self.values[StatKind::CacheSizeKibibyte.index()] as i64 + size_delta / 1024;
        self.values[StatKind::CacheSizeKibibyte.index()] = size.max(0) as u64;
        let files = self.values[StatKind::FilesInCache.index()] as i64 + files_delta;
        self.values[StatKind::FilesInCache.index()] = files.max(0) as u64;
    }

    fn parse(text: &str) -> Self {
        let mut values: Vec<u64> = text
            .split_whitespace()
            .map(|token| token.parse().unwrap_or(0))
            .collect();
        if values.len() < NUM_STATS {
            values.resize(NUM_STATS, 0);
        }
        Counters { values }
    }

    fn serialize(&self) -> String {
        let mut out = String::new();
        for value in &self.values {
            out.push_str(&value.to_string());
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("failed to update stats file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Read a stats file; an absent or truncated file reads as all zeroes.
pub fn read_stats_file(path: &Path) -> Counters {
    match fs::read_to_string(path) {
        Ok(text) => Counters::parse(&text),
        Err(_) => Counters::default(),
    }
}

/// Apply `update` to the counters stored at `path` under an exclusive lock.
pub fn update_stats_file<F>(path: &Path, update: F) -> Result<(), StatsError>
where
    F: FnOnce(&mut Counters),
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StatsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let lock_path = path.with_extension("lock");
    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|source| StatsError::Io {
            path: lock_path.clone(),
            source,
        })?;
    lock.lock_exclusive().map_err(|source| StatsError::Io {
        path: lock_path.clone(),
        source,
    })?;

    let mut counters = read_stats_file(path);
    update(&mut counters);

    let result = write_stats_file(path, &counters);
    let _ = fs2::FileExt::unlock(&lock);
    result
}

fn write_stats_file(path: &Path, counters: &Counters) -> Result<(), StatsError> {
    let map_err = |source| StatsError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().expect("stats file has a parent directory");
    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(map_err)?;
    temp.write_all(counters.serialize().as_bytes())
        .map_err(map_err)?;
    temp.persist(path).map_err(|error| StatsError::Io {
        path: path.to_path_buf(),
        source: error.error,
    })?;
    Ok(())
}

/// Merge pending in-memory updates into one stats file. Event counters are
/// added; gauges are added as deltas too since the pending values hold
/// deltas, not absolutes.
pub fn flush_to_file(path: &Path, pending: &Counters) -> Result<(), StatsError> {
    if pending.is_empty() {
        return Ok(());
    }
    update_stats_file(path, |stored| {
        for index in 0..NUM_STATS {
            stored.values[index] += pending.values[index];
        }
    })
}

/// Sum the counters of every first-level directory.
pub fn collect_totals(config: &Config) -> Counters {
    let mut totals = Counters::default();
    for level in 0..16u32 {
        let path = config
            .cache_dir
            .join(format!("{level:x}"))
            .join("stats");
        let counters = read_stats_file(&path);
        for index in 0..NUM_STATS {
            totals.values[index] += counters.values[index];
        }
    }
    totals
}

/// Zero all event counters, keeping the size gauges intact.
pub fn zero_all(config: &Config) -> Result<(), StatsError> {
    for level in 0..16u32 {
        let dir = config.cache_dir.join(format!("{level:x}"));
        if !dir.is_dir() {
            continue;
        }
        let path = dir.join("stats");
        update_stats_file(&path, |stored| {
            for index in 0..NUM_STATS {
                let stat_is_gauge = index == StatKind::FilesInCache.index()
                    || index == StatKind::CacheSizeKibibyte.index();
                if !stat_is_gauge {
                    stored.values[index] = 0;
                }
            }
        })?;
    }
    Ok(())
}
