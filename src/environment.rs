// SPDX-License-Identifier: GPL-3.0-or-later

//! Names of the environment variables the cache reads or sets.

/// Overrides the cache directory.
pub const KEY_CACHE_DIR: &str = "CCACHE_DIR";
/// Overrides the primary configuration file path.
pub const KEY_CONFIGPATH: &str = "CCACHE_CONFIGPATH";
/// When set, the list of included files is printed to stdout after a scan.
pub const KEY_DEBUG_INCLUDED: &str = "CCACHE_DEBUG_INCLUDED";
/// When set, internal tracing is requested.
pub const KEY_INTERNAL_TRACE: &str = "CCACHE_INTERNAL_TRACE";
/// Fallback location for temporary files outside the cache.
pub const KEY_TMPDIR: &str = "TMPDIR";
/// Exported for downstream processes: a duplicate of stderr that is never
/// captured into the cache.
pub const KEY_UNCACHED_ERR_FD: &str = "UNCACHED_ERR_FD";

/// Locale variables that may affect compiler diagnostics, hashed unless the
/// `locale` sloppiness is enabled.
pub const LOCALE_KEYS: &[&str] = &["LANG", "LC_ALL", "LC_CTYPE", "LC_MESSAGES"];

/// Include-search variables that affect preprocessor output. Hashed in
/// direct mode, where no preprocessor run would pick them up.
///
/// https://gcc.gnu.org/onlinedocs/cpp/Environment-Variables.html
pub const INCLUDE_PATH_KEYS: &[&str] = &[
    "CPATH",
    "C_INCLUDE_PATH",
    "CPLUS_INCLUDE_PATH",
    "OBJC_INCLUDE_PATH",
    "OBJCPLUS_INCLUDE_PATH",
];

/// GCC reads this for coloring diagnostics; it changes the bytes on stderr.
pub const KEY_GCC_COLORS: &str = "GCC_COLORS";

/// Dependency generation variables that must not leak into a preprocessor
/// run driven by the cache.
pub const DEPENDENCY_KEYS: &[&str] = &["DEPENDENCIES_OUTPUT", "SUNPRO_DEPENDENCIES"];
