// SPDX-License-Identifier: GPL-3.0-or-later

//! Configuration of the cache.
//!
//! Configuration is plain `key = value` text. The primary file lives at
//! `<cache_dir>/ccache.conf`, the secondary at `/etc/ccache.conf`. The
//! primary overrides the secondary, and environment variables of the form
//! `CCACHE_<NAME>` (with `CCACHE_NO<NAME>` negating booleans) override both.
//! Unknown keys in a configuration file are an error.

use log::debug;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "ccache.conf";
const SECONDARY_CONFIG_PATH: &str = "/etc/ccache.conf";

/// Relaxations the user may enable to trade safety for hit rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sloppiness(u32);

impl Sloppiness {
    pub const INCLUDE_FILE_MTIME: Sloppiness = Sloppiness(1 << 0);
    pub const INCLUDE_FILE_CTIME: Sloppiness = Sloppiness(1 << 1);
    pub const TIME_MACROS: Sloppiness = Sloppiness(1 << 2);
    pub const PCH_DEFINES: Sloppiness = Sloppiness(1 << 3);
    pub const FILE_STAT_MATCHES: Sloppiness = Sloppiness(1 << 4);
    pub const LOCALE: Sloppiness = Sloppiness(1 << 5);
    pub const SYSTEM_HEADERS: Sloppiness = Sloppiness(1 << 6);

    const NAMES: &'static [(&'static str, Sloppiness)] = &[
        ("include_file_mtime", Sloppiness::INCLUDE_FILE_MTIME),
        ("include_file_ctime", Sloppiness::INCLUDE_FILE_CTIME),
        ("time_macros", Sloppiness::TIME_MACROS),
        ("pch_defines", Sloppiness::PCH_DEFINES),
        ("file_stat_matches", Sloppiness::FILE_STAT_MATCHES),
        ("locale", Sloppiness::LOCALE),
        ("system_headers", Sloppiness::SYSTEM_HEADERS),
    ];

    pub fn contains(self, other: Sloppiness) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Sloppiness) {
        self.0 |= other.0;
    }

    fn parse(text: &str) -> Result<Self, String> {
        let mut result = Sloppiness::default();
        for token in text.split([',', ' ']).filter(|t| !t.is_empty()) {
            match Self::NAMES.iter().find(|(name, _)| *name == token) {
                Some((_, flag)) => result.insert(*flag),
                None => return Err(format!("unknown sloppiness: {token}")),
            }
        }
        Ok(result)
    }
}

impl fmt::Display for Sloppiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect();
        f.write_str(&names.join(", "))
    }
}

/// A snapshot of all configuration settings for one invocation.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: String,
    pub cache_dir: PathBuf,
    pub compiler: String,
    pub compiler_check: String,
    pub compression: bool,
    pub compression_level: i8,
    pub cpp_extension: String,
    pub depend_mode: bool,
    pub direct_mode: bool,
    pub disable: bool,
    pub extra_files_to_hash: String,
    pub hard_link: bool,
    pub hash_dir: bool,
    pub ignore_headers_in_manifest: String,
    pub keep_comments_cpp: bool,
    pub limit_multiple: f64,
    pub max_files: u64,
    pub max_size: u64,
    pub pch_external_checksum: bool,
    pub read_only: bool,
    pub read_only_direct: bool,
    pub recache: bool,
    pub run_second_cpp: bool,
    pub sloppiness: Sloppiness,
    pub stats: bool,
    pub temporary_dir: String,
    pub umask: Option<u32>,

    primary_config_path: PathBuf,
    origins: BTreeMap<&'static str, String>,
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Config {
            base_dir: String::new(),
            cache_dir: PathBuf::from(home).join(".ccache"),
            compiler: String::new(),
            compiler_check: "mtime".to_string(),
            compression: true,
            compression_level: 1,
            cpp_extension: String::new(),
            depend_mode: false,
            direct_mode: true,
            disable: false,
            extra_files_to_hash: String::new(),
            hard_link: false,
            hash_dir: true,
            ignore_headers_in_manifest: String::new(),
            keep_comments_cpp: false,
            limit_multiple: 0.8,
            max_files: 0,
            max_size: 5 * 1024 * 1024 * 1024,
            pch_external_checksum: false,
            read_only: false,
            read_only_direct: false,
            recache: false,
            run_second_cpp: true,
            sloppiness: Sloppiness::default(),
            stats: true,
            temporary_dir: String::new(),
            umask: None,
            primary_config_path: PathBuf::new(),
            origins: BTreeMap::new(),
        }
    }
}

/// All recognized configuration keys together with the suffix of their
/// `CCACHE_*` environment override.
const KEYS: &[(&str, &str)] = &[
    ("base_dir", "BASEDIR"),
    ("cache_dir", "DIR"),
    ("compiler", "CC"),
    ("compiler_check", "COMPILERCHECK"),
    ("compression", "COMPRESS"),
    ("compression_level", "COMPRESSLEVEL"),
    ("cpp_extension", "EXTENSION"),
    ("depend_mode", "DEPEND"),
    ("direct_mode", "DIRECT"),
    ("disable", "DISABLE"),
    ("extra_files_to_hash", "EXTRAFILES"),
    ("hard_link", "HARDLINK"),
    ("hash_dir", "HASHDIR"),
    ("ignore_headers_in_manifest", "IGNOREHEADERS"),
    ("keep_comments_cpp", "COMMENTS"),
    ("limit_multiple", "LIMIT_MULTIPLE"),
    ("max_files", "MAXFILES"),
    ("max_size", "MAXSIZE"),
    ("pch_external_checksum", "PCH_EXTSUM"),
    ("read_only", "READONLY"),
    ("read_only_direct", "READONLY_DIRECT"),
    ("recache", "RECACHE"),
    ("run_second_cpp", "CPP2"),
    ("sloppiness", "SLOPPINESS"),
    ("stats", "STATS"),
    ("temporary_dir", "TEMPDIR"),
    ("umask", "UMASK"),
];

const BOOL_KEYS: &[&str] = &[
    "compression",
    "depend_mode",
    "direct_mode",
    "disable",
    "hard_link",
    "hash_dir",
    "keep_comments_cpp",
    "pch_external_checksum",
    "read_only",
    "read_only_direct",
    "recache",
    "run_second_cpp",
    "stats",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file '{path}': {source}")]
    FileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: missing equal sign")]
    MissingEqualSign { path: PathBuf, line: usize },
    #[error("{path}:{line}: unknown configuration key: {key}")]
    UnknownKey {
        path: PathBuf,
        line: usize,
        key: String,
    },
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("unknown configuration key: {0}")]
    UnknownKeyName(String),
    #[error("failed to write configuration file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Config {
    /// Read config file(s) and environment overrides, in the documented
    /// precedence order: secondary file, then primary file, then environment.
    pub fn setup() -> Result<Config, ConfigError> {
        let mut config = Config::default();

        if let Ok(path) = std::env::var(crate::environment::KEY_CONFIGPATH) {
            config.primary_config_path = PathBuf::from(path);
        } else {
            let secondary = Path::new(SECONDARY_CONFIG_PATH);
            if secondary.is_file() {
                config.update_from_file(secondary, "secondary")?;
            }
            if let Ok(dir) = std::env::var(crate::environment::KEY_CACHE_DIR) {
                if !dir.is_empty() {
                    config.cache_dir = PathBuf::from(dir);
                    config.origins.insert("cache_dir", "environment".into());
                }
            }
            config.primary_config_path = config.cache_dir.join(CONFIG_FILE_NAME);
        }

        let primary = config.primary_config_path.clone();
        if primary.is_file() {
            config.update_from_file(&primary, "primary")?;
        } else if !config.disable {
            // First use: make sure the cache directory and an (empty)
            // primary configuration file exist, so --set-config has a
            // place to write to.
            if let Some(parent) = primary.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&primary);
        }
        config.update_from_environment()?;
        Ok(config)
    }

    pub fn primary_config_path(&self) -> &Path {
        &self.primary_config_path
    }

    pub fn temporary_dir(&self) -> PathBuf {
        if self.temporary_dir.is_empty() {
            self.cache_dir.join("tmp")
        } else {
            PathBuf::from(&self.temporary_dir)
        }
    }

    fn update_from_file(&mut self, path: &Path, origin: &str) -> Result<(), ConfigError> {
        debug!("Reading configuration file {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::FileAccess {
            path: path.to_path_buf(),
            source,
        })?;
        for (number, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(ConfigError::MissingEqualSign {
                path: path.to_path_buf(),
                line: number + 1,
            })?;
            let key = key.trim();
            let value = value.trim();
            if !KEYS.iter().any(|(name, _)| *name == key) {
                return Err(ConfigError::UnknownKey {
                    path: path.to_path_buf(),
                    line: number + 1,
                    key: key.to_string(),
                });
            }
            self.set_value(key, value)?;
            self.origins.insert(
                KEYS.iter().find(|(name, _)| *name == key).unwrap().0,
                origin.to_string(),
            );
        }
        Ok(())
    }

    fn update_from_environment(&mut self) -> Result<(), ConfigError> {
        for (key, suffix) in KEYS {
            let is_bool = BOOL_KEYS.contains(key);
            if is_bool {
                if std::env::var_os(format!("CCACHE_{suffix}")).is_some() {
                    self.set_value(key, "true")?;
                    self.origins.insert(key, "environment".into());
                }
                if std::env::var_os(format!("CCACHE_NO{suffix}")).is_some() {
                    self.set_value(key, "false")?;
                    self.origins.insert(key, "environment".into());
                }
            } else if let Ok(value) = std::env::var(format!("CCACHE_{suffix}")) {
                self.set_value(key, &value)?;
                self.origins.insert(key, "environment".into());
            }
        }
        Ok(())
    }

    fn set_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidValue {
            key: key.to_string(),
            reason,
        };
        match key {
            "base_dir" => self.base_dir = value.to_string(),
            "cache_dir" => self.cache_dir = PathBuf::from(value),
            "compiler" => self.compiler = value.to_string(),
            "compiler_check" => self.compiler_check = value.to_string(),
            "compression" => self.compression = parse_bool(value).map_err(invalid)?,
            "compression_level" => {
                self.compression_level = value.parse().map_err(|_| {
                    invalid(format!("not a compression level: {value}"))
                })?
            }
            "cpp_extension" => self.cpp_extension = value.to_string(),
            "depend_mode" => self.depend_mode = parse_bool(value).map_err(invalid)?,
            "direct_mode" => self.direct_mode = parse_bool(value).map_err(invalid)?,
            "disable" => self.disable = parse_bool(value).map_err(invalid)?,
            "extra_files_to_hash" => self.extra_files_to_hash = value.to_string(),
            "hard_link" => self.hard_link = parse_bool(value).map_err(invalid)?,
            "hash_dir" => self.hash_dir = parse_bool(value).map_err(invalid)?,
            "ignore_headers_in_manifest" => {
                self.ignore_headers_in_manifest = value.to_string()
            }
            "keep_comments_cpp" => self.keep_comments_cpp = parse_bool(value).map_err(invalid)?,
            "limit_multiple" => {
                self.limit_multiple = value
                    .parse()
                    .map_err(|_| invalid(format!("not a number: {value}")))?
            }
            "max_files" => {
                self.max_files = value
                    .parse()
                    .map_err(|_| invalid(format!("not a number: {value}")))?
            }
            "max_size" => self.max_size = parse_size_with_suffix(value).map_err(invalid)?,
            "pch_external_checksum" => {
                self.pch_external_checksum = parse_bool(value).map_err(invalid)?
            }
            "read_only" => self.read_only = parse_bool(value).map_err(invalid)?,
            "read_only_direct" => self.read_only_direct = parse_bool(value).map_err(invalid)?,
            "recache" => self.recache = parse_bool(value).map_err(invalid)?,
            "run_second_cpp" => self.run_second_cpp = parse_bool(value).map_err(invalid)?,
            "sloppiness" => self.sloppiness = Sloppiness::parse(value).map_err(invalid)?,
            "stats" => self.stats = parse_bool(value).map_err(invalid)?,
            "temporary_dir" => self.temporary_dir = value.to_string(),
            "umask" => {
                self.umask = Some(
                    u32::from_str_radix(value, 8)
                        .map_err(|_| invalid(format!("not an octal number: {value}")))?,
                )
            }
            _ => return Err(ConfigError::UnknownKeyName(key.to_string())),
        }
        Ok(())
    }

    /// Printable value of one key, for `--get-config` and `--show-config`.
    pub fn get_string_value(&self, key: &str) -> Result<String, ConfigError> {
        let value = match key {
            "base_dir" => self.base_dir.clone(),
            "cache_dir" => self.cache_dir.display().to_string(),
            "compiler" => self.compiler.clone(),
            "compiler_check" => self.compiler_check.clone(),
            "compression" => self.compression.to_string(),
            "compression_level" => self.compression_level.to_string(),
            "cpp_extension" => self.cpp_extension.clone(),
            "depend_mode" => self.depend_mode.to_string(),
            "direct_mode" => self.direct_mode.to_string(),
            "disable" => self.disable.to_string(),
            "extra_files_to_hash" => self.extra_files_to_hash.clone(),
            "hard_link" => self.hard_link.to_string(),
            "hash_dir" => self.hash_dir.to_string(),
            "ignore_headers_in_manifest" => self.ignore_headers_in_manifest.clone(),
            "keep_comments_cpp" => self.keep_comments_cpp.to_string(),
            "limit_multiple" => self.limit_multiple.to_string(),
            "max_files" => self.max_files.to_string(),
            "max_size" => format_parsable_size_with_suffix(self.max_size),
            "pch_external_checksum" => self.pch_external_checksum.to_string(),
            "read_only" => self.read_only.to_string(),
            "read_only_direct" => self.read_only_direct.to_string(),
            "recache" => self.recache.to_string(),
            "run_second_cpp" => self.run_second_cpp.to_string(),
            "sloppiness" => self.sloppiness.to_string(),
            "stats" => self.stats.to_string(),
            "temporary_dir" => self.temporary_dir.clone(),
            "umask" => match self.umask {
                Some(mask) => format!("{mask:03o}"),
                None => String::new(),
            },
            _ => return Err(ConfigError::UnknownKeyName(key.to_string())),
        };
        Ok(value)
    }

    /// Visit every key with its value and origin, in key order.
    pub fn visit_items<F>(&self, mut visitor: F)
    where
        F: FnMut(&str, &str, &str),
    {
        for (key, _) in KEYS {
            let value = self.get_string_value(key).expect("key is known");
            let origin = self
                .origins
                .get(key)
                .map(String::as_str)
                .unwrap_or("default");
            visitor(key, &value, origin);
        }
    }

    /// Set `key = value` in the configuration file at `path`, replacing an
    /// existing assignment or appending a new one. The value is validated
    /// against a scratch configuration first.
    pub fn set_value_in_file(path: &Path, key: &str, value: &str) -> Result<(), ConfigError> {
        if !KEYS.iter().any(|(name, _)| *name == key) {
            return Err(ConfigError::UnknownKeyName(key.to_string()));
        }
        Config::default().set_value(key, value)?;

        let write_error = |source| ConfigError::FileWrite {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        let old_text = std::fs::read_to_string(path).unwrap_or_default();
        let mut new_text = String::with_capacity(old_text.len());
        let mut replaced = false;
        for line in old_text.lines() {
            let is_this_key = line
                .split_once('=')
                .map(|(k, _)| k.trim() == key)
                .unwrap_or(false);
            if is_this_key {
                new_text.push_str(&format!("{key} = {value}\n"));
                replaced = true;
            } else {
                new_text.push_str(line);
                new_text.push('\n');
            }
        }
        if !replaced {
            new_text.push_str(&format!("{key} = {value}\n"));
        }
        std::fs::write(path, new_text).map_err(write_error)
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("not a boolean value: {other}")),
    }
}

/// Parse a size with an optional suffix: k/M/G/T are decimal multiples,
/// Ki/Mi/Gi/Ti binary ones. A bare number means gibibytes.
pub fn parse_size_with_suffix(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let digits_end = text
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(text.len());
    let (number_part, suffix) = text.split_at(digits_end);
    let number: f64 = number_part
        .parse()
        .map_err(|_| format!("invalid size: {text}"))?;
    let multiplier: u64 = match suffix.trim() {
        "" | "G" | "g" => 1_000_000_000,
        "k" | "K" => 1_000,
        "M" => 1_000_000,
        "T" => 1_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        other => return Err(format!("invalid size suffix: {other}")),
    };
    // A bare number defaults to G, but "0" must stay 0 to mean "no limit".
    Ok((number * multiplier as f64) as u64)
}

/// Render a size the way `parse_size_with_suffix` accepts it.
pub fn format_parsable_size_with_suffix(size: u64) -> String {
    if size >= 1_000_000_000_000 {
        format!("{:.1}T", size as f64 / 1e12)
    } else if size >= 1_000_000_000 {
        format!("{:.1}G", size as f64 / 1e9)
    } else if size >= 1_000_000 {
        format!("{:.1}M", size as f64 / 1e6)
    } else if size >= 1_000 {
        format!("{:.1}k", size as f64 / 1e3)
    } else {
        size.to_string()
    }
}

/// Human readable size for summaries.
pub fn format_human_readable_size(size: u64) -> String {
    if size >= 1_000_000_000 {
        format!("{:.1} GB", size as f64 / 1e9)
    } else if size >= 1_000_000 {
        format!("{:.1} MB", size as f64 / 1e6)
    } else {
        format!("{:.1} kB", size as f64 / 1e3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.direct_mode);
        assert!(config.run_second_cpp);
        assert!(!config.depend_mode);
        assert_eq!(config.compiler_check, "mtime");
        assert_eq!(config.max_size, 5 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ccache.conf");
        std::fs::write(
            &path,
            "# comment\n\
             max_size = 10G\n\
             direct_mode = false\n\
             sloppiness = time_macros, include_file_mtime\n",
        )
        .unwrap();

        let mut config = Config::default();
        config.update_from_file(&path, "primary").unwrap();
        assert_eq!(config.max_size, 10_000_000_000);
        assert!(!config.direct_mode);
        assert!(config.sloppiness.contains(Sloppiness::TIME_MACROS));
        assert!(config.sloppiness.contains(Sloppiness::INCLUDE_FILE_MTIME));
        assert!(!config.sloppiness.contains(Sloppiness::LOCALE));
    }

    #[test]
    fn test_unknown_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ccache.conf");
        std::fs::write(&path, "no_such_key = 1\n").unwrap();
        let mut config = Config::default();
        let error = config.update_from_file(&path, "primary").unwrap_err();
        assert!(matches!(error, ConfigError::UnknownKey { .. }));
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size_with_suffix("0").unwrap(), 0);
        assert_eq!(parse_size_with_suffix("42k").unwrap(), 42_000);
        assert_eq!(parse_size_with_suffix("5M").unwrap(), 5_000_000);
        assert_eq!(parse_size_with_suffix("2G").unwrap(), 2_000_000_000);
        assert_eq!(parse_size_with_suffix("1T").unwrap(), 1_000_000_000_000);
        assert_eq!(parse_size_with_suffix("4Ki").unwrap(), 4096);
        assert_eq!(parse_size_with_suffix("2Mi").unwrap(), 2 << 20);
        assert_eq!(parse_size_with_suffix("1Gi").unwrap(), 1 << 30);
        assert_eq!(parse_size_with_suffix("1Ti").unwrap(), 1 << 40);
        // Default suffix is G.
        assert_eq!(parse_size_with_suffix("3").unwrap(), 3_000_000_000);
        assert!(parse_size_with_suffix("1Q").is_err());
        assert!(parse_size_with_suffix("").is_err());
    }

    #[test]
    fn test_set_value_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ccache.conf");
        std::fs::write(&path, "max_size = 1G\ndirect_mode = true\n").unwrap();

        Config::set_value_in_file(&path, "max_size", "20G").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("max_size = 20G"));
        assert!(!text.contains("max_size = 1G"));
        assert!(text.contains("direct_mode = true"));

        Config::set_value_in_file(&path, "compression", "false").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("compression = false"));
    }

    #[test]
    fn test_set_value_in_file_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ccache.conf");
        assert!(Config::set_value_in_file(&path, "bogus", "1").is_err());
        assert!(Config::set_value_in_file(&path, "direct_mode", "maybe").is_err());
    }

    #[test]
    fn test_visit_items_reports_origin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ccache.conf");
        std::fs::write(&path, "max_files = 100\n").unwrap();
        let mut config = Config::default();
        config.update_from_file(&path, "primary").unwrap();

        let mut seen = BTreeMap::new();
        config.visit_items(|key, value, origin| {
            seen.insert(key.to_string(), (value.to_string(), origin.to_string()));
        });
        assert_eq!(seen["max_files"], ("100".to_string(), "primary".to_string()));
        assert_eq!(seen["direct_mode"].1, "default");
    }

    #[test]
    fn test_umask_is_octal() {
        let mut config = Config::default();
        config.set_value("umask", "022").unwrap();
        assert_eq!(config.umask, Some(0o022));
    }
}
