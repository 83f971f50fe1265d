// SPDX-License-Identifier: GPL-3.0-or-later

//! Source content hashing with detection of time-dependent macros.
//!
//! `__DATE__`, `__TIME__` and `__TIMESTAMP__` expand to values the cache
//! cannot predict, so a source or header mentioning them cannot be reused
//! from the cache unless the user opted into the `time_macros` sloppiness.

use crate::config::{Config, Sloppiness};
use crate::hashing::Hasher;
use std::path::Path;

pub const HASH_SOURCE_CODE_ERROR: u32 = 1 << 0;
pub const HASH_SOURCE_CODE_FOUND_DATE: u32 = 1 << 1;
pub const HASH_SOURCE_CODE_FOUND_TIME: u32 = 1 << 2;
pub const HASH_SOURCE_CODE_FOUND_TIMESTAMP: u32 = 1 << 3;

const TEMPORAL_MACROS: &[(&[u8], u32)] = &[
    (b"__DATE__", HASH_SOURCE_CODE_FOUND_DATE),
    (b"__TIME__", HASH_SOURCE_CODE_FOUND_TIME),
    (b"__TIMESTAMP__", HASH_SOURCE_CODE_FOUND_TIMESTAMP),
];

fn is_identifier_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

/// Scan for whole-token occurrences of the temporal macros.
pub fn check_for_temporal_macros(data: &[u8]) -> u32 {
    let mut found = 0;
    let mut index = 0;
    while index < data.len() {
        if data[index] != b'_' {
            index += 1;
            continue;
        }
        // A macro token must not be glued to surrounding identifier bytes.
        if index > 0 && is_identifier_byte(data[index - 1]) {
            // Skip over the rest of this identifier.
            while index < data.len() && is_identifier_byte(data[index]) {
                index += 1;
            }
            continue;
        }
        let mut matched = false;
        for (token, flag) in TEMPORAL_MACROS {
            if data[index..].starts_with(token) {
                let after = index + token.len();
                if after >= data.len() || !is_identifier_byte(data[after]) {
                    found |= flag;
                    index = after;
                    matched = true;
                    break;
                }
            }
        }
        if !matched {
            while index < data.len() && is_identifier_byte(data[index]) {
                index += 1;
            }
        }
    }
    found
}

/// Hash source bytes and report temporal macro findings. With the
/// `time_macros` sloppiness the findings are suppressed.
pub fn hash_source_code_data(config: &Config, hasher: &mut Hasher, data: &[u8]) -> u32 {
    hasher.update(data);
    let mut flags = check_for_temporal_macros(data);
    if config.sloppiness.contains(Sloppiness::TIME_MACROS) {
        flags = 0;
    }
    flags
}

/// Hash a source file's content; an unreadable file reports an error flag.
pub fn hash_source_code_file(config: &Config, hasher: &mut Hasher, path: &Path) -> u32 {
    match std::fs::read(path) {
        Ok(data) => hash_source_code_data(config, hasher, &data),
        Err(error) => {
            log::debug!("Failed to read {}: {error}", path.display());
            HASH_SOURCE_CODE_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_macros() {
        assert_eq!(
            check_for_temporal_macros(b"printf(__TIME__);"),
            HASH_SOURCE_CODE_FOUND_TIME
        );
        assert_eq!(
            check_for_temporal_macros(b"a = __DATE__;"),
            HASH_SOURCE_CODE_FOUND_DATE
        );
        assert_eq!(
            check_for_temporal_macros(b"__TIMESTAMP__"),
            HASH_SOURCE_CODE_FOUND_TIMESTAMP
        );
        assert_eq!(
            check_for_temporal_macros(b"__DATE__ __TIME__"),
            HASH_SOURCE_CODE_FOUND_DATE | HASH_SOURCE_CODE_FOUND_TIME
        );
    }

    #[test]
    fn test_ignores_non_token_occurrences() {
        assert_eq!(check_for_temporal_macros(b"MY__TIME__"), 0);
        assert_eq!(check_for_temporal_macros(b"__TIME__S"), 0);
        assert_eq!(check_for_temporal_macros(b"x__TIME__y"), 0);
        assert_eq!(check_for_temporal_macros(b"int main() { return 0; }"), 0);
        assert_eq!(check_for_temporal_macros(b"__TIME"), 0);
    }

    #[test]
    fn test_macro_at_buffer_edges() {
        assert_eq!(
            check_for_temporal_macros(b"__TIME__"),
            HASH_SOURCE_CODE_FOUND_TIME
        );
        assert_eq!(
            check_for_temporal_macros(b"(__TIME__)"),
            HASH_SOURCE_CODE_FOUND_TIME
        );
    }

    #[test]
    fn test_sloppiness_suppresses_findings() {
        let mut config = Config::default();
        let mut hasher = Hasher::new();
        assert_ne!(
            hash_source_code_data(&config, &mut hasher, b"__TIME__"),
            0
        );
        config.sloppiness.insert(Sloppiness::TIME_MACROS);
        let mut hasher = Hasher::new();
        assert_eq!(
            hash_source_code_data(&config, &mut hasher, b"__TIME__"),
            0
        );
    }

    #[test]
    fn test_content_still_hashed() {
        let config = Config::default();
        let mut a = Hasher::new();
        hash_source_code_data(&config, &mut a, b"int x;");
        let mut b = Hasher::new();
        hash_source_code_data(&config, &mut b, b"int y;");
        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let config = Config::default();
        let mut hasher = Hasher::new();
        let flags =
            hash_source_code_file(&config, &mut hasher, Path::new("/nonexistent/file.c"));
        assert_eq!(flags, HASH_SOURCE_CODE_ERROR);
    }
}
