// SPDX-License-Identifier: GPL-3.0-or-later

//! The streaming hasher behind every cache key.
//!
//! All hashing goes through labeled delimiters: before each logically
//! distinct input a caller absorbs a short label, so that a filename and a
//! flag value that happen to share bytes can never produce the same byte
//! stream. The hasher is cheap to fork, which lets the orchestrator share
//! the common prefix between the direct and preprocessor hashes.

pub mod common;
pub mod inclusions;
pub mod source;

use crate::digest::{Digest, DIGEST_SIZE};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Identifies the current version of the hash sum. Changing this string
/// makes every previously stored cache entry unreachable, which is the
/// intended way to retire an incompatible cache format.
pub const HASH_PREFIX: &str = "3";

/// Separator absorbed before each label. Labels never contain NUL, and the
/// trailing NUL after the label terminates it, so no label+payload sequence
/// is a prefix of another.
const DELIMITER_TOKEN: &[u8] = b"\x00cCaChE";

/// A streaming hash producing 20-byte digests.
#[derive(Clone)]
pub struct Hasher {
    inner: blake3::Hasher,
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher {
    pub fn new() -> Self {
        Hasher {
            inner: blake3::Hasher::new(),
        }
    }

    /// Absorb raw bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn update_str(&mut self, text: &str) {
        self.update(text.as_bytes());
    }

    pub fn update_int(&mut self, value: i64) {
        self.update(&value.to_le_bytes());
    }

    /// Absorb a label marking the start of a logically distinct input.
    ///
    /// Labels must not contain NUL bytes.
    pub fn delimiter(&mut self, label: &str) {
        debug_assert!(!label.as_bytes().contains(&0));
        self.inner.update(DELIMITER_TOKEN);
        self.inner.update(label.as_bytes());
        self.inner.update(&[0]);
    }

    /// Fork the hasher so two hashes can share an absorbed prefix.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    pub fn finalize(&self) -> Digest {
        let mut out = [0u8; DIGEST_SIZE];
        self.inner.finalize_xof().fill(&mut out);
        Digest::from_bytes(out)
    }

    /// Absorb the entire content of a file.
    pub fn hash_file(&mut self, path: &Path) -> io::Result<()> {
        let file = File::open(path)?;
        self.hash_reader(file)
    }

    /// Absorb everything a reader yields.
    pub fn hash_reader<R: Read>(&mut self, mut reader: R) -> io::Result<()> {
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                return Ok(());
            }
            self.update(&buffer[..n]);
        }
    }
}

/// Short integrity check over a byte slice, used for per-entry checksums in
/// cache files. Not a content address; collisions only risk a false corrupt
/// verdict, never a false hit.
pub fn checksum64(bytes: &[u8]) -> u64 {
    let hash = blake3::hash(bytes);
    u64::from_be_bytes(hash.as_bytes()[..8].try_into().expect("8 byte prefix"))
}
