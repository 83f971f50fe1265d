// SPDX-License-Identifier: GPL-3.0-or-later

//! The content address used throughout the cache.
//!
//! A digest is a fixed 160-bit byte string. Its printable form is lowercase
//! hex, which is also the on-disk name of manifest and result files.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Width of a digest in bytes.
pub const DIGEST_SIZE: usize = 20;

/// A 20-byte content address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    pub fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Digest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Lowercase hex form, 40 characters.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(DIGEST_SIZE * 2);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseDigestError {
    #[error("digest must be {} hex characters, got {0}", DIGEST_SIZE * 2)]
    BadLength(usize),
    #[error("digest contains a non-hex character")]
    BadCharacter,
}

impl FromStr for Digest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_SIZE * 2 {
            return Err(ParseDigestError::BadLength(s.len()));
        }
        let mut bytes = [0u8; DIGEST_SIZE];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let text = std::str::from_utf8(chunk).map_err(|_| ParseDigestError::BadCharacter)?;
            bytes[i] = u8::from_str_radix(text, 16).map_err(|_| ParseDigestError::BadCharacter)?;
        }
        Ok(Digest(bytes))
    }
}
