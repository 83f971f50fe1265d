// SPDX-License-Identifier: GPL-3.0-or-later

//! Compression codec wrapper for cache entry payloads.

use std::io;
use thiserror::Error;

/// Compression applied to the payload of a cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Zstd,
}

impl CompressionType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Zstd),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Zstd => 1,
        }
    }

    /// Codec selected by the configuration.
    pub fn from_config(compression: bool) -> Self {
        if compression {
            CompressionType::Zstd
        } else {
            CompressionType::None
        }
    }
}

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("failed to compress payload: {0}")]
    Compress(#[source] io::Error),
    #[error("failed to decompress payload: {0}")]
    Decompress(#[source] io::Error),
    #[error("decompressed size {actual} does not match header size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

pub fn compress(
    payload: &[u8],
    codec: CompressionType,
    level: i8,
) -> Result<Vec<u8>, CompressionError> {
    match codec {
        CompressionType::None => Ok(payload.to_vec()),
        CompressionType::Zstd => {
            zstd::encode_all(payload, level as i32).map_err(CompressionError::Compress)
        }
    }
}

pub fn decompress(
    data: &[u8],
    codec: CompressionType,
    expected_size: u64,
) -> Result<Vec<u8>, CompressionError> {
    let payload = match codec {
        CompressionType::None => data.to_vec(),
        CompressionType::Zstd => zstd::decode_all(data).map_err(CompressionError::Decompress)?,
    };
    if payload.len() as u64 != expected_size {
        return Err(CompressionError::SizeMismatch {
            expected: expected_size,
            actual: payload.len() as u64,
        });
    }
    Ok(payload)
}
