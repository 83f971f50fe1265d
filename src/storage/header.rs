// SPDX-License-Identifier: GPL-3.0-or-later

//! The fixed-width header shared by manifest and result files.
//!
//! Layout: magic (4 bytes), format version (1 byte), compression type
//! (1 byte), compression level (1 signed byte), uncompressed content size
//! (8 bytes, big-endian). The header is followed by an 8-byte checksum of
//! the uncompressed payload; readers refuse the file when it does not match.

use super::compress::{self, CompressionError, CompressionType};
use crate::config::Config;
use crate::hashing::checksum64;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MANIFEST_MAGIC: [u8; 4] = *b"cCmF";
pub const MANIFEST_VERSION: u8 = 2;
pub const RESULT_MAGIC: [u8; 4] = *b"cCrS";
pub const RESULT_VERSION: u8 = 1;

pub const HEADER_SIZE: usize = 4 + 1 + 1 + 1 + 8;
const CHECKSUM_SIZE: usize = 8;

#[derive(Debug, Clone)]
pub struct CommonHeader {
    pub magic: [u8; 4],
    pub version: u8,
    pub compression_type: CompressionType,
    pub compression_level: i8,
    pub content_size: u64,
}

#[derive(Debug, Error)]
pub enum EntryFileError {
    #[error("failed to read cache file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("'{path}' is too short to hold a header")]
    Truncated { path: PathBuf },
    #[error("bad magic in '{path}'")]
    BadMagic { path: PathBuf },
    #[error("unknown format version {version} in '{path}'")]
    BadVersion { path: PathBuf, version: u8 },
    #[error("unknown compression type {value} in '{path}'")]
    BadCompressionType { path: PathBuf, value: u8 },
    #[error("checksum mismatch in '{path}'")]
    BadChecksum { path: PathBuf },
    #[error("'{path}': {source}")]
    Payload {
        path: PathBuf,
        #[source]
        source: CompressionError,
    },
}

impl CommonHeader {
    fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic);
        out[4] = self.version;
        out[5] = self.compression_type.as_byte();
        out[6] = self.compression_level as u8;
        out[7..15].copy_from_slice(&self.content_size.to_be_bytes());
        out
    }

    fn parse(path: &Path, bytes: &[u8]) -> Result<Self, EntryFileError> {
        if bytes.len() < HEADER_SIZE {
            return Err(EntryFileError::Truncated {
                path: path.to_path_buf(),
            });
        }
        let compression_type = CompressionType::from_byte(bytes[5]).ok_or_else(|| {
            EntryFileError::BadCompressionType {
                path: path.to_path_buf(),
                value: bytes[5],
            }
        })?;
        Ok(CommonHeader {
            magic: bytes[0..4].try_into().unwrap(),
            version: bytes[4],
            compression_type,
            compression_level: bytes[6] as i8,
            content_size: u64::from_be_bytes(bytes[7..15].try_into().unwrap()),
        })
    }
}

/// Serialize a payload into header + checksum + (possibly compressed) body
/// and write it atomically.
pub fn write_entry_file(
    path: &Path,
    magic: [u8; 4],
    version: u8,
    config: &Config,
    payload: &[u8],
) -> Result<(), EntryFileError> {
    let codec = CompressionType::from_config(config.compression);
    write_entry_file_with(path, magic, version, codec, config.compression_level, payload)
}

/// Like `write_entry_file` with an explicit codec, used by `--recompress`.
pub fn write_entry_file_with(
    path: &Path,
    magic: [u8; 4],
    version: u8,
    codec: CompressionType,
    level: i8,
    payload: &[u8],
) -> Result<(), EntryFileError> {
    let header = CommonHeader {
        magic,
        version,
        compression_type: codec,
        compression_level: level,
        content_size: payload.len() as u64,
    };
    let body = compress::compress(payload, codec, level).map_err(|source| {
        EntryFileError::Payload {
            path: path.to_path_buf(),
            source,
        }
    })?;

    let mut out = Vec::with_capacity(HEADER_SIZE + CHECKSUM_SIZE + body.len());
    out.extend_from_slice(&header.serialize());
    out.extend_from_slice(&checksum64(payload).to_be_bytes());
    out.extend_from_slice(&body);
    super::atomic_write(path, &out).map_err(|source| EntryFileError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Read, verify and decompress a cache file; returns the payload.
pub fn read_entry_file(
    path: &Path,
    magic: [u8; 4],
    version: u8,
) -> Result<Vec<u8>, EntryFileError> {
    let bytes = fs::read(path).map_err(|source| EntryFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let header = CommonHeader::parse(path, &bytes)?;
    if header.magic != magic {
        return Err(EntryFileError::BadMagic {
            path: path.to_path_buf(),
        });
    }
    if header.version != version {
        return Err(EntryFileError::BadVersion {
            path: path.to_path_buf(),
            version: header.version,
        });
    }
    if bytes.len() < HEADER_SIZE + CHECKSUM_SIZE {
        return Err(EntryFileError::Truncated {
            path: path.to_path_buf(),
        });
    }
    let stored_checksum = u64::from_be_bytes(
        bytes[HEADER_SIZE..HEADER_SIZE + CHECKSUM_SIZE]
            .try_into()
            .unwrap(),
    );
    let payload = compress::decompress(
        &bytes[HEADER_SIZE + CHECKSUM_SIZE..],
        header.compression_type,
        header.content_size,
    )
    .map_err(|source| EntryFileError::Payload {
        path: path.to_path_buf(),
        source,
    })?;
    if checksum64(&payload) != stored_checksum {
        return Err(EntryFileError::BadChecksum {
            path: path.to_path_buf(),
        });
    }
    Ok(payload)
}

/// Header plus on-disk size, for compression statistics and recompression.
pub fn read_header_info(path: &Path) -> Result<(CommonHeader, u64), EntryFileError> {
    let bytes = fs::read(path).map_err(|source| EntryFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let header = CommonHeader::parse(path, &bytes)?;
    Ok((header, bytes.len() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_compression(on: bool) -> Config {
        let mut config = Config::default();
        config.compression = on;
        config
    }

    #[test]
    fn test_round_trip_uncompressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.manifest");
        let payload = b"manifest payload bytes".to_vec();
        write_entry_file(
            &path,
            MANIFEST_MAGIC,
            MANIFEST_VERSION,
            &config_with_compression(false),
            &payload,
        )
        .unwrap();

        let restored = read_entry_file(&path, MANIFEST_MAGIC, MANIFEST_VERSION).unwrap();
        assert_eq!(restored, payload);

        let (header, _) = read_header_info(&path).unwrap();
        assert_eq!(header.compression_type, CompressionType::None);
        assert_eq!(header.content_size, payload.len() as u64);
    }

    #[test]
    fn test_round_trip_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.result");
        let payload = vec![0u8; 32 * 1024];
        write_entry_file(
            &path,
            RESULT_MAGIC,
            RESULT_VERSION,
            &config_with_compression(true),
            &payload,
        )
        .unwrap();

        let on_disk = fs::metadata(&path).unwrap().len();
        assert!(on_disk < payload.len() as u64);
        let restored = read_entry_file(&path, RESULT_MAGIC, RESULT_VERSION).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_wrong_magic_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.result");
        write_entry_file(
            &path,
            RESULT_MAGIC,
            RESULT_VERSION,
            &config_with_compression(false),
            b"data",
        )
        .unwrap();
        let error = read_entry_file(&path, MANIFEST_MAGIC, MANIFEST_VERSION).unwrap_err();
        assert!(matches!(error, EntryFileError::BadMagic { .. }));
    }

    #[test]
    fn test_corrupt_payload_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.manifest");
        write_entry_file(
            &path,
            MANIFEST_MAGIC,
            MANIFEST_VERSION,
            &config_with_compression(false),
            b"some payload",
        )
        .unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let error = read_entry_file(&path, MANIFEST_MAGIC, MANIFEST_VERSION).unwrap_err();
        assert!(matches!(error, EntryFileError::BadChecksum { .. }));
    }

    #[test]
    fn test_truncated_file_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.manifest");
        fs::write(&path, b"cCmF").unwrap();
        let error = read_entry_file(&path, MANIFEST_MAGIC, MANIFEST_VERSION).unwrap_err();
        assert!(matches!(error, EntryFileError::Truncated { .. }));
    }
}
