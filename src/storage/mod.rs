// SPDX-License-Identifier: GPL-3.0-or-later

//! On-disk cache layout and shared file plumbing.
//!
//! Cache entries live in a two-level directory tree keyed by the first two
//! hex digits of their digest. Every write goes through a sibling temporary
//! file followed by an atomic rename, so readers observe either the previous
//! or the next committed version, never a torn one. Writers that must
//! read-modify-write serialize on an advisory lock next to the target file.

pub mod compress;
pub mod header;
pub mod manifest;
pub mod result;

use crate::config::Config;
use crate::digest::Digest;
use fs2::FileExt;
use log::debug;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// The two kinds of cache entry files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Manifest,
    Result,
}

impl EntryKind {
    pub fn extension(self) -> &'static str {
        match self {
            EntryKind::Manifest => "manifest",
            EntryKind::Result => "result",
        }
    }
}

/// `<cache_dir>/<hex0>/<hex1>/<rest>.<kind>` for a digest.
pub fn cache_entry_path(config: &Config, digest: &Digest, kind: EntryKind) -> PathBuf {
    let hex = digest.to_hex();
    config
        .cache_dir
        .join(&hex[0..1])
        .join(&hex[1..2])
        .join(format!("{}.{}", &hex[2..], kind.extension()))
}

/// The first-level directory holding an entry, which also owns the stats
/// file the entry's size is accounted in.
pub fn first_level_dir(config: &Config, digest: &Digest) -> PathBuf {
    let hex = digest.to_hex();
    config.cache_dir.join(&hex[0..1])
}

pub fn stats_file_for_digest(config: &Config, digest: &Digest) -> PathBuf {
    first_level_dir(config, digest).join("stats")
}

/// Apparent size of a file on disk, in bytes.
pub fn size_on_disk(metadata: &fs::Metadata) -> u64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        metadata.blocks() * 512
    }
    #[cfg(not(unix))]
    {
        metadata.len()
    }
}

/// Write `bytes` to `path` atomically, creating parent directories.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.persist(path).map_err(|error| error.error)?;
    Ok(())
}

/// An exclusive advisory lock on `<path>.lock`, released on drop.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Block until the lock guarding `path` is held.
    pub fn acquire(path: &Path) -> io::Result<FileLock> {
        let lock_path = lock_path_for(path);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

const CACHEDIR_TAG_CONTENT: &str = "Signature: 8a477f597d28d172789f06886806bc55\n\
     # This file is a cache directory tag created by ccache.\n\
     # For information about cache directory tags, see:\n\
     #\thttp://www.brynosaurus.com/cachedir/\n";

/// Make sure `dir` carries a `CACHEDIR.TAG` so backup tools skip it.
pub fn create_cachedir_tag(dir: &Path) -> io::Result<()> {
    let path = dir.join("CACHEDIR.TAG");
    match fs::symlink_metadata(&path) {
        Ok(metadata) if metadata.is_file() => return Ok(()),
        Ok(_) => return Err(io::Error::new(io::ErrorKind::AlreadyExists, "not a file")),
        Err(_) => {}
    }
    fs::create_dir_all(dir)?;
    fs::write(&path, CACHEDIR_TAG_CONTENT)
}

/// How often the internal temporary directory is scanned for orphans.
const TEMPDIR_CLEANUP_INTERVAL: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// Remove orphaned temporary files left behind by killed invocations. The
/// scan runs at most once per interval, tracked by the cache directory's
/// mtime.
pub fn clean_up_internal_tempdir(config: &Config) {
    let now = SystemTime::now();
    let cache_dir_mtime = fs::metadata(&config.cache_dir)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH);
    if cache_dir_mtime + TEMPDIR_CLEANUP_INTERVAL >= now {
        return;
    }
    let _ = touch(&config.cache_dir);

    let temp_dir = config.temporary_dir();
    let Ok(entries) = fs::read_dir(&temp_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = fs::symlink_metadata(&path) else {
            continue;
        };
        let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if mtime + TEMPDIR_CLEANUP_INTERVAL < now {
            debug!("Removing orphan temporary file {}", path.display());
            let _ = fs::remove_file(&path);
        }
    }
}

fn touch(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().read(true).open(path)?;
    file.set_times(fs::FileTimes::new().set_modified(SystemTime::now()))
}

/// Little-endian free, big-endian only: the wire helpers shared by the
/// manifest and result formats.
pub(crate) mod wire {
    use thiserror::Error;

    #[derive(Debug, Error, PartialEq)]
    pub enum WireError {
        #[error("unexpected end of data")]
        Truncated,
        #[error("invalid field value: {0}")]
        Invalid(&'static str),
    }

    pub struct Reader<'a> {
        buffer: &'a [u8],
        position: usize,
    }

    impl<'a> Reader<'a> {
        pub fn new(buffer: &'a [u8]) -> Self {
            Reader {
                buffer,
                position: 0,
            }
        }

        pub fn take(&mut self, count: usize) -> Result<&'a [u8], WireError> {
            if self.position + count > self.buffer.len() {
                return Err(WireError::Truncated);
            }
            let slice = &self.buffer[self.position..self.position + count];
            self.position += count;
            Ok(slice)
        }

        pub fn u8(&mut self) -> Result<u8, WireError> {
            Ok(self.take(1)?[0])
        }

        pub fn u16(&mut self) -> Result<u16, WireError> {
            Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
        }

        pub fn u32(&mut self) -> Result<u32, WireError> {
            Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
        }

        pub fn u64(&mut self) -> Result<u64, WireError> {
            Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
        }

        pub fn i64(&mut self) -> Result<i64, WireError> {
            Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
        }

        pub fn is_at_end(&self) -> bool {
            self.position == self.buffer.len()
        }
    }

    pub fn put_u8(out: &mut Vec<u8>, value: u8) {
        out.push(value);
    }

    pub fn put_u16(out: &mut Vec<u8>, value: u16) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32(out: &mut Vec<u8>, value: u32) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(out: &mut Vec<u8>, value: u64) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i64(out: &mut Vec<u8>, value: i64) {
        out.extend_from_slice(&value.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn test_digest() -> Digest {
        Digest::from_str("4a5c6d7e8f000102030405060708090a0b0c0d0e").unwrap()
    }

    #[test]
    fn test_entry_path_sharding() {
        let mut config = Config::default();
        config.cache_dir = PathBuf::from("/cache");
        let path = cache_entry_path(&config, &test_digest(), EntryKind::Manifest);
        assert_eq!(
            path,
            PathBuf::from("/cache/4/a/5c6d7e8f000102030405060708090a0b0c0d0e.manifest")
        );
        let path = cache_entry_path(&config, &test_digest(), EntryKind::Result);
        assert!(path.to_string_lossy().ends_with(".result"));
        assert_eq!(stats_file_for_digest(&config, &test_digest()), PathBuf::from("/cache/4/stats"));
    }

    #[test]
    fn test_atomic_write_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/file");
        atomic_write(&path, b"payload").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"payload");
    }

    #[test]
    fn test_atomic_write_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        atomic_write(&path, b"old").unwrap();
        atomic_write(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_cachedir_tag() {
        let dir = tempfile::tempdir().unwrap();
        create_cachedir_tag(dir.path()).unwrap();
        let content = fs::read_to_string(dir.path().join("CACHEDIR.TAG")).unwrap();
        assert!(content.starts_with("Signature: 8a477f597d28d172789f06886806bc55\n"));
        // Second call is a no-op.
        create_cachedir_tag(dir.path()).unwrap();
    }

    #[test]
    fn test_file_lock_serializes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("entry.manifest");
        let lock = FileLock::acquire(&target).unwrap();
        assert!(dir.path().join("entry.manifest.lock").exists());
        drop(lock);
        // Re-acquirable after release.
        let _lock = FileLock::acquire(&target).unwrap();
    }

    #[test]
    fn test_wire_round_trip() {
        use wire::*;
        let mut out = Vec::new();
        put_u8(&mut out, 7);
        put_u16(&mut out, 300);
        put_u32(&mut out, 70_000);
        put_u64(&mut out, 1 << 40);
        put_i64(&mut out, -12);
        out.extend_from_slice(b"tail");

        let mut reader = Reader::new(&out);
        assert_eq!(reader.u8().unwrap(), 7);
        assert_eq!(reader.u16().unwrap(), 300);
        assert_eq!(reader.u32().unwrap(), 70_000);
        assert_eq!(reader.u64().unwrap(), 1 << 40);
        assert_eq!(reader.i64().unwrap(), -12);
        assert_eq!(reader.take(4).unwrap(), b"tail");
        assert!(reader.is_at_end());
        assert_eq!(reader.u8(), Err(WireError::Truncated));
    }
}
