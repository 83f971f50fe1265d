// SPDX-License-Identifier: GPL-3.0-or-later

//! The manifest store.
//!
//! A manifest maps one direct-mode key to a list of candidate entries, each
//! pairing an observed include-file set with a result digest. Lookup walks
//! the candidates in insertion order and accepts the first whose include
//! files all still match what was recorded, either by a stat shortcut or by
//! rehashing the content.
//!
//! Payload layout after the common header: a creation timestamp, a string
//! table of paths, a table of include-file records (path index, content
//! digest, size, mtime, ctime) and a table of (file-record index list,
//! result digest) entries, all length-prefixed.

use super::header::{self, MANIFEST_MAGIC, MANIFEST_VERSION};
use super::wire::{self, Reader, WireError};
use super::FileLock;
use crate::config::{Config, Sloppiness};
use crate::context::IncludedFile;
use crate::digest::{Digest, DIGEST_SIZE};
use crate::hashing::source::hash_source_code_file;
use crate::hashing::Hasher;
use chrono::{TimeZone, Utc};
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

/// Candidate entries beyond this bound are evicted, oldest first.
const MAX_MANIFEST_ENTRIES: usize = 1500;
/// Bound on distinct include-file records, to keep degenerate manifests
/// from growing without limit.
const MAX_FILE_INFO_ENTRIES: usize = 10000;

/// Timestamp fields hold this when the writer chose not to record them.
const NO_TIMESTAMP: i64 = -1;

#[derive(Debug, Clone, PartialEq)]
struct FileInfo {
    /// Index into the path table.
    path_index: u32,
    digest: Digest,
    size: u64,
    mtime: i64,
    ctime: i64,
}

#[derive(Debug, Clone, PartialEq)]
struct ResultEntry {
    file_info_indexes: Vec<u32>,
    digest: Digest,
}

#[derive(Debug, Default, Clone)]
struct ManifestData {
    creation_time: i64,
    paths: Vec<String>,
    file_infos: Vec<FileInfo>,
    results: Vec<ResultEntry>,
}

impl ManifestData {
    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        wire::put_i64(&mut out, self.creation_time);
        wire::put_u32(&mut out, self.paths.len() as u32);
        for path in &self.paths {
            wire::put_u16(&mut out, path.len() as u16);
            out.extend_from_slice(path.as_bytes());
        }
        wire::put_u32(&mut out, self.file_infos.len() as u32);
        for info in &self.file_infos {
            wire::put_u32(&mut out, info.path_index);
            out.extend_from_slice(info.digest.as_bytes());
            wire::put_u64(&mut out, info.size);
            wire::put_i64(&mut out, info.mtime);
            wire::put_i64(&mut out, info.ctime);
        }
        wire::put_u32(&mut out, self.results.len() as u32);
        for result in &self.results {
            wire::put_u32(&mut out, result.file_info_indexes.len() as u32);
            for index in &result.file_info_indexes {
                wire::put_u32(&mut out, *index);
            }
            out.extend_from_slice(result.digest.as_bytes());
        }
        out
    }

    fn deserialize(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(payload);
        let creation_time = reader.i64()?;

        let path_count = reader.u32()? as usize;
        let mut paths = Vec::with_capacity(path_count.min(MAX_FILE_INFO_ENTRIES));
        for _ in 0..path_count {
            let length = reader.u16()? as usize;
            let bytes = reader.take(length)?;
            let path = std::str::from_utf8(bytes)
                .map_err(|_| WireError::Invalid("path is not UTF-8"))?;
            paths.push(path.to_string());
        }

        let info_count = reader.u32()? as usize;
        let mut file_infos = Vec::with_capacity(info_count.min(MAX_FILE_INFO_ENTRIES));
        for _ in 0..info_count {
            let path_index = reader.u32()?;
            if path_index as usize >= paths.len() {
                return Err(WireError::Invalid("path index out of range"));
            }
            let digest = Digest::from_bytes(reader.take(DIGEST_SIZE)?.try_into().unwrap());
            file_infos.push(FileInfo {
                path_index,
                digest,
                size: reader.u64()?,
                mtime: reader.i64()?,
                ctime: reader.i64()?,
            });
        }

        let result_count = reader.u32()? as usize;
        let mut results = Vec::with_capacity(result_count.min(MAX_MANIFEST_ENTRIES));
        for _ in 0..result_count {
            let index_count = reader.u32()? as usize;
            let mut file_info_indexes = Vec::with_capacity(index_count.min(MAX_FILE_INFO_ENTRIES));
            for _ in 0..index_count {
                let index = reader.u32()?;
                if index as usize >= file_infos.len() {
                    return Err(WireError::Invalid("file info index out of range"));
                }
                file_info_indexes.push(index);
            }
            let digest = Digest::from_bytes(reader.take(DIGEST_SIZE)?.try_into().unwrap());
            results.push(ResultEntry {
                file_info_indexes,
                digest,
            });
        }

        if !reader.is_at_end() {
            return Err(WireError::Invalid("trailing bytes"));
        }
        Ok(ManifestData {
            creation_time,
            paths,
            file_infos,
            results,
        })
    }
}

/// Look up a result digest: the first candidate whose include files all
/// still match wins. Any read or parse problem reads as a miss.
pub fn get(config: &Config, path: &Path) -> Option<Digest> {
    let payload = match header::read_entry_file(path, MANIFEST_MAGIC, MANIFEST_VERSION) {
        Ok(payload) => payload,
        Err(error) => {
            debug!("No usable manifest at {}: {error}", path.display());
            return None;
        }
    };
    let data = match ManifestData::deserialize(&payload) {
        Ok(data) => data,
        Err(error) => {
            debug!("Corrupt manifest {}: {error}", path.display());
            return None;
        }
    };

    // Hash and stat outcomes are shared between candidates referencing the
    // same file.
    let mut hashed: HashMap<u32, Option<Digest>> = HashMap::new();

    for result in &data.results {
        let all_match = result.file_info_indexes.iter().all(|index| {
            let info = &data.file_infos[*index as usize];
            file_matches(config, &data.paths[info.path_index as usize], info, &mut hashed, *index)
        });
        if all_match {
            return Some(result.digest);
        }
    }
    None
}

fn file_matches(
    config: &Config,
    path: &str,
    info: &FileInfo,
    hashed: &mut HashMap<u32, Option<Digest>>,
    index: u32,
) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };

    if config.sloppiness.contains(Sloppiness::FILE_STAT_MATCHES)
        && info.mtime != NO_TIMESTAMP
        && info.size == metadata.len()
    {
        let (mtime, ctime) = file_times(&metadata);
        let ctime_ok = config.sloppiness.contains(Sloppiness::INCLUDE_FILE_CTIME)
            || info.ctime == ctime;
        if info.mtime == mtime && ctime_ok {
            return true;
        }
    }

    let digest = hashed
        .entry(index)
        .or_insert_with(|| {
            let mut hasher = Hasher::new();
            let flags = hash_source_code_file(config, &mut hasher, Path::new(path));
            if flags != 0 {
                debug!("Include file {path} can no longer be trusted");
                None
            } else {
                Some(hasher.finalize())
            }
        });
    *digest == Some(info.digest)
}

/// Append a candidate entry mapping `included_files` to `result_digest`.
/// Existing entries are preserved; the oldest are evicted past the bound.
pub fn put(
    config: &Config,
    path: &Path,
    result_digest: Digest,
    included_files: &BTreeMap<String, IncludedFile>,
    save_timestamp: bool,
) -> bool {
    let _lock = match FileLock::acquire(path) {
        Ok(lock) => lock,
        Err(error) => {
            debug!("Failed to lock manifest {}: {error}", path.display());
            return false;
        }
    };

    let mut data = match header::read_entry_file(path, MANIFEST_MAGIC, MANIFEST_VERSION) {
        Ok(payload) => ManifestData::deserialize(&payload).unwrap_or_else(|error| {
            debug!("Replacing corrupt manifest {}: {error}", path.display());
            ManifestData::default()
        }),
        Err(_) => ManifestData::default(),
    };
    if data.creation_time == 0 {
        data.creation_time = now_seconds();
    }

    let mut path_indexes: HashMap<String, u32> = data
        .paths
        .iter()
        .enumerate()
        .map(|(index, path)| (path.clone(), index as u32))
        .collect();

    let mut file_info_indexes = Vec::with_capacity(included_files.len());
    for (file_path, record) in included_files {
        let path_index = *path_indexes.entry(file_path.clone()).or_insert_with(|| {
            data.paths.push(file_path.clone());
            (data.paths.len() - 1) as u32
        });
        let (mtime, ctime) = if save_timestamp {
            (record.mtime, record.ctime)
        } else {
            (NO_TIMESTAMP, NO_TIMESTAMP)
        };
        let info = FileInfo {
            path_index,
            digest: record.digest,
            size: record.size,
            mtime,
            ctime,
        };
        let index = match data.file_infos.iter().position(|existing| *existing == info) {
            Some(index) => index as u32,
            None => {
                data.file_infos.push(info);
                (data.file_infos.len() - 1) as u32
            }
        };
        file_info_indexes.push(index);
    }

    data.results.push(ResultEntry {
        file_info_indexes,
        digest: result_digest,
    });

    if data.results.len() > MAX_MANIFEST_ENTRIES || data.file_infos.len() > MAX_FILE_INFO_ENTRIES
    {
        evict_oldest(&mut data);
    }

    let payload = data.serialize();
    match header::write_entry_file(path, MANIFEST_MAGIC, MANIFEST_VERSION, config, &payload) {
        Ok(()) => true,
        Err(error) => {
            debug!("Failed to write manifest {}: {error}", path.display());
            false
        }
    }
}

/// Drop the oldest half of the candidates and garbage collect the tables.
fn evict_oldest(data: &mut ManifestData) {
    let keep_from = data.results.len() / 2;
    let kept: Vec<ResultEntry> = data.results.split_off(keep_from);

    let mut new_data = ManifestData {
        creation_time: now_seconds(),
        ..Default::default()
    };
    let mut path_remap: HashMap<u32, u32> = HashMap::new();
    let mut info_remap: HashMap<u32, u32> = HashMap::new();

    for result in kept {
        let mut new_indexes = Vec::with_capacity(result.file_info_indexes.len());
        for old_index in result.file_info_indexes {
            let new_index = *info_remap.entry(old_index).or_insert_with(|| {
                let old_info = &data.file_infos[old_index as usize];
                let new_path_index =
                    *path_remap.entry(old_info.path_index).or_insert_with(|| {
                        new_data
                            .paths
                            .push(data.paths[old_info.path_index as usize].clone());
                        (new_data.paths.len() - 1) as u32
                    });
                new_data.file_infos.push(FileInfo {
                    path_index: new_path_index,
                    ..old_info.clone()
                });
                (new_data.file_infos.len() - 1) as u32
            });
            new_indexes.push(new_index);
        }
        new_data.results.push(ResultEntry {
            file_info_indexes: new_indexes,
            digest: result.digest,
        });
    }
    *data = new_data;
}

/// Print a manifest in text form, for `--dump-manifest`.
pub fn dump(path: &Path, out: &mut dyn Write) -> anyhow::Result<()> {
    let payload = header::read_entry_file(path, MANIFEST_MAGIC, MANIFEST_VERSION)?;
    let data = ManifestData::deserialize(&payload)
        .map_err(|error| anyhow::anyhow!("corrupt manifest: {error}"))?;

    writeln!(out, "Magic: cCmF")?;
    writeln!(out, "Version: {MANIFEST_VERSION}")?;
    let created = Utc
        .timestamp_opt(data.creation_time, 0)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| data.creation_time.to_string());
    writeln!(out, "Created: {created}")?;
    writeln!(out, "File paths ({}):", data.paths.len())?;
    for (index, file_path) in data.paths.iter().enumerate() {
        writeln!(out, "  {index}: {file_path}")?;
    }
    writeln!(out, "File infos ({}):", data.file_infos.len())?;
    for (index, info) in data.file_infos.iter().enumerate() {
        writeln!(out, "  {index}:")?;
        writeln!(out, "    Path index: {}", info.path_index)?;
        writeln!(out, "    Hash: {}", info.digest)?;
        writeln!(out, "    Size: {}", info.size)?;
        writeln!(out, "    Mtime: {}", info.mtime)?;
        writeln!(out, "    Ctime: {}", info.ctime)?;
    }
    writeln!(out, "Results ({}):", data.results.len())?;
    for (index, result) in data.results.iter().enumerate() {
        writeln!(out, "  {index}:")?;
        let indexes: Vec<String> = result
            .file_info_indexes
            .iter()
            .map(u32::to_string)
            .collect();
        writeln!(out, "    File info indexes: {}", indexes.join(" "))?;
        writeln!(out, "    Name: {}", result.digest)?;
    }
    Ok(())
}

fn file_times(metadata: &std::fs::Metadata) -> (i64, i64) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        (metadata.mtime(), metadata.ctime())
    }
    #[cfg(not(unix))]
    {
        (NO_TIMESTAMP, NO_TIMESTAMP)
    }
}

fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
