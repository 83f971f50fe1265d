// SPDX-License-Identifier: GPL-3.0-or-later

//! The result store.
//!
//! A result file bundles all compiler outputs of one compilation: the
//! object, captured stderr, and whichever side files the invocation
//! produced. Entries are stored in order as (file type, payload size,
//! payload, checksum). An entry may alternatively reference a raw sidecar
//! file next to the result, which allows hard-linking large objects in and
//! out of the cache instead of copying them.

use super::header::{self, RESULT_MAGIC, RESULT_VERSION};
use super::wire::{self, Reader, WireError};
use crate::config::Config;
use crate::hashing::checksum64;
use log::debug;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// The closed set of compiler outputs a result can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FileType {
    Object = 0,
    Dependency = 1,
    StderrOutput = 2,
    Coverage = 3,
    Stackusage = 4,
    Diagnostic = 5,
    DwarfObject = 6,
}

impl FileType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(FileType::Object),
            1 => Some(FileType::Dependency),
            2 => Some(FileType::StderrOutput),
            3 => Some(FileType::Coverage),
            4 => Some(FileType::Stackusage),
            5 => Some(FileType::Diagnostic),
            6 => Some(FileType::DwarfObject),
            _ => None,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileType::Object => "object",
            FileType::Dependency => "dependency",
            FileType::StderrOutput => "stderr",
            FileType::Coverage => "coverage",
            FileType::Stackusage => "stack usage",
            FileType::Diagnostic => "diagnostic",
            FileType::DwarfObject => "dwarf object",
        };
        f.write_str(name)
    }
}

/// Storage form of one entry.
const STORAGE_EMBEDDED: u8 = 0;
const STORAGE_RAW: u8 = 1;

fn sidecar_path(result_path: &Path, entry_index: u8) -> PathBuf {
    let mut name = result_path
        .file_stem()
        .unwrap_or_default()
        .to_os_string();
    name.push(format!(".{entry_index}.raw"));
    result_path.with_file_name(name)
}

/// Store the given files under `path`. The object entry is hard-linked as
/// a raw sidecar when the configuration allows it.
pub fn put(config: &Config, path: &Path, files: &BTreeMap<FileType, PathBuf>) -> bool {
    let mut payload = Vec::new();
    wire::put_u8(&mut payload, files.len() as u8);

    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return false;
        }
    }

    for (entry_index, (file_type, source)) in files.iter().enumerate() {
        let entry_index = entry_index as u8;
        let use_raw =
            config.hard_link && !config.compression && *file_type == FileType::Object;
        wire::put_u8(&mut payload, *file_type as u8);

        if use_raw {
            let sidecar = sidecar_path(path, entry_index);
            let _ = fs::remove_file(&sidecar);
            if let Err(error) = fs::hard_link(source, &sidecar).or_else(|_| {
                fs::copy(source, &sidecar).map(|_| ())
            }) {
                debug!("Failed to store raw entry {}: {error}", sidecar.display());
                return false;
            }
            let Ok(metadata) = fs::metadata(&sidecar) else {
                return false;
            };
            wire::put_u8(&mut payload, STORAGE_RAW);
            wire::put_u64(&mut payload, metadata.len());
        } else {
            let Ok(data) = fs::read(source) else {
                debug!("Failed to read {}", source.display());
                return false;
            };
            wire::put_u8(&mut payload, STORAGE_EMBEDDED);
            wire::put_u64(&mut payload, data.len() as u64);
            let checksum = checksum64(&data);
            payload.extend_from_slice(&data);
            wire::put_u64(&mut payload, checksum);
        }
    }

    match header::write_entry_file(path, RESULT_MAGIC, RESULT_VERSION, config, &payload) {
        Ok(()) => true,
        Err(error) => {
            debug!("Failed to write result {}: {error}", path.display());
            false
        }
    }
}

/// Materialize the requested file types from the result at `path`.
///
/// Unrequested entries are skipped, `/dev/null` destinations are skipped
/// without error, and an absent stderr entry is fine. Any other requested
/// entry missing, or any integrity problem, deletes the entry and reports
/// a miss.
pub fn get(path: &Path, files: &BTreeMap<FileType, PathBuf>) -> bool {
    match try_get(path, files) {
        Ok(()) => true,
        Err(error) => {
            debug!("Failed to get result {}: {error}", path.display());
            // A result that cannot be materialized is useless; drop it so
            // the next miss replaces it.
            let _ = fs::remove_file(path);
            false
        }
    }
}

fn try_get(path: &Path, files: &BTreeMap<FileType, PathBuf>) -> anyhow::Result<()> {
    let payload = header::read_entry_file(path, RESULT_MAGIC, RESULT_VERSION)?;
    let mut reader = Reader::new(&payload);
    let entry_count = reader.u8()?;

    let mut found: Vec<FileType> = Vec::with_capacity(entry_count as usize);
    for entry_index in 0..entry_count {
        let file_type = FileType::from_byte(reader.u8()?)
            .ok_or_else(|| anyhow::anyhow!("unknown file type"))?;
        let storage = reader.u8()?;
        let size = reader.u64()?;

        match storage {
            STORAGE_EMBEDDED => {
                let data = reader.take(size as usize)?;
                let checksum = reader.u64()?;
                if checksum64(data) != checksum {
                    anyhow::bail!("checksum mismatch for {file_type} entry");
                }
                if let Some(destination) = files.get(&file_type) {
                    if destination != Path::new("/dev/null") {
                        write_file(destination, data)?;
                    }
                }
            }
            STORAGE_RAW => {
                let sidecar = sidecar_path(path, entry_index);
                let metadata = fs::metadata(&sidecar)?;
                if metadata.len() != size {
                    anyhow::bail!("raw entry {} has wrong size", sidecar.display());
                }
                if let Some(destination) = files.get(&file_type) {
                    if destination != Path::new("/dev/null") {
                        let _ = fs::remove_file(destination);
                        fs::hard_link(&sidecar, destination)
                            .or_else(|_| fs::copy(&sidecar, destination).map(|_| ()))?;
                    }
                }
            }
            _ => anyhow::bail!("unknown storage kind"),
        }
        found.push(file_type);
    }

    for requested in files.keys() {
        // The stderr entry is only stored when the compiler wrote to
        // stderr, so its absence means silence, not corruption.
        if *requested != FileType::StderrOutput && !found.contains(requested) {
            anyhow::bail!("requested {requested} entry not present");
        }
    }
    Ok(())
}

fn write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = fs::File::create(path)?;
    file.write_all(data)
}

/// Print a result in text form, for `--dump-result`.
pub fn dump(path: &Path, out: &mut dyn Write) -> anyhow::Result<()> {
    let (file_header, on_disk_size) = header::read_header_info(path)?;
    writeln!(out, "Magic: cCrS")?;
    writeln!(out, "Version: {}", file_header.version)?;
    writeln!(
        out,
        "Compression type: {}",
        match file_header.compression_type {
            super::compress::CompressionType::None => "none",
            super::compress::CompressionType::Zstd => "zstd",
        }
    )?;
    writeln!(out, "Compression level: {}", file_header.compression_level)?;
    writeln!(out, "Content size: {}", file_header.content_size)?;
    writeln!(out, "Size on disk: {on_disk_size}")?;

    let payload = header::read_entry_file(path, RESULT_MAGIC, RESULT_VERSION)?;
    let mut reader = Reader::new(&payload);
    let entry_count = reader.u8().map_err(invalid)?;
    writeln!(out, "Entries: {entry_count}")?;
    for entry_index in 0..entry_count {
        let file_type = FileType::from_byte(reader.u8().map_err(invalid)?)
            .ok_or_else(|| anyhow::anyhow!("unknown file type"))?;
        let storage = reader.u8().map_err(invalid)?;
        let size = reader.u64().map_err(invalid)?;
        let kind = if storage == STORAGE_RAW {
            "raw"
        } else {
            "embedded"
        };
        writeln!(out, "  {entry_index}: {file_type} ({kind}, {size} bytes)")?;
        if storage == STORAGE_EMBEDDED {
            reader.take(size as usize).map_err(invalid)?;
            reader.u64().map_err(invalid)?;
        }
    }
    Ok(())
}

fn invalid(error: WireError) -> anyhow::Error {
    anyhow::anyhow!("corrupt result: {error}")
}
