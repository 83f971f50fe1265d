// SPDX-License-Identifier: GPL-3.0-or-later

//! Cache management commands.

use crate::args::Management;
use crate::cleanup;
use crate::config::{format_human_readable_size, parse_size_with_suffix, Config};
use crate::hashing::Hasher;
use crate::stats::{self, StatKind};
use crate::storage::compress::CompressionType;
use crate::storage::{header, manifest, result};
use anyhow::{bail, Context as AnyhowContext};
use log::debug;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Execute the requested management operations in a fixed order. Returns
/// the process exit code.
pub fn run(management: &Management, config: &Config) -> anyhow::Result<()> {
    if let Some(path) = &management.dump_manifest {
        let mut out = std::io::stdout();
        manifest::dump(Path::new(path), &mut out)?;
    }
    if let Some(path) = &management.dump_result {
        let mut out = std::io::stdout();
        result::dump(Path::new(path), &mut out)?;
    }
    if let Some(path) = &management.hash_file {
        hash_file(path)?;
    }
    if management.print_stats {
        print_stats(config);
    }
    if management.cleanup {
        println!("Cleaning...");
        cleanup::clean_up_all(config);
    }
    if management.clear {
        println!("Clearing...");
        cleanup::wipe_all(config);
    }
    if let Some(key) = &management.get_config {
        println!("{}", config.get_string_value(key)?);
    }
    if let Some(value) = &management.max_files {
        let files: u64 = value
            .parse()
            .with_context(|| format!("invalid number: {value}"))?;
        Config::set_value_in_file(config.primary_config_path(), "max_files", value)?;
        if files == 0 {
            println!("Unset cache file limit");
        } else {
            println!("Set cache file limit to {files}");
        }
    }
    if let Some(value) = &management.max_size {
        let size = parse_size_with_suffix(value)
            .map_err(|reason| anyhow::anyhow!("invalid size: {reason}"))?;
        Config::set_value_in_file(config.primary_config_path(), "max_size", value)?;
        if size == 0 {
            println!("Unset cache size limit");
        } else {
            println!(
                "Set cache size limit to {}",
                format_human_readable_size(size)
            );
        }
    }
    if let Some(assignment) = &management.set_config {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("missing equal sign in \"{assignment}\""))?;
        Config::set_value_in_file(config.primary_config_path(), key, value)?;
    }
    if management.show_config {
        config.visit_items(|key, value, origin| {
            println!("({origin}) {key} = {value}");
        });
    }
    if management.show_stats {
        show_stats(config);
    }
    if management.show_compression {
        show_compression(config)?;
    }
    if let Some(level) = &management.recompress {
        recompress(config, level)?;
    }
    if management.zero_stats {
        stats::zero_all(config)?;
        println!("Statistics zeroed");
    }
    Ok(())
}

/// Print the hash of a file, or of stdin for "-".
fn hash_file(path: &str) -> anyhow::Result<()> {
    let mut hasher = Hasher::new();
    if path == "-" {
        hasher
            .hash_reader(std::io::stdin().lock())
            .context("failed to hash stdin")?;
    } else {
        hasher
            .hash_file(Path::new(path))
            .with_context(|| format!("failed to hash {path}"))?;
    }
    println!("{}", hasher.finalize());
    Ok(())
}

fn print_stats(config: &Config) {
    let totals = stats::collect_totals(config);
    let mut out = std::io::stdout();
    for stat in StatKind::display_order() {
        let _ = writeln!(out, "{}\t{}", stat.id(), totals.get(*stat));
    }
}

fn show_stats(config: &Config) {
    let totals = stats::collect_totals(config);
    println!("cache directory                     {}", config.cache_dir.display());
    println!(
        "primary config                      {}",
        config.primary_config_path().display()
    );
    for stat in StatKind::display_order() {
        let value = totals.get(*stat);
        if value == 0 && !stat.is_gauge() {
            continue;
        }
        let rendered = match stat {
            StatKind::CacheSizeKibibyte => format_human_readable_size(value * 1024),
            _ => value.to_string(),
        };
        println!("{:<35} {rendered}", stat.message());
    }
    if config.max_files != 0 {
        println!("max files                           {}", config.max_files);
    }
    if config.max_size != 0 {
        println!(
            "max cache size                      {}",
            format_human_readable_size(config.max_size)
        );
    }
}

/// Every manifest and result file in the cache.
fn cache_entry_files(config: &Config) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for level in 0..16u32 {
        let dir = config.cache_dir.join(format!("{level:x}"));
        collect_entries(&dir, &mut files);
    }
    files
}

fn collect_entries(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_entries(&path, files);
            continue;
        }
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if matches!(extension, "manifest" | "result") {
            files.push(path);
        }
    }
}

fn magic_and_version(path: &Path) -> ([u8; 4], u8) {
    if path.extension().and_then(|e| e.to_str()) == Some("manifest") {
        (header::MANIFEST_MAGIC, header::MANIFEST_VERSION)
    } else {
        (header::RESULT_MAGIC, header::RESULT_VERSION)
    }
}

fn show_compression(config: &Config) -> anyhow::Result<()> {
    let mut compressed_files: u64 = 0;
    let mut total_files: u64 = 0;
    let mut on_disk_size: u64 = 0;
    let mut content_size: u64 = 0;

    for path in cache_entry_files(config) {
        let Ok((file_header, file_size)) = header::read_header_info(&path) else {
            // Unknown or older format; not part of the statistics.
            continue;
        };
        total_files += 1;
        on_disk_size += file_size;
        if file_header.compression_type == CompressionType::None {
            content_size += file_size;
        } else {
            compressed_files += 1;
            content_size += file_header.content_size;
        }
    }

    println!(
        "Compressed size: {}, {compressed_files} files",
        format_human_readable_size(on_disk_size)
    );
    println!(
        "Uncompressed size: {}, {total_files} files",
        format_human_readable_size(content_size)
    );
    let percent = if total_files > 0 {
        100.0 * compressed_files as f64 / total_files as f64
    } else {
        0.0
    };
    println!("Compressed files: {percent:.2} %");
    let ratio = if on_disk_size > 0 {
        content_size as f64 / on_disk_size as f64
    } else {
        0.0
    };
    let savings = if ratio > 0.0 { 100.0 - 100.0 / ratio } else { 0.0 };
    println!("Compression ratio: {savings:.2} % ({ratio:.1}x)");
    Ok(())
}

/// Rewrite every cache entry with a new compression level, or without
/// compression for "uncompressed".
fn recompress(config: &Config, level: &str) -> anyhow::Result<()> {
    let (codec, level) = if level == "uncompressed" {
        (CompressionType::None, 0i8)
    } else {
        let level: i32 = level
            .parse()
            .with_context(|| format!("invalid compression level: {level}"))?;
        if !(-128..=127).contains(&level) {
            bail!("compression level must be between -128 and 127");
        }
        let level = if level == 0 {
            config.compression_level
        } else {
            level as i8
        };
        (CompressionType::Zstd, level)
    };

    println!("Recompressing...");
    let mut rewritten: u64 = 0;
    for path in cache_entry_files(config) {
        let (magic, version) = magic_and_version(&path);
        let payload = match header::read_entry_file(&path, magic, version) {
            Ok(payload) => payload,
            Err(error) => {
                debug!("Skipping {}: {error}", path.display());
                continue;
            }
        };
        header::write_entry_file_with(&path, magic, version, codec, level, &payload)?;
        rewritten += 1;
    }
    println!("Recompressed {rewritten} files");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::storage::{cache_entry_path, EntryKind};
    use std::collections::BTreeMap;

    fn config_in(dir: &Path) -> Config {
        let mut config = Config::default();
        config.cache_dir = dir.to_path_buf();
        config
    }

    fn store_result(config: &Config, filler: u8) -> PathBuf {
        let dir = tempfile::tempdir().unwrap();
        let object = dir.path().join("a.o");
        fs::write(&object, vec![b'x'; 4096]).unwrap();
        let digest = Digest::from_bytes([filler; 20]);
        let path = cache_entry_path(config, &digest, EntryKind::Result);
        let mut files = BTreeMap::new();
        files.insert(crate::storage::result::FileType::Object, object);
        assert!(result::put(config, &path, &files));
        path
    }

    #[test]
    fn test_recompress_to_uncompressed_and_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let path = store_result(&config, 1);

        let compressed_size = fs::metadata(&path).unwrap().len();
        recompress(&config, "uncompressed").unwrap();
        let uncompressed_size = fs::metadata(&path).unwrap().len();
        assert!(uncompressed_size > compressed_size);

        recompress(&config, "19").unwrap();
        let recompressed_size = fs::metadata(&path).unwrap().len();
        assert!(recompressed_size < uncompressed_size);

        // Content is unchanged either way.
        let (magic, version) = magic_and_version(&path);
        header::read_entry_file(&path, magic, version).unwrap();
    }

    #[test]
    fn test_cache_entry_files_finds_entries() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        store_result(&config, 2);
        store_result(&config, 0x31);
        assert_eq!(cache_entry_files(&config).len(), 2);
    }

    #[test]
    fn test_hash_file_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        fs::write(&path, b"content").unwrap();
        hash_file(&path.to_string_lossy()).unwrap();
        assert!(hash_file("/nonexistent/file").is_err());
    }
}
