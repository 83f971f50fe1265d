// SPDX-License-Identifier: GPL-3.0-or-later

//! Cache size enforcement.
//!
//! Each first-level directory is kept within its share of the configured
//! limits by deleting the least recently used files. The per-directory
//! stats file gauges are recomputed from what actually remains on disk.

use crate::config::Config;
use crate::stats::{self, StatKind};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

struct CacheFile {
    path: PathBuf,
    mtime: SystemTime,
    size_on_disk: u64,
}

/// Files in a first-level directory, excluding bookkeeping files.
fn collect_files(dir: &Path, files: &mut Vec<CacheFile>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = fs::symlink_metadata(&path) else {
            continue;
        };
        if metadata.is_dir() {
            collect_files(&path, files);
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "stats" || name == "CACHEDIR.TAG" {
            continue;
        }
        if name.ends_with(".lock") || name.starts_with(".nfs") {
            // Lock files are tiny and may be held by a concurrent writer;
            // .nfs files belong to open-but-deleted files.
            continue;
        }
        files.push(CacheFile {
            path,
            mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size_on_disk: crate::storage::size_on_disk(&metadata),
        });
    }
}

/// Enforce the limits in one first-level directory. Returns the number of
/// deleted files.
fn clean_up_dir(config: &Config, dir: &Path) -> u64 {
    debug!("Cleaning up {}", dir.display());
    let mut files = Vec::new();
    collect_files(dir, &mut files);
    files.sort_by_key(|file| file.mtime);

    let mut total_size: u64 = files.iter().map(|f| f.size_on_disk).sum();
    let mut total_files = files.len() as u64;

    // Each of the 16 first-level directories gets a 16th of the limits,
    // scaled down so one cleanup creates headroom for a while.
    let size_goal = (config.max_size as f64 * config.limit_multiple / 16.0) as u64;
    let files_goal = (config.max_files as f64 * config.limit_multiple / 16.0) as u64;

    let mut deleted: u64 = 0;
    for file in &files {
        let over_size = config.max_size != 0 && total_size > size_goal;
        let over_files = config.max_files != 0 && total_files > files_goal;
        if !over_size && !over_files {
            break;
        }
        if fs::remove_file(&file.path).is_ok() {
            debug!("Deleted {}", file.path.display());
            total_size -= file.size_on_disk;
            total_files -= 1;
            deleted += 1;
        }
    }

    let stats_path = dir.join("stats");
    let _ = stats::update_stats_file(&stats_path, |counters| {
        counters.set(StatKind::FilesInCache, total_files);
        counters.set(StatKind::CacheSizeKibibyte, total_size / 1024);
        if deleted > 0 {
            counters.increment(StatKind::CleanupsPerformed);
        }
    });
    deleted
}

/// Enforce the limits on the whole cache.
pub fn clean_up_all(config: &Config) -> u64 {
    let mut deleted = 0;
    for level in 0..16u32 {
        let dir = config.cache_dir.join(format!("{level:x}"));
        if dir.is_dir() {
            deleted += clean_up_dir(config, &dir);
        }
    }
    info!("Cleanup deleted {deleted} files");
    deleted
}

/// Delete every cache entry, keeping configuration and statistics history.
pub fn wipe_all(config: &Config) -> u64 {
    let mut deleted = 0;
    for level in 0..16u32 {
        let dir = config.cache_dir.join(format!("{level:x}"));
        if !dir.is_dir() {
            continue;
        }
        let mut files = Vec::new();
        collect_files(&dir, &mut files);
        for file in &files {
            if fs::remove_file(&file.path).is_ok() {
                deleted += 1;
            }
        }
        let stats_path = dir.join("stats");
        let _ = stats::update_stats_file(&stats_path, |counters| {
            counters.set(StatKind::FilesInCache, 0);
            counters.set(StatKind::CacheSizeKibibyte, 0);
            counters.increment(StatKind::CleanupsPerformed);
        });
    }
    info!("Cleared cache: deleted {deleted} files");
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::read_stats_file;

    fn populate(dir: &Path, count: usize, size: usize) {
        for index in 0..count {
            let sub = dir.join("0").join(format!("{index:x}"));
            fs::create_dir_all(&sub).unwrap();
            fs::write(sub.join(format!("entry{index}.result")), vec![0u8; size]).unwrap();
        }
    }

    #[test]
    fn test_no_limits_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache_dir = dir.path().to_path_buf();
        config.max_files = 0;
        config.max_size = 0;
        populate(dir.path(), 4, 10);

        assert_eq!(clean_up_all(&config), 0);
        let counters = read_stats_file(&dir.path().join("0/stats"));
        assert_eq!(counters.get(StatKind::FilesInCache), 4);
    }

    #[test]
    fn test_file_limit_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache_dir = dir.path().to_path_buf();
        config.max_size = 0;
        // 16 * limit_multiple(0.8) / 16 = 0.8 files per dir; everything
        // beyond that is deleted.
        config.max_files = 16;
        populate(dir.path(), 4, 10);

        let deleted = clean_up_all(&config);
        assert!(deleted >= 3, "deleted {deleted}");
        let counters = read_stats_file(&dir.path().join("0/stats"));
        assert!(counters.get(StatKind::FilesInCache) <= 1);
        assert_eq!(counters.get(StatKind::CleanupsPerformed), 1);
    }

    #[test]
    fn test_wipe_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache_dir = dir.path().to_path_buf();
        populate(dir.path(), 3, 10);
        // Configuration files survive a wipe.
        fs::write(dir.path().join("ccache.conf"), b"max_files = 5\n").unwrap();

        let deleted = wipe_all(&config);
        assert_eq!(deleted, 3);
        assert!(dir.path().join("ccache.conf").exists());
        let counters = read_stats_file(&dir.path().join("0/stats"));
        assert_eq!(counters.get(StatKind::FilesInCache), 0);
    }
}
