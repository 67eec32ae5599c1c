// Copyright 2026 Segstore Project Authors. Licensed under Apache-2.0.

//! On-disk layout: `<root>/g-NNNN/{wr,rd}-NNNN/`. The generation with the
//! largest sequence number is in use; stale generations are reclaimed at
//! open. A `merging.lock` inside a generation marks a crashed merge and
//! refuses startup until the operator removes that generation.

use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::error::{StorageResult, TracedStorageError};

pub const MERGING_LOCK_FILE: &str = "merging.lock";

pub fn merge_path(root: &Path, merge_seq: u64) -> PathBuf {
    root.join(format!("g-{:04}", merge_seq))
}

pub fn seg_path(root: &Path, merge_seq: u64, ty: &str, seg_idx: usize) -> PathBuf {
    merge_path(root, merge_seq).join(format!("{}-{:04}", ty, seg_idx))
}

fn parse_merge_seq(name: &str) -> Option<u64> {
    name.strip_prefix("g-")?.parse().ok()
}

pub fn parse_seg_dir_name(name: &str) -> Option<(bool, usize)> {
    if let Some(idx) = name.strip_prefix("wr-") {
        return Some((true, idx.parse().ok()?));
    }
    if let Some(idx) = name.strip_prefix("rd-") {
        return Some((false, idx.parse().ok()?));
    }
    None
}

/// Find the in-use merge generation, refusing to open over a crashed merge
/// and reclaiming stale generations. Returns the in-use sequence number.
pub fn discover_merge_dir(root: &Path) -> StorageResult<u64> {
    let mut merge_seq: Option<u64> = None;
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(seq) = parse_merge_seq(&name) else {
            continue;
        };
        let lock_file = entry.path().join(MERGING_LOCK_FILE);
        if lock_file.exists() {
            return Err(TracedStorageError::logic_error(format!(
                "merging is not completed: '{}', it should be caused by a process crash! \
                 to continue, remove dir: {}",
                lock_file.display(),
                entry.path().display()
            )));
        }
        merge_seq = Some(merge_seq.map_or(seq, |m| m.max(seq)));
    }
    match merge_seq {
        None => {
            std::fs::create_dir_all(merge_path(root, 0))?;
            Ok(0)
        }
        Some(seq) => {
            remove_stale_dirs(root, seq)?;
            Ok(seq)
        }
    }
}

/// Reduce symlinks of the in-use generation, then delete every other
/// generation directory.
fn remove_stale_dirs(root: &Path, in_use: u64) -> StorageResult<()> {
    let in_use_dir = merge_path(root, in_use);
    for entry in std::fs::read_dir(&in_use_dir)? {
        try_reduce_symlink(&entry?.path())?;
    }
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(seq) = parse_merge_seq(&name) {
            if seq != in_use {
                info!(dir = %entry.path().display(), "remove stale dir");
                if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                    error!(dir = %entry.path().display(), error = %e, "failed to remove stale dir");
                }
            }
        }
    }
    Ok(())
}

/// Replace a symlinked segment directory by its target so the generation is
/// self-contained.
pub fn try_reduce_symlink(seg_dir: &Path) -> StorageResult<()> {
    let meta = match std::fs::symlink_metadata(seg_dir) {
        Ok(meta) => meta,
        Err(_) => return Ok(()),
    };
    if !meta.file_type().is_symlink() {
        return Ok(());
    }
    let target = std::fs::read_link(seg_dir)?;
    let resolved = if target.is_absolute() {
        target
    } else {
        seg_dir.parent().unwrap().join(target)
    };
    warn!(
        link = %seg_dir.display(),
        target = %resolved.display(),
        "writable segment is a symbol link, reduce it"
    );
    std::fs::remove_file(seg_dir)?;
    if resolved.exists() {
        std::fs::rename(&resolved, seg_dir)?;
    }
    Ok(())
}

pub struct SegDirEntry {
    pub name: String,
    pub seg_idx: usize,
    pub writable: bool,
}

/// List the segment directories of a generation, resolving interrupted
/// `.tmp`/`.backup-0` renames left by a crashed purge rebuild.
pub fn working_seg_dir_list(merge_dir: &Path) -> StorageResult<Vec<SegDirEntry>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(merge_dir)? {
        let entry = entry?;
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if name == MERGING_LOCK_FILE {
            continue;
        }
        if name.ends_with(".backup-0") {
            warn!(dir = %entry.path().display(), "found backup segment");
            continue;
        }
        if let Some(canonical) = name.strip_suffix(".tmp") {
            let right_dir = merge_dir.join(canonical);
            let backup = merge_dir.join(format!("{}.backup-0", canonical));
            if backup.exists() {
                warn!(dir = %entry.path().display(), "promote interrupted rebuild");
                if right_dir.exists() {
                    return Err(TracedStorageError::invalid_argument(format!(
                        "please check segment: {}",
                        right_dir.display()
                    )));
                }
                std::fs::rename(entry.path(), &right_dir)?;
                std::fs::remove_dir_all(&backup)?;
                name = canonical.to_string();
            } else {
                warn!(dir = %entry.path().display(), "remove temporary segment");
                std::fs::remove_dir_all(entry.path())?;
                continue;
            }
        }
        if parse_seg_dir_name(&name).is_some() {
            names.push(name);
        } else {
            warn!(dir = %merge_dir.join(&name).display(), "skip unknown dir");
        }
    }
    names.sort();
    Ok(names
        .into_iter()
        .map(|name| {
            let (writable, seg_idx) = parse_seg_dir_name(&name).unwrap();
            SegDirEntry {
                name,
                seg_idx,
                writable,
            }
        })
        .collect())
}

/// Delete a segment directory, following one level of symlink.
pub fn remove_seg_dir(dir: &Path) {
    let Ok(meta) = std::fs::symlink_metadata(dir) else {
        return;
    };
    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(dir)
            .map(|t| {
                if t.is_absolute() {
                    t
                } else {
                    dir.parent().unwrap().join(t)
                }
            })
            .ok();
        if let Err(e) = std::fs::remove_file(dir) {
            warn!(dir = %dir.display(), error = %e, "failed to remove segment symlink");
        }
        if let Some(target) = target {
            if target.exists() {
                if let Err(e) = std::fs::remove_dir_all(&target) {
                    warn!(dir = %target.display(), error = %e, "failed to remove segment dir");
                }
            }
        }
    } else if let Err(e) = std::fs::remove_dir_all(dir) {
        warn!(dir = %dir.display(), error = %e, "failed to remove segment dir");
    }
}

#[cfg(unix)]
pub fn symlink_dir(target: &Path, link: &Path) -> StorageResult<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(windows)]
pub fn symlink_dir(target: &Path, link: &Path) -> StorageResult<()> {
    std::os::windows::fs::symlink_dir(target, link)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_fresh_root() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(discover_merge_dir(dir.path()).unwrap(), 0);
        assert!(merge_path(dir.path(), 0).exists());
    }

    #[test]
    fn test_stale_generation_removed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(merge_path(dir.path(), 0)).unwrap();
        std::fs::create_dir_all(merge_path(dir.path(), 3)).unwrap();
        assert_eq!(discover_merge_dir(dir.path()).unwrap(), 3);
        assert!(!merge_path(dir.path(), 0).exists());
        assert!(merge_path(dir.path(), 3).exists());
    }

    #[test]
    fn test_merging_lock_refuses_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(merge_path(dir.path(), 0)).unwrap();
        let gen1 = merge_path(dir.path(), 1);
        std::fs::create_dir_all(&gen1).unwrap();
        std::fs::write(gen1.join(MERGING_LOCK_FILE), b"").unwrap();
        let err = discover_merge_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("merging.lock"));
        // generations are left untouched for the operator
        assert!(merge_path(dir.path(), 0).exists());
        assert!(gen1.exists());
    }

    #[test]
    fn test_tmp_and_backup_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let gen = merge_path(dir.path(), 0);
        // interrupted rebuild: canonical renamed to backup, tmp not yet moved
        std::fs::create_dir_all(gen.join("rd-0000.tmp")).unwrap();
        std::fs::create_dir_all(gen.join("rd-0000.backup-0")).unwrap();
        // stray tmp without backup
        std::fs::create_dir_all(gen.join("rd-0001.tmp")).unwrap();
        std::fs::create_dir_all(gen.join("wr-0002")).unwrap();
        let entries = working_seg_dir_list(&gen).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["rd-0000", "wr-0002"]);
        assert!(gen.join("rd-0000").exists());
        assert!(!gen.join("rd-0000.backup-0").exists());
        assert!(!gen.join("rd-0001.tmp").exists());
    }
}
