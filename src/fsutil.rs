// SPDX-License-Identifier: MPL-2.0
/*
 * replicar: trace R computations into a reproducible container manifest
 * Copyright (C) 2024-2026 The replicar authors
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

#![forbid(unsafe_code)]

//! Filesystem helpers: root-symlink equivalence, accessibility probing and
//! lexical path handling.
//!
//! Unlike a path-security library, replicar does not need race-free lookups.
//! A path that changes under us degrades a single record (the tracer warns
//! and drops it), so plain [`std::fs`] queries are the right tool here.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs,
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::{Component, Path, PathBuf},
};

use tracing::warn;

/// Whether `path` has `base` as a lexical prefix (component-wise, so
/// `/usr/libexec` is not under `/usr/lib`).
pub(crate) fn is_sub_path(path: &Path, base: &Path) -> bool {
    let mut path_parts = path.components();
    base.components().all(|part| path_parts.next() == Some(part))
}

/// Resolve `.` and `..` components without touching the filesystem. `..` at
/// the root stays at the root.
pub(crate) fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for part in path.components() {
        match part {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(out.components().next_back(), None | Some(Component::RootDir)) {
                    out.pop();
                }
            }
            part => out.push(part),
        }
    }
    out
}

/// Read a symlink and absolutize a relative target against the link's parent
/// directory. Returns `None` if `path` is not a readable symlink.
pub(crate) fn resolve_symlink(path: &Path) -> Option<PathBuf> {
    let target = fs::read_link(path).ok()?;
    if target.is_absolute() {
        Some(target)
    } else {
        Some(normalize_lexically(&path.parent()?.join(target)))
    }
}

fn same_inode(a: &Path, b: &Path) -> bool {
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => ma.dev() == mb.dev() && ma.ino() == mb.ino(),
        _ => false,
    }
}

/// Map of directory symlinks at the filesystem root, and the equivalence
/// closure they induce on paths.
///
/// Merged-usr systems alias whole hierarchies (`/lib -> /usr/lib`,
/// `/bin -> /usr/bin`, ...). A package database keyed on `/usr/lib/x` must
/// still match a traced path `/lib/x`, so every path lookup first expands
/// into the set of spellings that reach the same inode.
#[derive(Debug, Clone)]
pub struct SymlinkMap {
    links: HashMap<PathBuf, PathBuf>,
}

impl Default for SymlinkMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SymlinkMap {
    /// Enumerate the top-level symlinks of `/`.
    pub fn new() -> Self {
        Self::from_root(Path::new("/"))
    }

    /// Enumerate the top-level symlinks of `root`, keeping entries whose
    /// readable target is an accessible directory.
    pub fn from_root(root: &Path) -> Self {
        let mut links = HashMap::new();
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(err) => {
                // Degrade to the identity mapping.
                warn!(root = %root.display(), %err, "failed to enumerate root symlinks");
                return Self { links };
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_symlink() {
                continue;
            }
            let Ok(target) = fs::read_link(&path) else {
                continue;
            };
            let target = if target.is_absolute() {
                target
            } else {
                match fs::canonicalize(root.join(target)) {
                    Ok(target) => target,
                    Err(_) => continue,
                }
            };
            if target.is_dir() {
                links.insert(path, target);
            }
        }
        Self { links }
    }

    #[cfg(test)]
    pub(crate) fn from_links(links: HashMap<PathBuf, PathBuf>) -> Self {
        Self { links }
    }

    /// Expand `path` into the set of equivalent paths reachable by
    /// substituting link and target segments (in both directions), following
    /// the path itself if it is a symlink. Always contains `path`.
    pub fn equivalents(&self, path: &Path) -> HashSet<PathBuf> {
        let mut result = HashSet::new();
        let mut worklist = VecDeque::from([path.to_path_buf()]);

        // Checks whether `p` is under `b` and, if so, whether the same file
        // can be reached by spelling the prefix as `a` instead.
        let substitute = |p: &Path, a: &Path, b: &Path| -> Option<PathBuf> {
            if !is_sub_path(p, b) {
                return None;
            }
            let candidate = a.join(p.strip_prefix(b).ok()?);
            (candidate.exists() && same_inode(&candidate, p)).then_some(candidate)
        };

        while let Some(p) = worklist.pop_front() {
            if !result.insert(p.clone()) {
                continue;
            }

            // Every map entry is tried in both directions; independent links
            // may each contribute a spelling (their targets can nest).
            for (link, target) in &self.links {
                if let Some(candidate) = substitute(&p, link, target) {
                    worklist.push_back(candidate);
                }
                if let Some(candidate) = substitute(&p, target, link) {
                    worklist.push_back(candidate);
                }
            }

            if p.is_symlink() {
                if let Some(target) = resolve_symlink(&p) {
                    worklist.push_back(target);
                }
            }
        }

        result
    }
}

/// Outcome of probing a path for use in the copy resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Accessible,
    DoesNotExist,
    InsufficientPermission,
}

/// Probe whether `path` can actually be read (opened, or listed for a
/// directory), not merely stat-ed.
pub fn check_access(path: &Path) -> AccessStatus {
    match path.try_exists() {
        Ok(false) => return AccessStatus::DoesNotExist,
        Ok(true) => {}
        Err(_) => return AccessStatus::InsufficientPermission,
    }

    let readable = if path.is_dir() {
        fs::read_dir(path).is_ok()
    } else {
        fs::File::open(path).is_ok()
    };
    if readable {
        AccessStatus::Accessible
    } else {
        AccessStatus::InsufficientPermission
    }
}

/// Human-readable file type of `path` (without following symlinks), for log
/// messages.
pub(crate) fn file_type_str(path: &Path) -> &'static str {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return "not found";
    };
    let ftype = meta.file_type();
    if ftype.is_file() {
        "regular file"
    } else if ftype.is_dir() {
        "directory"
    } else if ftype.is_symlink() {
        "symlink"
    } else if ftype.is_block_device() {
        "block device"
    } else if ftype.is_char_device() {
        "character device"
    } else if ftype.is_fifo() {
        "FIFO/pipe"
    } else if ftype.is_socket() {
        "socket"
    } else {
        "unknown"
    }
}

/// Size of a regular file, with a warning on failure.
pub(crate) fn file_size(path: &Path) -> Option<u64> {
    match fs::metadata(path) {
        Ok(meta) => Some(meta.len()),
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to get file size");
            None
        }
    }
}
