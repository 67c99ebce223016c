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

//! The resolver chain: an ordered sequence of classifiers that consumes the
//! traced file set and fills in the manifest.
//!
//! Each resolver removes the files it claims. The fixed order is ignore ->
//! system packages -> language packages -> copy; the copy resolver consumes
//! everything that is left, so no path goes unclassified.

use crate::{
    dpkg::{DebPackage, DpkgDatabase},
    fsutil::{self, check_access, AccessStatus, SymlinkMap},
    manifest::{FileStatus, Manifest},
    rpkg::{RPackage, RpkgDatabase},
    tracer::FileRecord,
    trie::PathTrie,
};

use std::{
    collections::{BTreeMap, HashSet},
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, info, warn};

/// Traced symlinks under consideration (link -> target).
pub type TracedSymlinks = BTreeMap<PathBuf, PathBuf>;

/// One stage of the chain. `resolve` removes the files and symlinks it
/// claims from the working set and records its claim in the manifest.
pub trait Resolver {
    fn resolve(
        &mut self,
        files: &mut Vec<FileRecord>,
        symlinks: &mut TracedSymlinks,
        manifest: &mut Manifest,
    );
}

/// Fixed-order pipeline of resolvers.
#[derive(Default)]
pub struct ResolverChain {
    resolvers: Vec<(&'static str, Box<dyn Resolver>)>,
}

impl fmt::Debug for ResolverChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.resolvers.iter().map(|(name, _)| name).collect();
        f.debug_struct("ResolverChain").field("resolvers", &names).finish()
    }
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &'static str, resolver: impl Resolver + 'static) {
        self.resolvers.push((name, Box::new(resolver)));
    }

    /// Run every resolver over the traced records. Paths that are currently
    /// symlinks additionally enter the symlink stream, so the chain can both
    /// classify them and preserve the links themselves.
    pub fn run(&mut self, mut files: Vec<FileRecord>, manifest: &mut Manifest) {
        let mut symlinks = TracedSymlinks::new();
        for record in &files {
            if record.path.is_symlink() {
                if let Some(target) = fsutil::resolve_symlink(&record.path) {
                    symlinks.insert(record.path.clone(), target);
                }
            }
        }

        for (name, resolver) in &mut self.resolvers {
            debug!(resolver = *name, files = files.len(), "running resolver");
            resolver.resolve(&mut files, &mut symlinks, manifest);
        }

        for record in &files {
            warn!(path = %record.path.display(), "file left unclassified by the resolver chain");
        }
    }
}

/// Ignore rules: wildcard prefixes, exact files (checked across symlink
/// equivalents) and custom predicates.
pub struct IgnoreFileMap {
    wildcards: PathTrie<()>,
    files: PathTrie<()>,
    custom: Vec<Box<dyn Fn(&Path) -> bool + Send + Sync>>,
    symlinks: Arc<SymlinkMap>,
}

impl fmt::Debug for IgnoreFileMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IgnoreFileMap")
            .field("custom", &self.custom.len())
            .finish_non_exhaustive()
    }
}

impl IgnoreFileMap {
    pub fn new(symlinks: Arc<SymlinkMap>) -> Self {
        Self {
            wildcards: PathTrie::new(),
            files: PathTrie::new(),
            custom: Vec::new(),
            symlinks,
        }
    }

    /// Ignore everything under `path`.
    pub fn add_wildcard(&mut self, path: impl AsRef<Path>) {
        self.wildcards.insert(path, ());
    }

    /// Ignore exactly `path` (or any symlink-equivalent spelling of it).
    pub fn add_file(&mut self, path: impl AsRef<Path>) {
        self.files.insert(path, ());
    }

    pub fn add_custom(&mut self, predicate: impl Fn(&Path) -> bool + Send + Sync + 'static) {
        self.custom.push(Box::new(predicate));
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        if self.wildcards.find_longest_prefix(path).is_some() {
            return true;
        }
        for equivalent in self.symlinks.equivalents(path) {
            if self.files.find(&equivalent).is_some() {
                return true;
            }
        }
        self.custom.iter().any(|predicate| predicate(path))
    }
}

/// Fontconfig drops `.uuid` state files next to installed fonts; they are
/// machine-local cache, not content.
pub(crate) fn is_font_uuid_file(path: &Path) -> bool {
    const FONT_DIRS: &[&str] = &[
        "/usr/share/fonts",
        "/usr/share/poppler",
        "/usr/share/texmf/fonts",
    ];
    path.file_name().is_some_and(|name| name == ".uuid")
        && FONT_DIRS
            .iter()
            .any(|dir| fsutil::is_sub_path(path, Path::new(dir)))
}

/// First stage: drop everything the ignore rules match.
#[derive(Debug)]
pub struct IgnoreResolver {
    map: IgnoreFileMap,
}

impl IgnoreResolver {
    pub fn new(map: IgnoreFileMap) -> Self {
        Self { map }
    }
}

impl Resolver for IgnoreResolver {
    fn resolve(
        &mut self,
        files: &mut Vec<FileRecord>,
        symlinks: &mut TracedSymlinks,
        _manifest: &mut Manifest,
    ) {
        let before = files.len();
        files.retain(|record| !self.map.is_ignored(&record.path));
        symlinks.retain(|link, _| !self.map.is_ignored(link));
        info!(ignored = before - files.len(), "ignored traced files");
    }
}

/// Second stage: claim files owned by resolvable system packages.
#[derive(Debug)]
pub struct DebPackageResolver {
    database: Arc<DpkgDatabase>,
    symlinks: Arc<SymlinkMap>,
    /// Substring skiplist for packages that must not be resolved (their
    /// files fall through to the copy stage).
    skiplist: Vec<String>,
}

impl DebPackageResolver {
    pub fn new(database: Arc<DpkgDatabase>, symlinks: Arc<SymlinkMap>, skiplist: Vec<String>) -> Self {
        Self {
            database,
            symlinks,
            skiplist,
        }
    }

    fn lookup(&self, path: &Path) -> Option<Arc<DebPackage>> {
        for equivalent in self.symlinks.equivalents(path) {
            if !equivalent.is_file() {
                debug!(
                    path = %equivalent.display(),
                    file_type = fsutil::file_type_str(&equivalent),
                    "looking up a non-regular file"
                );
            }
            if let Some(pkg) = self.database.lookup_by_path(&equivalent) {
                if self.skiplist.iter().any(|skip| pkg.name.contains(skip)) {
                    continue;
                }
                debug!(path = %path.display(), package = pkg.name, "resolved to deb package");
                return Some(Arc::clone(pkg));
            }
        }
        None
    }
}

impl Resolver for DebPackageResolver {
    fn resolve(
        &mut self,
        files: &mut Vec<FileRecord>,
        symlinks: &mut TracedSymlinks,
        manifest: &mut Manifest,
    ) {
        let mut resolved_files = 0usize;
        let mut claim = |path: &Path, manifest: &mut Manifest| -> bool {
            match self.lookup(path) {
                Some(pkg) => {
                    resolved_files += 1;
                    manifest.deb_packages.insert(pkg.full_name(), pkg);
                    true
                }
                None => false,
            }
        };

        files.retain(|record| !claim(&record.path, manifest));
        symlinks.retain(|link, _| !claim(link, manifest));

        info!(
            files = resolved_files,
            packages = manifest.deb_packages.len(),
            "resolved files and symlinks to deb packages"
        );
    }
}

/// Third stage: claim files under installed language-package directories.
#[derive(Debug)]
pub struct RPackageResolver {
    database: Arc<RpkgDatabase>,
    symlinks: Arc<SymlinkMap>,
}

impl RPackageResolver {
    pub fn new(database: Arc<RpkgDatabase>, symlinks: Arc<SymlinkMap>) -> Self {
        Self { database, symlinks }
    }

    fn lookup(&self, path: &Path) -> Option<Arc<RPackage>> {
        for equivalent in self.symlinks.equivalents(path) {
            if let Some(pkg) = self.database.lookup_by_path(&equivalent) {
                debug!(path = %path.display(), package = pkg.name, "resolved to R package");
                return Some(Arc::clone(pkg));
            }
        }
        None
    }
}

impl Resolver for RPackageResolver {
    fn resolve(
        &mut self,
        files: &mut Vec<FileRecord>,
        _symlinks: &mut TracedSymlinks,
        manifest: &mut Manifest,
    ) {
        let mut resolved_files = 0usize;
        files.retain(|record| match self.lookup(&record.path) {
            Some(pkg) => {
                resolved_files += 1;
                manifest.r_packages.insert(pkg.name.clone(), pkg);
                false
            }
            None => true,
        });

        info!(
            files = resolved_files,
            packages = manifest.r_packages.len(),
            "resolved files to R packages"
        );
    }
}

/// Final stage: classify everything that is left.
#[derive(Debug)]
pub struct CopyFileResolver {
    cwd: PathBuf,
    result_files: HashSet<PathBuf>,
}

impl CopyFileResolver {
    pub fn new(cwd: PathBuf, result_files: HashSet<PathBuf>) -> Self {
        Self { cwd, result_files }
    }

    fn classify(&self, record: &FileRecord) -> FileStatus {
        if self.result_files.contains(&record.path) {
            return FileStatus::Result;
        }
        if record.path == self.cwd {
            return FileStatus::IgnoreIsCwd;
        }

        match check_access(&record.path) {
            AccessStatus::DoesNotExist => {
                if record.existed_before {
                    FileStatus::IgnoreNoLongerExist
                } else {
                    // A scratch file the program created and deleted again.
                    FileStatus::IgnoreDidNotExistBefore
                }
            }
            AccessStatus::InsufficientPermission => FileStatus::IgnoreNotAccessible,
            AccessStatus::Accessible => {
                let mut consider = record.path.is_file();
                if record.path.is_symlink() {
                    if let Some(target) = fsutil::resolve_symlink(&record.path) {
                        consider = target.is_file();
                    }
                }

                if !consider {
                    FileStatus::IgnoreIsDirectory
                } else if record.existed_before {
                    FileStatus::Copy
                } else {
                    FileStatus::Result
                }
            }
        }
    }
}

impl Resolver for CopyFileResolver {
    fn resolve(
        &mut self,
        files: &mut Vec<FileRecord>,
        symlinks: &mut TracedSymlinks,
        manifest: &mut Manifest,
    ) {
        let mut copies = 0usize;
        let mut results = 0usize;

        for record in files.drain(..) {
            let status = self.classify(&record);
            match status {
                FileStatus::Copy => copies += 1,
                FileStatus::Result => results += 1,
                _ => {}
            }
            debug!(path = %record.path.display(), %status, "classified file");
            manifest.copy_files.insert(record.path, status);
        }

        // Keep a traced symlink only if it still is one and its target still
        // exists.
        for (link, target) in std::mem::take(symlinks) {
            match fs::symlink_metadata(&link) {
                Ok(meta) if meta.file_type().is_symlink() => {}
                Ok(_) => {
                    warn!(link = %link.display(), "traced symlink is not a symlink anymore");
                    continue;
                }
                Err(err) => {
                    warn!(link = %link.display(), %err, "failed to check traced symlink");
                    continue;
                }
            }
            if !matches!(target.try_exists(), Ok(true)) {
                debug!(
                    link = %link.display(),
                    target = %target.display(),
                    "traced symlink target no longer exists"
                );
                continue;
            }
            debug!(link = %link.display(), "preserving symlink");
            manifest.symlinks.insert(link, target);
        }

        info!(
            copies,
            results,
            symlinks = manifest.symlinks.len(),
            "classified remaining files"
        );
    }
}
