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

//! The system-package database: which dpkg package owns which file.
//!
//! Loading runs in three stages. First `dpkg -l` enumerates the installed
//! packages. Then (optionally) the cached apt repository indices are
//! cross-checked so that packages which cannot be re-fetched from a
//! configured source are dropped -- a manually installed .deb cannot be
//! reproduced in the replay image, so its files are copied instead. Finally
//! each surviving package's installed-file list is inserted into a
//! [`PathTrie`] for exact path-to-package lookups.

use crate::{
    error::{Error, ErrorExt, ErrorImpl},
    process,
    trie::PathTrie,
};

use std::{
    collections::HashMap,
    fs,
    io::{BufRead, BufReader},
    path::Path,
    sync::Arc,
};

use once_cell::sync::Lazy;
use tracing::{debug, warn};

/// Where dpkg keeps the per-package `<name>.list` file inventories.
const DPKG_INFO_DIR: &str = "/var/lib/dpkg/info";
/// Where apt caches the repository indices (`*_Packages`, possibly
/// compressed).
const APT_LISTS_DIR: &str = "/var/lib/apt/lists";

/// The dpkg architecture name of the host, used to retry qualified
/// (`name:arch`) lookups.
static HOST_ARCH: Lazy<Option<&'static str>> = Lazy::new(|| {
    match std::env::consts::ARCH {
        "x86_64" => Some("amd64"),
        "aarch64" => Some("arm64"),
        "x86" => Some("i386"),
        "arm" => Some("armhf"),
        "powerpc64" => Some("ppc64el"),
        "riscv64" => Some("riscv64"),
        "s390x" => Some("s390x"),
        _ => None,
    }
});

/// One installed system package.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebPackage {
    pub name: String,
    pub version: String,
    /// Multi-arch qualifier, when dpkg lists the package as `name:arch`.
    pub arch: Option<String>,
    /// Whether a cached repository index still carries this exact version.
    pub in_source_list: bool,
}

impl DebPackage {
    fn parse_name(listed: &str, version: &str) -> Self {
        let (name, arch) = match listed.split_once(':') {
            Some((name, arch)) => (name.to_string(), Some(arch.to_string())),
            None => (listed.to_string(), None),
        };
        Self {
            name,
            version: version.to_string(),
            arch,
            in_source_list: false,
        }
    }

    /// The name as dpkg lists it (`name` or `name:arch`).
    pub fn full_name(&self) -> String {
        match &self.arch {
            Some(arch) => format!("{}:{}", self.name, arch),
            None => self.name.clone(),
        }
    }
}

type Packages = HashMap<String, DebPackage>;

/// Parse the fixed-column listing produced by `dpkg -l`: header lines are
/// skipped until the `+++-` column separator, and only `ii` (fully
/// installed) rows are kept.
pub(crate) fn parse_installed(input: impl BufRead) -> Result<Packages, Error> {
    let mut packages = Packages::new();
    let mut in_body = false;

    for line in input.lines() {
        let line = line.map_err(|err| ErrorImpl::OsError {
            operation: "read dpkg listing".into(),
            source: err,
        })?;
        if !in_body {
            in_body = line.starts_with("+++-");
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }

        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next(), fields.next()) {
            (Some(status), Some(name), Some(version)) => {
                if status == "ii" {
                    packages.insert(name.to_string(), DebPackage::parse_name(name, version));
                }
            }
            _ => warn!(line, "failed to parse line from dpkg listing"),
        }
    }

    Ok(packages)
}

/// Scan one repository index (a sequence of RFC822-style records) and mark
/// every installed package whose `Package` (possibly with `:Architecture`
/// appended) and `Version` both match.
pub(crate) fn mark_in_sources(packages: &mut Packages, index: &str) {
    let mut name: Option<String> = None;
    let mut version: Option<String> = None;
    let mut architecture: Option<String> = None;

    for line in index.lines() {
        if let Some(rest) = line.strip_prefix("Package:") {
            name = Some(rest.trim().to_string());
            version = None;
            architecture = None;
        } else if let Some(rest) = line.strip_prefix("Version:") {
            if version.is_none() {
                version = Some(rest.trim().to_string());
            }
        } else if let Some(rest) = line.strip_prefix("Architecture:") {
            if architecture.is_none() {
                architecture = Some(rest.trim().to_string());
            }
        }

        if let (Some(pkg_version), Some(pkg_arch)) = (version.as_deref(), architecture.as_deref())
        {
            // A record is complete once all three fields have been seen.
            if let Some(pkg_name) = name.take() {
                let qualified = format!("{pkg_name}:{pkg_arch}");
                let key = if packages.contains_key(&pkg_name) {
                    Some(pkg_name)
                } else if packages.contains_key(&qualified) {
                    Some(qualified)
                } else {
                    None
                };
                let entry = key.and_then(|key| packages.get_mut(&key));
                if let Some(pkg) = entry {
                    if pkg.version == pkg_version {
                        pkg.in_source_list = true;
                    }
                }
            }
        }
    }
}

/// Whether a cached index filename looks like `*_Packages`, possibly with a
/// compression suffix.
fn is_index_file(filename: &str) -> bool {
    let stem = filename
        .strip_suffix(".gz")
        .or_else(|| filename.strip_suffix(".lz4"))
        .or_else(|| filename.strip_suffix(".xz"))
        .unwrap_or(filename);
    stem.strip_suffix("_Packages")
        .is_some_and(|prefix| !prefix.is_empty())
}

/// Cross-check `packages` against every cached index in `lists_dir` and drop
/// the ones no index still provides.
///
/// Note that `apt update` against a repository that moved to a newer version
/// makes the installed version unavailable; such packages are dropped too
/// and end up copied into the image.
fn drop_unavailable(packages: &mut Packages, lists_dir: &Path) -> Result<(), Error> {
    let entries = fs::read_dir(lists_dir).map_err(|err| ErrorImpl::OsError {
        operation: format!("enumerate repository indices in {}", lists_dir.display()).into(),
        source: err,
    })?;

    for entry in entries.flatten() {
        let filename = entry.file_name();
        let Some(filename) = filename.to_str() else {
            continue;
        };
        if !is_index_file(filename) {
            continue;
        }
        let index = process::read_index(&entry.path())
            .with_wrap(|| format!("decompress repository index {filename}"))?;
        mark_in_sources(packages, &index);
    }

    packages.retain(|listed_name, pkg| {
        if !pkg.in_source_list {
            warn!(
                package = listed_name,
                version = pkg.version,
                "package is not in any source list, removing it; it might have been \
                 installed manually, and traced files from it will be copied directly"
            );
        }
        pkg.in_source_list
    });

    Ok(())
}

/// Installed packages and the path trie over the files they own.
#[derive(Debug)]
pub struct DpkgDatabase {
    packages: HashMap<String, Arc<DebPackage>>,
    files: PathTrie<Arc<DebPackage>>,
}

impl DpkgDatabase {
    /// Load the host's database: `dpkg -l`, `/var/lib/apt/lists` and
    /// `/var/lib/dpkg/info`.
    pub fn system_database(detect_manually_installed: bool) -> Result<Self, Error> {
        let listing = process::capture_stdout("dpkg", ["-l"]).wrap("run 'dpkg -l'")?;
        let mut packages = parse_installed(BufReader::new(listing.as_bytes()))?;
        if detect_manually_installed {
            drop_unavailable(&mut packages, Path::new(APT_LISTS_DIR))?;
        }
        Ok(Self::from_packages(packages, Path::new(DPKG_INFO_DIR)))
    }

    /// Build the path trie for `packages` from the `.list` inventories in
    /// `info_dir`. A missing or unreadable list file degrades that package
    /// (its files resolve as copies), not the run.
    pub(crate) fn from_packages(packages: Packages, info_dir: &Path) -> Self {
        let packages: HashMap<String, Arc<DebPackage>> = packages
            .into_iter()
            .map(|(name, pkg)| (name, Arc::new(pkg)))
            .collect();

        let mut files = PathTrie::new();
        for (listed_name, pkg) in &packages {
            let list_file = info_dir.join(format!("{listed_name}.list"));
            let contents = match fs::read_to_string(&list_file) {
                Ok(contents) => contents,
                Err(err) => {
                    warn!(
                        package = listed_name,
                        list_file = %list_file.display(),
                        %err,
                        "package list file is not readable"
                    );
                    continue;
                }
            };
            for line in contents.lines() {
                if !line.is_empty() {
                    files.insert(line, Arc::clone(pkg));
                }
            }
        }

        debug!(packages = packages.len(), "loaded dpkg database");
        Self { packages, files }
    }

    /// Exact lookup of the package owning `path`.
    pub fn lookup_by_path(&self, path: &Path) -> Option<&Arc<DebPackage>> {
        self.files.find(path)
    }

    /// Look a package up by name, retrying with the host architecture
    /// qualifier (`name:amd64`) appended.
    pub fn lookup_by_name(&self, name: &str) -> Option<&Arc<DebPackage>> {
        self.packages.get(name).or_else(|| {
            let arch = (*HOST_ARCH)?;
            self.packages.get(&format!("{name}:{arch}"))
        })
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}
