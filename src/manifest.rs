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

//! The manifest: everything the resolver chain learned about one traced run,
//! and the sole artifact the core hands to the recipe generator.

pub mod format;
pub mod sections;

use crate::{dpkg::DebPackage, environment::UserInfo, rpkg::RPackage};

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::PathBuf,
    sync::Arc,
};

/// Classification of one unresolved (non-package) path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Input file; copied into the replay image.
    Copy,
    /// Declared or detected output of the run; not copied.
    Result,
    /// Created and deleted during the run; nothing to carry over.
    IgnoreDidNotExistBefore,
    /// Existed at trace time but has since disappeared.
    IgnoreNoLongerExist,
    IgnoreNotAccessible,
    IgnoreIsCwd,
    IgnoreIsDirectory,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Copy => "Copy",
            Self::Result => "Result file",
            Self::IgnoreDidNotExistBefore => "Ignore, did not exist before",
            Self::IgnoreNoLongerExist => "Ignore, no longer exists",
            Self::IgnoreNotAccessible => "Ignore, not accessible",
            Self::IgnoreIsCwd => "Ignore, it is the current working directory",
            Self::IgnoreIsDirectory => "Ignore, it is a directory",
        };
        f.write_str(text)
    }
}

/// Snapshot of one traced run: the command and its environment, plus the
/// resolver chain's verdict for every traced path.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub cmd: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub user: UserInfo,
    pub timezone: String,
    /// `<distribution>:<release>` of the machine the trace ran on.
    pub distribution: String,

    /// Paths no database claimed, with their per-path status.
    pub copy_files: HashMap<PathBuf, FileStatus>,
    /// Resolved system packages, keyed by their listed (`name:arch`) name.
    pub deb_packages: BTreeMap<String, Arc<DebPackage>>,
    /// Resolved language packages, keyed by name.
    pub r_packages: BTreeMap<String, Arc<RPackage>>,
    /// Symlinks to recreate in the image (link -> target).
    pub symlinks: BTreeMap<PathBuf, PathBuf>,
}

impl Manifest {
    /// Paths currently classified as results of the run.
    pub fn result_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.copy_files
            .iter()
            .filter(|(_, status)| **status == FileStatus::Result)
            .map(|(path, _)| path)
    }
}
