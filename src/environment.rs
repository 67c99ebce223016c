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

//! Capture of the ambient execution environment: working directory,
//! environment variables, user identity, timezone and distribution.

use crate::{
    error::{Error, ErrorImpl},
    process,
};

use std::{
    collections::HashMap,
    ffi::CString,
    fs,
    io::{Error as IOError, ErrorKind as IOErrorKind},
    path::{Path, PathBuf},
};

use nix::unistd::{getgid, getgrouplist, getuid, Gid, Group, User};
use tracing::{debug, warn};

const DEFAULT_TIMEZONE: &str = "UTC";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupInfo {
    pub gid: u32,
    pub name: String,
}

/// The identity the replay image recreates, so files keep their ownership
/// and the program sees the same user.
#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub uid: u32,
    pub username: String,
    pub group: GroupInfo,
    pub groups: Vec<GroupInfo>,
    pub home: PathBuf,
    pub shell: PathBuf,
}

fn group_info(gid: Gid) -> Result<Option<GroupInfo>, Error> {
    let group = Group::from_gid(gid).map_err(|err| ErrorImpl::OsError {
        operation: format!("look up group {gid}").into(),
        source: err.into(),
    })?;
    Ok(group.map(|group| GroupInfo {
        gid: group.gid.as_raw(),
        name: group.name,
    }))
}

impl UserInfo {
    pub fn current() -> Result<Self, Error> {
        let uid = getuid();
        let gid = getgid();

        let user = User::from_uid(uid)
            .map_err(|err| ErrorImpl::OsError {
                operation: format!("look up passwd entry for uid {uid}").into(),
                source: err.into(),
            })?
            .ok_or_else(|| ErrorImpl::OsError {
                operation: format!("look up passwd entry for uid {uid}").into(),
                source: IOError::from(IOErrorKind::NotFound),
            })?;

        let primary = group_info(gid)?.ok_or_else(|| ErrorImpl::OsError {
            operation: format!("look up group entry for gid {gid}").into(),
            source: IOError::from(IOErrorKind::NotFound),
        })?;

        let username = CString::new(user.name.clone()).map_err(|_| ErrorImpl::OsError {
            operation: "encode username".into(),
            source: IOError::from(IOErrorKind::InvalidData),
        })?;
        let mut groups = Vec::new();
        match getgrouplist(&username, gid) {
            Ok(gids) => {
                for gid in gids {
                    match group_info(gid)? {
                        Some(info) => groups.push(info),
                        // Stale gid without a group entry; nothing to recreate.
                        None => debug!(%gid, "skipping group without a group database entry"),
                    }
                }
            }
            Err(err) => warn!(user = user.name, %err, "failed to get supplementary groups"),
        }

        Ok(Self {
            uid: uid.as_raw(),
            username: user.name,
            group: primary,
            groups,
            home: user.dir,
            shell: user.shell,
        })
    }
}

/// `ID`/`VERSION_ID` of `/etc/os-release`, used for the manifest's
/// distribution tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    pub distribution: String,
    pub release: String,
}

impl OsRelease {
    pub fn load() -> Option<Self> {
        let contents = fs::read_to_string("/etc/os-release").ok()?;
        Some(Self::parse(&contents))
    }

    pub(crate) fn parse(contents: &str) -> Self {
        let mut release = Self::default();
        for line in contents.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "ID" => release.distribution = value.to_string(),
                "VERSION_ID" => release.release = value.to_string(),
                _ => {}
            }
        }
        release
    }

    /// `<id>:<version>` tag of the distribution; a rolling debian without a
    /// version id maps to sid.
    pub fn tag(&self) -> String {
        let release = if self.distribution == "debian" && self.release.is_empty() {
            "sid"
        } else {
            &self.release
        };
        format!("{}:{}", self.distribution, release)
    }
}

/// Snapshot of the environment around one traced run.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub cwd: PathBuf,
    pub vars: HashMap<String, String>,
    pub user: UserInfo,
    pub timezone: String,
}

impl Environment {
    pub fn capture() -> Result<Self, Error> {
        let cwd = std::env::current_dir().map_err(|err| ErrorImpl::OsError {
            operation: "get current working directory".into(),
            source: err,
        })?;
        debug!(cwd = %cwd.display(), "current working directory");

        let mut vars = HashMap::new();
        for (key, value) in std::env::vars_os() {
            match (key.into_string(), value.into_string()) {
                (Ok(key), Ok(value)) => {
                    vars.insert(key, value);
                }
                (key, _) => {
                    warn!(?key, "skipping non-unicode environment variable");
                }
            }
        }

        let user = UserInfo::current()?;
        debug!(user = user.username, "current user");

        let timezone = system_timezone().unwrap_or_else(|| {
            warn!("failed to get timezone information, falling back to {DEFAULT_TIMEZONE}");
            DEFAULT_TIMEZONE.to_string()
        });

        Ok(Self {
            cwd,
            vars,
            user,
            timezone,
        })
    }
}

/// The host timezone: `$TZ`, then `/etc/timezone`, then `timedatectl`.
fn system_timezone() -> Option<String> {
    if let Ok(tz) = std::env::var("TZ") {
        if !tz.is_empty() {
            return Some(tz);
        }
    }

    if let Some(tz) = first_line(Path::new("/etc/timezone")) {
        return Some(tz);
    }

    process::capture_stdout("timedatectl", ["show", "--property=Timezone", "--value"])
        .ok()
        .map(|out| out.trim().to_string())
        .filter(|tz| !tz.is_empty())
}

fn first_line(path: &Path) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    let line = contents.lines().next()?.trim();
    (!line.is_empty()).then(|| line.to_string())
}
