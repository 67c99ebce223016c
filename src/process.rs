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

//! Thin wrappers around [`std::process::Command`] for the external tools the
//! databases shell out to (`dpkg`, the index decompressors, `R`,
//! `timedatectl`, the manifest editor).

use crate::error::{Error, ErrorImpl};

use std::{
    ffi::OsStr,
    path::Path,
    process::{Command, Stdio},
};

/// Run `program` with `args` and capture its stdout as a (lossy) string.
/// A non-zero exit status is an error; stderr passes through to ours.
pub(crate) fn capture_stdout<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = S>,
) -> Result<String, Error> {
    let program = program.as_ref();
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| ErrorImpl::OsError {
            operation: format!("spawn {program:?}").into(),
            source: err,
        })?;

    if !output.status.success() {
        return Err(ErrorImpl::CommandFailed {
            command: format!("{program:?}").into(),
            status: output.status,
        }
        .into());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Read a repository index, decompressing through the external tool matching
/// the filename suffix (the same tools apt itself ships with).
pub(crate) fn read_index(path: &Path) -> Result<String, Error> {
    let extension = path.extension().and_then(OsStr::to_str);
    match extension {
        Some("gz") => capture_stdout("gunzip", [path.as_os_str(), OsStr::new("-c")]),
        Some("lz4") => capture_stdout("lz4", [OsStr::new("-cd"), path.as_os_str()]),
        // xzcat is equivalent to xz --decompress --stdout.
        Some("xz") => capture_stdout("xzcat", [path.as_os_str()]),
        _ => std::fs::read_to_string(path).map_err(|err| {
            ErrorImpl::OsError {
                operation: format!("read index {}", path.display()).into(),
                source: err,
            }
            .into()
        }),
    }
}
