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

//! Error types for replicar.

use std::{borrow::Cow, io::Error as IOError};

/// Opaque error type for replicar.
///
/// If you wish to do non-trivial error handling with replicar errors, use
/// [`Error::kind`] to get an [`ErrorKind`] you can handle programmatically.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct Error(#[from] Box<ErrorImpl>);

impl<E: Into<ErrorImpl>> From<E> for Error {
    #[doc(hidden)]
    fn from(err: E) -> Self {
        Self(Box::new(err.into()))
    }
}

impl Error {
    /// Get the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        self.0.kind()
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ErrorImpl {
    #[error("invalid {name} argument: {description}")]
    InvalidArgument {
        name: Cow<'static, str>,
        description: Cow<'static, str>,
    },

    #[error("trace protocol violated: {description}")]
    Protocol { description: Cow<'static, str> },

    #[error("failed to spawn the traced program")]
    TraceeSpawnFailure,

    #[error("traced program was terminated by signal {signal}")]
    TraceeSignalled { signal: i32 },

    #[error("cycle detected in package dependencies: {name}")]
    CycleDetected { name: String },

    #[error("invalid manifest: {description}")]
    InvalidManifest { description: Cow<'static, str> },

    #[error("{command} exited with {status}")]
    CommandFailed {
        command: Cow<'static, str>,
        status: std::process::ExitStatus,
    },

    #[error("{operation} failed")]
    OsError {
        operation: Cow<'static, str>,
        source: IOError,
    },

    #[error("{context}")]
    Wrapped {
        context: Cow<'static, str>,
        source: Box<ErrorImpl>,
    },
}

/// Underlying error class for replicar errors.
///
/// This is similar in concept to [`std::io::ErrorKind`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The provided arguments to replicar were invalid.
    InvalidArgument,
    /// The kernel tracing interface reported a state replicar cannot recover
    /// from. The run is aborted.
    ProtocolError,
    /// The traced program could not be spawned at all (usually the command
    /// does not exist). No manifest is produced.
    TraceeSpawnFailure,
    /// The traced program was terminated by the given signal number.
    TraceeSignalled(i32),
    /// The language-package dependency graph contains a cycle through the
    /// named package. Only topological queries can produce this.
    CycleDetected,
    /// A manifest file could not be parsed or constructed (bad section name,
    /// duplicate section, content outside of a section).
    InvalidManifest,
    /// An external tool exited unsuccessfully.
    CommandFailed,
    /// The underlying error came from a system call. The provided
    /// [`std::io::RawOsError`] is the numerical value of the `errno` number,
    /// if available.
    OsError(Option<i32>),
    /// Some internal error occurred. For more information, see the string
    /// description of the original [`Error`].
    InternalError,
}

impl ErrorImpl {
    pub(crate) fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Protocol { .. } => ErrorKind::ProtocolError,
            Self::TraceeSpawnFailure => ErrorKind::TraceeSpawnFailure,
            Self::TraceeSignalled { signal } => ErrorKind::TraceeSignalled(*signal),
            Self::CycleDetected { .. } => ErrorKind::CycleDetected,
            Self::InvalidManifest { .. } => ErrorKind::InvalidManifest,
            Self::CommandFailed { .. } => ErrorKind::CommandFailed,
            Self::OsError { source, .. } => ErrorKind::OsError(source.raw_os_error()),
            Self::Wrapped { source, .. } => source.kind(),
        }
    }
}

// Private trait necessary to work around the "orphan trait" restriction.
pub(crate) trait ErrorExt: Sized {
    /// Wrap a `Result<..., Error>` with an additional context string.
    fn wrap<S: Into<String>>(self, context: S) -> Self {
        self.with_wrap(|| context.into())
    }

    /// Wrap a `Result<..., Error>` with an additional context string created
    /// by a closure.
    fn with_wrap<F>(self, context_fn: F) -> Self
    where
        F: FnOnce() -> String;
}

impl ErrorExt for ErrorImpl {
    fn with_wrap<F>(self, context_fn: F) -> Self
    where
        F: FnOnce() -> String,
    {
        Self::Wrapped {
            context: context_fn().into(),
            source: self.into(),
        }
    }
}

impl ErrorExt for Error {
    fn with_wrap<F>(self, context_fn: F) -> Self
    where
        F: FnOnce() -> String,
    {
        self.0.with_wrap(context_fn).into()
    }
}

impl<T, E: ErrorExt> ErrorExt for Result<T, E> {
    fn with_wrap<F>(self, context_fn: F) -> Self
    where
        F: FnOnce() -> String,
    {
        self.map_err(|err| err.with_wrap(context_fn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn error_kind_os_error() {
        let err = Error::from(ErrorImpl::OsError {
            operation: "stat manifest".into(),
            source: IOError::from_raw_os_error(libc::ENOENT),
        });
        assert_eq!(
            err.kind(),
            ErrorKind::OsError(Some(libc::ENOENT)),
            "ErrorKind::OsError(...) keeps the errno of the source"
        );
    }

    #[test]
    fn error_kind_survives_wrapping() {
        let err = Error::from(ErrorImpl::CycleDetected {
            name: "bslib".into(),
        })
        .wrap("collect transitive dependencies");
        assert_eq!(
            err.kind(),
            ErrorKind::CycleDetected,
            "wrapping must not change the error kind"
        );
        assert_eq!(
            err.to_string(),
            "collect transitive dependencies",
            "wrapping replaces the displayed context"
        );
    }

    #[test]
    fn error_kind_tracee_signalled() {
        assert_eq!(
            Error::from(ErrorImpl::TraceeSignalled { signal: 15 }).kind(),
            ErrorKind::TraceeSignalled(15),
            "signal number is part of the kind"
        );
    }
}
