// SPDX-License-Identifier: MPL-2.0
/*
 * replicar: trace R computations into a reproducible container manifest
 * Copyright (C) 2024-2026 The replicar authors
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! replicar captures an entire software execution -- the files a program
//! reads, the R packages it depends on, the system packages those files come
//! from, and the user and environment around it -- and produces a manifest
//! from which a clean base image can replay the same computation.
//!
//! The pipeline runs a command under a syscall-level tracer, classifies
//! every touched path through a chain of resolvers backed by the dpkg and R
//! package databases, and emits a [`Manifest`] whose copy section lists the
//! unresolved files for user confirmation.
//!
//! # Example
//!
//! ```no_run
//! # use replicar::{execute, Options};
//! # fn main() -> Result<(), replicar::error::Error> {
//! let manifest = execute(Options {
//!     cmd: vec!["Rscript".into(), "analysis.R".into()],
//!     ..Options::default()
//! })?;
//! println!("{} files to copy", manifest.copy_files.len());
//! # Ok(())
//! # }
//! ```
//!
//! The surrounding CLI (argument parsing, recipe generation, the build
//! driver) lives outside of this crate; the core's only entry point is
//! [`execute`] and the building blocks it is made of, all exported below.

// ptrace, /proc and dpkg only exist on Linux.
#![cfg(target_os = "linux")]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(missing_debug_implementations)]
// We use this the coverage_attribute when doing coverage runs.
// <https://github.com/rust-lang/rust/issues/84605>
#![cfg_attr(coverage, feature(coverage_attribute))]

pub mod error;

mod trie;
#[doc(inline)]
pub use trie::PathTrie;

mod fsutil;
#[doc(inline)]
pub use fsutil::{check_access, AccessStatus, SymlinkMap};

// Process helpers for the external tools.
mod process;

pub mod dpkg;
pub mod rpkg;

pub mod monitor;

mod tracer;
#[doc(inline)]
pub use tracer::{FileKind, FileRecord, FileTracer};

pub mod resolve;

pub mod manifest;
#[doc(inline)]
pub use manifest::Manifest;

pub mod environment;

mod pipeline;
#[doc(inline)]
pub use pipeline::{execute, Options, Pipeline, DEFAULT_DEB_SKIPLIST, DEFAULT_IGNORED};
