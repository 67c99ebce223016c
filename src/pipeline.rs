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

//! The capture pipeline: trace the command, resolve the traced files against
//! the package databases, and produce the manifest.

use crate::{
    environment::Environment,
    error::{Error, ErrorExt, ErrorImpl},
    fsutil::SymlinkMap,
    manifest::{sections, Manifest},
    monitor::{StopHandle, SyscallMonitor, TraceeStatus},
    resolve::{
        is_font_uuid_file, CopyFileResolver, DebPackageResolver, IgnoreFileMap, IgnoreResolver,
        RPackageResolver, ResolverChain,
    },
    rpkg::RpkgDatabase,
    tracer::{FileRecord, FileTracer},
};

use std::{collections::HashSet, fs, path::PathBuf, process::Command, sync::Arc, thread};

use tracing::{debug, info, warn};

/// Prefixes that are never worth carrying into an image: virtual
/// filesystems, loader/locale caches, and machine-local caches.
pub const DEFAULT_IGNORED: &[&str] = &[
    "/dev",
    "/etc/ld.so.cache",
    "/etc/nsswitch.conf",
    "/etc/passwd",
    "/proc",
    "/sys",
    // created by locale-gen
    "/usr/lib/locale/locale-archive",
    // fonts should be installed from a package
    "/usr/local/share/fonts",
    // cache is usually not transferable anyway
    "/var/cache",
];

/// Package-name substrings whose system packages are never resolved (their
/// files are copied instead).
pub const DEFAULT_DEB_SKIPLIST: &[&str] = &["rstudio", "bslib"];

/// Filename the manifest is persisted under in the output directory.
const MANIFEST_FILENAME: &str = "manifest.conf";

/// Everything the core needs to capture one run.
#[derive(Debug, Clone)]
pub struct Options {
    /// The command to trace.
    pub cmd: Vec<String>,
    /// The R interpreter used to enumerate installed packages.
    pub r_bin: PathBuf,
    /// Where the manifest file is written.
    pub output_dir: PathBuf,
    /// Declared result paths of the run.
    pub results: HashSet<PathBuf>,
    /// Ignore-list seeds (wildcard prefixes).
    pub ignored: Vec<PathBuf>,
    /// Drop system packages that no repository index still provides.
    pub detect_manually_installed: bool,
    /// Substring skiplist for the system-package resolver.
    pub deb_skiplist: Vec<String>,
    /// Open the manifest in `$VISUAL`/`$EDITOR` for review before returning.
    pub review: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cmd: Vec::new(),
            r_bin: PathBuf::from("R"),
            output_dir: PathBuf::from("."),
            results: HashSet::new(),
            ignored: DEFAULT_IGNORED.iter().map(PathBuf::from).collect(),
            detect_manually_installed: false,
            deb_skiplist: DEFAULT_DEB_SKIPLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
            review: false,
        }
    }
}

/// Capture a run with `options` and return its manifest.
///
/// Convenience wrapper; use [`Pipeline`] directly when the caller needs the
/// [`StopHandle`] for ctrl-C handling.
pub fn execute(options: Options) -> Result<Manifest, Error> {
    Pipeline::new(options).execute()
}

/// The staged capture-and-resolve pipeline.
#[derive(Debug)]
pub struct Pipeline {
    options: Options,
    stop: StopHandle,
}

impl Pipeline {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            stop: StopHandle::default(),
        }
    }

    /// Cancellation handle, valid for the lifetime of the pipeline. Stable
    /// across `execute`, so it can be registered with a signal handler up
    /// front.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn execute(&self) -> Result<Manifest, Error> {
        if self.options.cmd.is_empty() {
            return Err(ErrorImpl::InvalidArgument {
                name: "cmd".into(),
                description: "no command to trace".into(),
            }
            .into());
        }
        fs::create_dir_all(&self.options.output_dir).map_err(|err| ErrorImpl::OsError {
            operation: format!(
                "create output directory {}",
                self.options.output_dir.display()
            )
            .into(),
            source: err,
        })?;

        let envir = Environment::capture()?;
        let records = self.trace()?;
        let mut manifest = self.resolve(envir, records)?;
        self.review(&mut manifest)?;

        let manifest_file = self.options.output_dir.join(MANIFEST_FILENAME);
        fs::write(&manifest_file, sections::save_manifest(&manifest)?).map_err(|err| {
            ErrorImpl::OsError {
                operation: format!("write manifest to {}", manifest_file.display()).into(),
                source: err,
            }
        })?;
        info!(manifest = %manifest_file.display(), "manifest written");

        Ok(manifest)
    }

    /// Run the command under the syscall monitor and collect the traced
    /// file records.
    fn trace(&self) -> Result<Vec<FileRecord>, Error> {
        info!(cmd = self.options.cmd.join(" "), "tracing program");

        let mut tracer = FileTracer::new();
        let monitor = SyscallMonitor::new(self.options.cmd.iter().cloned())
            .with_stop_handle(self.stop.clone());
        let status = monitor.run(&mut tracer)?;

        info!(
            syscalls = tracer.syscalls_seen(),
            files = tracer.files().len(),
            "finished tracing"
        );

        match status {
            TraceeStatus::Failure => Err(ErrorImpl::TraceeSpawnFailure.into()),
            TraceeStatus::Signal(signal) => {
                Err(ErrorImpl::TraceeSignalled { signal }.into())
            }
            TraceeStatus::Exit(code) => {
                if code != 0 {
                    // The manifest is still produced; replaying a failing
                    // program reproduces the failure, which is the point.
                    warn!(code, "traced program exited non-zero");
                }
                Ok(tracer.into_records())
            }
        }
    }

    /// Build both package databases and run the resolver chain.
    fn resolve(&self, envir: Environment, records: Vec<FileRecord>) -> Result<Manifest, Error> {
        // The databases are independent; build them concurrently and share
        // them read-only afterwards.
        let (dpkg, rpkg) = thread::scope(|scope| {
            let dpkg = scope.spawn(|| {
                crate::dpkg::DpkgDatabase::system_database(self.options.detect_manually_installed)
            });
            let rpkg = scope.spawn(|| RpkgDatabase::from_interpreter(&self.options.r_bin));
            (join_db(dpkg), join_db(rpkg))
        });
        let dpkg = Arc::new(dpkg.wrap("load the system package database")?);
        let rpkg = Arc::new(rpkg.wrap("load the R package database")?);
        debug!(
            deb_packages = dpkg.len(),
            r_packages = rpkg.len(),
            "package databases loaded"
        );

        let symlinks = Arc::new(SymlinkMap::new());

        let mut ignore = IgnoreFileMap::new(Arc::clone(&symlinks));
        for path in &self.options.ignored {
            ignore.add_wildcard(path);
        }
        ignore.add_custom(is_font_uuid_file);

        let mut manifest = Manifest {
            cmd: self.options.cmd.clone(),
            cwd: envir.cwd.clone(),
            env: envir.vars,
            user: envir.user,
            timezone: envir.timezone,
            distribution: crate::environment::OsRelease::load()
                .map(|release| release.tag())
                .unwrap_or_else(|| {
                    warn!("failed to load os-release information");
                    String::new()
                }),
            ..Manifest::default()
        };

        let mut chain = ResolverChain::new();
        chain.add("ignore", IgnoreResolver::new(ignore));
        chain.add(
            "deb",
            DebPackageResolver::new(
                Arc::clone(&dpkg),
                Arc::clone(&symlinks),
                self.options.deb_skiplist.clone(),
            ),
        );
        chain.add(
            "rpkg",
            RPackageResolver::new(Arc::clone(&rpkg), Arc::clone(&symlinks)),
        );
        chain.add(
            "copy",
            CopyFileResolver::new(envir.cwd, self.options.results.clone()),
        );
        chain.run(records, &mut manifest);

        Ok(manifest)
    }

    /// Offer the manifest for review in the user's editor and re-read it if
    /// the editor changed the file.
    fn review(&self, manifest: &mut Manifest) -> Result<(), Error> {
        if !self.options.review || manifest.copy_files.is_empty() {
            return Ok(());
        }

        let Some(editor) = editor_command() else {
            warn!("no editor found; set the VISUAL or EDITOR environment variable");
            return Ok(());
        };

        let file = tempfile::Builder::new()
            .prefix("replicar-manifest")
            .suffix(".conf")
            .tempfile()
            .map_err(|err| ErrorImpl::OsError {
                operation: "create manifest review file".into(),
                source: err,
            })?;
        fs::write(file.path(), sections::save_manifest(manifest)?).map_err(|err| {
            ErrorImpl::OsError {
                operation: "write manifest review file".into(),
                source: err,
            }
        })?;
        let before = fs::metadata(file.path()).and_then(|meta| meta.modified()).ok();

        debug!(path = %file.path().display(), %editor, "opening the manifest file");
        let status = Command::new(&editor).arg(file.path()).status();
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                warn!(%editor, %status, "editor exited unsuccessfully; keeping the manifest as-is");
                return Ok(());
            }
            Err(err) => {
                warn!(%editor, %err, "failed to spawn the editor; keeping the manifest as-is");
                return Ok(());
            }
        }

        let after = fs::metadata(file.path()).and_then(|meta| meta.modified()).ok();
        if before.is_some() && before == after {
            debug!("manifest untouched by the editor");
            return Ok(());
        }

        let contents = fs::read_to_string(file.path()).map_err(|err| ErrorImpl::OsError {
            operation: "re-read the reviewed manifest".into(),
            source: err,
        })?;
        sections::load_manifest(manifest, &contents)
    }
}

fn editor_command() -> Option<String> {
    std::env::var("VISUAL")
        .ok()
        .filter(|cmd| !cmd.is_empty())
        .or_else(|| std::env::var("EDITOR").ok().filter(|cmd| !cmd.is_empty()))
}

fn join_db<T>(handle: thread::ScopedJoinHandle<'_, Result<T, Error>>) -> Result<T, Error> {
    handle.join().map_err(|_| {
        Error::from(ErrorImpl::Protocol {
            description: "package database builder thread panicked".into(),
        })
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::manifest::FileStatus;
    use crate::tests::common::child_lock;

    use std::path::Path;

    use anyhow::Error as TestError;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_command_is_rejected() {
        let err = execute(Options::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn default_ignore_seeds_cover_virtual_filesystems() {
        let options = Options::default();
        for path in ["/dev", "/proc", "/sys"] {
            assert!(
                options.ignored.contains(&PathBuf::from(path)),
                "{path} must be seeded"
            );
        }
        assert!(options.deb_skiplist.iter().any(|s| s == "rstudio"));
    }

    // Trace a real shell command and push the traced set through an
    // ignore+copy chain (the package stages need a host database, which unit
    // tests cannot rely on).
    fn trace_and_classify(cmd: &[&str]) -> Result<Manifest, TestError> {
        let mut tracer = FileTracer::new();
        let status = SyscallMonitor::new(cmd.iter().copied()).run(&mut tracer)?;
        assert_eq!(status, crate::monitor::TraceeStatus::Exit(0));

        let symlinks = Arc::new(SymlinkMap::new());
        let mut ignore = IgnoreFileMap::new(Arc::clone(&symlinks));
        for path in DEFAULT_IGNORED {
            ignore.add_wildcard(path);
        }

        let mut chain = ResolverChain::new();
        chain.add("ignore", IgnoreResolver::new(ignore));
        chain.add(
            "copy",
            CopyFileResolver::new(std::env::current_dir()?, HashSet::new()),
        );

        let mut manifest = Manifest::default();
        chain.run(tracer.into_records(), &mut manifest);
        Ok(manifest)
    }

    #[test]
    fn traced_input_files_are_classified_for_copying() -> Result<(), TestError> {
        let _guard = child_lock();
        let input = tempfile::NamedTempFile::new()?;
        std::fs::write(input.path(), "myhost\n")?;
        let cmd = format!("cat {}", input.path().display());
        let manifest = trace_and_classify(&["sh", "-c", &cmd])?;

        assert_eq!(
            manifest.copy_files.get(input.path()),
            Some(&FileStatus::Copy),
            "an unresolved pre-existing input is copied"
        );
        assert!(
            !manifest.copy_files.contains_key(Path::new("/etc/ld.so.cache")),
            "the loader cache is on the default ignore list"
        );
        Ok(())
    }

    #[test]
    fn files_created_by_the_program_become_results() -> Result<(), TestError> {
        let _guard = child_lock();
        let dir = tempfile::TempDir::new()?;
        let out = dir.path().join("out");
        let cmd = format!("echo hi > {}", out.display());
        let manifest = trace_and_classify(&["sh", "-c", &cmd])?;

        assert_eq!(
            manifest.copy_files.get(&out),
            Some(&FileStatus::Result),
            "a file the program created did not exist before and is a result"
        );
        Ok(())
    }
}
