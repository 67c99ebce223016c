// SPDX-License-Identifier: MPL-2.0
/*
 * replicar: trace R computations into a reproducible container manifest
 * Copyright (C) 2024-2026 The replicar authors
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

#![deny(unsafe_code)]

//! The file tracer: a [`SyscallListener`] that interprets `open`, `openat`
//! and `execve` and accumulates the set of files the traced program touched.
//!
//! Whether a path existed is probed at syscall *entry* -- that is what
//! distinguishes program inputs from files the program created. The size is
//! captured after a successful exit. Anything that goes wrong for a single
//! path degrades that path with a warning, never the trace.

use crate::{
    error::{Error, ErrorImpl},
    fsutil,
    monitor::{read_tracee_string, SyscallArgs, SyscallListener},
    trie::PathTrie,
};

use std::{
    collections::HashMap,
    ffi::OsString,
    fs, io,
    os::unix::{ffi::OsStringExt, fs::MetadataExt},
    path::{Path, PathBuf},
};

use nix::unistd::Pid;
use tracing::{debug, trace, warn};

const SYS_OPENAT: u64 = libc::SYS_openat as u64;
const SYS_EXECVE: u64 = libc::SYS_execve as u64;
// Legacy open(2) exists on x86_64 but not on newer syscall ABIs (aarch64,
// riscv) where libc always goes through openat(2).
#[cfg(target_arch = "x86_64")]
const SYS_OPEN: u64 = libc::SYS_open as u64;
#[cfg(not(target_arch = "x86_64"))]
const SYS_OPEN: u64 = u64::MAX;

/// Which syscall family produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// `open(2)`/`openat(2)`.
    Open,
    /// `execve(2)`.
    Exec,
}

/// One traced path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Absolute, lexically normalized path.
    pub path: PathBuf,
    /// Size captured at syscall exit; only attempted when the path existed
    /// before.
    pub size: Option<u64>,
    /// Whether the path existed when the syscall entered.
    pub existed_before: bool,
    pub kind: FileKind,
}

/// Per-pid in-flight syscall. The kernel serializes syscalls within one
/// task, so one slot per pid is enough; a second entry without an
/// intervening exit is a protocol violation.
#[derive(Debug)]
struct Pending {
    nr: u64,
    record: Option<FileRecord>,
}

/// Syscall listener that records `(path, existed-before, size)` tuples for
/// the whole process tree.
#[derive(Debug, Default)]
pub struct FileTracer {
    state: HashMap<Pid, Pending>,
    files: HashMap<PathBuf, FileRecord>,
    ignored: PathTrie<()>,
    syscalls: u64,
}

impl FileTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracer that drops any path under the given ignore trie (deepest
    /// prefix match) at registration time.
    pub fn with_ignored(ignored: PathTrie<()>) -> Self {
        Self {
            ignored,
            ..Self::default()
        }
    }

    /// The deduplicated traced file set, keyed by path.
    pub fn files(&self) -> &HashMap<PathBuf, FileRecord> {
        &self.files
    }

    /// Consume the tracer, returning records sorted by path.
    pub fn into_records(self) -> Vec<FileRecord> {
        let mut records: Vec<_> = self.files.into_values().collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        records
    }

    /// Total number of syscall entries seen (handled or not).
    pub fn syscalls_seen(&self) -> u64 {
        self.syscalls
    }

    /// `openat(2)`-style path resolution: absolute paths stand alone,
    /// relative ones resolve against the tracee's cwd (for `AT_FDCWD`) or
    /// the directory the descriptor refers to.
    fn resolve_at(pid: Pid, dirfd: i32, pathname: &Path) -> Option<PathBuf> {
        let base = if pathname.is_absolute() {
            return Some(pathname.to_path_buf());
        } else if dirfd == libc::AT_FDCWD {
            process_cwd(pid).or_else(|| {
                warn!(%pid, "failed to resolve tracee cwd");
                None
            })?
        } else {
            resolve_fd_path(pid, dirfd as i64).or_else(|| {
                warn!(%pid, dirfd, "failed to resolve dirfd");
                None
            })?
        };
        Some(base.join(pathname))
    }

    fn enter_open(&self, pid: Pid, dirfd: i32, pathname: &Path) -> Option<FileRecord> {
        debug!(%pid, path = %pathname.display(), "open");

        let path = Self::resolve_at(pid, dirfd, pathname)?;
        let existed_before = match path.try_exists() {
            Ok(exists) => exists,
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to check if file exists");
                return None;
            }
        };

        Some(FileRecord {
            path,
            size: None,
            existed_before,
            kind: FileKind::Open,
        })
    }

    fn exit_open(&mut self, pid: Pid, retval: i64, record: FileRecord) {
        let entry_path = &record.path;

        // lstat is the sole existence and type gate: a dangling symlink
        // opened with O_PATH|O_NOFOLLOW is still a symlink worth recording,
        // and stat-based probing would drop it before the type check below.
        // Only regular files, directories and symlinks are of interest;
        // /proc fd resolution below also weeds out unnamed resources (pipes,
        // sockets) whose readlink target is not a real path.
        let Ok(meta) = fs::symlink_metadata(entry_path) else {
            return;
        };
        let ftype = meta.file_type();
        if !(ftype.is_file() || ftype.is_dir() || ftype.is_symlink()) {
            warn!(
                path = %entry_path.display(),
                file_type = fsutil::file_type_str(entry_path),
                "unsupported file type"
            );
            return;
        }

        if retval >= 0 {
            match resolve_fd_path(pid, retval) {
                None => {
                    warn!(%pid, fd = retval, "unable to resolve fd to a path");
                }
                Some(exit_path) => {
                    if same_file(&exit_path, entry_path) {
                        self.register(record);
                    } else {
                        // Path race between entry and exit.
                        warn!(
                            entry = %entry_path.display(),
                            exit = %exit_path.display(),
                            "file entry/exit mismatch"
                        );
                    }
                }
            }
        }
    }

    fn register(&mut self, mut record: FileRecord) {
        if !record.path.is_absolute() {
            match std::env::current_dir() {
                Ok(cwd) => record.path = cwd.join(&record.path),
                Err(err) => {
                    warn!(path = %record.path.display(), %err, "failed to make path absolute");
                }
            }
        }
        record.path = fsutil::normalize_lexically(&record.path);

        if self.ignored.find_longest_prefix(&record.path).is_some() {
            debug!(path = %record.path.display(), "ignoring traced file");
            return;
        }

        if record.existed_before {
            record.size = fsutil::file_size(&record.path);
        }

        // First writer wins.
        self.files.entry(record.path.clone()).or_insert(record);
    }
}

/// The tracee's current working directory, from `/proc/<pid>/cwd`.
fn process_cwd(pid: Pid) -> Option<PathBuf> {
    fs::read_link(format!("/proc/{pid}/cwd")).ok()
}

/// The path a tracee file descriptor refers to, from `/proc/<pid>/fd/<n>`.
fn resolve_fd_path(pid: Pid, fd: i64) -> Option<PathBuf> {
    fs::read_link(format!("/proc/{pid}/fd/{fd}")).ok()
}

/// Whether the descriptor's resolved path and the entry-recorded path refer
/// to the same inode. The comparison is tried with both follow and no-follow
/// semantics: an O_NOFOLLOW-style open of a symlink keeps the link's own
/// inode, which only lstat can see on either side.
fn same_file(fd_path: &Path, entry_path: &Path) -> bool {
    fn same_inode(a: io::Result<fs::Metadata>, b: io::Result<fs::Metadata>) -> bool {
        match (a, b) {
            (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
            _ => false,
        }
    }
    same_inode(fs::metadata(fd_path), fs::metadata(entry_path))
        || same_inode(fs::symlink_metadata(fd_path), fs::symlink_metadata(entry_path))
}

impl SyscallListener for FileTracer {
    fn on_syscall_entry(&mut self, pid: Pid, nr: u64, args: &SyscallArgs) -> Result<(), Error> {
        trace!(%pid, nr, "syscall entry");
        self.syscalls = self.syscalls.saturating_add(1);

        let record = match nr {
            SYS_OPEN => {
                let pathname = read_path(pid, args[0])?;
                self.enter_open(pid, libc::AT_FDCWD, &pathname)
            }
            SYS_OPENAT => {
                let pathname = read_path(pid, args[1])?;
                self.enter_open(pid, args[0] as i32, &pathname)
            }
            SYS_EXECVE => {
                let pathname = read_path(pid, args[0])?;
                debug!(%pid, path = %pathname.display(), "execve");
                Some(FileRecord {
                    path: pathname,
                    size: None,
                    existed_before: false,
                    kind: FileKind::Exec,
                })
            }
            _ => return Ok(()),
        };

        if self
            .state
            .insert(pid, Pending { nr, record })
            .is_some()
        {
            return Err(ErrorImpl::Protocol {
                description: format!("pid {pid} already has an in-flight syscall").into(),
            }
            .into());
        }
        Ok(())
    }

    fn on_syscall_exit(&mut self, pid: Pid, retval: i64, is_error: bool) -> Result<(), Error> {
        trace!(%pid, retval, "syscall exit");

        let Some(Pending { nr, record }) = self.state.remove(&pid) else {
            return Ok(());
        };
        if is_error {
            // The syscall failed; nothing was opened or executed.
            return Ok(());
        }

        match nr {
            SYS_OPEN | SYS_OPENAT => {
                if let Some(record) = record {
                    self.exit_open(pid, retval, record);
                }
            }
            SYS_EXECVE => {
                let Some(mut record) = record else {
                    return Err(ErrorImpl::Protocol {
                        description: "execve succeeded but no path was recorded".into(),
                    }
                    .into());
                };
                // Success proves the executable existed.
                record.existed_before = true;
                self.register(record);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Read a NUL-terminated path argument out of the tracee.
fn read_path(pid: Pid, addr: u64) -> Result<PathBuf, Error> {
    let bytes = read_tracee_string(pid, addr, libc::PATH_MAX as usize)?;
    Ok(PathBuf::from(OsString::from_vec(bytes)))
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::monitor::{SyscallMonitor, TraceeStatus};
    use crate::tests::common::child_lock;

    use std::{ffi::CString, io::Write, os::unix::ffi::OsStrExt};

    use anyhow::{Context, Error};
    use pretty_assertions::assert_eq;
    use tempfile::NamedTempFile;

    fn trace_closure(
        tracer: &mut FileTracer,
        tracee: impl FnOnce() -> i32 + Send + 'static,
    ) -> Result<TraceeStatus, Error> {
        let monitor = SyscallMonitor::from_closure(tracee);
        Ok(monitor.run(tracer)?)
    }

    fn test_file(content: &str) -> Result<(NamedTempFile, CString), Error> {
        let mut file = NamedTempFile::with_prefix("replicar-trace-test")?;
        write!(file, "{content}")?;
        let cpath = CString::new(file.path().as_os_str().as_bytes())?;
        Ok((file, cpath))
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn open_syscall_is_recorded() -> Result<(), Error> {
        let _guard = child_lock();
        let (file, cpath) = test_file("test content")?;

        let mut tracer = FileTracer::new();
        let status = trace_closure(&mut tracer, move || {
            // Use the raw syscall: libc's open() wrapper goes through openat.
            // SAFETY: async-signal-safe syscalls on a owned CString.
            let fd = unsafe { libc::syscall(libc::SYS_open, cpath.as_ptr(), libc::O_RDONLY) };
            if fd < 0 {
                return 1;
            }
            // SAFETY: closing the fd we just opened.
            unsafe { libc::close(fd as i32) };
            0
        })?;
        assert_eq!(status, TraceeStatus::Exit(0));

        let record = tracer
            .files()
            .get(file.path())
            .context("opened file recorded")?;
        assert!(record.existed_before);
        assert_eq!(record.size, Some("test content".len() as u64));
        assert_eq!(record.kind, FileKind::Open);
        Ok(())
    }

    #[test]
    fn openat_syscall_is_recorded() -> Result<(), Error> {
        let _guard = child_lock();
        let (file, cpath) = test_file("test content")?;

        let mut tracer = FileTracer::new();
        let status = trace_closure(&mut tracer, move || {
            // SAFETY: async-signal-safe syscalls on a owned CString.
            let fd = unsafe { libc::openat(libc::AT_FDCWD, cpath.as_ptr(), libc::O_RDONLY) };
            if fd < 0 {
                return 1;
            }
            // SAFETY: closing the fd we just opened.
            unsafe { libc::close(fd) };
            0
        })?;
        assert_eq!(status, TraceeStatus::Exit(0));

        let record = tracer
            .files()
            .get(file.path())
            .context("opened file recorded")?;
        assert!(record.existed_before);
        assert_eq!(record.size, Some("test content".len() as u64));
        Ok(())
    }

    #[test]
    fn dangling_symlink_open_is_recorded() -> Result<(), Error> {
        let _guard = child_lock();
        let dir = tempfile::TempDir::new()?;
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("/nonexistent/replicar-target", &link)?;
        let cpath = CString::new(link.as_os_str().as_bytes())?;

        let mut tracer = FileTracer::new();
        let status = trace_closure(&mut tracer, move || {
            // SAFETY: async-signal-safe syscalls on a owned CString.
            let fd = unsafe {
                libc::openat(
                    libc::AT_FDCWD,
                    cpath.as_ptr(),
                    libc::O_PATH | libc::O_NOFOLLOW,
                )
            };
            if fd < 0 {
                return 1;
            }
            // SAFETY: closing the fd we just opened.
            unsafe { libc::close(fd) };
            0
        })?;
        assert_eq!(status, TraceeStatus::Exit(0));

        let record = tracer
            .files()
            .get(&link)
            .context("the link itself is recorded")?;
        assert!(
            !record.existed_before,
            "existence is probed through the link, which dangles"
        );
        assert_eq!(record.size, None);
        Ok(())
    }

    #[test]
    fn failed_open_is_discarded() -> Result<(), Error> {
        let _guard = child_lock();
        let missing = CString::new("/nonexistent/replicar-missing")?;

        let mut tracer = FileTracer::new();
        let status = trace_closure(&mut tracer, move || {
            // SAFETY: probing a nonexistent path.
            unsafe { libc::openat(libc::AT_FDCWD, missing.as_ptr(), libc::O_RDONLY) };
            0
        })?;
        assert_eq!(status, TraceeStatus::Exit(0));
        assert!(
            !tracer.files().contains_key(Path::new("/nonexistent/replicar-missing")),
            "a failed open leaves no record"
        );
        Ok(())
    }

    #[test]
    fn execve_is_recorded() -> Result<(), Error> {
        let _guard = child_lock();
        let executable = Path::new("/bin/true");

        let mut tracer = FileTracer::new();
        let status = trace_closure(&mut tracer, || {
            // Fork a grandchild and exec in it, so the closure child can
            // still report the exit status.
            // SAFETY: async-signal-safe fork/exec/wait dance.
            unsafe {
                let pid = libc::fork();
                if pid == 0 {
                    let prog = c"/bin/true";
                    let argv = [prog.as_ptr(), std::ptr::null()];
                    libc::execv(prog.as_ptr(), argv.as_ptr());
                    libc::_exit(127);
                }
                let mut status = 0;
                libc::waitpid(pid, &mut status, 0);
                libc::WEXITSTATUS(status)
            }
        })?;
        assert_eq!(status, TraceeStatus::Exit(0));

        let record = tracer.files().get(executable).context("execve recorded")?;
        assert!(record.existed_before, "successful exec proves existence");
        assert!(record.size.is_some());
        assert_eq!(record.kind, FileKind::Exec);
        Ok(())
    }

    #[test]
    fn ignore_trie_filters_registration() -> Result<(), Error> {
        let _guard = child_lock();
        let (file1, cpath1) = test_file("test content 1")?;
        let (file2, cpath2) = test_file("test content 2")?;

        let mut ignored = PathTrie::new();
        ignored.insert(file1.path(), ());

        let mut tracer = FileTracer::with_ignored(ignored);
        let status = trace_closure(&mut tracer, move || {
            for cpath in [&cpath1, &cpath2] {
                // SAFETY: async-signal-safe syscalls on owned CStrings.
                let fd = unsafe { libc::openat(libc::AT_FDCWD, cpath.as_ptr(), libc::O_RDONLY) };
                if fd < 0 {
                    return 1;
                }
                // SAFETY: closing the fd we just opened.
                unsafe { libc::close(fd) };
            }
            0
        })?;
        assert_eq!(status, TraceeStatus::Exit(0));

        assert!(
            !tracer.files().contains_key(file1.path()),
            "ignored path never appears in the output set"
        );
        assert!(tracer.files().contains_key(file2.path()));
        assert!(tracer.syscalls_seen() > 0);
        Ok(())
    }

    #[test]
    fn records_deduplicate_first_writer_wins() {
        let mut tracer = FileTracer::new();
        let first = FileRecord {
            path: PathBuf::from("/tmp/x"),
            size: None,
            existed_before: true,
            kind: FileKind::Open,
        };
        let second = FileRecord {
            existed_before: false,
            ..first.clone()
        };
        tracer.register(first);
        tracer.register(second);
        assert!(tracer.files()[Path::new("/tmp/x")].existed_before);
    }

    #[test]
    fn relative_paths_are_normalized() {
        let mut tracer = FileTracer::new();
        tracer.register(FileRecord {
            path: PathBuf::from("/tmp/a/../b/./c"),
            size: None,
            existed_before: false,
            kind: FileKind::Open,
        });
        assert!(tracer.files().contains_key(Path::new("/tmp/b/c")));
    }
}
