// SPDX-License-Identifier: MPL-2.0
/*
 * replicar: trace R computations into a reproducible container manifest
 * Copyright (C) 2024-2026 The replicar authors
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Run a child command under ptrace syscall-stepping and deliver a
//! per-syscall entry/exit event stream to a [`SyscallListener`].
//!
//! The monitor auto-attaches to every process the tracee forks or clones.
//! Within one pid, entry and exit callbacks arrive in strict kernel order;
//! across pids no ordering is promised, so listener state must be keyed on
//! the pid. Callbacks run synchronously on the monitor thread and must not
//! block indefinitely.

// fork/exec and the raw PTRACE_GET_SYSCALL_INFO call need unsafe; everything
// else in the crate forbids it.
#![allow(unsafe_code)]

use crate::error::{Error, ErrorImpl};

use std::{
    ffi::{CString, OsString},
    fs::File,
    io::{IoSliceMut, Read, Write},
    os::unix::{ffi::OsStrExt, io::OwnedFd},
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use memchr::memchr;
use nix::{
    errno::Errno,
    sys::{
        ptrace,
        signal::{kill, raise, Signal},
        uio::{process_vm_readv, RemoteIoVec},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{execvp, fork, pipe, ForkResult, Pid},
};
use once_cell::sync::Lazy;
use tracing::{debug, warn};

/// The six syscall arguments as the kernel reports them at syscall entry.
pub type SyscallArgs = [u64; 6];

/// Receiver of the monitor's event stream.
pub trait SyscallListener {
    fn on_syscall_entry(&mut self, pid: Pid, nr: u64, args: &SyscallArgs) -> Result<(), Error>;
    fn on_syscall_exit(&mut self, pid: Pid, retval: i64, is_error: bool) -> Result<(), Error>;
}

/// How the root tracee ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceeStatus {
    /// Normal exit with the given code.
    Exit(i32),
    /// Terminated by the given signal number.
    Signal(i32),
    /// The command could not be spawned at all.
    Failure,
}

/// Exit code the child reserves to signal "the program could not even be
/// started" (as opposed to "the program ran and failed").
const SPAWN_ERROR_EXIT_CODE: i32 = 254;

/// How long the child may take to reach its initial self-stop.
const INITIAL_STOP_TIMEOUT: Duration = Duration::from_millis(10);

// All tracing options are set in one go on every traced process:
//  - auto-attach to fork(2), vfork(2) and clone(2) children;
//  - kill every traced process if the tracer exits unexpectedly;
//  - tag syscall-stops with bit 7 (SIGTRAP|0x80) so they are separable from
//    genuine SIGTRAPs.
fn trace_options() -> ptrace::Options {
    ptrace::Options::PTRACE_O_TRACEFORK
        | ptrace::Options::PTRACE_O_TRACEVFORK
        | ptrace::Options::PTRACE_O_TRACECLONE
        | ptrace::Options::PTRACE_O_EXITKILL
        | ptrace::Options::PTRACE_O_TRACESYSGOOD
}

static PAGE_SIZE: Lazy<usize> = Lazy::new(rustix::param::page_size);

// struct ptrace_syscall_info from the kernel UAPI; there is no nix wrapper
// for PTRACE_GET_SYSCALL_INFO yet, so the call goes through libc::ptrace.
const PTRACE_GET_SYSCALL_INFO: libc::c_uint = 0x420e;
const PTRACE_SYSCALL_INFO_ENTRY: u8 = 1;
const PTRACE_SYSCALL_INFO_EXIT: u8 = 2;

#[repr(C)]
#[allow(dead_code)] // mirrors the kernel layout; only op and data are read
struct RawSyscallInfo {
    op: u8,
    pad: [u8; 3],
    arch: u32,
    instruction_pointer: u64,
    stack_pointer: u64,
    data: RawSyscallData,
}

#[repr(C)]
#[allow(dead_code)]
union RawSyscallData {
    entry: RawSyscallEntry,
    exit: RawSyscallExit,
    seccomp: RawSyscallSeccomp,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct RawSyscallEntry {
    nr: u64,
    args: [u64; 6],
}

#[derive(Clone, Copy)]
#[repr(C)]
struct RawSyscallExit {
    rval: i64,
    is_error: u8,
}

#[derive(Clone, Copy)]
#[repr(C)]
#[allow(dead_code)] // present for layout parity with the kernel struct
struct RawSyscallSeccomp {
    nr: u64,
    args: [u64; 6],
    ret_data: u32,
}

/// Cancellation handle for a running monitor.
///
/// `stop` sends SIGKILL to the root tracee; the monitor observes the death
/// through its normal wait loop. It is idempotent, safe to call at any time
/// and from a signal handler (it only does an atomic load and a `kill(2)`).
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    pid: Arc<AtomicI32>,
}

impl StopHandle {
    pub fn stop(&self) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid > 0 {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }

    fn set(&self, pid: Option<Pid>) {
        self.pid
            .store(pid.map_or(0, Pid::as_raw), Ordering::SeqCst);
    }
}

/// What runs in the forked child.
enum Tracee {
    /// An argv, spawned via executable-search-path exec.
    Command(Vec<OsString>),
    /// An in-process closure (test seam). It runs between the initial
    /// self-stop and `_exit`, so it must restrict itself to
    /// async-signal-safe operations.
    Closure(Box<dyn FnOnce() -> i32 + Send>),
}

impl std::fmt::Debug for Tracee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command(argv) => f.debug_tuple("Command").field(argv).finish(),
            Self::Closure(_) => f.debug_tuple("Closure").finish(),
        }
    }
}

/// Fork-and-trace driver for one child command.
pub struct SyscallMonitor {
    tracee: Tracee,
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
    stop: StopHandle,
}

impl std::fmt::Debug for SyscallMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallMonitor")
            .field("tracee", &self.tracee)
            .field("stop", &self.stop)
            .finish_non_exhaustive()
    }
}

impl SyscallMonitor {
    pub fn new<S: Into<OsString>>(cmd: impl IntoIterator<Item = S>) -> Self {
        Self::with_tracee(Tracee::Command(cmd.into_iter().map(Into::into).collect()))
    }

    pub(crate) fn from_closure(tracee: impl FnOnce() -> i32 + Send + 'static) -> Self {
        Self::with_tracee(Tracee::Closure(Box::new(tracee)))
    }

    fn with_tracee(tracee: Tracee) -> Self {
        Self {
            tracee,
            stdout: Box::new(std::io::stdout()),
            stderr: Box::new(std::io::stderr()),
            stop: StopHandle::default(),
        }
    }

    /// Replace the sink the tracee's stdout is forwarded to.
    pub fn redirect_stdout(&mut self, sink: impl Write + Send + 'static) {
        self.stdout = Box::new(sink);
    }

    /// Replace the sink the tracee's stderr is forwarded to.
    pub fn redirect_stderr(&mut self, sink: impl Write + Send + 'static) {
        self.stderr = Box::new(sink);
    }

    /// Share a pre-existing cancellation handle (so callers can register
    /// signal handlers before the tracee exists).
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run the tracee to completion, feeding every syscall entry/exit to
    /// `listener`.
    pub fn run<L: SyscallListener>(self, listener: &mut L) -> Result<TraceeStatus, Error> {
        let Self {
            tracee,
            stdout,
            stderr,
            stop,
        } = self;

        // Prepare the argv before forking: the child must not allocate.
        let argv = match &tracee {
            Tracee::Command(cmd) => {
                if cmd.is_empty() {
                    return Err(ErrorImpl::InvalidArgument {
                        name: "cmd".into(),
                        description: "empty command line".into(),
                    }
                    .into());
                }
                cmd.iter()
                    .map(|arg| CString::new(arg.as_bytes()))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| ErrorImpl::InvalidArgument {
                        name: "cmd".into(),
                        description: "argument contains an interior NUL byte".into(),
                    })?
            }
            Tracee::Closure(_) => Vec::new(),
        };

        let (stdout_r, stdout_w) = new_pipe()?;
        let (stderr_r, stderr_w) = new_pipe()?;

        // SAFETY: the child branch only performs async-signal-safe work (fd
        // duplication, ptrace, raise, exec or the caller's closure) before
        // _exit; it never returns into the library.
        match unsafe { fork() }.map_err(|err| ErrorImpl::OsError {
            operation: "fork the tracee process".into(),
            source: err.into(),
        })? {
            ForkResult::Child => {
                run_tracee(tracee, argv, stdout_r, stdout_w, stderr_r, stderr_w)
            }
            ForkResult::Parent { child } => {
                drop(stdout_w);
                drop(stderr_w);
                stop.set(Some(child));

                let stdout_thread = spawn_forwarder(stdout_r, stdout);
                let stderr_thread = spawn_forwarder(stderr_r, stderr);

                let result = run_tracer(child, listener);

                // The tracee is dead (or never started); reap the threads
                // once every writer side of the pipes is gone.
                if result.is_err() {
                    let _ = kill(child, Signal::SIGKILL);
                    let _ = waitpid(child, None);
                }
                let _ = stdout_thread.join();
                let _ = stderr_thread.join();
                stop.set(None);

                result
            }
        }
    }
}

fn run_tracer<L: SyscallListener>(child: Pid, listener: &mut L) -> Result<TraceeStatus, Error> {
    wait_for_initial_stop(child)?;
    set_trace_options(child)?;
    step(child, None)?;
    monitor_loop(child, listener)
}

/// The tracer-wide wait loop.
fn monitor_loop<L: SyscallListener>(root: Pid, listener: &mut L) -> Result<TraceeStatus, Error> {
    loop {
        let status = match waitpid(None, Some(WaitPidFlag::__WALL)) {
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                // Should be unreachable: the loop returns when the root
                // tracee exits, before running out of children.
                return Err(ErrorImpl::Protocol {
                    description: "no more children to trace".into(),
                }
                .into());
            }
            Err(err) => {
                return Err(ErrorImpl::OsError {
                    operation: "wait for tracee".into(),
                    source: err.into(),
                }
                .into())
            }
            Ok(status) => status,
        };

        match status {
            WaitStatus::Exited(pid, code) if pid == root => {
                return Ok(if code == SPAWN_ERROR_EXIT_CODE {
                    TraceeStatus::Failure
                } else {
                    TraceeStatus::Exit(code)
                });
            }
            WaitStatus::Signaled(pid, signal, _) if pid == root => {
                return Ok(TraceeStatus::Signal(signal as i32));
            }
            // Exits of other traced processes are consumed silently.
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {}

            WaitStatus::PtraceEvent(pid, _, event) => {
                if matches!(
                    event,
                    libc::PTRACE_EVENT_FORK
                        | libc::PTRACE_EVENT_VFORK
                        | libc::PTRACE_EVENT_CLONE
                ) {
                    attach_new_child(pid)?;
                }
                step(pid, None)?;
            }

            WaitStatus::PtraceSyscall(pid) => {
                handle_syscall(pid, listener)?;
                step(pid, None)?;
            }

            WaitStatus::Stopped(pid, signal) => {
                // Re-deliver genuine signals. SIGSTOP is the attach artifact
                // of freshly-traced children and the post-exec SIGTRAP is a
                // tracing artifact; injecting either would stop or kill the
                // tracee.
                let deliver = match signal {
                    Signal::SIGSTOP | Signal::SIGTRAP => None,
                    signal => Some(signal),
                };
                step(pid, deliver)?;
            }

            WaitStatus::Continued(_) | WaitStatus::StillAlive => {}
        }
    }
}

/// A clone/fork/vfork event fired on `pid`: look up the new child and start
/// stepping it with the same options.
fn attach_new_child(pid: Pid) -> Result<(), Error> {
    match ptrace::getevent(pid) {
        Ok(child) => {
            let child = Pid::from_raw(child as i32);
            debug!(%pid, %child, "tracing new child");
            set_trace_options(child)?;
            step(child, None)?;
        }
        Err(err) => warn!(%pid, %err, "failed to get pid of the new child"),
    }
    Ok(())
}

fn handle_syscall<L: SyscallListener>(pid: Pid, listener: &mut L) -> Result<(), Error> {
    // SAFETY: the kernel writes at most size bytes into info, which is a
    // plain-old-data struct matching the UAPI layout.
    let mut info: RawSyscallInfo = unsafe { std::mem::zeroed() };
    let ret = unsafe {
        libc::ptrace(
            PTRACE_GET_SYSCALL_INFO,
            pid.as_raw(),
            std::mem::size_of::<RawSyscallInfo>() as *mut libc::c_void,
            std::ptr::addr_of_mut!(info).cast::<libc::c_void>(),
        )
    };
    if ret < 0 {
        warn!(
            %pid,
            err = %std::io::Error::last_os_error(),
            "failed to fetch syscall info"
        );
        return Ok(());
    }

    match info.op {
        PTRACE_SYSCALL_INFO_ENTRY => {
            // SAFETY: op tags which union member the kernel filled in.
            let entry = unsafe { info.data.entry };
            listener.on_syscall_entry(pid, entry.nr, &entry.args)
        }
        PTRACE_SYSCALL_INFO_EXIT => {
            // SAFETY: see above.
            let exit = unsafe { info.data.exit };
            listener.on_syscall_exit(pid, exit.rval, exit.is_error != 0)
        }
        _ => Ok(()),
    }
}

fn new_pipe() -> Result<(OwnedFd, OwnedFd), Error> {
    pipe().map_err(|err| {
        ErrorImpl::OsError {
            operation: "create tracee output pipe".into(),
            source: err.into(),
        }
        .into()
    })
}

/// The child half of the fork. Never returns.
fn run_tracee(
    tracee: Tracee,
    argv: Vec<CString>,
    stdout_r: OwnedFd,
    stdout_w: OwnedFd,
    stderr_r: OwnedFd,
    stderr_w: OwnedFd,
) -> ! {
    fn fail(what: &str) -> ! {
        // Write piecewise without allocating; the parent's heap state is
        // not safe to touch after fork.
        for part in [b"replicar tracee setup failed: ".as_slice(), what.as_bytes(), b"\n"] {
            // SAFETY: plain write(2) on fd 2.
            unsafe { libc::write(libc::STDERR_FILENO, part.as_ptr().cast(), part.len()) };
        }
        // SAFETY: terminates the child without running parent-owned atexit
        // handlers or buffers.
        unsafe { libc::_exit(SPAWN_ERROR_EXIT_CODE) }
    }

    drop(stdout_r);
    drop(stderr_r);

    if rustix::stdio::dup2_stdout(&stdout_w).is_err() {
        fail("dup2 stdout");
    }
    if rustix::stdio::dup2_stderr(&stderr_w).is_err() {
        fail("dup2 stderr");
    }
    drop(stdout_w);
    drop(stderr_w);

    if ptrace::traceme().is_err() {
        fail("ptrace(PTRACE_TRACEME)");
    }
    // Stop ourselves and wait until the tracer is ready.
    if raise(Signal::SIGSTOP).is_err() {
        fail("raise(SIGSTOP)");
    }

    match tracee {
        Tracee::Command(_) => {
            let argv_refs: Vec<&std::ffi::CStr> = argv.iter().map(CString::as_c_str).collect();
            let _ = execvp(argv_refs[0], &argv_refs);
            fail("execvp");
        }
        Tracee::Closure(f) => {
            let code = f();
            // SAFETY: see fail().
            unsafe { libc::_exit(code & 0xff) }
        }
    }
}

/// Stream one pipe into the configured sink until the writer side closes.
fn spawn_forwarder(fd: OwnedFd, mut sink: Box<dyn Write + Send>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = File::from(fd);
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if sink.write_all(&buf[..n]).and_then(|()| sink.flush()).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}

/// Wait (bounded) for the child's initial SIGSTOP after `PTRACE_TRACEME`.
fn wait_for_initial_stop(child: Pid) -> Result<(), Error> {
    let deadline = Instant::now() + INITIAL_STOP_TIMEOUT;
    loop {
        match waitpid(child, Some(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED)) {
            Ok(WaitStatus::StillAlive) => {
                if Instant::now() >= deadline {
                    return Err(ErrorImpl::Protocol {
                        description: "timed out waiting for the tracee's initial stop".into(),
                    }
                    .into());
                }
                thread::sleep(Duration::from_micros(200));
            }
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => return Ok(()),
            Ok(WaitStatus::Exited(_, code)) => {
                return Err(ErrorImpl::Protocol {
                    description: format!("tracee exited with {code} before the initial stop")
                        .into(),
                }
                .into())
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Err(ErrorImpl::Protocol {
                    description: format!(
                        "tracee was killed by signal {signal} before the initial stop"
                    )
                    .into(),
                }
                .into())
            }
            Ok(status) => {
                return Err(ErrorImpl::Protocol {
                    description: format!("unexpected tracee state {status:?}").into(),
                }
                .into())
            }
            Err(Errno::EINTR) => continue,
            Err(err) => {
                return Err(ErrorImpl::OsError {
                    operation: "wait for the tracee's initial stop".into(),
                    source: err.into(),
                }
                .into())
            }
        }
    }
}

fn set_trace_options(pid: Pid) -> Result<(), Error> {
    match ptrace::setoptions(pid, trace_options()) {
        // The process has already exited.
        Err(Errno::ESRCH) | Ok(()) => Ok(()),
        Err(err) => Err(ErrorImpl::Protocol {
            description: format!("failed to set ptrace options on {pid}: {err}").into(),
        }
        .into()),
    }
}

/// Restart `pid` until its next syscall boundary, optionally delivering a
/// signal. A vanished process is not an error; it will be reaped by the wait
/// loop.
fn step(pid: Pid, signal: Option<Signal>) -> Result<(), Error> {
    match ptrace::syscall(pid, signal) {
        Err(Errno::ESRCH) | Ok(()) => Ok(()),
        Err(err) => Err(ErrorImpl::Protocol {
            description: format!("failed to restart syscall stepping on {pid}: {err}").into(),
        }
        .into()),
    }
}

/// Read a NUL-terminated string of at most `max_len` bytes from the tracee's
/// memory.
///
/// Reads go page by page and never cross a page boundary: a fault in the
/// next page must not discard bytes already read from a good page (see the
/// note in process_vm_readv(2)). An EFAULT past a partial read is a soft
/// stop returning the bytes so far; a permission error is fatal.
pub fn read_tracee_string(pid: Pid, remote_addr: u64, max_len: usize) -> Result<Vec<u8>, Error> {
    let page_size = *PAGE_SIZE;
    let mut buf: Vec<u8> = Vec::new();

    while buf.len() < max_len {
        let addr = remote_addr + buf.len() as u64;
        let to_boundary = page_size - (addr as usize & (page_size - 1));
        let chunk = (max_len - buf.len()).min(to_boundary);

        let start = buf.len();
        buf.resize(start + chunk, 0);
        let mut local = [IoSliceMut::new(&mut buf[start..])];
        let remote = [RemoteIoVec {
            base: addr as usize,
            len: chunk,
        }];

        let read = match process_vm_readv(pid, &mut local, &remote) {
            Ok(n) => n,
            Err(Errno::EFAULT) => {
                // We cannot read further; return what we have so far.
                buf.truncate(start);
                break;
            }
            Err(err) => {
                // EPERM here might be recoverable via PTRACE_PEEKDATA, but
                // that reads just a word at a time; treat it as fatal.
                return Err(ErrorImpl::OsError {
                    operation: format!("read {pid} memory").into(),
                    source: err.into(),
                }
                .into());
            }
        };
        buf.truncate(start + read);

        if let Some(nul) = memchr(0, &buf[start..]) {
            buf.truncate(start + nul);
            return Ok(buf);
        }
        if read < chunk || read == 0 {
            // Could not read more and no NUL found.
            break;
        }
    }

    buf.truncate(max_len);
    Ok(buf)
}
