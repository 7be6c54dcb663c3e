//! Subprocess supervision.
//!
//! Test bodies spawn real processes through [`spawn`]. A [`ProcessHandle`]
//! owns its child until the child is reaped, either explicitly through
//! [`ProcessHandle::wait`], [`ProcessHandle::terminate`] or
//! [`ProcessHandle::kill`], or by the handle's `Drop`, which terminates and
//! reaps anything still running.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Search list used when `PATH` is unset (see exec(3)).
const DEFAULT_SEARCH_PATH: &str = ":/bin:/usr/bin";

/// Sleep between non-blocking reap attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long an abandoned process gets after SIGTERM before SIGKILL.
pub const DEFAULT_FINALIZER_GRACE: Duration = Duration::from_millis(1500);

/// Error type for process operations.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// No executable could be resolved for the requested name.
    #[error("{0}")]
    NotFound(String),
    #[error("error spawning process '{name}': {source}")]
    Spawn { name: String, source: io::Error },
    /// The handle has already been reaped.
    #[error("no process")]
    NoProcess,
    #[error("error sending {signal:?} to process {pid}: {source}")]
    Signal {
        pid: u32,
        signal: Signal,
        source: nix::errno::Errno,
    },
    #[error("error waiting for process {pid}: {source}")]
    Wait { pid: u32, source: io::Error },
    #[error("unknown wait status for process {pid}: {status}")]
    UnknownStatus { pid: u32, status: ExitStatus },
}

/// How the standard streams of a spawned process are connected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StdioMode {
    /// All three streams go to the null device.
    #[default]
    #[serde(rename = "none")]
    Null,
    /// stdin is writable and stdout/stderr are readable through the handle.
    Piped,
}

/// How a supervised process finished, or that it has not yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Normal exit with the given code.
    Exited(i32),
    /// Terminated by a signal, without a core dump.
    Signaled(i32),
    /// Terminated by a signal and dumped core.
    CoreDumped,
    /// The deadline passed; the process is still running and not reaped.
    Timeout,
}

impl WaitOutcome {
    fn from_status(pid: u32, status: ExitStatus) -> Result<Self, ProcessError> {
        // An exit code wins over signal information, and a core dump wins
        // over the raw signal number.
        if let Some(code) = status.code() {
            Ok(WaitOutcome::Exited(code))
        } else if status.core_dumped() {
            Ok(WaitOutcome::CoreDumped)
        } else if let Some(sig) = status.signal() {
            Ok(WaitOutcome::Signaled(sig))
        } else {
            Err(ProcessError::UnknownStatus { pid, status })
        }
    }
}

impl fmt::Display for WaitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitOutcome::Exited(code) => write!(f, "exit code {code}"),
            WaitOutcome::Signaled(sig) => write!(f, "signal {sig}"),
            WaitOutcome::CoreDumped => f.write_str("core dumped"),
            WaitOutcome::Timeout => f.write_str("timeout"),
        }
    }
}

/// Resolve `name` to an executable file.
///
/// Names containing `/` are checked directly; anything else is looked up in
/// `PATH`.
pub fn locate(name: &str) -> Result<PathBuf, ProcessError> {
    locate_in(name, std::env::var_os("PATH").as_deref())
}

/// Resolve `name` against an explicit search list.
///
/// `None` falls back to the default exec(3) search list. Empty components
/// are skipped.
pub fn locate_in(name: &str, search: Option<&OsStr>) -> Result<PathBuf, ProcessError> {
    if name.is_empty() {
        return Err(ProcessError::NotFound(
            "invalid path provided (path was an empty string)".to_string(),
        ));
    }

    if name.contains('/') {
        let path = PathBuf::from(name);
        return match check_executable(&path) {
            Ok(()) => Ok(path),
            Err(reason) => Err(ProcessError::NotFound(format!("'{name}': {reason}"))),
        };
    }

    let search = search.unwrap_or(OsStr::new(DEFAULT_SEARCH_PATH));
    std::env::split_paths(search)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| check_executable(candidate).is_ok())
        .ok_or_else(|| ProcessError::NotFound(format!("no executable found for path '{name}'")))
}

/// Best-effort executability check based on file type and mode bits.
fn check_executable(path: &Path) -> Result<(), String> {
    let meta = fs::metadata(path).map_err(|e| e.to_string())?;
    if !meta.is_file() {
        return Err("path is not a regular file".to_string());
    }
    if meta.permissions().mode() & 0o111 == 0 {
        return Err("path is not executable".to_string());
    }
    Ok(())
}

/// Spawn `name` with `args`.
pub fn spawn(name: &str, args: &[String], stdio: StdioMode) -> Result<ProcessHandle, ProcessError> {
    spawn_with_env(name, args, stdio, &HashMap::new())
}

/// Spawn `name` with `args` and extra environment variables.
///
/// The executable is resolved with [`locate`] first; the child still sees
/// `name` as its `argv[0]`.
pub fn spawn_with_env(
    name: &str,
    args: &[String],
    stdio: StdioMode,
    env: &HashMap<String, String>,
) -> Result<ProcessHandle, ProcessError> {
    let program = locate(name)?;

    let mut cmd = Command::new(&program);
    cmd.arg0(name).args(args).envs(env);
    match stdio {
        StdioMode::Null => {
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }
        StdioMode::Piped => {
            cmd.stdin(Stdio::piped());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }
    }

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        name: name.to_string(),
        source,
    })?;
    let pid = child.id();
    log::debug!("spawned '{name}' ({}) as pid {pid}", program.display());

    Ok(ProcessHandle {
        pid,
        stdin: child.stdin.take(),
        stdout: child.stdout.take(),
        stderr: child.stderr.take(),
        child: Some(child),
        grace: DEFAULT_FINALIZER_GRACE,
    })
}

/// A spawned process and the parent ends of its pipes.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    /// `None` once the process has been reaped.
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    grace: Duration,
}

impl ProcessHandle {
    /// Set the SIGTERM grace period used when the handle is dropped.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the process has not been reaped yet.
    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    pub fn stdin(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    /// Close the write end of the stdin pipe so the child sees EOF.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Wait for the process to finish.
    ///
    /// Without a timeout this blocks until the process is reaped. With one,
    /// the process is polled until it exits or the deadline passes; a
    /// timeout leaves the process running and the handle still owning it.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<WaitOutcome, ProcessError> {
        let pid = self.pid;
        let Some(child) = self.child.as_mut() else {
            return Err(ProcessError::NoProcess);
        };

        let status = match timeout {
            None => child
                .wait()
                .map_err(|source| ProcessError::Wait { pid, source })?,
            Some(limit) => {
                let start = Instant::now();
                loop {
                    match child.try_wait() {
                        Ok(Some(status)) => break status,
                        Ok(None) => {
                            if start.elapsed() > limit {
                                return Ok(WaitOutcome::Timeout);
                            }
                            thread::sleep(POLL_INTERVAL);
                        }
                        Err(source) => return Err(ProcessError::Wait { pid, source }),
                    }
                }
            }
        };

        self.child = None;
        let outcome = WaitOutcome::from_status(pid, status)?;
        log::debug!("reaped pid {pid}: {outcome}");
        Ok(outcome)
    }

    /// Send SIGTERM, then [`wait`](Self::wait) with the given timeout.
    pub fn terminate(&mut self, timeout: Option<Duration>) -> Result<WaitOutcome, ProcessError> {
        self.signal(Signal::SIGTERM)?;
        self.wait(timeout)
    }

    /// Send SIGKILL, then wait until the process is reaped.
    pub fn kill(&mut self) -> Result<WaitOutcome, ProcessError> {
        self.signal(Signal::SIGKILL)?;
        self.wait(None)
    }

    fn signal(&self, sig: Signal) -> Result<(), ProcessError> {
        if self.child.is_none() {
            return Err(ProcessError::NoProcess);
        }
        send_signal(self.pid, sig)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.stdin = None;
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Err(e) = send_signal(self.pid, Signal::SIGTERM) {
            log::debug!("finalizer: {e}");
        }
        if reap_within(&mut child, self.grace) {
            return;
        }

        log::warn!(
            "pid {} still running {:?} after SIGTERM, sending SIGKILL",
            self.pid,
            self.grace
        );
        if let Err(e) = send_signal(self.pid, Signal::SIGKILL) {
            log::debug!("finalizer: {e}");
        }
        if !reap_within(&mut child, self.grace) {
            log::warn!("pid {} could not be reaped, giving up", self.pid);
        }
    }
}

#[allow(clippy::cast_possible_wrap)]
fn send_signal(pid: u32, sig: Signal) -> Result<(), ProcessError> {
    signal::kill(Pid::from_raw(pid as i32), sig).map_err(|source| ProcessError::Signal {
        pid,
        signal: sig,
        source,
    })
}

/// Poll until the child is reaped or `grace` runs out.
fn reap_within(child: &mut Child, grace: Duration) -> bool {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) if start.elapsed() < grace => thread::sleep(POLL_INTERVAL),
            Ok(None) | Err(_) => return false,
        }
    }
}
