//! Process management utilities.
//!
//! Liveness checks, graceful shutdown and the subprocess collaborator used
//! by the hypervisor backends to launch their native programs.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Aggressive poll interval for fast process shutdown.
pub const FAST_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Number of aggressive polls before backing off to slower intervals.
pub const FAST_POLL_COUNT: u32 = 10;

/// Poll interval once the fast phase is over.
pub const SLOW_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for SIGKILL to take effect.
pub const SIGKILL_WAIT: Duration = Duration::from_millis(500);

/// Exit code recorded when a process was killed with SIGKILL.
pub const KILLED_EXIT_CODE: i32 = 128 + libc::SIGKILL;

/// Check if a process is alive.
///
/// A zombie (exited but not yet reaped) counts as dead. A process owned by
/// another user (EPERM) counts as alive.
pub fn is_alive(pid: libc::pid_t) -> bool {
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } != 0 {
        return std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    }
    !is_zombie(pid)
}

/// Whether the process is a zombie (state `Z` in /proc/pid/stat).
#[cfg(target_os = "linux")]
fn is_zombie(pid: libc::pid_t) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // Format: pid (comm) state ...; comm may contain spaces and parentheses.
    stat.rfind(')')
        .and_then(|i| stat.get(i + 2..))
        .and_then(|rest| rest.chars().next())
        == Some('Z')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: libc::pid_t) -> bool {
    false
}

/// Reap a child process if it has exited (non-blocking).
///
/// Returns `Some(exit_code)` if `pid` is our child and has exited, `None`
/// if it is still running or is not our child (e.g. a daemonized
/// hypervisor). Handles EINTR by retrying the waitpid call.
pub fn try_wait(pid: libc::pid_t) -> Option<i32> {
    if pid <= 0 {
        return None;
    }
    loop {
        let mut status: libc::c_int = 0;
        let result = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };

        if result == pid {
            let exit_code = if libc::WIFEXITED(status) {
                libc::WEXITSTATUS(status)
            } else if libc::WIFSIGNALED(status) {
                128 + libc::WTERMSIG(status)
            } else {
                -1
            };
            return Some(exit_code);
        } else if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return None;
        } else {
            return None;
        }
    }
}

/// Send SIGTERM to a process.
///
/// Returns true if the signal was sent successfully.
pub fn terminate(pid: libc::pid_t) -> bool {
    pid > 0 && unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

/// Send SIGKILL to a process.
///
/// Returns true if the signal was sent successfully.
pub fn kill(pid: libc::pid_t) -> bool {
    pid > 0 && unsafe { libc::kill(pid, libc::SIGKILL) == 0 }
}

/// Wait until a process has exited, polling its liveness.
///
/// Polls aggressively for the first [`FAST_POLL_COUNT`] checks, then backs
/// off. Returns the exit code (reaped if the process is our child, `0`
/// otherwise) or `None` if it was still alive at the deadline.
pub async fn wait_for_exit(pid: libc::pid_t, timeout: Duration) -> Option<i32> {
    let deadline = Instant::now() + timeout;
    let mut polls = 0u32;

    loop {
        if let Some(code) = try_wait(pid) {
            return Some(code);
        }
        if !is_alive(pid) {
            return Some(try_wait(pid).unwrap_or(0));
        }
        if Instant::now() >= deadline {
            return None;
        }

        let interval = if polls < FAST_POLL_COUNT {
            FAST_POLL_INTERVAL
        } else {
            SLOW_POLL_INTERVAL
        };
        polls += 1;
        tokio::time::sleep(interval).await;
    }
}

/// Gracefully stop a process.
///
/// 1. Sends SIGTERM
/// 2. Waits up to `timeout` for the process to exit
/// 3. If still running and `force` is true, sends SIGKILL
///
/// Stopping an already-dead process succeeds. Returns the exit code.
pub async fn stop_process(pid: libc::pid_t, timeout: Duration, force: bool) -> Result<i32> {
    if !is_alive(pid) {
        return Ok(try_wait(pid).unwrap_or(0));
    }

    if !terminate(pid) {
        return Ok(try_wait(pid).unwrap_or(0));
    }

    if let Some(code) = wait_for_exit(pid, timeout).await {
        return Ok(code);
    }

    if !force {
        return Err(Error::Timeout {
            operation: format!("stop process {}", pid),
            duration: timeout,
        });
    }

    tracing::debug!(pid, "SIGTERM timeout, sending SIGKILL");
    kill(pid);
    match wait_for_exit(pid, SIGKILL_WAIT).await {
        Some(code) if code != 0 => Ok(code),
        Some(_) => Ok(KILLED_EXIT_CODE),
        None => Err(Error::Timeout {
            operation: format!("kill process {}", pid),
            duration: SIGKILL_WAIT,
        }),
    }
}

/// A program invocation handed to the subprocess collaborator.
///
/// Backends describe what to run; how it is spawned stays here. A
/// detached executable is placed in its own session so it outlives the
/// CLI process that launched it.
#[derive(Debug, Clone)]
pub struct Executable {
    name: String,
    args: Vec<String>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
    detach: bool,
    pid: Option<libc::pid_t>,
}

impl Executable {
    /// Create an invocation of `name` with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            stdout: None,
            stderr: None,
            detach: false,
            pid: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append stdout to a file.
    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    /// Append stderr to a file.
    pub fn stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    /// Run the process in its own session.
    pub fn detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    /// Program name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments in order.
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// PID of the last process started by [`Executable::start`].
    pub fn pid(&self) -> Option<libc::pid_t> {
        self.pid
    }

    /// Human-readable command line, for logs and errors.
    pub fn command_line(&self) -> String {
        std::iter::once(self.name.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Result<std::process::Command> {
        let mut cmd = std::process::Command::new(&self.name);
        cmd.args(&self.args).stdin(Stdio::null());

        match &self.stdout {
            Some(path) => {
                cmd.stdout(append_to(path)?);
            }
            None => {
                cmd.stdout(Stdio::null());
            }
        }
        if let Some(path) = &self.stderr {
            cmd.stderr(append_to(path)?);
        }

        if self.detach {
            use std::os::unix::process::CommandExt;
            // SAFETY: setsid is async-signal-safe.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        Ok(cmd)
    }

    /// Spawn the process without waiting for it. Returns its PID.
    pub fn start(&mut self) -> Result<libc::pid_t> {
        let mut cmd = self.command()?;
        if self.stderr.is_none() {
            cmd.stderr(Stdio::null());
        }
        let child = cmd
            .spawn()
            .map_err(|e| Error::command_failed(self.command_line(), e.to_string()))?;
        let pid = child.id() as libc::pid_t;
        self.pid = Some(pid);
        tracing::debug!(pid, command = %self.command_line(), "started process");
        Ok(pid)
    }

    /// Run the process to completion.
    ///
    /// A non-zero exit is an error carrying the captured stderr (unless
    /// stderr was redirected to a file).
    pub async fn start_and_wait(&mut self) -> Result<i32> {
        let output = self.run(false).await?;
        Ok(output.status.code().unwrap_or(-1))
    }

    /// Run the process to completion and return its standard output.
    pub async fn output(&mut self) -> Result<String> {
        let output = self.run(true).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run(&mut self, capture_stdout: bool) -> Result<std::process::Output> {
        let mut cmd = tokio::process::Command::from(self.command()?);
        if self.stderr.is_none() {
            cmd.stderr(Stdio::piped());
        }
        if capture_stdout {
            cmd.stdout(Stdio::piped());
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| Error::command_failed(self.command_line(), e.to_string()))?;

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let reason = if stderr.is_empty() {
                format!("exit status {}", code)
            } else {
                stderr
            };
            return Err(Error::command_failed(self.command_line(), reason));
        }
        Ok(output)
    }
}

fn append_to(path: &std::path::Path) -> Result<std::fs::File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}
