// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External process execution.
//!
//! Every fetch step is delegated to an external executable. This module runs
//! one such executable at a time, captures what it writes to stdout and
//! stderr, and lets the caller abandon it early through a timeout or a shared
//! __cancellation__ signal.
//!
//! # Cancellation
//!
//! Workers that run side by side share one [`Cancellation`]. Once the
//! matching [`CancelHandle`] fires, any process still running under that
//! signal is killed and reaped before [`Syscall::run`] returns, so nothing
//! keeps writing into the cache after the caller has moved on.
//!
//! On unix every command runs in a process group of its own. Whatever the
//! command spawns in turn, e.g., the `upload-pack` or `ssh` helpers of a git
//! fetch, is killed along with it.

use std::{
    ffi::{OsStr, OsString},
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::watch,
};
use tracing::{debug, warn};

/// Construct a linked cancellation handle and signal.
pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (sender, receiver) = watch::channel(false);
    (CancelHandle { sender }, Cancellation { receiver })
}

/// Sending side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    /// Ask every holder of the matching [`Cancellation`] to stop.
    ///
    /// Calling this more than once has no further effect.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

/// Receiving side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct Cancellation {
    receiver: watch::Receiver<bool>,
}

impl Cancellation {
    /// Signal that never fires.
    pub fn never() -> Self {
        let (handle, cancellation) = cancellation();
        drop(handle);
        cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once cancellation has been requested.
    ///
    /// Pends forever if the handle was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        let closed = receiver.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// A single external command invocation.
#[derive(Debug)]
pub struct Syscall {
    command: Command,
    display: String,
    timeout: Option<Duration>,
}

impl Syscall {
    /// Construct new system call of `program` with `args`.
    pub fn new(
        program: impl AsRef<OsStr>,
        args: impl IntoIterator<Item = impl Into<OsString>>,
    ) -> Self {
        let args = args.into_iter().map(Into::into).collect::<Vec<OsString>>();
        let display = std::iter::once(program.as_ref())
            .chain(args.iter().map(OsString::as_os_str))
            .map(OsStr::to_string_lossy)
            .collect::<Vec<_>>()
            .join(" ");

        let mut command = Command::new(program.as_ref());
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        Self {
            command,
            display,
            timeout: None,
        }
    }

    /// Run command from within `dir`.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.command.current_dir(dir.as_ref());
        self
    }

    /// Kill command if it has not exited after `timeout`.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run command to completion.
    ///
    /// Returns standard output with trailing newlines chomped.
    ///
    /// # Errors
    ///
    /// - Return [`SyscallError::Spawn`] if process cannot be started.
    /// - Return [`SyscallError::Wait`] if process output cannot be collected.
    /// - Return [`SyscallError::Failed`] if process exits unsuccessfully.
    /// - Return [`SyscallError::TimedOut`] if timeout elapses first.
    /// - Return [`SyscallError::Cancelled`] if cancellation fires first.
    pub async fn run(mut self, cancel: &Cancellation) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(SyscallError::Cancelled {
                command: self.display,
            });
        }

        debug!("run {}", self.display);
        let mut child = self.command.spawn().map_err(|source| SyscallError::Spawn {
            source,
            command: self.display.clone(),
        })?;
        let _group = ProcessGroup::of(&child, &self.display);
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let outcome = {
            let collect = futures::future::try_join3(
                child.wait(),
                read_pipe(stdout.as_mut()),
                read_pipe(stderr.as_mut()),
            );
            let deadline = async {
                match self.timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                result = collect => Outcome::Exited(result),
                _ = deadline => Outcome::TimedOut,
                _ = cancel.cancelled() => Outcome::Cancelled,
            }
        };

        match outcome {
            Outcome::Exited(result) => {
                let (status, stdout, stderr) = result.map_err(|source| SyscallError::Wait {
                    source,
                    command: self.display.clone(),
                })?;

                if !status.success() {
                    return Err(SyscallError::Failed {
                        command: self.display,
                        status,
                        stderr: chomp(stderr),
                    });
                }

                Ok(chomp(stdout))
            }
            Outcome::TimedOut => {
                warn!("{} timed out, killing it", self.display);
                reap(&mut child, &self.display).await;
                Err(SyscallError::TimedOut {
                    command: self.display,
                    timeout: self.timeout.unwrap_or_default(),
                })
            }
            Outcome::Cancelled => {
                debug!("{} cancelled, killing it", self.display);
                reap(&mut child, &self.display).await;
                Err(SyscallError::Cancelled {
                    command: self.display,
                })
            }
        }
    }
}

enum Outcome {
    Exited(std::io::Result<(ExitStatus, String, String)>),
    TimedOut,
    Cancelled,
}

async fn read_pipe(pipe: Option<&mut (impl AsyncRead + Unpin)>) -> std::io::Result<String> {
    let mut buffer = Vec::new();
    if let Some(pipe) = pipe {
        pipe.read_to_end(&mut buffer).await?;
    }

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

async fn reap(child: &mut Child, command: &str) {
    kill_group(child.id(), command);
    if let Err(error) = child.kill().await {
        warn!("failed to kill {command}: {error}");
    }
}

// Kills every process left in the group of a command once it goes out of
// scope, including when the running future is dropped.
struct ProcessGroup {
    id: Option<u32>,
    command: String,
}

impl ProcessGroup {
    fn of(child: &Child, command: &str) -> Self {
        Self {
            id: child.id(),
            command: command.into(),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        kill_group(self.id, &self.command);
    }
}

#[cfg(unix)]
fn kill_group(id: Option<u32>, command: &str) {
    use nix::{
        errno::Errno,
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };

    let Some(id) = id.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };

    match killpg(Pid::from_raw(id), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(error) => warn!("failed to kill process group of {command}: {error}"),
    }
}

#[cfg(not(unix))]
fn kill_group(_: Option<u32>, _: &str) {}

fn chomp(mut text: String) -> String {
    // INVARIANT: Chomp trailing newlines.
    let trimmed = text.trim_end_matches(['\r', '\n']).len();
    text.truncate(trimmed);
    text
}

/// System call error types.
#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    /// Process could not be started.
    #[error("failed to run `{command}`")]
    Spawn {
        #[source]
        source: std::io::Error,
        command: String,
    },

    /// Process output or exit status could not be collected.
    #[error("failed to collect output of `{command}`")]
    Wait {
        #[source]
        source: std::io::Error,
        command: String,
    },

    /// Process exited unsuccessfully.
    #[error("`{command}` failed with {status}, stderr: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    /// Process did not finish in time.
    #[error("`{command}` did not finish within {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    /// Process was stopped by cancellation.
    #[error("`{command}` was cancelled")]
    Cancelled { command: String },
}

/// Friendly result alias :3
pub type Result<T, E = SyscallError> = std::result::Result<T, E>;
