//! One block as an OS subprocess.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tempfile::TempPath;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use super::{BlockError, BlockRole, BlockSpec, Invocation};

/// How long a block gets to exit after SIGTERM before it is killed.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// A block process and its plumbing.
///
/// Lifecycle: [`start`](Self::start) once, optionally take the stdio pipes,
/// then [`wait`](Self::wait) or [`stop`](Self::stop). Scratch files are
/// deleted as soon as the process is known to have exited.
#[derive(Debug)]
pub struct SubprocessBlock {
    spec: BlockSpec,
    command: Option<Command>,
    scratch: Vec<TempPath>,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    status: Option<ExitStatus>,
    grace: Duration,
}

impl SubprocessBlock {
    #[must_use]
    pub fn new(spec: BlockSpec, invocation: Invocation) -> Self {
        Self {
            spec,
            command: Some(invocation.command),
            scratch: invocation.scratch,
            child: None,
            stdout: None,
            stderr: None,
            status: None,
            grace: GRACEFUL_STOP_TIMEOUT,
        }
    }

    /// Override the SIGTERM grace period.
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.spec.name()
    }

    #[must_use]
    pub fn role(&self) -> BlockRole {
        self.spec.role()
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Exit status, once observed.
    #[must_use]
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Spawn the process reading `stdin`, with stdout and stderr piped.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::Spawn`] if the executable cannot be started, or
    /// if the block was already started.
    pub fn start(&mut self, stdin: Stdio) -> Result<(), BlockError> {
        let Some(mut command) = self.command.take() else {
            return Err(BlockError::Spawn {
                block: self.name().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "already started"),
            });
        };
        command
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|source| BlockError::Spawn {
            block: self.name().to_string(),
            source,
        })?;
        // Dropping the command closes the parent's copy of a piped stdin.
        drop(command);

        self.stdout = child.stdout.take();
        self.stderr = child.stderr.take();
        tracing::info!(
            block = self.name(),
            role = %self.role(),
            pid = child.id(),
            "Started block"
        );
        self.child = Some(child);
        Ok(())
    }

    /// Take stdout, to be wired into the next block or proxied.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Wait for the process to exit. Cancel safe.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::NotStarted`] before [`start`](Self::start), or
    /// [`BlockError::Io`] if waiting fails.
    pub async fn wait(&mut self) -> Result<ExitStatus, BlockError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let block = self.name().to_string();
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| BlockError::NotStarted { block: block.clone() })?;
        let status = child
            .wait()
            .await
            .map_err(|source| BlockError::Io { block, source })?;
        self.status = Some(status);
        self.release_scratch();
        Ok(status)
    }

    fn release_scratch(&mut self) {
        for path in self.scratch.drain(..) {
            let shown = path.display().to_string();
            if let Err(e) = path.close() {
                tracing::warn!(block = self.spec.name(), path = shown, "Failed to remove scratch file: {e}");
            }
        }
    }

    /// Whether the process has already exited, without blocking.
    fn exited(&mut self) -> bool {
        if self.status.is_some() {
            return true;
        }
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(Some(status))) => {
                self.status = Some(status);
                true
            }
            Some(Ok(None)) => false,
            // Unstarted, or status unavailable: nothing left to signal.
            None | Some(Err(_)) => true,
        }
    }

    /// Ask the process to exit (SIGTERM). No-op once it has exited.
    pub fn terminate(&mut self) {
        if self.exited() {
            return;
        }
        let Some(pid) = self.pid() else {
            return;
        };
        tracing::info!(block = self.name(), pid, "Sending SIGTERM to block");
        send_terminate(pid, self.child.as_mut());
    }

    /// Kill the process (SIGKILL). No-op once it has exited.
    pub fn kill(&mut self) {
        if self.exited() {
            return;
        }
        tracing::warn!(block = self.name(), pid = self.pid(), "Killing block");
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                tracing::warn!(block = self.spec.name(), "Failed to kill block: {e}");
            }
        }
    }

    /// Stop the process and wait for it.
    ///
    /// `force` kills immediately; otherwise SIGTERM, then SIGKILL after the
    /// grace period. Idempotent on unstarted or exited blocks.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::Io`] if waiting for the process fails.
    pub async fn stop(&mut self, force: bool) -> Result<(), BlockError> {
        if self.child.is_none() || self.exited() {
            self.release_scratch();
            return Ok(());
        }
        if force {
            self.kill();
        } else {
            self.terminate();
            if tokio::time::timeout(self.grace, self.wait()).await.is_ok() {
                return Ok(());
            }
            tracing::warn!(
                block = self.name(),
                grace_secs = self.grace.as_secs_f64(),
                "Block did not exit after SIGTERM"
            );
            self.kill();
        }
        self.wait().await.map(|_| ())
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32, _child: Option<&mut Child>) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: `kill` has no memory-safety preconditions; `pid` is our own
    // child, which has not been reaped yet.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        tracing::warn!(
            pid,
            "Failed to send SIGTERM: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32, child: Option<&mut Child>) {
    if let Some(child) = child {
        let _ = child.start_kill();
    }
}
