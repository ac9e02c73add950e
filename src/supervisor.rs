//! Supervision of the server under test.
//!
//! The server runs as a child process with stdin closed and stdout/stderr
//! captured. Output is drained while the child runs, so a chatty server
//! never blocks on a full pipe. Shutdown is SIGTERM, a bounded wait, then
//! SIGKILL; both signals go to the child's process group.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("failed to wait for child: {0}")]
    Wait(#[from] std::io::Error),
}

/// Lifecycle of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    Running,
    /// Exited on its own before `stop` was called
    Exited,
    /// Exited within the grace period after SIGTERM
    GracefullyStopped,
    /// Still running after the grace period and killed
    ForceKilled,
}

/// Everything the child wrote, plus how it ended
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: Option<ExitStatus>,
    pub state: TerminationState,
}

impl CapturedOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

type SharedBuf = Arc<Mutex<Vec<u8>>>;

/// Handle to a running child process
pub struct SupervisedProcess {
    child: Child,
    pid: Option<u32>,
    command: String,
    stdout: SharedBuf,
    stderr: SharedBuf,
    readers: Vec<JoinHandle<()>>,
    state: TerminationState,
    output: Option<CapturedOutput>,
}

/// Launch `command` with captured output.
///
/// Returns as soon as the process exists; readiness is the caller's problem.
pub fn start(command: &str, args: &[String]) -> Result<SupervisedProcess, SupervisorError> {
    let mut std_cmd = std::process::Command::new(command);
    std_cmd
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Own process group, so signals also reach anything the server forks
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_cmd.process_group(0);
    }

    let mut cmd = Command::from(std_cmd);
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        command: command.to_string(),
        source,
    })?;

    let pid = child.id();
    info!(command, ?args, pid, "Started server process");

    let stdout = SharedBuf::default();
    let stderr = SharedBuf::default();
    let mut readers = Vec::with_capacity(2);
    if let Some(pipe) = child.stdout.take() {
        readers.push(tokio::spawn(drain(pipe, Arc::clone(&stdout))));
    }
    if let Some(pipe) = child.stderr.take() {
        readers.push(tokio::spawn(drain(pipe, Arc::clone(&stderr))));
    }

    Ok(SupervisedProcess {
        child,
        pid,
        command: command.to_string(),
        stdout,
        stderr,
        readers,
        state: TerminationState::Running,
        output: None,
    })
}

/// Copy a pipe into a shared buffer until EOF
async fn drain<R>(mut pipe: R, sink: SharedBuf)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => lock(&sink).extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}

fn lock(buf: &SharedBuf) -> std::sync::MutexGuard<'_, Vec<u8>> {
    buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SupervisedProcess {
    /// Whether the child has exited, without blocking
    pub fn has_exited(&mut self) -> bool {
        if self.output.is_some() {
            return true;
        }
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Stop the child and return its captured output.
    ///
    /// Sends SIGTERM and waits up to `grace_period`; a child still running
    /// after that is killed. Pipes are then drained for at most
    /// `drain_timeout`. Calling this again returns the same output.
    pub async fn stop(
        &mut self,
        grace_period: Duration,
        drain_timeout: Duration,
    ) -> Result<CapturedOutput, SupervisorError> {
        if let Some(output) = &self.output {
            return Ok(output.clone());
        }

        let status = match self.child.try_wait()? {
            Some(status) => {
                debug!(pid = self.pid, %status, "Server already exited");
                self.state = TerminationState::Exited;
                status
            }
            None => self.terminate(grace_period).await?,
        };

        self.collect(drain_timeout).await;

        let output = CapturedOutput {
            stdout: std::mem::take(&mut *lock(&self.stdout)),
            stderr: std::mem::take(&mut *lock(&self.stderr)),
            status: Some(status),
            state: self.state,
        };
        info!(
            command = %self.command,
            pid = self.pid,
            state = ?output.state,
            %status,
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "Server process stopped"
        );

        self.output = Some(output.clone());
        Ok(output)
    }

    async fn terminate(&mut self, grace_period: Duration) -> Result<ExitStatus, SupervisorError> {
        self.signal_graceful();

        match tokio::time::timeout(grace_period, self.child.wait()).await {
            Ok(status) => {
                self.state = TerminationState::GracefullyStopped;
                Ok(status?)
            }
            Err(_) => {
                warn!(
                    pid = self.pid,
                    grace_ms = grace_period.as_millis() as u64,
                    "Server ignored SIGTERM, killing"
                );
                self.signal_kill();
                let status = self.child.wait().await?;
                self.state = TerminationState::ForceKilled;
                Ok(status)
            }
        }
    }

    #[cfg(unix)]
    fn signal_graceful(&mut self) {
        if let Some(pid) = self.pid {
            send_group_signal(pid, libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    fn signal_graceful(&mut self) {
        // No SIGTERM equivalent off unix
        let _ = self.child.start_kill();
    }

    fn signal_kill(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            send_group_signal(pid, libc::SIGKILL);
        }
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "start_kill failed");
        }
    }

    /// Wait for the reader tasks, keeping whatever they captured on timeout
    async fn collect(&mut self, drain_timeout: Duration) {
        let deadline = tokio::time::Instant::now() + drain_timeout;
        for reader in self.readers.drain(..) {
            let abort = reader.abort_handle();
            if tokio::time::timeout_at(deadline, reader).await.is_err() {
                // A grandchild may still hold the pipe open
                debug!("Output drain timed out");
                abort.abort();
            }
        }
    }
}

/// Signal the process group led by `pid`
#[cfg(unix)]
fn send_group_signal(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        debug!(
            pid,
            signal,
            error = %std::io::Error::last_os_error(),
            "killpg failed"
        );
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> SupervisedProcess {
        start("sh", &["-c".to_string(), script.to_string()]).unwrap()
    }

    #[tokio::test]
    async fn test_graceful_stop_captures_output() {
        let mut process = sh("echo hello; echo oops >&2; exec sleep 30");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!process.has_exited());

        let output = process
            .stop(Duration::from_secs(5), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(output.state, TerminationState::GracefullyStopped);
        assert_eq!(output.stdout_lossy(), "hello\n");
        assert_eq!(output.stderr_lossy(), "oops\n");
        assert!(!output.status.unwrap().success());
    }

    #[tokio::test]
    async fn test_term_resistant_child_is_killed() {
        let mut process = sh("trap '' TERM; echo started; sleep 30");
        tokio::time::sleep(Duration::from_millis(300)).await;

        let grace = Duration::from_millis(300);
        let started = Instant::now();
        let output = process.stop(grace, Duration::from_secs(1)).await.unwrap();

        assert!(started.elapsed() < grace + Duration::from_secs(2));
        assert_eq!(output.state, TerminationState::ForceKilled);
        assert_eq!(output.stdout_lossy(), "started\n");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut process = sh("echo done");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(process.has_exited());

        let first = process
            .stop(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        let second = process
            .stop(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(first.state, TerminationState::Exited);
        assert_eq!(first.stdout, b"done\n");
        assert_eq!(first.stdout, second.stdout);
        assert_eq!(first.stderr, second.stderr);
        assert_eq!(first.status, second.status);
        assert_eq!(second.state, TerminationState::Exited);
    }

    #[tokio::test]
    async fn test_large_output_does_not_block_child() {
        // Far more than a pipe buffer
        let mut process = sh("head -c 262144 /dev/zero; echo end >&2");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(process.has_exited());

        let output = process
            .stop(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(output.stdout.len(), 262144);
        assert_eq!(output.stderr_lossy(), "end\n");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = start("/nonexistent/mllp-server", &[]).err().unwrap();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/mllp-server"));
    }
}
