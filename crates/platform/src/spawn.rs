//! Child process spawning contract.
//!
//! The engine never forks processes itself. Session channels describe the
//! child they need as a [`PreparedChildProcess`] and hand it to a
//! [`SpawnService`]; the service is expected to apply namespace, mount
//! and resource isolation before exec. A [`LocalSpawnService`] backed by
//! `tokio::process` ships for tests and single-host deployments; it runs
//! children without isolation.

use crate::{PassageError, PassageResult};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;

/// How the child's stdio is wired up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdioMode {
    /// Three pipes: stdin, stdout, stderr.
    Pipes,
    /// A pseudo-terminal. The spawn service allocates the PTY pair and
    /// connects the slave side to the child; the master side is returned
    /// as the child's stdin/stdout.
    Pty(PtyParams),
}

/// Terminal parameters from a pty-req channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyParams {
    /// TERM environment variable value (e.g. "xterm-256color").
    pub term: String,
    /// Terminal width in columns.
    pub cols: u32,
    /// Terminal height in rows.
    pub rows: u32,
    /// Terminal width in pixels (0 if unspecified).
    pub pixel_width: u32,
    /// Terminal height in pixels (0 if unspecified).
    pub pixel_height: u32,
}

/// Description of a child process to spawn.
///
/// Carries everything the spawn service needs: what to execute, the
/// environment, stdio wiring and working directory. Isolation settings
/// (namespaces, mounts, cgroups, uid/gid) are applied by the service
/// implementation; the engine only records the identity they key off.
#[derive(Debug, Clone)]
pub struct PreparedChildProcess {
    /// Program to execute.
    pub exec_path: PathBuf,
    /// Arguments, not including argv[0].
    pub args: Vec<String>,
    /// Environment as NAME=VALUE pairs. The child starts from an empty
    /// environment plus these.
    pub env: Vec<(String, String)>,
    /// Working directory, if any.
    pub chdir: Option<PathBuf>,
    /// Stdio wiring.
    pub stdio: StdioMode,
    /// User the child should run as; interpretation is up to the
    /// spawn service.
    pub user: Option<String>,
}

impl PreparedChildProcess {
    /// Creates a preparation for `exec_path` with empty arguments and
    /// environment, piped stdio and no chdir.
    pub fn new(exec_path: impl Into<PathBuf>) -> Self {
        Self {
            exec_path: exec_path.into(),
            args: Vec::new(),
            env: Vec::new(),
            chdir: None,
            stdio: StdioMode::Pipes,
            user: None,
        }
    }

    /// Appends an environment variable.
    pub fn push_env(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.env.push((name.into(), value.into()));
    }
}

/// How a child process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal exit with the given status code.
    Exited(u32),
    /// Killed by the given signal number.
    Signaled(i32),
}

/// Boxed async reader for child output streams.
pub type ChildReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed async writer for the child input stream.
pub type ChildWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Control handle for a running child.
///
/// Dropping the handle requests termination of the process; the service
/// implementation must not block in its destructor.
#[async_trait::async_trait]
pub trait ChildProcessHandle: Send {
    /// Waits for the child to exit.
    async fn wait(&mut self) -> PassageResult<ExitOutcome>;

    /// Delivers a signal to the child. `signal` is an SSH signal name
    /// without the SIG prefix ("TERM", "KILL", ...).
    fn signal(&mut self, signal: &str) -> PassageResult<()>;
}

/// A spawned child: stdio endpoints plus the control handle.
pub struct SpawnedChild {
    /// Child stdin (None when the service could not provide it).
    pub stdin: Option<ChildWriter>,
    /// Child stdout.
    pub stdout: Option<ChildReader>,
    /// Child stderr. None in PTY mode, where stderr shares the terminal.
    pub stderr: Option<ChildReader>,
    /// Control handle; dropping it kills the process.
    pub handle: Box<dyn ChildProcessHandle>,
}

/// Service that turns a [`PreparedChildProcess`] into a running child.
#[async_trait::async_trait]
pub trait SpawnService: Send + Sync {
    /// Spawns a child. `name` tags the process for accounting and log
    /// correlation ("shell", "exec", "sftp", "connect").
    async fn spawn(
        &self,
        name: &str,
        prepared: PreparedChildProcess,
    ) -> PassageResult<SpawnedChild>;
}

/// Spawn service backed by `tokio::process`, without isolation.
///
/// PTY mode is not supported here; a deployment that needs terminals
/// provides a spawn service that allocates them.
#[derive(Debug, Default)]
pub struct LocalSpawnService;

struct LocalChildHandle {
    child: tokio::process::Child,
}

#[async_trait::async_trait]
impl ChildProcessHandle for LocalChildHandle {
    async fn wait(&mut self) -> PassageResult<ExitOutcome> {
        let status = self.child.wait().await.map_err(PassageError::Io)?;
        if let Some(code) = status.code() {
            return Ok(ExitOutcome::Exited(code as u32));
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return Ok(ExitOutcome::Signaled(sig));
            }
        }
        Err(PassageError::Internal(
            "child exited without status or signal".to_string(),
        ))
    }

    fn signal(&mut self, signal: &str) -> PassageResult<()> {
        match signal {
            "KILL" => self
                .child
                .start_kill()
                .map_err(|e| PassageError::Spawn(format!("failed to kill child: {}", e))),
            other => Err(PassageError::Spawn(format!(
                "signal {} not supported by local spawn service",
                other
            ))),
        }
    }
}

#[async_trait::async_trait]
impl SpawnService for LocalSpawnService {
    async fn spawn(
        &self,
        name: &str,
        prepared: PreparedChildProcess,
    ) -> PassageResult<SpawnedChild> {
        if let StdioMode::Pty(_) = prepared.stdio {
            return Err(PassageError::Spawn(
                "local spawn service cannot allocate a PTY".to_string(),
            ));
        }

        let mut command = Command::new(&prepared.exec_path);
        command
            .args(&prepared.args)
            .env_clear()
            .envs(prepared.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &prepared.chdir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            PassageError::Spawn(format!(
                "failed to spawn {} ({}): {}",
                name,
                prepared.exec_path.display(),
                e
            ))
        })?;

        tracing::debug!(name, path = %prepared.exec_path.display(), "spawned child process");

        let stdin = child.stdin.take().map(|s| Box::new(s) as ChildWriter);
        let stdout = child.stdout.take().map(|s| Box::new(s) as ChildReader);
        let stderr = child.stderr.take().map(|s| Box::new(s) as ChildReader);

        Ok(SpawnedChild {
            stdin,
            stdout,
            stderr,
            handle: Box::new(LocalChildHandle { child }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_spawn_and_wait() {
        let service = LocalSpawnService;
        let mut prepared = PreparedChildProcess::new("/bin/sh");
        prepared.args = vec!["-c".to_string(), "exit 7".to_string()];

        let mut child = service.spawn("exec", prepared).await.unwrap();
        let outcome = child.handle.wait().await.unwrap();
        assert_eq!(outcome, ExitOutcome::Exited(7));
    }

    #[tokio::test]
    async fn test_spawn_captures_stdout() {
        let service = LocalSpawnService;
        let mut prepared = PreparedChildProcess::new("/bin/sh");
        prepared.args = vec!["-c".to_string(), "printf hi".to_string()];

        let mut child = service.spawn("exec", prepared).await.unwrap();
        let mut out = Vec::new();
        child
            .stdout
            .take()
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, b"hi");
        assert_eq!(child.handle.wait().await.unwrap(), ExitOutcome::Exited(0));
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let service = LocalSpawnService;
        let prepared = PreparedChildProcess::new("/nonexistent/program");
        let result = service.spawn("exec", prepared).await;
        assert!(matches!(result, Err(PassageError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_pty_unsupported() {
        let service = LocalSpawnService;
        let mut prepared = PreparedChildProcess::new("/bin/sh");
        prepared.stdio = StdioMode::Pty(PtyParams {
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
            pixel_width: 0,
            pixel_height: 0,
        });
        assert!(matches!(
            service.spawn("shell", prepared).await,
            Err(PassageError::Spawn(_))
        ));
    }
}
