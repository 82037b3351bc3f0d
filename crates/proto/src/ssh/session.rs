//! Session channels: shell, exec and subsystem requests backed by a
//! child process (RFC 4254 Section 6).
//!
//! A session channel records environment and PTY parameters until one
//! of `shell`, `exec` or `subsystem` arrives, then asks the spawn
//! service for a child. Exactly one spawn is allowed per session; a
//! second request fails. Child stdout/stderr are pumped into the
//! connection's event queue by per-stream tasks; inbound channel data is
//! reassembled through [`BufferedChannel`] and fed to the child's stdin
//! as fast as its pipe accepts it. When the child exits and both output
//! pipes drain, the channel finishes with exit-status or exit-signal.
//!
//! When the session profile carries a proxy-to address the channel
//! never spawns locally: the spawn request opens a TCP connection to
//! the upstream and the byte stream is forwarded verbatim, which is the
//! gateway's pass-through mode.

use crate::ssh::buffered::BufferedChannel;
use crate::ssh::channel::{ChannelEvent, ChannelHandler, DataStream, Finish};
use crate::ssh::connection::{parse_env, parse_signal, PtyRequest, WindowChange};
use passage_platform::{
    ChildReader, ChildWriter, ExitOutcome, PassageResult, PreparedChildProcess, PtyParams,
    SessionProfile, SpawnService, StdioMode,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Read size for child output pumps.
const PUMP_CHUNK: usize = 32 * 1024;

/// Depth of the stdin writer queue, in chunks.
const STDIN_QUEUE: usize = 8;

/// Server-side session settings shared by all session channels.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Shell executed for "shell" requests when the profile does not
    /// override it.
    pub shell: PathBuf,
    /// Binary executed for the "sftp" subsystem; None disables it.
    pub sftp_server: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            sftp_server: Some(PathBuf::from("/usr/lib/ssh/sftp-server")),
        }
    }
}

/// A session channel handler.
pub struct SessionChannel {
    local_id: u32,
    events: mpsc::Sender<ChannelEvent>,
    spawn: Arc<dyn SpawnService>,
    config: SessionConfig,
    profile: SessionProfile,

    env: Vec<(String, String)>,
    pty: Option<PtyParams>,

    started: bool,
    stdin: BufferedChannel,
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    signal_tx: Option<mpsc::Sender<String>>,

    open_sources: u32,
    exit_outcome: Option<ExitOutcome>,

    tasks: Vec<JoinHandle<()>>,
}

impl SessionChannel {
    /// Creates an idle session channel for `local_id`.
    pub fn new(
        local_id: u32,
        events: mpsc::Sender<ChannelEvent>,
        spawn: Arc<dyn SpawnService>,
        config: SessionConfig,
        profile: SessionProfile,
    ) -> Self {
        Self {
            local_id,
            events,
            spawn,
            config,
            profile,
            env: Vec::new(),
            pty: None,
            started: false,
            stdin: BufferedChannel::new(),
            stdin_tx: None,
            signal_tx: None,
            open_sources: 0,
            exit_outcome: None,
            tasks: Vec::new(),
        }
    }

    fn spawn_reader(&mut self, mut reader: ChildReader, stream: DataStream) {
        let id = self.local_id;
        let events = self.events.clone();
        self.open_sources += 1;

        self.tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; PUMP_CHUNK];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if events
                            .send(ChannelEvent::Output {
                                id,
                                stream,
                                data: buf[..n].to_vec(),
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
            let _ = events.send(ChannelEvent::SourceEof { id }).await;
        }));
    }

    fn spawn_stdin_writer(&mut self, mut writer: ChildWriter) {
        let id = self.local_id;
        let events = self.events.clone();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(STDIN_QUEUE);
        self.stdin_tx = Some(tx);

        self.tasks.push(tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if writer.write_all(&chunk).await.is_err() {
                    break;
                }
                // tell the engine the pipe made progress so buffered
                // stdin can be retried
                if events.send(ChannelEvent::Wakeup { id }).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        }));
    }

    fn spawn_waiter(&mut self, mut handle: Box<dyn passage_platform::ChildProcessHandle>) {
        let id = self.local_id;
        let events = self.events.clone();
        let (tx, mut rx) = mpsc::channel::<String>(4);
        self.signal_tx = Some(tx);

        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    outcome = handle.wait() => {
                        match outcome {
                            Ok(outcome) => {
                                let _ = events.send(ChannelEvent::ChildExit { id, outcome }).await;
                            }
                            Err(e) => {
                                warn!(channel = id, error = %e, "child wait failed");
                            }
                        }
                        break;
                    }
                    // the pattern disables this branch once the sender
                    // side is gone
                    Some(signal) = rx.recv() => {
                        if let Err(e) = handle.signal(&signal) {
                            debug!(channel = id, signal = %signal, error = %e, "signal not delivered");
                        }
                    }
                }
            }
        }));
    }

    /// Starts the child process for a shell/exec/subsystem request.
    async fn start(&mut self, name: &str, exec_path: PathBuf, args: Vec<String>) -> bool {
        if self.started {
            warn!(channel = self.local_id, "second process start on session channel");
            return false;
        }

        if let Some(upstream) = self.profile.proxy_to.clone() {
            return self.start_proxy(&upstream).await;
        }

        let mut prepared = PreparedChildProcess::new(exec_path);
        prepared.args = args;
        prepared.chdir = self.profile.chdir.clone();
        for (k, v) in self.profile.env.iter().chain(self.env.iter()) {
            prepared.push_env(k.clone(), v.clone());
        }
        if let Some(pty) = &self.pty {
            prepared.push_env("TERM", pty.term.clone());
            prepared.stdio = StdioMode::Pty(pty.clone());
        }

        let spawned = match self.spawn.spawn(name, prepared).await {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(channel = self.local_id, error = %e, "spawn failed");
                return false;
            }
        };

        self.started = true;

        if let Some(stdout) = spawned.stdout {
            self.spawn_reader(stdout, DataStream::Stdout);
        }
        if let Some(stderr) = spawned.stderr {
            self.spawn_reader(stderr, DataStream::Stderr);
        }
        if let Some(stdin) = spawned.stdin {
            self.spawn_stdin_writer(stdin);
        }
        self.spawn_waiter(spawned.handle);

        true
    }

    /// Connects the channel to the profile's upstream instead of
    /// spawning a child.
    async fn start_proxy(&mut self, upstream: &str) -> bool {
        let stream = match tokio::net::TcpStream::connect(upstream).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(channel = self.local_id, upstream = %upstream, error = %e, "proxy connect failed");
                return false;
            }
        };

        debug!(channel = self.local_id, upstream = %upstream, "session proxied to upstream");
        self.started = true;

        let (read_half, write_half) = stream.into_split();
        self.spawn_reader(Box::new(read_half), DataStream::Stdout);
        self.spawn_stdin_writer(Box::new(write_half));
        true
    }

    /// Pushes buffered stdin into the writer queue as far as it
    /// accepts.
    fn drain_stdin(&mut self) {
        let Some(tx) = &self.stdin_tx else {
            // no sink: discard, matching a child without stdin
            self.stdin.drain(|bytes| bytes.len());
            self.check_stdin_eof();
            return;
        };

        loop {
            let mut progressed = false;
            self.stdin.drain(|bytes| {
                match tx.try_reserve() {
                    Ok(permit) => {
                        let take = bytes.len().min(PUMP_CHUNK);
                        permit.send(bytes[..take].to_vec());
                        progressed = true;
                        take
                    }
                    Err(_) => 0,
                }
            });
            if !progressed || self.stdin.is_empty() {
                break;
            }
        }

        self.check_stdin_eof();
    }

    fn check_stdin_eof(&mut self) {
        if self.stdin.take_buffered_eof() {
            // dropping the sender ends the writer task, which closes
            // the child's stdin
            self.stdin_tx = None;
        }
    }
}

#[async_trait::async_trait]
impl ChannelHandler for SessionChannel {
    async fn on_data(&mut self, data: &[u8]) -> PassageResult<()> {
        self.stdin.push(data);
        self.drain_stdin();
        Ok(())
    }

    async fn on_eof(&mut self) -> PassageResult<()> {
        self.stdin.set_eof();
        self.drain_stdin();
        Ok(())
    }

    async fn on_wakeup(&mut self) -> PassageResult<()> {
        self.drain_stdin();
        Ok(())
    }

    async fn on_request(
        &mut self,
        request_type: &str,
        type_specific: &[u8],
    ) -> PassageResult<bool> {
        match request_type {
            "pty-req" => {
                if self.started {
                    return Ok(false);
                }
                let request = PtyRequest::from_bytes(type_specific)?;
                debug!(channel = self.local_id, term = %request.term, "pty requested");
                self.pty = Some(PtyParams {
                    term: request.term,
                    cols: request.cols,
                    rows: request.rows,
                    pixel_width: request.pixel_width,
                    pixel_height: request.pixel_height,
                });
                Ok(true)
            }
            "env" => {
                let (name, value) = parse_env(type_specific)?;
                self.env.push((name, value));
                Ok(true)
            }
            "shell" => {
                let shell = self
                    .profile
                    .shell
                    .clone()
                    .unwrap_or_else(|| self.config.shell.clone());
                Ok(self.start("shell", shell, Vec::new()).await)
            }
            "exec" => {
                let command = crate::ssh::connection::parse_exec(type_specific)?;
                let shell = self
                    .profile
                    .shell
                    .clone()
                    .unwrap_or_else(|| self.config.shell.clone());
                Ok(self
                    .start("exec", shell, vec!["-c".to_string(), command])
                    .await)
            }
            "subsystem" => {
                let name = crate::ssh::connection::parse_subsystem(type_specific)?;
                if name != "sftp" {
                    return Ok(false);
                }
                let Some(sftp) = self.config.sftp_server.clone() else {
                    return Ok(false);
                };
                Ok(self.start("sftp", sftp, Vec::new()).await)
            }
            "signal" => {
                let signal = parse_signal(type_specific)?;
                if let Some(tx) = &self.signal_tx {
                    let _ = tx.try_send(signal);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            "window-change" => {
                let change = WindowChange::from_bytes(type_specific)?;
                match &mut self.pty {
                    Some(pty) => {
                        pty.cols = change.cols;
                        pty.rows = change.rows;
                        pty.pixel_width = change.pixel_width;
                        pty.pixel_height = change.pixel_height;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            other => {
                debug!(channel = self.local_id, request = %other, "unhandled session request");
                Ok(false)
            }
        }
    }

    fn on_source_eof(&mut self) {
        self.open_sources = self.open_sources.saturating_sub(1);
    }

    fn on_child_exit(&mut self, outcome: ExitOutcome) {
        self.exit_outcome = Some(outcome);
    }

    fn finish_status(&self) -> Option<Finish> {
        if !self.started {
            return None;
        }
        // a proxied session has no exit status; it finishes when the
        // upstream closes
        if self.profile.proxy_to.is_some() {
            return (self.open_sources == 0).then_some(Finish::Plain);
        }
        match self.exit_outcome {
            Some(outcome) if self.open_sources == 0 => Some(Finish::Exit(outcome)),
            _ => None,
        }
    }

    fn on_close(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.tasks.clear();
        self.stdin_tx = None;
        self.signal_tx = None;
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        // aborting the waiter drops the child handle, which kills the
        // process
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::wire::PacketWriter;
    use passage_platform::LocalSpawnService;

    fn test_session() -> (SessionChannel, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let session = SessionChannel::new(
            0,
            tx,
            Arc::new(LocalSpawnService),
            SessionConfig::default(),
            SessionProfile::default(),
        );
        (session, rx)
    }

    fn exec_body(command: &str) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.put_str(command).unwrap();
        w.into_bytes()
    }

    async fn collect_until_exit(
        rx: &mut mpsc::Receiver<ChannelEvent>,
        session: &mut SessionChannel,
    ) -> (Vec<u8>, ExitOutcome) {
        let mut stdout = Vec::new();
        let mut exit = None;
        while session.finish_status().is_none() {
            match rx.recv().await.expect("event stream ended early") {
                ChannelEvent::Output {
                    stream: DataStream::Stdout,
                    data,
                    ..
                } => stdout.extend_from_slice(&data),
                ChannelEvent::Output { .. } => {}
                ChannelEvent::SourceEof { .. } => session.on_source_eof(),
                ChannelEvent::ChildExit { outcome, .. } => {
                    session.on_child_exit(outcome);
                    exit = Some(outcome);
                }
                ChannelEvent::Wakeup { .. } => {}
            }
        }
        (stdout, exit.expect("no exit outcome"))
    }

    #[tokio::test]
    async fn test_exec_echo() {
        let (mut session, mut rx) = test_session();

        let started = session.on_request("exec", &exec_body("printf hi")).await.unwrap();
        assert!(started);

        let (stdout, exit) = collect_until_exit(&mut rx, &mut session).await;
        assert_eq!(stdout, b"hi");
        assert_eq!(exit, ExitOutcome::Exited(0));
        assert_eq!(session.finish_status(), Some(Finish::Exit(ExitOutcome::Exited(0))));
    }

    #[tokio::test]
    async fn test_exec_exit_code() {
        let (mut session, mut rx) = test_session();
        assert!(session.on_request("exec", &exec_body("exit 3")).await.unwrap());

        let (_, exit) = collect_until_exit(&mut rx, &mut session).await;
        assert_eq!(exit, ExitOutcome::Exited(3));
    }

    #[tokio::test]
    async fn test_stdin_reaches_child() {
        let (mut session, mut rx) = test_session();
        assert!(session.on_request("exec", &exec_body("cat")).await.unwrap());

        session.on_data(b"roundtrip").await.unwrap();
        session.on_eof().await.unwrap();

        let (stdout, exit) = collect_until_exit(&mut rx, &mut session).await;
        assert_eq!(stdout, b"roundtrip");
        assert_eq!(exit, ExitOutcome::Exited(0));
    }

    #[tokio::test]
    async fn test_env_recorded_and_applied() {
        let (mut session, mut rx) = test_session();

        let mut body = PacketWriter::new();
        body.put_str("GREETING").unwrap();
        body.put_str("hello-env").unwrap();
        assert!(session.on_request("env", body.as_slice()).await.unwrap());

        assert!(session
            .on_request("exec", &exec_body("printf %s \"$GREETING\""))
            .await
            .unwrap());

        let (stdout, _) = collect_until_exit(&mut rx, &mut session).await;
        assert_eq!(stdout, b"hello-env");
    }

    #[tokio::test]
    async fn test_second_spawn_fails() {
        let (mut session, mut rx) = test_session();
        assert!(session.on_request("exec", &exec_body("true")).await.unwrap());
        assert!(!session.on_request("exec", &exec_body("true")).await.unwrap());
        let _ = collect_until_exit(&mut rx, &mut session).await;
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_false() {
        let (tx, _rx) = mpsc::channel(8);
        let mut config = SessionConfig::default();
        config.shell = PathBuf::from("/nonexistent/shell");
        let mut session = SessionChannel::new(
            0,
            tx,
            Arc::new(LocalSpawnService),
            config,
            SessionProfile::default(),
        );

        assert!(!session.on_request("shell", &[]).await.unwrap());
        // the channel is still usable for a retry
        assert!(session.finish_status().is_none());
    }

    #[tokio::test]
    async fn test_unknown_subsystem_fails() {
        let (mut session, _rx) = test_session();
        let mut body = PacketWriter::new();
        body.put_str("netconf").unwrap();
        assert!(!session.on_request("subsystem", body.as_slice()).await.unwrap());
    }

    #[tokio::test]
    async fn test_pty_must_precede_start() {
        let (mut session, mut rx) = test_session();
        assert!(session.on_request("exec", &exec_body("true")).await.unwrap());

        let mut body = PacketWriter::new();
        body.put_str("xterm").unwrap();
        for _ in 0..4 {
            body.put_u32(0).unwrap();
        }
        body.put_string(&[]).unwrap();
        assert!(!session.on_request("pty-req", body.as_slice()).await.unwrap());
        let _ = collect_until_exit(&mut rx, &mut session).await;
    }
}
