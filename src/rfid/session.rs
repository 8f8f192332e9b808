// src/rfid/session.rs - Process sessions with the tag-reading tool
//
// Two ways of talking to the tool: a fresh process per command (commands
// passed with `-c`), or one interactive process whose stdin receives commands
// and whose stdout is read up to the next prompt.
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::config::{RfidConfig, SessionStrategy};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Exit { program: String, status: ExitStatus },
    #[error("Session I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No prompt from tag tool within {0:?}")]
    Timeout(Duration),
    #[error("Tag tool session closed")]
    Closed,
}

/// Send a command, get the tool's textual response.
#[async_trait]
pub trait TagSession: Send + Sync {
    async fn execute(&self, command: &str) -> Result<String, SessionError>;

    /// Release the underlying process. Safe to call more than once.
    async fn terminate(&self) -> Result<(), SessionError>;
}

/// Open the session selected by `config.strategy`.
pub async fn open_session(config: &RfidConfig) -> Result<std::sync::Arc<dyn TagSession>, SessionError> {
    match config.strategy {
        SessionStrategy::OneShot => Ok(std::sync::Arc::new(OneShotSession::new(
            &config.client,
            &config.port,
        ))),
        SessionStrategy::Persistent => {
            let session = PersistentSession::open(
                &config.client,
                &config.port,
                &config.prompt,
                config.response_timeout(),
            )
            .await?;
            Ok(std::sync::Arc::new(session))
        }
    }
}

/// Spawns `<client> <port> -c <command>` for every command.
pub struct OneShotSession {
    client: String,
    port: String,
}

impl OneShotSession {
    pub fn new(client: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            port: port.into(),
        }
    }
}

#[async_trait]
impl TagSession for OneShotSession {
    async fn execute(&self, command: &str) -> Result<String, SessionError> {
        tracing::debug!("{} -c '{}'", self.client, command);
        let output = Command::new(&self.client)
            .arg(&self.port)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SessionError::Spawn {
                program: self.client.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SessionError::Exit {
                program: self.client.clone(),
                status: output.status,
            });
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(combined)
    }

    async fn terminate(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

struct SessionIo {
    stdin: BufWriter<ChildStdin>,
    stdout: ChildStdout,
    // Bytes read but not yet returned; survives a timed-out read.
    pending: Vec<u8>,
    // A reply timed out and its prompt has not been read yet.
    desynced: bool,
}

impl SessionIo {
    /// Read until the buffered output contains `prompt`, then hand back
    /// everything read. The prompt is usually not newline terminated.
    async fn read_until_prompt(&mut self, prompt: &[u8]) -> Result<String, SessionError> {
        let mut chunk = [0u8; 1024];
        let mut scanned: usize = 0;
        loop {
            let from = scanned.saturating_sub(prompt.len());
            if prompt.is_empty() || self.pending[from..].windows(prompt.len()).any(|w| w == prompt) {
                return Ok(self.take_pending());
            }
            scanned = self.pending.len();

            let n = self.stdout.read(&mut chunk).await?;
            if n == 0 {
                if self.pending.is_empty() {
                    return Err(SessionError::Closed);
                }
                return Ok(self.take_pending());
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    fn take_pending(&mut self) -> String {
        let bytes = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// One interactive tool process kept alive for the scanner's lifetime.
///
/// The tool has no request IDs, so exactly one command may be in flight:
/// `io` is held for the whole write + read exchange. The child handle has
/// its own lock so it can be killed while a read is blocked.
pub struct PersistentSession {
    program: String,
    child: Mutex<Child>,
    io: Mutex<SessionIo>,
    prompt: String,
    timeout: Duration,
}

impl PersistentSession {
    pub async fn open(
        client: &str,
        port: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        tracing::info!("Starting tag tool session: {} {}", client, port);
        let mut child = Command::new(client)
            .arg(port)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SessionError::Spawn {
                program: client.to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(SessionError::Closed)?;
        let stdout = child.stdout.take().ok_or(SessionError::Closed)?;

        let session = Self {
            program: client.to_string(),
            child: Mutex::new(child),
            io: Mutex::new(SessionIo {
                stdin: BufWriter::new(stdin),
                stdout,
                pending: Vec::new(),
                desynced: false,
            }),
            prompt: prompt.to_string(),
            timeout,
        };

        // Swallow the banner so the first response is not polluted by it.
        // A tool that prints no startup prompt is not an error.
        {
            let mut io = session.io.lock().await;
            match session.read_reply(&mut io).await {
                Ok(banner) => tracing::debug!("Tag tool banner: {} bytes", banner.len()),
                Err(e) => {
                    tracing::debug!("No initial prompt from {}: {}", session.program, e);
                    io.pending.clear();
                    io.desynced = false;
                }
            }
        }
        Ok(session)
    }

    /// One command, one reply. At most one command is ever unanswered: after
    /// a timeout the late reply is drained before anything new is written.
    async fn exchange(&self, command: &str) -> Result<String, SessionError> {
        let mut io = self.io.lock().await;
        if io.desynced {
            let stale = self.read_reply(&mut io).await?;
            tracing::debug!("Discarded late reply from {}: {} bytes", self.program, stale.len());
        }

        io.stdin.write_all(command.as_bytes()).await?;
        io.stdin.write_all(b"\n").await?;
        io.stdin.flush().await?;
        self.read_reply(&mut io).await
    }

    /// Read up to the next prompt within the response timeout. On timeout the
    /// partial reply is kept and the session is marked out of sync.
    async fn read_reply(&self, io: &mut SessionIo) -> Result<String, SessionError> {
        match tokio::time::timeout(self.timeout, io.read_until_prompt(self.prompt.as_bytes())).await {
            Ok(result) => {
                io.desynced = false;
                result
            }
            Err(_) => {
                io.desynced = true;
                Err(SessionError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl TagSession for PersistentSession {
    async fn execute(&self, command: &str) -> Result<String, SessionError> {
        tracing::trace!("{} <- {}", self.program, command);
        self.exchange(command).await
    }

    async fn terminate(&self) -> Result<(), SessionError> {
        let mut child = self.child.lock().await;
        if let Ok(Some(status)) = child.try_wait() {
            tracing::debug!("{} already exited with {}", self.program, status);
            return Ok(());
        }
        child.kill().await?;
        tracing::info!("Tag tool session terminated");
        Ok(())
    }
}
