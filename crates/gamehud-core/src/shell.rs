//! Privileged shell channel.
//!
//! Keeps one long-lived elevated shell (`su` by default) and turns its
//! unframed stdin/stdout into synchronous request/response calls. Every
//! command is followed by `echo <sentinel>`; the response is every line read
//! before the sentinel comes back.
//!
//! Only the sampler thread talks to the channel, one command at a time, so the
//! streams are never shared and need no lock.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ShellConfig;

/// How long a closing shell gets to exit before we stop waiting for it.
const EXIT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("failed to start shell `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("shell pipe broken")]
    BrokenPipe(#[source] io::Error),
    #[error("shell closed its output")]
    EndOfStream,
    #[error("shell did not answer within {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("no shell session is open")]
    Closed,
}

/// Anything that can run a command line and hand back its output lines.
///
/// The engine only depends on this seam, which keeps layer detection and frame
/// sampling testable without a device.
#[allow(async_fn_in_trait)]
pub trait Shell {
    /// Whether the current session proved elevated identity.
    fn is_privileged(&self) -> bool;

    /// Runs one command and returns its stdout lines.
    async fn execute(&mut self, command: &str) -> Result<Vec<String>, ShellError>;
}

/// One running shell process and its streams.
struct ShellSession {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    privileged: bool,
}

impl ShellSession {
    fn spawn(config: &ShellConfig) -> Result<Self, ShellError> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ShellError::Spawn {
                program: config.program.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ShellError::Closed);
        };

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            privileged: false,
        })
    }

    /// Discards output that is already buffered or readable without waiting.
    ///
    /// Leftovers only exist when an earlier exchange was abandoned, but they
    /// would otherwise be attributed to the next command.
    fn drain_stale(&mut self) -> usize {
        let mut discarded = 0;
        loop {
            let pending = match self.stdout.fill_buf().now_or_never() {
                Some(Ok(buf)) => buf.len(),
                _ => 0,
            };
            if pending == 0 {
                return discarded;
            }
            self.stdout.consume(pending);
            discarded += pending;
        }
    }

    /// Sends `command` and collects its output, bounded by `deadline`.
    async fn exchange(
        &mut self,
        command: &str,
        deadline: Duration,
    ) -> Result<Vec<String>, ShellError> {
        let stale = self.drain_stale();
        if stale > 0 {
            debug!(bytes = stale, "discarded stale shell output");
        }

        let sentinel = format!("__gamehud_{}__", Uuid::new_v4().simple());
        match tokio::time::timeout(deadline, self.round_trip(command, &sentinel)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ShellError::Timeout(deadline)),
        }
    }

    async fn round_trip(&mut self, command: &str, sentinel: &str) -> Result<Vec<String>, ShellError> {
        let request = format!("{command}\necho {sentinel}\n");
        self.stdin
            .write_all(request.as_bytes())
            .await
            .map_err(ShellError::BrokenPipe)?;
        self.stdin.flush().await.map_err(ShellError::BrokenPipe)?;

        let mut lines = Vec::new();
        let mut raw = Vec::new();
        loop {
            raw.clear();
            let read = self
                .stdout
                .read_until(b'\n', &mut raw)
                .await
                .map_err(ShellError::BrokenPipe)?;
            if read == 0 {
                return Err(ShellError::EndOfStream);
            }

            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            // Output without a trailing newline shares its last line with the sentinel.
            if let Some(tail) = line.strip_suffix(sentinel) {
                if !tail.is_empty() {
                    lines.push(tail.to_string());
                }
                return Ok(lines);
            }
            lines.push(line.to_string());
        }
    }

    /// Asks the shell to exit, then kills it. Never fails.
    async fn shutdown(mut self) {
        let stdin = &mut self.stdin;
        let _ = tokio::time::timeout(EXIT_GRACE, async move {
            stdin.write_all(b"exit\n").await?;
            stdin.flush().await
        })
        .await;
        drop(self.stdin);

        let _ = self.child.start_kill();
        // A root shell may refuse our signal; closing stdin makes it exit on its own.
        let _ = tokio::time::timeout(EXIT_GRACE, self.child.wait()).await;
    }
}

/// Owner of the single privileged shell session.
pub struct ShellChannel {
    config: ShellConfig,
    session: Option<ShellSession>,
    open_attempts: u64,
    degraded_reported: bool,
}

impl ShellChannel {
    pub fn new(config: ShellConfig) -> Self {
        Self {
            config,
            session: None,
            open_attempts: 0,
            degraded_reported: false,
        }
    }

    /// Whether a shell process is currently attached.
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Number of times a session has been spawned (or tried to be).
    pub fn open_attempts(&self) -> u64 {
        self.open_attempts
    }

    /// Replaces any current session with a fresh one and probes its identity.
    ///
    /// Returns whether the new session is privileged. A process that starts but
    /// fails the probe stays attached as unprivileged so it is not respawned
    /// every tick.
    pub async fn open(&mut self) -> bool {
        self.close().await;
        self.open_attempts += 1;

        let mut session = match ShellSession::spawn(&self.config) {
            Ok(session) => session,
            Err(err) => {
                self.report_degraded(&err);
                return false;
            }
        };

        let probe = session
            .exchange(&self.config.probe_command, self.config.command_timeout())
            .await;
        let lines = match probe {
            Ok(lines) => lines,
            Err(err) => {
                session.shutdown().await;
                self.report_degraded(&err);
                return false;
            }
        };

        session.privileged = lines
            .iter()
            .any(|line| line.contains(&self.config.privileged_marker));
        let privileged = session.privileged;
        self.session = Some(session);

        if privileged {
            info!(program = %self.config.program, "privileged shell ready");
            self.degraded_reported = false;
        } else {
            self.report_degraded(&"identity probe did not prove elevation");
        }
        privileged
    }

    /// Opens a session if none is attached. Called once per tick.
    pub async fn ensure_open(&mut self) -> bool {
        if self.session.is_some() {
            return self.is_privileged();
        }
        self.open().await
    }

    /// Closes the current session, if any. Never fails.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("closing shell session");
            session.shutdown().await;
        }
    }

    fn report_degraded(&mut self, reason: &dyn std::fmt::Display) {
        if self.degraded_reported {
            debug!(%reason, "privileged shell still unavailable");
        } else {
            warn!(%reason, "privileged shell unavailable, frame metrics disabled");
            self.degraded_reported = true;
        }
    }
}

impl Shell for ShellChannel {
    fn is_privileged(&self) -> bool {
        self.session.as_ref().is_some_and(|session| session.privileged)
    }

    /// Runs `command` in the shell.
    ///
    /// A broken pipe, end of stream or missed deadline closes the session and
    /// triggers exactly one reopen before the error is returned.
    async fn execute(&mut self, command: &str) -> Result<Vec<String>, ShellError> {
        let deadline = self.config.command_timeout();
        let Some(session) = self.session.as_mut() else {
            return Err(ShellError::Closed);
        };

        match session.exchange(command, deadline).await {
            Ok(lines) => {
                debug!(command, lines = lines.len(), "shell command finished");
                Ok(lines)
            }
            Err(err) => {
                warn!(%err, command, "shell command failed, reopening session");
                self.open().await;
                Err(err)
            }
        }
    }
}
