use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::error::{CoreError, CoreResult};

/// How long a closed child gets to exit on stdin EOF before SIGTERM.
pub const GRACEFUL_EXIT: Duration = Duration::from_secs(5);
/// How long after SIGTERM before SIGKILL.
pub const FORCED_EXIT: Duration = Duration::from_secs(2);

const STDERR_RING_BYTES: usize = 64 * 1024;
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub binary: String,
    pub workdir: PathBuf,
    pub model: Option<String>,
    /// Conversation id from a previous child's init frame; passed via
    /// `--resume` so a respawn keeps the conversation context.
    pub resume_session_id: Option<String>,
    /// Extra environment for the child (e.g. a HOME override).
    pub env: Vec<(String, String)>,
}

/// Owns one assistant child process speaking line-delimited stream-JSON over
/// stdin/stdout. At most one `ask` may be in flight; the session layer
/// serializes callers.
#[derive(Debug)]
pub struct ProcessDriver {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Arc<StderrRing>,
    pid: u32,
    closed: bool,
    /// Conversation id reported by the child's init frame.
    pub session_id: Option<String>,
}

impl ProcessDriver {
    pub fn spawn(config: &DriverConfig) -> CoreResult<Self> {
        if !config.workdir.is_dir() {
            return Err(CoreError::WorkdirInvalid(config.workdir.clone()));
        }

        let mut cmd = Command::new(&config.binary);
        if let Some(resume) = &config.resume_session_id {
            cmd.arg("--resume").arg(resume);
        }
        cmd.arg("--dangerously-skip-permissions");
        if let Some(model) = &config.model {
            cmd.arg("--model").arg(model);
        }
        cmd.args([
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
            "--strict-mcp-config",
        ]);

        // The assistant refuses to nest inside another of its own sessions.
        cmd.env_remove("CLAUDECODE");
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        cmd.current_dir(&config.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(CoreError::SpawnFailed)?;
        let pid = child.id().unwrap_or(0);

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .map(|out| BufReader::new(out).lines())
            .ok_or_else(|| {
                CoreError::SpawnFailed(std::io::Error::other("child stdout not piped"))
            })?;

        let stderr = Arc::new(StderrRing::default());
        if let Some(pipe) = child.stderr.take() {
            let ring = stderr.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    ring.push(line);
                }
            });
        }

        info!(
            "assistant process started: pid={}, cwd={}, resume={}",
            pid,
            config.workdir.display(),
            config.resume_session_id.is_some(),
        );

        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
            pid,
            closed: false,
            session_id: config.resume_session_id.clone(),
        })
    }

    /// Write one request frame and read the stream up to its terminal
    /// `result` frame. Returns the canonical result text, falling back to the
    /// concatenated assistant text blocks.
    pub async fn ask(&mut self, prompt: &str, deadline: Duration) -> CoreResult<String> {
        if self.closed {
            return Err(CoreError::Closed);
        }

        let frame = json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{ "type": "text", "text": prompt }],
            },
        });
        let line = format!("{}\n", frame);

        let stdin = self.stdin.as_mut().ok_or(CoreError::Closed)?;
        if let Err(e) = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await
        {
            debug!("stdin write failed: {}", e);
            self.closed = true;
            return Err(CoreError::Dead {
                stderr_tail: self.stderr.tail(STDERR_TAIL_LINES),
                partial: String::new(),
            });
        }

        match timeout(deadline, self.collect_response()).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout(deadline.as_secs())),
        }
    }

    async fn collect_response(&mut self) -> CoreResult<String> {
        let mut acc = String::new();

        loop {
            let line = match self.stdout.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => {
                    // EOF or broken pipe: the child is gone.
                    self.closed = true;
                    let _ = self.child.try_wait();
                    return Err(CoreError::Dead {
                        stderr_tail: self.stderr.tail(STDERR_TAIL_LINES),
                        partial: acc,
                    });
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let event: StreamEvent = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(e) => {
                    debug!("skipping unparseable frame ({} bytes): {}", line.len(), e);
                    continue;
                }
            };

            match event.kind.as_str() {
                "assistant" => {
                    if let Some(message) = &event.message {
                        for block in &message.content {
                            if block.kind == "text" {
                                acc.push_str(&block.text);
                            }
                        }
                    }
                }
                "system" => {
                    if event.subtype.as_deref() == Some("init") {
                        if let Some(id) = event.session_id {
                            self.session_id = Some(id);
                        }
                    }
                }
                "result" => {
                    let text = event.result_text();
                    if text.is_empty() && event.is_error.unwrap_or(false) {
                        return Err(CoreError::ProtocolViolation(event.error_message()));
                    }
                    return Ok(if text.is_empty() { acc } else { text });
                }
                "error" => {
                    return Err(CoreError::ProtocolViolation(event.error_message()));
                }
                // Tool use, progress and anything newer: consume and move on.
                _ => {}
            }
        }
    }

    /// Stdin EOF, then escalate: wait 5s, SIGTERM, wait 2s, SIGKILL.
    /// Idempotent; after return the child has been reaped.
    pub async fn close(&mut self) {
        self.closed = true;
        self.stdin.take();

        if timeout(GRACEFUL_EXIT, self.child.wait()).await.is_ok() {
            debug!("assistant process exited cleanly: pid={}", self.pid);
            return;
        }

        warn!("assistant process ignored EOF, terminating: pid={}", self.pid);
        terminate(self.pid);
        if timeout(FORCED_EXIT, self.child.wait()).await.is_err() {
            warn!("assistant process ignored SIGTERM, killing: pid={}", self.pid);
            let _ = self.child.kill().await;
        }
    }

    pub fn is_alive(&mut self) -> bool {
        !self.closed && matches!(self.child.try_wait(), Ok(None))
    }
}

fn terminate(pid: u32) {
    #[cfg(unix)]
    {
        let _ = std::process::Command::new("kill")
            .arg("-15")
            .arg(pid.to_string())
            .output();
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// Bounded buffer of the child's most recent stderr output. A dedicated
/// drain task keeps the pipe from backing up; the tail is attached to
/// process-death errors for diagnostics.
#[derive(Default)]
#[derive(Debug)]
struct StderrRing {
    inner: StdMutex<(VecDeque<String>, usize)>,
}

impl StderrRing {
    fn push(&self, line: String) {
        let mut inner = self.inner.lock().expect("stderr ring lock");
        inner.1 += line.len();
        inner.0.push_back(line);
        while inner.1 > STDERR_RING_BYTES {
            if let Some(dropped) = inner.0.pop_front() {
                inner.1 -= dropped.len();
            } else {
                break;
            }
        }
    }

    fn tail(&self, max_lines: usize) -> String {
        let inner = self.inner.lock().expect("stderr ring lock");
        let skip = inner.0.len().saturating_sub(max_lines);
        inner
            .0
            .iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    subtype: Option<String>,
    message: Option<EventMessage>,
    result: Option<serde_json::Value>,
    is_error: Option<bool>,
    session_id: Option<String>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EventMessage {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: String,
}

impl StreamEvent {
    fn result_text(&self) -> String {
        match &self.result {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    fn error_message(&self) -> String {
        match &self.error {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Object(map)) => map
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("assistant reported an error")
                .to_string(),
            _ => "assistant reported an error".to_string(),
        }
    }
}
