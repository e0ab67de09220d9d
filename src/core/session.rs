use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::driver::{DriverConfig, ProcessDriver};
use crate::core::error::{CoreError, CoreResult};
use crate::core::events::{CoreEvent, EventSink};

/// Two deaths inside this window disable auto-respawn until an explicit
/// reset or reopen.
pub const DEATH_WINDOW: Duration = Duration::from_secs(60);
pub const MAX_DEATHS_IN_WINDOW: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Busy,
    Dead,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionState::Busy,
            2 => SessionState::Dead,
            _ => SessionState::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Busy => "busy",
            SessionState::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub assistant_bin: String,
    pub model: Option<String>,
    pub ask_timeout: Duration,
    /// Extra environment for spawned children (HOME override and friends).
    pub env: Vec<(String, String)>,
}

/// Lock-free status snapshot; values may lag a transition.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub name: String,
    pub workdir: PathBuf,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
}

struct Inner {
    driver: Option<ProcessDriver>,
    /// Conversation id carried across respawns via `--resume`.
    resume_session_id: Option<String>,
    respawn_disabled: bool,
    deaths: Vec<Instant>,
    last_error: Option<String>,
}

/// A named conversation pinned to a working directory, backed by exactly one
/// assistant child at a time. The inner mutex is the request mutex: `ask`,
/// `new_conversation` and `close` all serialize on it.
pub struct Session {
    name: String,
    workdir: PathBuf,
    config: SessionConfig,
    inner: Mutex<Inner>,
    state: AtomicU8,
    created_at: DateTime<Utc>,
    last_activity: AtomicI64,
    message_count: AtomicU64,
    events: Arc<dyn EventSink>,
}

impl Session {
    /// Spawn the first child and return the session in `idle`.
    pub fn open(
        name: &str,
        workdir: PathBuf,
        config: SessionConfig,
        events: Arc<dyn EventSink>,
    ) -> CoreResult<Arc<Self>> {
        let driver = ProcessDriver::spawn(&driver_config(&config, &workdir, None))?;
        let now = Utc::now();
        info!("session '{}' opened in {}", name, workdir.display());
        Ok(Arc::new(Self {
            name: name.to_string(),
            workdir,
            config,
            inner: Mutex::new(Inner {
                driver: Some(driver),
                resume_session_id: None,
                respawn_disabled: false,
                deaths: Vec::new(),
                last_error: None,
            }),
            state: AtomicU8::new(0),
            created_at: now,
            last_activity: AtomicI64::new(now.timestamp()),
            message_count: AtomicU64::new(0),
            events,
        }))
    }

    pub fn workdir(&self) -> &PathBuf {
        &self.workdir
    }

    /// Send one prompt and wait for the reply. Serialized per session; on
    /// child death the session respawns once and retries the prompt once.
    pub async fn ask(&self, prompt: &str) -> CoreResult<String> {
        let mut inner = self.inner.lock().await;

        if inner.respawn_disabled {
            self.set_state(SessionState::Dead);
            return Err(CoreError::HardFail {
                cause: format!("session '{}' is dead, close or reset it first", self.name),
                stderr_tail: inner.last_error.clone().unwrap_or_default(),
            });
        }

        self.set_state(SessionState::Busy);
        let outcome = self.ask_locked(&mut inner, prompt).await;
        self.set_state(if inner.respawn_disabled {
            SessionState::Dead
        } else {
            SessionState::Idle
        });
        outcome
    }

    async fn ask_locked(&self, inner: &mut Inner, prompt: &str) -> CoreResult<String> {
        self.ensure_driver(inner).await?;

        let deadline = self.config.ask_timeout;
        let driver = inner.driver.as_mut().expect("driver ensured");
        match driver.ask(prompt, deadline).await {
            Ok(reply) => {
                self.note_success(inner);
                Ok(reply)
            }
            Err(CoreError::Dead {
                stderr_tail,
                partial,
            }) => {
                self.handle_death_and_retry(inner, prompt, stderr_tail, partial)
                    .await
            }
            Err(CoreError::Timeout(secs)) => {
                // No in-band cancel exists: treat the child as unresponsive,
                // force-close it and respawn lazily on the next ask.
                warn!(
                    "session '{}' hit the {}s deadline, recycling the child",
                    self.name, secs
                );
                if let Some(mut driver) = inner.driver.take() {
                    driver.close().await;
                }
                self.record_death(inner);
                inner.last_error = Some(format!("deadline of {}s exceeded", secs));
                Err(CoreError::Timeout(secs))
            }
            Err(other) => {
                inner.last_error = Some(other.to_string());
                Err(other)
            }
        }
    }

    async fn handle_death_and_retry(
        &self,
        inner: &mut Inner,
        prompt: &str,
        stderr_tail: String,
        partial: String,
    ) -> CoreResult<String> {
        warn!(
            "session '{}' child died mid-request ({} chars collected)",
            self.name,
            partial.len()
        );
        if let Some(mut driver) = inner.driver.take() {
            driver.close().await;
        }
        inner.last_error = Some("assistant process exited unexpectedly".to_string());

        if self.record_death(inner) >= MAX_DEATHS_IN_WINDOW {
            inner.respawn_disabled = true;
            self.events.on_event(CoreEvent::SessionDead {
                name: self.name.clone(),
                reason: "crashed repeatedly, auto-respawn disabled".to_string(),
            });
            return Err(CoreError::HardFail {
                cause: format!("session '{}' crashed repeatedly", self.name),
                stderr_tail,
            });
        }

        if let Err(e) = self.spawn_driver(inner) {
            inner.respawn_disabled = true;
            self.events.on_event(CoreEvent::SessionDead {
                name: self.name.clone(),
                reason: format!("respawn failed: {}", e),
            });
            return Err(CoreError::HardFail {
                cause: format!("respawn of session '{}' failed: {}", self.name, e),
                stderr_tail,
            });
        }
        self.events.on_event(CoreEvent::SessionRespawned {
            name: self.name.clone(),
        });

        // Retry the original prompt exactly once against the fresh child.
        let deadline = self.config.ask_timeout;
        let driver = inner.driver.as_mut().expect("driver respawned");
        match driver.ask(prompt, deadline).await {
            Ok(reply) => {
                info!("session '{}' recovered after respawn", self.name);
                self.note_success(inner);
                Ok(reply)
            }
            Err(e) => {
                if let Some(mut driver) = inner.driver.take() {
                    driver.close().await;
                }
                inner.respawn_disabled = true;
                let tail = e.stderr_tail().unwrap_or(&stderr_tail).to_string();
                self.events.on_event(CoreEvent::SessionDead {
                    name: self.name.clone(),
                    reason: format!("retry after respawn failed: {}", e),
                });
                Err(CoreError::HardFail {
                    cause: format!("session '{}' failed again after respawn: {}", self.name, e),
                    stderr_tail: tail,
                })
            }
        }
    }

    /// Reset the conversation: fresh child, cleared resume id, cleared death
    /// history. Serialized against `ask` on the same mutex.
    pub async fn new_conversation(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(mut driver) = inner.driver.take() {
            driver.close().await;
        }
        inner.resume_session_id = None;
        inner.respawn_disabled = false;
        inner.deaths.clear();
        inner.last_error = None;
        self.spawn_driver(&mut inner)?;
        self.set_state(SessionState::Idle);
        info!("session '{}' conversation reset", self.name);
        Ok(())
    }

    /// Terminal close. Idempotent.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut driver) = inner.driver.take() {
            driver.close().await;
        }
        inner.respawn_disabled = true;
        self.set_state(SessionState::Dead);
        info!("session '{}' closed", self.name);
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            name: self.name.clone(),
            workdir: self.workdir.clone(),
            state: SessionState::from_u8(self.state.load(Ordering::Relaxed)),
            created_at: self.created_at,
            last_activity: DateTime::from_timestamp(
                self.last_activity.load(Ordering::Relaxed),
                0,
            )
            .unwrap_or(self.created_at),
            message_count: self.message_count.load(Ordering::Relaxed),
        }
    }

    /// Spawn a driver if none is alive. A child found dead between requests
    /// is replaced the same way as one that died mid-request.
    async fn ensure_driver(&self, inner: &mut Inner) -> CoreResult<()> {
        let mut replacing_dead = false;
        let needs_spawn = match inner.driver.as_mut() {
            Some(driver) => {
                if driver.is_alive() {
                    false
                } else {
                    warn!("session '{}' child died while idle", self.name);
                    if let Some(mut dead) = inner.driver.take() {
                        dead.close().await;
                    }
                    self.record_death(inner);
                    replacing_dead = true;
                    true
                }
            }
            None => true,
        };

        if needs_spawn {
            self.spawn_driver(inner).map_err(|e| CoreError::HardFail {
                cause: format!("could not start assistant for '{}': {}", self.name, e),
                stderr_tail: String::new(),
            })?;
            if replacing_dead {
                self.events.on_event(CoreEvent::SessionRespawned {
                    name: self.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn spawn_driver(&self, inner: &mut Inner) -> CoreResult<()> {
        let config = driver_config(
            &self.config,
            &self.workdir,
            inner.resume_session_id.clone(),
        );
        inner.driver = Some(ProcessDriver::spawn(&config)?);
        Ok(())
    }

    fn note_success(&self, inner: &mut Inner) {
        if let Some(driver) = inner.driver.as_ref() {
            if driver.session_id.is_some() {
                inner.resume_session_id = driver.session_id.clone();
            }
        }
        inner.last_error = None;
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    fn record_death(&self, inner: &mut Inner) -> usize {
        let now = Instant::now();
        inner.deaths.retain(|at| now.duration_since(*at) < DEATH_WINDOW);
        inner.deaths.push(now);
        inner.deaths.len()
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }
}

fn driver_config(
    config: &SessionConfig,
    workdir: &PathBuf,
    resume_session_id: Option<String>,
) -> DriverConfig {
    DriverConfig {
        binary: config.assistant_bin.clone(),
        workdir: workdir.clone(),
        model: config.model.clone(),
        resume_session_id,
        env: config.env.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::driver::tests::{fake_assistant, ECHO_SCRIPT};
    use crate::core::events::test_support::RecordingSink;

    fn session_config(bin: String, timeout: Duration, env: Vec<(String, String)>) -> SessionConfig {
        SessionConfig {
            assistant_bin: bin,
            model: None,
            ask_timeout: timeout,
            env,
        }
    }

    #[tokio::test]
    async fn ask_round_trips_and_updates_counters() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = fake_assistant(tmp.path(), ECHO_SCRIPT);
        let sink = Arc::new(RecordingSink::default());
        let session = Session::open(
            "alpha",
            tmp.path().to_path_buf(),
            session_config(bin, Duration::from_secs(5), Vec::new()),
            sink,
        )
        .unwrap();

        let reply = session.ask("ping").await.unwrap();
        assert_eq!(reply, "final answer");

        let status = session.status();
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.message_count, 1);

        session.close().await;
        assert_eq!(session.status().state, SessionState::Dead);
    }

    #[tokio::test]
    async fn crash_mid_request_respawns_once_and_retries() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("crashed-once");
        let bin = fake_assistant(
            tmp.path(),
            r#"if [ ! -f "$CRASH_MARKER" ]; then
  : > "$CRASH_MARKER"
  exit 1
fi
while IFS= read -r line; do printf '{"type":"result","result":"pong"}\n'; done"#,
        );
        let sink = Arc::new(RecordingSink::default());
        let session = Session::open(
            "alpha",
            tmp.path().to_path_buf(),
            session_config(
                bin,
                Duration::from_secs(5),
                vec![(
                    "CRASH_MARKER".to_string(),
                    marker.to_string_lossy().to_string(),
                )],
            ),
            sink.clone(),
        )
        .unwrap();

        // The first child exits immediately; the respawn answers.
        let reply = session.ask("ping").await.unwrap();
        assert_eq!(reply, "pong");
        assert_eq!(sink.respawned_count("alpha"), 1);
        assert_eq!(session.status().state, SessionState::Idle);

        session.close().await;
    }

    #[tokio::test]
    async fn repeated_crashes_leave_the_session_dead() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = fake_assistant(tmp.path(), "exit 1");
        let sink = Arc::new(RecordingSink::default());
        let session = Session::open(
            "alpha",
            tmp.path().to_path_buf(),
            session_config(bin, Duration::from_secs(5), Vec::new()),
            sink.clone(),
        )
        .unwrap();

        let err = session.ask("ping").await.unwrap_err();
        assert!(matches!(err, CoreError::HardFail { .. }));
        assert_eq!(session.status().state, SessionState::Dead);
        assert_eq!(sink.dead_count("alpha"), 1);

        // Still dead until an explicit reset.
        let err = session.ask("ping").await.unwrap_err();
        assert!(matches!(err, CoreError::HardFail { .. }));

        session.close().await;
    }

    #[tokio::test]
    async fn new_conversation_revives_a_dead_session() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("healthy");
        // Crashes until the marker file exists.
        let bin = fake_assistant(
            tmp.path(),
            r#"if [ ! -f "$HEAL_MARKER" ]; then exit 1; fi
while IFS= read -r line; do printf '{"type":"result","result":"revived"}\n'; done"#,
        );
        let sink = Arc::new(RecordingSink::default());
        let session = Session::open(
            "alpha",
            tmp.path().to_path_buf(),
            session_config(
                bin,
                Duration::from_secs(5),
                vec![(
                    "HEAL_MARKER".to_string(),
                    marker.to_string_lossy().to_string(),
                )],
            ),
            sink,
        )
        .unwrap();

        assert!(session.ask("ping").await.is_err());
        assert_eq!(session.status().state, SessionState::Dead);

        std::fs::write(&marker, b"").unwrap();
        session.new_conversation().await.unwrap();
        assert_eq!(session.status().state, SessionState::Idle);
        assert_eq!(session.ask("ping").await.unwrap(), "revived");

        session.close().await;
    }

    #[tokio::test]
    async fn deadline_recycles_the_child_and_the_next_ask_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("slow-once");
        let bin = fake_assistant(
            tmp.path(),
            r#"if [ ! -f "$SLOW_MARKER" ]; then
  : > "$SLOW_MARKER"
  while IFS= read -r line; do sleep 3; done
fi
while IFS= read -r line; do printf '{"type":"result","result":"fast"}\n'; done"#,
        );
        let sink = Arc::new(RecordingSink::default());
        let session = Session::open(
            "alpha",
            tmp.path().to_path_buf(),
            session_config(
                bin,
                Duration::from_millis(300),
                vec![(
                    "SLOW_MARKER".to_string(),
                    marker.to_string_lossy().to_string(),
                )],
            ),
            sink,
        )
        .unwrap();

        let err = session.ask("ping").await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)));
        assert_eq!(session.status().state, SessionState::Idle);

        assert_eq!(session.ask("ping").await.unwrap(), "fast");

        session.close().await;
    }

    #[tokio::test]
    async fn concurrent_asks_are_serialized() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = fake_assistant(
            tmp.path(),
            r#"while IFS= read -r line; do
  sleep 0.3
  printf '{"type":"result","result":"ok"}\n'
done"#,
        );
        let sink = Arc::new(RecordingSink::default());
        let session = Session::open(
            "alpha",
            tmp.path().to_path_buf(),
            session_config(bin, Duration::from_secs(5), Vec::new()),
            sink,
        )
        .unwrap();

        let started = Instant::now();
        let (a, b) = tokio::join!(session.ask("one"), session.ask("two"));
        a.unwrap();
        b.unwrap();
        // Serialized requests cannot finish faster than the sum of their
        // individual service times.
        assert!(started.elapsed() >= Duration::from_millis(600));

        session.close().await;
    }
}
