use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::core::error::{CoreError, CoreResult};
use crate::core::events::{CoreEvent, EventSink};
use crate::core::history::{Direction, HistoryStore};
use crate::core::manager::SessionManager;
use crate::core::{shape_reply, Outbound, Reply};

/// Terminal jobs kept around for status queries.
const RETENTION: usize = 64;

#[derive(Debug, Clone)]
pub enum Payload {
    Text(String),
    Image { path: PathBuf, caption: String },
}

impl Payload {
    /// The text the `@name` routing prefix is parsed from.
    fn routing_text(&self) -> &str {
        match self {
            Payload::Text(text) => text,
            Payload::Image { caption, .. } => caption,
        }
    }

    /// Final prompt once routing has stripped any prefix. Image payloads
    /// point the assistant at the saved file; it reads the file itself.
    fn prompt_from(&self, stripped: String) -> String {
        match self {
            Payload::Text(_) => stripped,
            Payload::Image { path, .. } => {
                if stripped.is_empty() {
                    format!("The user sent an image, saved at {}.", path.display())
                } else {
                    format!(
                        "{}\n\n(The user attached an image, saved at {}.)",
                        stripped,
                        path.display()
                    )
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Waiting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobSummary {
    pub id: u64,
    pub chat_id: i64,
    pub status: JobStatus,
    pub session: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

struct WaitingJob {
    id: u64,
    chat_id: i64,
    payload: Payload,
    target: Option<String>,
    enqueued_at: DateTime<Utc>,
}

struct RunningJob {
    id: u64,
    chat_id: i64,
    session: String,
    enqueued_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
}

struct ActiveJob {
    id: u64,
    chat_id: i64,
    session: String,
    prompt: String,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<WaitingJob>,
    running: HashMap<u64, RunningJob>,
    /// At most one running job per session name.
    busy_sessions: HashSet<String>,
    finished: VecDeque<JobSummary>,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub depth: usize,
    pub workers: usize,
    pub inline_reply_limit: usize,
}

/// Ordered admission queue in front of the session registry.
///
/// A fixed worker pool pulls from the head. Dispatch resolves the target
/// session at start time (so default changes take effect), keeps at most one
/// running job per session, and skips a blocked head only for entries whose
/// chat has nothing skipped ahead of it, preserving per-chat FIFO.
pub struct MessageQueue {
    state: StdMutex<QueueState>,
    notify: Notify,
    accepting: AtomicBool,
    stopping: AtomicBool,
    next_id: AtomicU64,
    options: QueueOptions,
    sessions: Arc<SessionManager>,
    history: Arc<HistoryStore>,
    outbound: Arc<dyn Outbound>,
    events: Arc<dyn EventSink>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl MessageQueue {
    pub fn start(
        options: QueueOptions,
        sessions: Arc<SessionManager>,
        history: Arc<HistoryStore>,
        outbound: Arc<dyn Outbound>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let worker_count = options.workers.max(1);
        let queue = Arc::new(Self {
            state: StdMutex::new(QueueState::default()),
            notify: Notify::new(),
            accepting: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            options,
            sessions,
            history,
            outbound,
            events,
            workers: StdMutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.worker_loop(worker_id).await;
            }));
        }
        *queue.workers.lock().expect("worker lock") = handles;
        info!("message queue started with {} workers", worker_count);
        queue
    }

    /// Append a job. Returns its id and 1-based position counted from the
    /// next job to dispatch.
    pub fn enqueue(
        &self,
        chat_id: i64,
        payload: Payload,
        target: Option<String>,
    ) -> CoreResult<(u64, usize)> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(CoreError::Shutdown);
        }

        let (id, position) = {
            let mut state = self.state.lock().expect("queue lock");
            if state.waiting.len() >= self.options.depth {
                drop(state);
                self.events
                    .on_event(CoreEvent::QueueCapacityExceeded { chat_id });
                return Err(CoreError::OverCapacity(self.options.depth));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            state.waiting.push_back(WaitingJob {
                id,
                chat_id,
                payload,
                target,
                enqueued_at: Utc::now(),
            });
            (id, state.waiting.len())
        };

        self.events.on_event(CoreEvent::JobQueued {
            id,
            chat_id,
            position,
        });
        self.notify.notify_one();
        Ok((id, position))
    }

    /// Only waiting jobs can be cancelled; the wire protocol has no way to
    /// abort an in-flight response.
    pub fn cancel(&self, id: u64) -> CoreResult<()> {
        let mut state = self.state.lock().expect("queue lock");
        if let Some(idx) = state.waiting.iter().position(|j| j.id == id) {
            let job = state.waiting.remove(idx).expect("indexed job");
            let summary = JobSummary {
                id: job.id,
                chat_id: job.chat_id,
                status: JobStatus::Cancelled,
                session: job.target.clone(),
                enqueued_at: job.enqueued_at,
                started_at: None,
                finished_at: Some(Utc::now()),
                error: None,
            };
            push_finished(&mut state.finished, summary);
            return Ok(());
        }
        if state.running.contains_key(&id) {
            return Err(CoreError::AlreadyRunning(id));
        }
        if state.finished.iter().any(|j| j.id == id) {
            return Err(CoreError::AlreadyTerminal(id));
        }
        Err(CoreError::NotFound(format!("job #{}", id)))
    }

    /// Running jobs first (oldest start first), then the waiting queue in
    /// arrival order.
    pub fn snapshot(&self) -> Vec<JobSummary> {
        let state = self.state.lock().expect("queue lock");
        let mut out: Vec<JobSummary> = state
            .running
            .values()
            .map(|job| JobSummary {
                id: job.id,
                chat_id: job.chat_id,
                status: JobStatus::Running,
                session: Some(job.session.clone()),
                enqueued_at: job.enqueued_at,
                started_at: Some(job.started_at),
                finished_at: None,
                error: None,
            })
            .collect();
        out.sort_by_key(|job| job.started_at);
        out.extend(state.waiting.iter().map(|job| JobSummary {
            id: job.id,
            chat_id: job.chat_id,
            status: JobStatus::Waiting,
            session: job.target.clone(),
            enqueued_at: job.enqueued_at,
            started_at: None,
            finished_at: None,
            error: None,
        }));
        out
    }

    /// Terminal jobs still inside the retention window, oldest first.
    pub fn finished(&self) -> Vec<JobSummary> {
        self.state
            .lock()
            .expect("queue lock")
            .finished
            .iter()
            .cloned()
            .collect()
    }

    pub fn waiting_count(&self) -> usize {
        self.state.lock().expect("queue lock").waiting.len()
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().expect("queue lock").running.len()
    }

    /// Stop accepting, cancel everything still waiting, then drain running
    /// jobs for up to `drain`.
    pub async fn shutdown(&self, drain: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        self.stopping.store(true, Ordering::SeqCst);

        {
            let mut state = self.state.lock().expect("queue lock");
            while let Some(job) = state.waiting.pop_front() {
                let summary = JobSummary {
                    id: job.id,
                    chat_id: job.chat_id,
                    status: JobStatus::Cancelled,
                    session: job.target.clone(),
                    enqueued_at: job.enqueued_at,
                    started_at: None,
                    finished_at: Some(Utc::now()),
                    error: None,
                };
                push_finished(&mut state.finished, summary);
            }
        }
        self.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().expect("worker lock"));
        let deadline = Instant::now() + drain;
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, &mut handle).await.is_err() {
                warn!("worker did not drain in time, aborting");
                handle.abort();
            }
        }
        info!("message queue stopped");
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            match self.try_dispatch() {
                Some(job) => {
                    // Cascade the wakeup: more work may be dispatchable now.
                    self.notify.notify_one();
                    self.process(worker_id, job).await;
                    self.notify.notify_one();
                }
                None => {
                    if self.stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    self.notify.notified().await;
                }
            }
        }
    }

    fn try_dispatch(&self) -> Option<ActiveJob> {
        let mut state = self.state.lock().expect("queue lock");
        let sessions = &self.sessions;
        let (idx, session, stripped) =
            pick_next(&state.waiting, &state.busy_sessions, |job| {
                resolve_target(sessions, job)
            })?;

        let job = state.waiting.remove(idx).expect("picked job");
        let prompt = job.payload.prompt_from(stripped);
        state.busy_sessions.insert(session.clone());
        state.running.insert(
            job.id,
            RunningJob {
                id: job.id,
                chat_id: job.chat_id,
                session: session.clone(),
                enqueued_at: job.enqueued_at,
                started_at: Utc::now(),
            },
        );
        Some(ActiveJob {
            id: job.id,
            chat_id: job.chat_id,
            session,
            prompt,
        })
    }

    async fn process(&self, worker_id: usize, job: ActiveJob) {
        self.events.on_event(CoreEvent::JobStarted {
            id: job.id,
            chat_id: job.chat_id,
            session: job.session.clone(),
        });
        info!(
            "worker-{} starts job #{} (chat {}, session '{}')",
            worker_id, job.id, job.chat_id, job.session
        );
        let started = Instant::now();

        // Run the job in its own task so a panic marks this job failed
        // instead of taking the worker down.
        let sessions = self.sessions.clone();
        let history = self.history.clone();
        let session_name = job.session.clone();
        let prompt = job.prompt.clone();
        let joined = tokio::spawn(async move {
            run_job(sessions, history, session_name, prompt).await
        })
        .await;

        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                error!("job #{} panicked: {}", job.id, e);
                Err(CoreError::HardFail {
                    cause: "internal error while processing the message".to_string(),
                    stderr_tail: String::new(),
                })
            }
        };

        let (ok, error_text) = match result {
            Ok(reply) => {
                let shaped = shape_reply(reply, self.options.inline_reply_limit);
                self.outbound.deliver(job.chat_id, shaped).await;
                (true, None)
            }
            Err(e) => {
                warn!("job #{} failed: {}", job.id, e);
                let mut message = format!("❌ {}", e);
                if let Some(tail) = e.stderr_tail() {
                    message.push_str("\n\nstderr:\n");
                    message.push_str(tail);
                }
                self.outbound.deliver(job.chat_id, Reply::Inline(message)).await;
                (false, Some(e.to_string()))
            }
        };

        self.finalize(&job, ok, error_text);
        self.events.on_event(CoreEvent::JobFinished {
            id: job.id,
            chat_id: job.chat_id,
            ok,
            elapsed: started.elapsed(),
        });
    }

    fn finalize(&self, job: &ActiveJob, ok: bool, error: Option<String>) {
        let mut state = self.state.lock().expect("queue lock");
        let running = state.running.remove(&job.id);
        state.busy_sessions.remove(&job.session);
        let (enqueued_at, started_at) = running
            .map(|r| (r.enqueued_at, Some(r.started_at)))
            .unwrap_or((Utc::now(), None));
        let summary = JobSummary {
            id: job.id,
            chat_id: job.chat_id,
            status: if ok {
                JobStatus::Succeeded
            } else {
                JobStatus::Failed
            },
            session: Some(job.session.clone()),
            enqueued_at,
            started_at,
            finished_at: Some(Utc::now()),
            error,
        };
        push_finished(&mut state.finished, summary);
    }
}

async fn run_job(
    sessions: Arc<SessionManager>,
    history: Arc<HistoryStore>,
    session_name: String,
    prompt: String,
) -> CoreResult<String> {
    let session = sessions
        .get(&session_name)
        .ok_or_else(|| CoreError::NotFound(session_name.clone()))?;
    let reply = session.ask(&prompt).await?;
    history.append(&session_name, Direction::User, &prompt);
    history.append(&session_name, Direction::Assistant, &reply);
    Ok(reply)
}

/// Dispatch-time resolution: an explicit known target wins, everything else
/// goes through `SessionManager::resolve` on the payload text.
fn resolve_target(sessions: &SessionManager, job: &WaitingJob) -> (String, String) {
    if let Some(target) = &job.target {
        if sessions.get(target).is_some() {
            return (target.clone(), job.payload.routing_text().to_string());
        }
    }
    sessions.resolve(job.payload.routing_text())
}

fn push_finished(finished: &mut VecDeque<JobSummary>, summary: JobSummary) {
    finished.push_back(summary);
    while finished.len() > RETENTION {
        finished.pop_front();
    }
}

/// Head-of-queue selection under the per-session slot rule.
///
/// Walks the waiting queue in order. A job whose target session is busy is
/// skipped and its chat becomes blocked: no later job of that chat may be
/// picked this round, which keeps per-chat start order FIFO.
fn pick_next<F>(
    waiting: &VecDeque<WaitingJob>,
    busy: &HashSet<String>,
    resolve: F,
) -> Option<(usize, String, String)>
where
    F: Fn(&WaitingJob) -> (String, String),
{
    let mut blocked_chats: HashSet<i64> = HashSet::new();
    for (idx, job) in waiting.iter().enumerate() {
        if blocked_chats.contains(&job.chat_id) {
            continue;
        }
        let (target, stripped) = resolve(job);
        if busy.contains(&target) {
            blocked_chats.insert(job.chat_id);
            continue;
        }
        return Some((idx, target, stripped));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: u64, chat_id: i64, target: &str) -> WaitingJob {
        WaitingJob {
            id,
            chat_id,
            payload: Payload::Text(format!("@{} hello", target)),
            target: Some(target.to_string()),
            enqueued_at: Utc::now(),
        }
    }

    fn fixed_resolve(job: &WaitingJob) -> (String, String) {
        (job.target.clone().unwrap(), "hello".to_string())
    }

    #[test]
    fn head_job_with_free_session_is_picked() {
        let waiting: VecDeque<_> = [job(1, 42, "alpha"), job(2, 42, "beta")].into();
        let busy = HashSet::new();
        let (idx, session, _) = pick_next(&waiting, &busy, fixed_resolve).unwrap();
        assert_eq!((idx, session.as_str()), (0, "alpha"));
    }

    #[test]
    fn busy_session_skips_to_a_different_chat_only() {
        // Chat 42's head targets a busy session; its later job for a free
        // session must NOT overtake, but chat 7's may.
        let waiting: VecDeque<_> =
            [job(1, 42, "alpha"), job(2, 42, "beta"), job(3, 7, "beta")].into();
        let busy: HashSet<String> = ["alpha".to_string()].into();
        let (idx, session, _) = pick_next(&waiting, &busy, fixed_resolve).unwrap();
        assert_eq!((idx, session.as_str()), (2, "beta"));
    }

    #[test]
    fn fully_blocked_queue_yields_none() {
        let waiting: VecDeque<_> = [job(1, 42, "alpha"), job(2, 42, "beta")].into();
        let busy: HashSet<String> = ["alpha".to_string()].into();
        // Job 2 shares chat 42 with the skipped head, so nothing runs.
        assert!(pick_next(&waiting, &busy, fixed_resolve).is_none());
    }

    #[test]
    fn distinct_chats_with_distinct_sessions_progress_in_order() {
        let waiting: VecDeque<_> = [job(1, 1, "alpha"), job(2, 2, "beta")].into();
        let mut busy = HashSet::new();

        let (idx, first, _) = pick_next(&waiting, &busy, fixed_resolve).unwrap();
        assert_eq!((idx, first.as_str()), (0, "alpha"));
        busy.insert(first);

        let waiting: VecDeque<_> = [job(2, 2, "beta")].into();
        let (idx, second, _) = pick_next(&waiting, &busy, fixed_resolve).unwrap();
        assert_eq!((idx, second.as_str()), (0, "beta"));
    }
}
