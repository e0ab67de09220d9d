pub mod driver;
pub mod error;
pub mod events;
pub mod history;
pub mod manager;
pub mod mcp;
pub mod queue;
pub mod session;
pub mod workdir;


use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::Settings;
use crate::core::error::CoreResult;
use crate::core::events::EventSink;
use crate::core::history::HistoryStore;
use crate::core::manager::SessionManager;
use crate::core::mcp::McpInjector;
use crate::core::queue::{MessageQueue, Payload, QueueOptions};
use crate::core::session::SessionConfig;
use crate::core::workdir::DirAllocator;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

/// Outbound payload handed to the transport: short replies go inline, long
/// ones as a Markdown file artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Inline(String),
    Document { name: String, content: String },
}

/// Delivery callback implemented by the transport.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn deliver(&self, chat_id: i64, reply: Reply);
}

pub fn shape_reply(text: String, inline_limit: usize) -> Reply {
    if text.len() <= inline_limit {
        Reply::Inline(text)
    } else {
        Reply::Document {
            name: "reply.md".to_string(),
            content: text,
        }
    }
}

/// Composition root. Owns the session registry, the message queue and the
/// history store; the transport talks to the rest of the system through this.
pub struct Core {
    pub settings: Settings,
    pub sessions: Arc<SessionManager>,
    pub queue: Arc<MessageQueue>,
    pub history: Arc<HistoryStore>,
}

impl Core {
    /// Leaves-first startup: MCP config injection, history store, session
    /// manager (spawns the default session; failure there is fatal), queue.
    pub async fn start(
        settings: Settings,
        outbound: Arc<dyn Outbound>,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>> {
        if let Some(token) = &settings.notion_token {
            match McpInjector::for_current_user() {
                Some(injector) => {
                    if let Err(e) = injector.inject_notion(token) {
                        warn!(
                            "MCP config injection into {} failed (continuing): {:#}",
                            injector.config_path().display(),
                            e
                        );
                    }
                }
                None => warn!("no home directory, skipping MCP config injection"),
            }
        }

        std::fs::create_dir_all(&settings.data_dir)
            .with_context(|| format!("creating data dir {}", settings.data_dir.display()))?;
        let history = Arc::new(HistoryStore::new(&settings.data_dir.join("history.db"))?);

        let mut env = Vec::new();
        if let Some(home) = &settings.assistant_home {
            env.push(("HOME".to_string(), home.to_string_lossy().to_string()));
        }
        let template = SessionConfig {
            assistant_bin: settings.assistant_bin.clone(),
            model: settings.model.clone(),
            ask_timeout: Duration::from_secs(settings.ask_timeout_secs),
            env,
        };
        let sessions = Arc::new(SessionManager::new(
            DirAllocator::new(settings.data_dir.join("sessions")),
            template,
            &settings.default_session,
            settings.max_sessions,
            events.clone(),
        ));
        sessions
            .create_default()
            .context("default session failed to start")?;

        let queue = MessageQueue::start(
            QueueOptions {
                depth: settings.queue_depth,
                workers: settings.workers,
                inline_reply_limit: settings.inline_reply_limit,
            },
            sessions.clone(),
            history.clone(),
            outbound,
            events.clone(),
        );

        info!(
            "core up: default session '{}', {} workers, queue depth {}",
            settings.default_session, settings.workers, settings.queue_depth
        );
        Ok(Arc::new(Self {
            settings,
            sessions,
            queue,
            history,
        }))
    }

    pub fn enqueue(&self, chat_id: i64, payload: Payload) -> CoreResult<(u64, usize)> {
        self.queue.enqueue(chat_id, payload, None)
    }

    /// The administrative default-session path: reset the conversation and
    /// clear its history. Regular `close` refuses to touch the default.
    pub async fn reset_default(&self) -> CoreResult<()> {
        let name = self.sessions.default_name();
        if let Some(session) = self.sessions.default_session() {
            session.new_conversation().await?;
        }
        self.history.clear(Some(&name));
        Ok(())
    }

    /// First free auto-generated session name, for `/new` without arguments.
    pub fn auto_session_name(&self) -> String {
        let mut n = self.sessions.session_count().max(1);
        loop {
            let candidate = format!("s{}", n);
            if self.sessions.get(&candidate).is_none() {
                return candidate;
            }
            n += 1;
        }
    }

    pub async fn shutdown(&self) {
        info!("shutting down");
        self.queue.shutdown(SHUTDOWN_DRAIN).await;
        self.sessions.close_all().await;
        self.history.flush().await;
        info!("shutdown complete");
    }
}

#[cfg(test)]
mod reply_tests {
    use super::*;

    #[test]
    fn reply_at_the_inline_threshold_stays_inline() {
        let text = "a".repeat(3000);
        assert_eq!(shape_reply(text.clone(), 3000), Reply::Inline(text));
    }

    #[test]
    fn one_byte_over_the_threshold_becomes_a_document() {
        let text = "a".repeat(3001);
        match shape_reply(text, 3000) {
            Reply::Document { name, content } => {
                assert_eq!(name, "reply.md");
                assert_eq!(content.len(), 3001);
            }
            other => panic!("expected document, got {:?}", other),
        }
    }
}
