use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{BotCommand, ChatAction, InputFile};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::core::events::CoreEvent;
use crate::core::history::Direction;
use crate::core::queue::Payload;
use crate::core::session::SessionState;
use crate::core::{Core, Outbound, Reply};

/// Telegram's hard per-message limit; longer inline replies are chunked.
const TELEGRAM_CHUNK: usize = 4096;

/// Outbound delivery through the bot API.
pub struct TelegramOutbound {
    bot: Bot,
}

impl TelegramOutbound {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Outbound for TelegramOutbound {
    async fn deliver(&self, chat_id: i64, reply: Reply) {
        match reply {
            Reply::Inline(text) => {
                let text = if text.is_empty() {
                    "(empty reply)".to_string()
                } else {
                    text
                };
                for chunk in chunk_by_chars(&text, TELEGRAM_CHUNK) {
                    if let Err(e) = self.bot.send_message(ChatId(chat_id), chunk).await {
                        error!("failed to send reply to chat {}: {}", chat_id, e);
                        break;
                    }
                }
            }
            Reply::Document { name, content } => {
                let file = InputFile::memory(content.into_bytes()).file_name(name);
                if let Err(e) = self.bot.send_document(ChatId(chat_id), file).await {
                    error!("failed to send document to chat {}: {}", chat_id, e);
                }
            }
        }
    }
}

/// Forward core events to the user: crash/respawn notices for everyone on the
/// allow-list, a typing indicator for the chat whose job just started.
pub fn spawn_notifier(bot: Bot, core: Arc<Core>, mut rx: mpsc::Receiver<CoreEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                CoreEvent::JobStarted { chat_id, .. } => {
                    let _ = bot.send_chat_action(ChatId(chat_id), ChatAction::Typing).await;
                }
                CoreEvent::SessionRespawned { name } => {
                    notify_all(
                        &bot,
                        &core.settings.allowed_users,
                        &format!("⚠️ Session '{}' crashed and was restarted.", name),
                    )
                    .await;
                }
                CoreEvent::SessionDead { name, reason } => {
                    notify_all(
                        &bot,
                        &core.settings.allowed_users,
                        &format!("❌ Session '{}' is dead: {}", name, reason),
                    )
                    .await;
                }
                _ => {}
            }
        }
    });
}

async fn notify_all(bot: &Bot, users: &[i64], text: &str) {
    for uid in users {
        if let Err(e) = bot.send_message(ChatId(*uid), text).await {
            warn!("notification to {} failed: {}", uid, e);
        }
    }
}

pub struct TelegramInterface {
    bot: Bot,
    core: Arc<Core>,
}

impl TelegramInterface {
    pub fn new(bot: Bot, core: Arc<Core>) -> Self {
        Self { bot, core }
    }

    pub async fn run(self) -> Result<()> {
        let commands = vec![
            BotCommand::new("new", "Open a new session (optionally named)"),
            BotCommand::new("open", "Open a session with a working directory"),
            BotCommand::new("close", "Close a session, or reset the default"),
            BotCommand::new("default", "Change the default session"),
            BotCommand::new("job", "Show the message queue"),
            BotCommand::new("cancel", "Cancel a waiting job by id"),
            BotCommand::new("status", "Show sessions and queue state"),
            BotCommand::new("history", "Show recent conversation history"),
            BotCommand::new("clean", "Clear all conversation history"),
        ];
        if let Err(e) = self.bot.set_my_commands(commands).await {
            error!("failed to register bot commands: {}", e);
        }

        info!("telegram transport up");
        let core = self.core;
        teloxide::repl(self.bot, move |bot: Bot, msg: Message| {
            let core = core.clone();
            async move {
                handle_update(&bot, &msg, &core).await;
                Ok(())
            }
        })
        .await;
        Ok(())
    }
}

async fn handle_update(bot: &Bot, msg: &Message, core: &Arc<Core>) {
    // Admission: unknown senders are dropped without a reply.
    let Some(user) = msg.from() else { return };
    let uid = user.id.0 as i64;
    if !core.settings.allowed_users.contains(&uid) {
        warn!("dropping message from unlisted user {}", uid);
        return;
    }

    let chat_id = msg.chat.id.0;
    if let Some(text) = msg.text() {
        handle_text(bot, core, chat_id, text).await;
    } else if msg.photo().is_some() {
        handle_photo(bot, core, chat_id, msg).await;
    }
}

async fn handle_text(bot: &Bot, core: &Arc<Core>, chat_id: i64, text: &str) {
    let trimmed = text.trim();
    let reply = |text: String| async move {
        let _ = bot.send_message(ChatId(chat_id), text).await;
    };

    if trimmed == "@" {
        reply(format_sessions(core)).await;
        return;
    }
    if !trimmed.starts_with('/') {
        enqueue_payload(bot, core, chat_id, Payload::Text(text.to_string())).await;
        return;
    }

    let mut parts = trimmed.splitn(3, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let arg1 = parts.next();
    let arg2 = parts.next();

    let response = match command {
        "/start" | "/help" => usage_text(),
        "/new" => {
            let name = arg1
                .map(|n| n.to_string())
                .unwrap_or_else(|| core.auto_session_name());
            match core.sessions.open(&name, None) {
                Ok(session) => format!(
                    "🆕 Session '{}' opened in {}. Address it with @{}.",
                    name,
                    session.workdir().display(),
                    name
                ),
                Err(e) => format!("❌ {}", e),
            }
        }
        "/open" => match arg1 {
            Some(name) => {
                let dir = arg2.map(PathBuf::from);
                match core.sessions.open(name, dir.as_deref()) {
                    Ok(session) => format!(
                        "🆕 Session '{}' opened in {}.",
                        name,
                        session.workdir().display()
                    ),
                    Err(e) => format!("❌ {}", e),
                }
            }
            None => "Usage: /open <name> [directory]".to_string(),
        },
        "/close" => match arg1 {
            Some(name) => match core.sessions.close(name).await {
                Ok(()) => format!("🗑 Session '{}' closed.", name),
                Err(e) => format!("❌ {}", e),
            },
            None => match core.reset_default().await {
                Ok(()) => "🔄 Default conversation reset, history cleared.".to_string(),
                Err(e) => format!("❌ {}", e),
            },
        },
        "/default" => match core.sessions.set_default(arg1) {
            Ok(name) => format!("✅ Default session is now '{}'.", name),
            Err(e) => format!("❌ {}", e),
        },
        "/job" => format_jobs(core),
        "/cancel" => match arg1.and_then(|a| a.parse().ok()) {
            Some(id) => match core.queue.cancel(id) {
                Ok(()) => format!("🚫 Job #{} cancelled.", id),
                Err(e) => format!("❌ {}", e),
            },
            None => "Usage: /cancel <job-id>".to_string(),
        },
        "/clean" => {
            core.history.clear(None);
            "🧹 All history cleared.".to_string()
        }
        "/status" => format_status(core),
        "/history" => {
            let n = arg1.and_then(|a| a.parse().ok()).unwrap_or(10);
            format_history(core, n).await
        }
        _ => usage_text(),
    };
    reply(response).await;
}

async fn handle_photo(bot: &Bot, core: &Arc<Core>, chat_id: i64, msg: &Message) {
    let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) else {
        return;
    };
    let caption = msg.caption().unwrap_or_default().to_string();

    let incoming = core.settings.data_dir.join("incoming");
    if let Err(e) = tokio::fs::create_dir_all(&incoming).await {
        error!("cannot create incoming dir: {}", e);
        return;
    }
    let path = incoming.join(format!("{}.jpg", photo.file.unique_id));

    let download = async {
        let file = bot.get_file(photo.file.id.clone()).await?;
        let mut dst = tokio::fs::File::create(&path).await?;
        bot.download_file(&file.path, &mut dst).await?;
        anyhow::Ok(())
    };
    match download.await {
        Ok(()) => {
            enqueue_payload(bot, core, chat_id, Payload::Image { path, caption }).await;
        }
        Err(e) => {
            error!("image download failed: {}", e);
            let _ = bot
                .send_message(ChatId(chat_id), "❌ Failed to download the image.")
                .await;
        }
    }
}

async fn enqueue_payload(bot: &Bot, core: &Arc<Core>, chat_id: i64, payload: Payload) {
    let ack = match core.enqueue(chat_id, payload) {
        Ok((_, position)) if position > 1 => {
            format!("⏳ Queued ({} ahead)...", position - 1)
        }
        Ok(_) => "⏳ Working...".to_string(),
        Err(e) => format!("❌ {}", e),
    };
    let _ = bot.send_message(ChatId(chat_id), ack).await;
}

fn usage_text() -> String {
    "chatmux — your assistant sessions over Telegram\n\n\
     Send text to talk to the default session, or @name text for a named one.\n\n\
     /new [name] — open a session\n\
     /open <name> [dir] — open a session in a directory\n\
     /close [name] — close a session (no name: reset the default)\n\
     /default [name] — change the default session\n\
     @ — list sessions\n\
     /job — show the queue\n\
     /cancel <id> — cancel a waiting job\n\
     /status — sessions and queue state\n\
     /history [n] — recent conversation\n\
     /clean — wipe history"
        .to_string()
}

fn format_sessions(core: &Arc<Core>) -> String {
    let sessions = core.sessions.list();
    if sessions.is_empty() {
        return "No sessions.".to_string();
    }
    let default = core.sessions.default_name();
    let mut lines = vec!["Sessions:".to_string()];
    for s in sessions {
        lines.push(format!(
            "• {}{} — {}, {} msgs, last active {}, {}",
            s.name,
            if s.name == default { " (default)" } else { "" },
            s.state.as_str(),
            s.message_count,
            s.last_activity.format("%m/%d %H:%M"),
            s.workdir.display(),
        ));
    }
    lines.join("\n")
}

fn format_jobs(core: &Arc<Core>) -> String {
    let jobs = core.queue.snapshot();
    let done = core.queue.finished();
    if jobs.is_empty() && done.is_empty() {
        return "Queue is empty.".to_string();
    }

    let now = chrono::Utc::now();
    let mut lines = Vec::new();
    if !jobs.is_empty() {
        lines.push(format!("Queue ({} entries):", jobs.len()));
        for job in jobs {
            let age = (now - job.enqueued_at).num_seconds().max(0);
            lines.push(format!(
                "#{} [{}] chat {}{}, {}s in queue",
                job.id,
                job.status.as_str(),
                job.chat_id,
                job.session
                    .map(|s| format!(" → {}", s))
                    .unwrap_or_default(),
                age,
            ));
        }
    }
    if !done.is_empty() {
        lines.push("Recently finished:".to_string());
        for job in done.iter().rev().take(5) {
            lines.push(format!(
                "#{} [{}]{}",
                job.id,
                job.status.as_str(),
                job.error
                    .as_deref()
                    .map(|e| format!(" {}", e))
                    .unwrap_or_default(),
            ));
        }
    }
    lines.join("\n")
}

fn format_status(core: &Arc<Core>) -> String {
    let sessions = core.sessions.list();
    let (mut idle, mut busy, mut dead) = (0, 0, 0);
    for s in &sessions {
        match s.state {
            SessionState::Idle => idle += 1,
            SessionState::Busy => busy += 1,
            SessionState::Dead => dead += 1,
        }
    }
    format!(
        "📊 Sessions: {} (🟢 {} idle, 🔵 {} busy, 🔴 {} dead)\n\
         Queue: {} waiting, {} running",
        sessions.len(),
        idle,
        busy,
        dead,
        core.queue.waiting_count(),
        core.queue.running_count(),
    )
}

async fn format_history(core: &Arc<Core>, n: usize) -> String {
    let session = core.sessions.default_name();
    let entries = core.history.recent(&session, n).await;
    if entries.is_empty() {
        return "📭 No history yet.".to_string();
    }
    let mut lines = vec![format!("📜 Last {} messages ({}):", entries.len(), session)];
    for entry in entries {
        let icon = match entry.direction {
            Direction::User => "👤",
            Direction::Assistant => "🤖",
        };
        let mut preview: String = entry.text.chars().take(200).collect();
        preview = preview.replace('\n', " ");
        lines.push(format!(
            "{} [{}] {}",
            icon,
            entry.ts.format("%m/%d %H:%M"),
            preview
        ));
    }
    lines.join("\n")
}

fn chunk_by_chars(text: &str, size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for c in text.chars() {
        current.push(c);
        count += 1;
        if count >= size {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
