use std::path::PathBuf;

use anyhow::{Context, Result};

/// Runtime settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bot_token: String,
    /// Telegram user ids allowed to talk to the bot. Empty list allows nobody.
    pub allowed_users: Vec<i64>,
    pub assistant_bin: String,
    pub model: Option<String>,
    /// Root for session workdirs and the history database.
    pub data_dir: PathBuf,
    pub default_session: String,
    pub workers: usize,
    pub queue_depth: usize,
    pub ask_timeout_secs: u64,
    /// Replies longer than this are delivered as a Markdown file.
    pub inline_reply_limit: usize,
    pub max_sessions: usize,
    /// HOME override for the assistant child, for service-account runs where
    /// the per-user config file location must stay predictable.
    pub assistant_home: Option<PathBuf>,
    pub notion_token: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .context("TELEGRAM_BOT_TOKEN must be set")?;

        let data_dir = match std::env::var("CHATMUX_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::home_dir()
                .context("could not resolve home directory")?
                .join(".chatmux"),
        };

        Ok(Self {
            bot_token,
            allowed_users: parse_user_list(
                &std::env::var("CHATMUX_ALLOWED_USERS").unwrap_or_default(),
            ),
            assistant_bin: env_or("CHATMUX_ASSISTANT_BIN", "claude"),
            model: std::env::var("CHATMUX_MODEL").ok().filter(|m| !m.is_empty()),
            data_dir,
            default_session: env_or("CHATMUX_DEFAULT_SESSION", "main"),
            workers: env_parse("CHATMUX_WORKERS", 5),
            queue_depth: env_parse("CHATMUX_QUEUE_DEPTH", 1024),
            ask_timeout_secs: env_parse("CHATMUX_ASK_TIMEOUT_SECS", 600),
            inline_reply_limit: env_parse("CHATMUX_INLINE_REPLY_LIMIT", 3000),
            max_sessions: env_parse("CHATMUX_MAX_SESSIONS", 32),
            assistant_home: std::env::var("CHATMUX_ASSISTANT_HOME")
                .ok()
                .filter(|h| !h.is_empty())
                .map(PathBuf::from),
            notion_token: std::env::var("NOTION_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_user_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_list_parses_ids_and_skips_garbage() {
        assert_eq!(parse_user_list("1, 42,  -7"), vec![1, 42, -7]);
        assert_eq!(parse_user_list("abc, 5"), vec![5]);
        assert!(parse_user_list("").is_empty());
    }
}
