mod config;
mod core;
mod interfaces;
mod logging;

use std::sync::Arc;

use anyhow::Result;
use teloxide::Bot;
use tracing::info;

use crate::config::Settings;
use crate::core::events::ChannelSink;
use crate::core::Core;
use crate::interfaces::telegram::{spawn_notifier, TelegramInterface, TelegramOutbound};

const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let settings = Settings::from_env()?;
    let bot = Bot::new(&settings.bot_token);

    let outbound = Arc::new(TelegramOutbound::new(bot.clone()));
    let (sink, events_rx) = ChannelSink::new(EVENT_BUFFER);

    let core = Core::start(settings, outbound, Arc::new(sink)).await?;
    spawn_notifier(bot.clone(), core.clone(), events_rx);

    let transport = TelegramInterface::new(bot, core.clone());
    tokio::select! {
        result = transport.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
    }

    core.shutdown().await;
    Ok(())
}
