use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

/// Lifecycle notifications produced by the core.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    JobQueued {
        id: u64,
        chat_id: i64,
        position: usize,
    },
    JobStarted {
        id: u64,
        chat_id: i64,
        session: String,
    },
    JobFinished {
        id: u64,
        chat_id: i64,
        ok: bool,
        elapsed: Duration,
    },
    SessionRespawned {
        name: String,
    },
    SessionDead {
        name: String,
        reason: String,
    },
    QueueCapacityExceeded {
        chat_id: i64,
    },
}

/// Observer passed to the core at construction. Callbacks run synchronously
/// on the thread that produced the event and must not block; slow sinks go
/// behind [`ChannelSink`].
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: CoreEvent);
}

/// Buffers events into a bounded channel so a slow consumer (the Telegram
/// notifier) never stalls a worker. Overflow is dropped with a warning.
pub struct ChannelSink {
    tx: mpsc::Sender<CoreEvent>,
}

impl ChannelSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<CoreEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn on_event(&self, event: CoreEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("dropping core event, notifier is behind: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Captures every event for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub events: Mutex<Vec<CoreEvent>>,
    }

    impl EventSink for RecordingSink {
        fn on_event(&self, event: CoreEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl RecordingSink {
        pub fn respawned_count(&self, name: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, CoreEvent::SessionRespawned { name: n } if n == name))
                .count()
        }

        pub fn dead_count(&self, name: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, CoreEvent::SessionDead { name: n, .. } if n == name))
                .count()
        }
    }
}
