//! Status broadcaster: best-effort fan-out of status lines.
//!
//! Built on a bounded `tokio::sync::broadcast` channel. Publishing never
//! waits on a consumer: an observer that falls more than the channel
//! capacity behind is dropped. Observers only see lines published after
//! they connected; nothing is buffered for late joiners. An observer
//! leaves the membership set when it is disconnected or dropped, whichever
//! comes first.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::LogMessage;

/// Default channel depth per observer.
pub const DEFAULT_CAPACITY: usize = 256;

/// Greeting sent to each new observer, to that observer only.
pub const WELCOME: &str = "Welcome to the agent log stream!";

pub type ObserverId = Uuid;

/// A line on the channel, tagged with the observer that sent it (if any)
/// so relayed chat is not echoed back to its author.
#[derive(Debug, Clone)]
struct StatusLine {
    origin: Option<ObserverId>,
    message: LogMessage,
}

type Registry = Mutex<HashSet<ObserverId>>;

pub struct StatusBroadcaster {
    tx: broadcast::Sender<StatusLine>,
    observers: Arc<Registry>,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            observers: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Send a status line to every connected observer.
    ///
    /// Returns how many observers it was queued for.
    pub fn publish(&self, text: impl Into<String>) -> usize {
        let message = LogMessage::now(text);
        info!(target: "yield_agent::status", "{}", message.text);
        self.send(StatusLine {
            origin: None,
            message,
        })
    }

    /// Forward a line received from one observer to all the others.
    pub fn relay(&self, from: ObserverId, text: impl Into<String>) -> usize {
        let message = LogMessage::now(text);
        debug!(observer = %from, text = %message.text, "Relaying observer message");
        self.send(StatusLine {
            origin: Some(from),
            message,
        })
    }

    fn send(&self, line: StatusLine) -> usize {
        // Err only means nobody is listening; the line is simply lost.
        self.tx.send(line).unwrap_or(0)
    }

    /// Register a new observer.
    pub fn connect(&self) -> Observer {
        let id = Uuid::new_v4();
        let rx = self.tx.subscribe();
        let count = {
            let mut set = lock(&self.observers);
            set.insert(id);
            set.len()
        };
        info!(observer = %id, connected = count, "Observer connected");
        Observer {
            id,
            rx,
            registry: Arc::downgrade(&self.observers),
        }
    }

    /// Remove an observer. Safe to call more than once.
    pub fn disconnect(&self, id: ObserverId) -> bool {
        let removed = lock(&self.observers).remove(&id);
        if removed {
            info!(observer = %id, "Observer disconnected");
        }
        removed
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.observers).len()
    }
}

fn lock(registry: &Registry) -> MutexGuard<'_, HashSet<ObserverId>> {
    // A poisoned set is still a valid set of ids.
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Receiving end held by one connected client.
pub struct Observer {
    id: ObserverId,
    rx: broadcast::Receiver<StatusLine>,
    registry: Weak<Registry>,
}

impl Observer {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Next line for this observer, skipping its own relayed messages.
    ///
    /// `None` means the observer must be dropped: either the broadcaster is
    /// gone or this observer fell too far behind.
    pub async fn next(&mut self) -> Option<LogMessage> {
        loop {
            match self.rx.recv().await {
                Ok(line) if line.origin == Some(self.id) => continue,
                Ok(line) => return Some(line.message),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(observer = %self.id, missed, "Observer lagging, dropping");
                    return None;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of `next`; `None` when nothing is queued.
    pub fn try_next(&mut self) -> Option<LogMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(line) if line.origin == Some(self.id) => continue,
                Ok(line) => return Some(line.message),
                Err(_) => return None,
            }
        }
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if lock(&registry).remove(&self.id) {
                debug!(observer = %self.id, "Observer dropped");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
