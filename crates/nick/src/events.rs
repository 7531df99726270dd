//! Event Bus - lifecycle notifications of a browser and its tabs
//!
//! Enums over a broadcast channel; publishing never blocks and never fails
//! when nobody listens.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BrowserEvent {
    Started,
    Stopped,
    TabOpened { tab_id: u64 },
    TabClosed { tab_id: u64 },
    TabCrashed { tab_id: u64 },
    /// The browser process went away; every open tab is now crashed
    ProcessExited,
    NavigationComplete {
        tab_id: u64,
        url: String,
        http_code: Option<u16>,
    },
}

/// Cloning shares the channel
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BrowserEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn publish(&self, event: BrowserEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrowserEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
