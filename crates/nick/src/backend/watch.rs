//! Normalized page events and per-operation subscriptions
//!
//! Each backend translates its own event vocabulary into `PageEvent`.
//! An `EventWatch` owns the listeners of exactly one operation; dropping
//! it removes them, so nothing fires into the next operation.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::transport::{ListenerId, RawEvent, Transport};

/// Backend-neutral network/lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    /// A request left the page
    Request { id: String, url: String },
    /// The request `id` was redirected; later events concern `to`
    Redirect { id: String, from: String, to: String },
    /// Response headers arrived. `status` is None when the backend gave none
    Response {
        id: String,
        url: String,
        status: Option<u16>,
        status_text: Option<String>,
    },
    /// The resource body was fully delivered
    Finished { id: String },
    /// Low-level failure of one resource
    Failed { id: String, message: Option<String> },
    /// Main frame finished loading
    LoadComplete,
    /// Main frame failed to load
    LoadFailed { message: Option<String> },
}

/// Translation from a raw backend event to the normalized vocabulary
pub type Translate = fn(&RawEvent) -> Option<PageEvent>;

/// Live subscription of one operation
pub struct EventWatch {
    rx: mpsc::UnboundedReceiver<PageEvent>,
    transport: Arc<dyn Transport>,
    listeners: Vec<ListenerId>,
}

impl EventWatch {
    pub fn new(transport: Arc<dyn Transport>, names: &[&str], translate: Translate) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let listeners = names
            .iter()
            .map(|name| {
                let tx = tx.clone();
                transport.on(
                    name,
                    Arc::new(move |raw: RawEvent| {
                        if let Some(event) = translate(&raw) {
                            let _ = tx.send(event);
                        }
                    }),
                )
            })
            .collect();

        Self {
            rx,
            transport,
            listeners,
        }
    }

    /// Next event, or None once every listener is gone
    pub async fn next(&mut self) -> Option<PageEvent> {
        self.rx.recv().await
    }
}

impl Drop for EventWatch {
    fn drop(&mut self) {
        for id in self.listeners.drain(..) {
            self.transport.remove_listener(id);
        }
    }
}
