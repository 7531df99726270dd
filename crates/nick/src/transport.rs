//! Transport - the command/event channel every backend is built on
//!
//! Two very different engines sit behind this trait: a Chrome DevTools
//! target reached over a WebSocket, and a legacy step-queue engine.
//! Engines only ever see `send_command` and `on`/`remove_listener`.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Identifier returned by [`Transport::on`], used to remove the listener later
pub type ListenerId = u64;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {code} - {message}")]
    Protocol { code: i64, message: String },

    #[error("Connection closed")]
    Closed,

    #[error("Invalid response for request {0}")]
    InvalidResponse(u64),
}

/// Backend event as delivered by the transport, before normalization
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub name: String,
    pub params: Value,
}

/// Event listener callback
///
/// Called on the transport's reader task: must not block and must not
/// add or remove listeners of the same transport.
pub type EventCallback = Arc<dyn Fn(RawEvent) + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a command and wait for its result
    async fn send_command(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, TransportError>;

    /// Register a listener for one event name
    fn on(&self, event: &str, callback: EventCallback) -> ListenerId;

    /// Remove a listener; unknown ids are ignored
    fn remove_listener(&self, id: ListenerId);

    /// Release what this transport is bound to: a session closes its
    /// target, a dedicated page connection shuts its socket
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
