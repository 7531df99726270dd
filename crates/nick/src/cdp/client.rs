//! CDP Client - The Core Communication Layer
//!
//! Design decisions:
//! 1. Single WebSocket per browser connection (no per-session WS overhead)
//! 2. Async message passing - no locks on send/receive path
//! 3. Request/response matching via ID, events broadcast to subscribers
//! 4. Fail fast - no retries, no queuing. Let the caller decide.
//!
//! The framing is plain JSON-RPC, so the same client also talks to the
//! legacy step-queue engine (no session ids involved there).

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::protocol::*;
use crate::transport::{EventCallback, ListenerId, RawEvent, Transport, TransportError};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Result type for CDP operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Subscriber callback, receives the event with its session id
pub type CDPCallback = Arc<dyn Fn(CDPEvent) + Send + Sync>;

/// CDP Client - manages single WebSocket connection to browser
pub struct CDPClient {
    /// Monotonic request ID counter
    next_id: AtomicU64,

    /// Monotonic listener ID counter
    next_listener: AtomicU64,

    /// Pending requests waiting for responses
    /// Key: request_id, Value: oneshot sender for response
    pending: Arc<DashMap<RequestId, oneshot::Sender<CDPResponse>>>,

    /// Event subscribers
    /// Key: method name (e.g., "Page.loadEventFired"), Value: (listener id, callback)
    subscribers: Arc<DashMap<String, Vec<(ListenerId, CDPCallback)>>>,

    /// WebSocket write half (wrapped for concurrent sending)
    ws_sink: Arc<RwLock<WsSink>>,

    /// Flips to true once the reader loop exits
    closed: watch::Sender<bool>,
}

impl CDPClient {
    /// Connect to a DevTools (or JSON-RPC) WebSocket endpoint
    pub async fn connect(ws_url: &str) -> Result<Arc<Self>> {
        tracing::info!("[CDPClient] Connecting to {}", ws_url);
        let (ws_stream, _) = connect_async(ws_url).await?;
        let (sink, mut stream) = ws_stream.split();

        let (closed, _) = watch::channel(false);
        let client = Arc::new(Self {
            next_id: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            subscribers: Arc::new(DashMap::new()),
            ws_sink: Arc::new(RwLock::new(sink)),
            closed,
        });

        // Spawn message receiver task
        let client_clone = client.clone();
        tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = client_clone.handle_message(&text) {
                            tracing::error!("[CDPClient] Failed to handle message: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("[CDPClient] WebSocket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!("[CDPClient] WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Dropping the senders fails every waiter with Closed
            client_clone.pending.clear();
            let _ = client_clone.closed.send(true);
        });

        Ok(client)
    }

    /// Send CDP request and wait for response
    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        session_id: Option<SessionId>,
    ) -> Result<Value> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = CDPRequest {
            id,
            method: method.into(),
            params,
            session_id,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        // Serialize and send
        let json = serde_json::to_string(&request)?;
        let mut sink = self.ws_sink.write().await;
        if let Err(e) = sink.send(Message::Text(json)).await {
            self.pending.remove(&id);
            return Err(TransportError::WebSocket(e));
        }
        drop(sink); // Release lock immediately

        // Wait for response
        let response = rx.await.map_err(|_| TransportError::Closed)?;
        if response.id != id {
            return Err(TransportError::InvalidResponse(id));
        }

        if let Some(error) = response.error {
            return Err(TransportError::Protocol {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Subscribe to CDP events
    pub fn subscribe(&self, method: impl Into<String>, callback: CDPCallback) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .entry(method.into())
            .or_default()
            .push((id, callback));
        id
    }

    /// Remove a subscription by id
    pub fn unsubscribe(&self, id: ListenerId) {
        for mut entry in self.subscribers.iter_mut() {
            entry.value_mut().retain(|(listener, _)| *listener != id);
        }
    }

    /// Watch channel that turns true when the connection is gone
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Handle incoming WebSocket message
    fn handle_message(&self, text: &str) -> Result<()> {
        let msg: CDPMessage = serde_json::from_str(text)?;

        match msg {
            CDPMessage::Response(response) => {
                if let Some((_, tx)) = self.pending.remove(&response.id) {
                    let _ = tx.send(response); // Ignore send errors (receiver dropped)
                } else {
                    tracing::warn!("[CDPClient] Response for unknown request: {}", response.id);
                }
            }
            CDPMessage::Event(event) => {
                // Clone out so callbacks run without holding the shard lock
                let callbacks: Vec<CDPCallback> = match self.subscribers.get(&event.method) {
                    Some(subscribers) => subscribers.iter().map(|(_, cb)| cb.clone()).collect(),
                    None => return Ok(()),
                };
                for callback in callbacks {
                    callback(event.clone());
                }
            }
        }

        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Close connection gracefully
    pub async fn close(&self) -> Result<()> {
        let mut sink = self.ws_sink.write().await;
        sink.close().await?;
        Ok(())
    }
}

/// Un-sessioned transport: the whole connection is one page
#[async_trait]
impl Transport for CDPClient {
    async fn send_command(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.send_request(method, params, None).await
    }

    fn on(&self, event: &str, callback: EventCallback) -> ListenerId {
        self.subscribe(
            event,
            Arc::new(move |event: CDPEvent| {
                callback(RawEvent {
                    name: event.method,
                    params: event.params.unwrap_or(Value::Null),
                })
            }),
        )
    }

    fn remove_listener(&self, id: ListenerId) {
        self.unsubscribe(id);
    }

    async fn close(&self) -> Result<()> {
        CDPClient::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: Real tests need a running Chrome instance

    #[tokio::test]
    #[ignore]
    async fn test_connect() {
        let client = CDPClient::connect("ws://localhost:9222/devtools/browser")
            .await
            .unwrap();

        let result = client
            .send_request("Browser.getVersion", None, None)
            .await
            .unwrap();

        println!("Browser version: {:?}", result);
    }

    #[test]
    fn test_message_shapes() {
        let response: CDPMessage =
            serde_json::from_str(r#"{"id":7,"result":{"frameId":"F"}}"#).unwrap();
        assert!(matches!(response, CDPMessage::Response(ref r) if r.id == 7));

        let event: CDPMessage = serde_json::from_str(
            r#"{"method":"Page.loadEventFired","params":{"timestamp":1.5},"sessionId":"S1"}"#,
        )
        .unwrap();
        match event {
            CDPMessage::Event(e) => {
                assert_eq!(e.method, "Page.loadEventFired");
                assert_eq!(e.session_id.as_deref(), Some("S1"));
            }
            _ => panic!("Expected event"),
        }
    }
}
