//! CDP Session - Represents a connection to a specific browser target
//!
//! Design: Lightweight wrapper around CDPClient with target-specific context.
//! All sessions share the same WebSocket - no per-session connection overhead.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::client::{CDPClient, Result};
use super::protocol::{AttachToTargetResult, CDPEvent, SessionId, TargetId};
use crate::transport::{EventCallback, ListenerId, RawEvent, Transport, TransportError};

/// Domains every tab needs for navigation, evaluation and crash tracking
const DEFAULT_DOMAINS: [&str; 4] = ["Page", "Network", "Runtime", "Inspector"];

/// CDP Session bound to a specific target
#[derive(Clone)]
pub struct CDPSession {
    /// Shared CDP client
    client: Arc<CDPClient>,

    /// Target this session is attached to
    pub target_id: TargetId,

    /// Session ID assigned by Chrome
    pub session_id: SessionId,
}

impl CDPSession {
    /// Open a new target and attach to it
    pub async fn create(client: Arc<CDPClient>, url: &str) -> Result<Self> {
        let result = client
            .send_request("Target.createTarget", Some(json!({ "url": url })), None)
            .await?;

        let target_id: TargetId = result["targetId"]
            .as_str()
            .ok_or(TransportError::Protocol {
                code: -1,
                message: "Target.createTarget returned no targetId".to_string(),
            })?
            .to_string();

        Self::attach(client, target_id, None).await
    }

    /// Attach to a target and create session
    pub async fn attach(
        client: Arc<CDPClient>,
        target_id: TargetId,
        domains: Option<Vec<&str>>,
    ) -> Result<Self> {
        // Attach to target
        let result = client
            .send_request(
                "Target.attachToTarget",
                Some(json!({
                    "targetId": target_id,
                    "flatten": true,
                })),
                None,
            )
            .await?;

        let attach_result: AttachToTargetResult = serde_json::from_value(result)?;
        let session_id = attach_result.session_id;

        let domains = domains.unwrap_or_else(|| DEFAULT_DOMAINS.to_vec());

        // Enable all domains in parallel
        let enable_futures: Vec<_> = domains
            .into_iter()
            .map(|domain| {
                let client = client.clone();
                let session_id = session_id.clone();
                async move {
                    client
                        .send_request(format!("{}.enable", domain), None, Some(session_id))
                        .await
                }
            })
            .collect();

        // Wait for all enables (ignore individual failures)
        let results = futures_util::future::join_all(enable_futures).await;
        let failures = results.iter().filter(|r| r.is_err()).count();
        if failures > 0 {
            tracing::warn!(
                "[CDPSession] Some domain enables failed: {}/{}",
                failures,
                results.len()
            );
        }

        tracing::debug!(
            "[CDPSession] Attached to target {} (session {})",
            target_id,
            session_id
        );

        Ok(Self {
            client,
            target_id,
            session_id,
        })
    }

    /// Send command within this session's context
    pub async fn send(&self, method: impl Into<String>, params: Option<Value>) -> Result<Value> {
        self.client
            .send_request(method, params, Some(self.session_id.clone()))
            .await
    }

    /// Close the target this session is attached to
    pub async fn close_target(&self) -> Result<()> {
        self.client
            .send_request(
                "Target.closeTarget",
                Some(json!({ "targetId": &self.target_id })),
                None,
            )
            .await?;
        Ok(())
    }
}

/// Sessioned transport: only events of this session reach the listeners
#[async_trait]
impl Transport for CDPSession {
    async fn send_command(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.send(method, params).await
    }

    fn on(&self, event: &str, callback: EventCallback) -> ListenerId {
        let session_id = self.session_id.clone();
        self.client.subscribe(
            event,
            Arc::new(move |event: CDPEvent| {
                if event.session_id.as_deref() != Some(session_id.as_str()) {
                    return;
                }
                callback(RawEvent {
                    name: event.method,
                    params: event.params.unwrap_or(Value::Null),
                })
            }),
        )
    }

    fn remove_listener(&self, id: ListenerId) {
        self.client.unsubscribe(id);
    }

    /// Closes the target; the shared connection stays up
    async fn close(&self) -> Result<()> {
        self.close_target().await
    }
}
