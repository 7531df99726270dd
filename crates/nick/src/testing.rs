//! Scripted in-memory transport for unit tests

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::transport::{EventCallback, ListenerId, RawEvent, Transport, TransportError};

type Responder =
    Box<dyn Fn(&MockTransport, &str, Option<&Value>) -> Result<Value, TransportError> + Send + Sync>;

/// Answers commands through a closure; the closure may emit events
/// (delivered synchronously, before the command returns)
pub(crate) struct MockTransport {
    next_listener: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, String, EventCallback)>>,
    commands: Mutex<Vec<(String, Option<Value>)>>,
    closed: AtomicBool,
    responder: Responder,
}

impl MockTransport {
    pub(crate) fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&MockTransport, &str, Option<&Value>) -> Result<Value, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            next_listener: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            responder: Box::new(responder),
        })
    }

    pub(crate) fn emit(&self, name: &str, params: Value) {
        let callbacks: Vec<EventCallback> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, event, _)| event == name)
            .map(|(_, _, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(RawEvent {
                name: name.to_string(),
                params: params.clone(),
            });
        }
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(method, _)| method.clone())
            .collect()
    }

    pub(crate) fn params_of(&self, method: &str) -> Vec<Value> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone().unwrap_or(Value::Null))
            .collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_command(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, TransportError> {
        self.commands
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));
        (self.responder)(self, method, params.as_ref())
    }

    fn on(&self, event: &str, callback: EventCallback) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap()
            .push((id, event.to_string(), callback));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().unwrap().retain(|(l, _, _)| *l != id);
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Expression text of a Runtime.evaluate call
pub(crate) fn expression(params: Option<&Value>) -> &str {
    params
        .and_then(|p| p["expression"].as_str())
        .unwrap_or_default()
}

/// By-value Runtime.evaluate reply
pub(crate) fn evaluated(value: Value) -> Value {
    serde_json::json!({ "result": { "type": "boolean", "value": value } })
}

/// Selectors a condition check asked about, on either backend
pub(crate) fn selectors_of(params: Option<&Value>) -> Vec<String> {
    let arg = match params.and_then(|p| p.get("arg")) {
        Some(arg) => arg.clone(),
        None => expression(params)
            .rsplit_once(")(")
            .and_then(|(_, arg)| arg.strip_suffix(')'))
            .and_then(|arg| serde_json::from_str(arg).ok())
            .unwrap_or(Value::Null),
    };
    arg["selectors"]
        .as_array()
        .map(|selectors| {
            selectors
                .iter()
                .filter_map(|s| s.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

/// Page answer to a condition check: one state per selector asked about
pub(crate) fn states(params: Option<&Value>, matched: impl Fn(&str) -> bool) -> Value {
    Value::Array(
        selectors_of(params)
            .iter()
            .map(|selector| Value::Bool(matched(selector)))
            .collect(),
    )
}

/// Holds one command back for `delay` before `inner` answers it
pub(crate) struct SlowTransport {
    inner: Arc<MockTransport>,
    method: &'static str,
    delay: Duration,
}

impl SlowTransport {
    pub(crate) fn new(inner: Arc<MockTransport>, method: &'static str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner,
            method,
            delay,
        })
    }
}

#[async_trait]
impl Transport for SlowTransport {
    async fn send_command(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, TransportError> {
        if method == self.method {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.send_command(method, params).await
    }

    fn on(&self, event: &str, callback: EventCallback) -> ListenerId {
        self.inner.on(event, callback)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.inner.remove_listener(id);
    }
}
