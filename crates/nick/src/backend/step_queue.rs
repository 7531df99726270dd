//! Step-queue backend: the legacy automation engine
//!
//! The legacy engine only does work inside "steps" that its own loop
//! picks up on a fixed tick. `StepQueue` models that loop explicitly:
//!
//! ```text
//! Idle --schedule--> StepScheduled --tick--> StepRunning --done--> Idle
//! ```
//!
//! Every command becomes one step, so to the engines the queue is just
//! another `Transport`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::dialog::{DialogHandler, DialogKind};
use super::watch::{EventWatch, PageEvent};
use super::{BackendKind, NavigationStart, OpenOptions, PageDriver};
use crate::config::BrowserConfig;
use crate::error::{self, Result};
use crate::policy::UrlPolicy;
use crate::transport::{EventCallback, ListenerId, RawEvent, Transport, TransportError};

/// Loop period of the legacy engine
pub const LEGACY_TICK: Duration = Duration::from_millis(10);

const NETWORK_EVENTS: [&str; 4] = [
    "resource.requested",
    "resource.received",
    "resource.error",
    "load.finished",
];

/// Error string the engine produces for requests we aborted ourselves
const ABORTED_ERROR: &str = "Protocol \"\" is unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Idle,
    StepScheduled,
    StepRunning,
}

type Step = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Steps {
    state: StepState,
    pending: VecDeque<Step>,
}

pub struct StepQueue {
    inner: Arc<dyn Transport>,
    steps: Arc<Mutex<Steps>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StepQueue {
    /// Start the tick loop over `inner`
    pub fn start(inner: Arc<dyn Transport>, tick: Duration) -> Arc<Self> {
        let steps = Arc::new(Mutex::new(Steps {
            state: StepState::Idle,
            pending: VecDeque::new(),
        }));
        let ticker = tokio::spawn(Self::run(steps.clone(), tick));

        Arc::new(Self {
            inner,
            steps,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    async fn run(steps: Arc<Mutex<Steps>>, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;

            let step = {
                let mut steps = lock(&steps);
                match steps.pending.pop_front() {
                    Some(step) => {
                        steps.state = StepState::StepRunning;
                        step
                    }
                    None => continue,
                }
            };

            step.await;

            let mut steps = lock(&steps);
            steps.state = if steps.pending.is_empty() {
                StepState::Idle
            } else {
                StepState::StepScheduled
            };
        }
    }

    pub fn state(&self) -> StepState {
        lock(&self.steps).state
    }

    fn schedule(&self, step: Step) {
        let mut steps = lock(&self.steps);
        steps.pending.push_back(step);
        if steps.state == StepState::Idle {
            steps.state = StepState::StepScheduled;
        }
    }

    /// Drop every step not yet started; returns how many were dropped
    pub fn clear(&self) -> usize {
        let mut steps = lock(&self.steps);
        let dropped = steps.pending.len();
        steps.pending.clear();
        if steps.state == StepState::StepScheduled {
            steps.state = StepState::Idle;
        }
        dropped
    }

    /// Stop the loop; pending commands fail with `Closed`
    pub fn stop(&self) {
        if let Some(ticker) = lock(&self.ticker).take() {
            ticker.abort();
        }
        let mut steps = lock(&self.steps);
        steps.pending.clear();
        steps.state = StepState::Idle;
    }
}

impl Drop for StepQueue {
    fn drop(&mut self) {
        if let Some(ticker) = lock(&self.ticker).take() {
            ticker.abort();
        }
    }
}

#[async_trait]
impl Transport for StepQueue {
    async fn send_command(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> std::result::Result<Value, TransportError> {
        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        let method = method.to_string();
        self.schedule(Box::pin(async move {
            let _ = tx.send(inner.send_command(&method, params).await);
        }));
        rx.await.map_err(|_| TransportError::Closed)?
    }

    fn on(&self, event: &str, callback: EventCallback) -> ListenerId {
        self.inner.on(event, callback)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.inner.remove_listener(id);
    }

    async fn close(&self) -> std::result::Result<(), TransportError> {
        self.inner.close().await
    }
}

/// Resource ids are numbers on the wire; compare them as strings
fn id_of(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn text_of(value: &Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(String::from)
}

fn translate(raw: &RawEvent) -> Option<PageEvent> {
    let params = &raw.params;
    match raw.name.as_str() {
        "resource.requested" => Some(PageEvent::Request {
            id: id_of(&params["id"])?,
            url: params["url"].as_str()?.to_string(),
        }),
        "resource.received" => {
            let id = id_of(&params["id"])?;
            let url = params["url"].as_str()?.to_string();
            if let Some(to) = text_of(&params["redirectURL"]) {
                return Some(PageEvent::Redirect { id, from: url, to });
            }
            match params["stage"].as_str() {
                Some("end") => Some(PageEvent::Finished { id }),
                _ => Some(PageEvent::Response {
                    id,
                    url,
                    status: params["status"].as_u64().map(|s| s as u16),
                    status_text: text_of(&params["statusText"]),
                }),
            }
        }
        "resource.error" => Some(PageEvent::Failed {
            id: id_of(&params["id"])?,
            message: text_of(&params["errorString"]),
        }),
        "load.finished" => match params["status"].as_str() {
            Some("success") => Some(PageEvent::LoadComplete),
            _ => Some(PageEvent::LoadFailed {
                message: text_of(&params["errorString"]),
            }),
        },
        _ => None,
    }
}

pub struct StepQueueDriver {
    tab_id: u64,
    queue: Arc<StepQueue>,
    persistent: Mutex<Vec<ListenerId>>,
    dialogs: Arc<DialogHandler>,
}

impl StepQueueDriver {
    pub async fn new(tab_id: u64, inner: Arc<dyn Transport>, config: &BrowserConfig) -> Result<Self> {
        let queue = StepQueue::start(inner.clone(), LEGACY_TICK);
        let driver = Self {
            tab_id,
            queue,
            persistent: Mutex::new(Vec::new()),
            dialogs: DialogHandler::new(config.accept_dialogs),
        };

        let mut settings = json!({
            "viewportSize": { "width": config.width, "height": config.height },
            "resourceTimeout": config.resource_timeout_ms,
            "loadImages": config.load_images,
            "ignoreSslErrors": config.ignore_ssl_errors,
        });
        if let Some(user_agent) = &config.user_agent {
            settings["userAgent"] = json!(user_agent);
        }
        driver.command("settings", settings).await?;

        let policy = UrlPolicy::from_config(config);
        if policy.is_restrictive() {
            // Aborts bypass the queue: the engine holds the request until answered
            let weak: Weak<dyn Transport> = Arc::downgrade(&inner);
            let id = inner.on(
                "resource.requested",
                Arc::new(move |event: RawEvent| {
                    let url = event.params["url"].as_str().unwrap_or_default();
                    if policy.is_url_allowed(url) {
                        return;
                    }
                    let (Some(transport), Some(request_id)) =
                        (weak.upgrade(), id_of(&event.params["id"]))
                    else {
                        return;
                    };
                    tracing::debug!("[Tab {}] Aborted: {}", tab_id, url);
                    tokio::spawn(async move {
                        if let Err(e) = transport
                            .send_command("abort", Some(json!({ "id": request_id })))
                            .await
                        {
                            tracing::warn!("[Tab {}] abort failed: {}", tab_id, e);
                        }
                    });
                }),
            );
            driver.keep(id);
        }

        // The engine is blocked until the dialog is answered: bypass the queue
        let dialogs = driver.dialogs.clone();
        let weak: Weak<dyn Transport> = Arc::downgrade(&inner);
        let id = inner.on(
            "dialog.opening",
            Arc::new(move |event: RawEvent| {
                let (Some(transport), Some(dialog_id)) = (weak.upgrade(), id_of(&event.params["id"]))
                else {
                    return;
                };
                let kind = DialogKind::parse(event.params["type"].as_str().unwrap_or_default());
                let reply = dialogs.reply(kind, event.params["message"].as_str().unwrap_or_default());
                let params = json!({
                    "id": dialog_id,
                    "accept": reply.accept,
                    "promptText": reply.prompt_text,
                });
                tokio::spawn(async move {
                    if let Err(e) = transport.send_command("dialog.reply", Some(params)).await {
                        tracing::warn!("[Tab {}] dialog.reply failed: {}", tab_id, e);
                    }
                });
            }),
        );
        driver.keep(id);

        let id = inner.on(
            "resource.error",
            Arc::new(move |event: RawEvent| {
                let message = event.params["errorString"].as_str().unwrap_or_default();
                if message != ABORTED_ERROR {
                    tracing::debug!(
                        "[Tab {}] Resource error: {} ({})",
                        tab_id,
                        message,
                        event.params["url"].as_str().unwrap_or_default()
                    );
                }
            }),
        );
        driver.keep(id);

        Ok(driver)
    }

    pub fn dialogs(&self) -> &Arc<DialogHandler> {
        &self.dialogs
    }

    pub fn queue(&self) -> &Arc<StepQueue> {
        &self.queue
    }

    fn keep(&self, id: ListenerId) {
        lock(&self.persistent).push(id);
    }

    async fn command(&self, method: &str, params: Value) -> Result<Value> {
        self.queue
            .send_command(method, Some(params))
            .await
            .map_err(|e| error::normalize(BackendKind::StepQueue, e))
    }
}

#[async_trait]
impl PageDriver for StepQueueDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::StepQueue
    }

    fn watch(&self) -> EventWatch {
        let transport: Arc<dyn Transport> = self.queue.clone();
        EventWatch::new(transport, &NETWORK_EVENTS, translate)
    }

    async fn clear(&self) -> Result<()> {
        let dropped = self.queue.clear();
        if dropped > 0 {
            tracing::debug!("[Tab {}] Dropped {} stale steps", self.tab_id, dropped);
        }
        self.command("clear", json!({})).await?;
        Ok(())
    }

    async fn begin_navigation(&self, url: &str, options: &OpenOptions) -> Result<NavigationStart> {
        self.command(
            "open",
            json!({ "url": url, "settings": Value::Object(options.0.clone()) }),
        )
        .await?;
        Ok(NavigationStart::default())
    }

    async fn include_script(&self, url: &str) -> Result<()> {
        self.command("includeJs", json!({ "url": url })).await?;
        Ok(())
    }

    async fn run_script(&self, source: &str) -> Result<()> {
        self.command("evaluateScript", json!({ "source": source }))
            .await?;
        Ok(())
    }

    async fn evaluate(&self, function: &str, arg: Value) -> Result<Value> {
        let result = self
            .command("evaluate", json!({ "function": function, "arg": arg }))
            .await?;
        Ok(result.get("value").cloned().unwrap_or(Value::Null))
    }

    async fn teardown(&self) -> Result<()> {
        let listeners: Vec<ListenerId> = lock(&self.persistent).drain(..).collect();
        for id in listeners {
            self.queue.remove_listener(id);
        }
        let closed = self.command("close", json!({})).await;
        self.queue.stop();
        if let Err(e) = self.queue.close().await {
            tracing::warn!("[Tab {}] Closing page connection failed: {}", self.tab_id, e);
        }
        closed.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    #[tokio::test(start_paused = true)]
    async fn test_state_machine() {
        let mock = MockTransport::new(|_, _, _| Ok(json!({ "ok": true })));
        let queue = StepQueue::start(mock.clone(), LEGACY_TICK);
        assert_eq!(queue.state(), StepState::Idle);

        let result = queue.send_command("open", None).await.unwrap();
        assert_eq!(result, json!({ "ok": true }));
        assert_eq!(queue.state(), StepState::Idle);
        assert_eq!(mock.commands(), vec!["open".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_run_in_order() {
        let mock = MockTransport::new(|_, _, _| Ok(Value::Null));
        let queue = StepQueue::start(mock.clone(), LEGACY_TICK);

        let (a, b, c) = tokio::join!(
            queue.send_command("a", None),
            queue.send_command("b", None),
            queue.send_command("c", None),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(mock.commands(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_scheduled_steps() {
        let mock = MockTransport::new(|_, _, _| Ok(Value::Null));
        let queue = StepQueue::start(mock.clone(), LEGACY_TICK);

        let mut stale = tokio_test::task::spawn(queue.send_command("stale", None));
        tokio_test::assert_pending!(stale.poll());
        assert_eq!(queue.state(), StepState::StepScheduled);

        assert_eq!(queue.clear(), 1);
        assert_eq!(queue.state(), StepState::Idle);
        let result = tokio_test::assert_ready!(stale.poll());
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(mock.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_settings_and_teardown() {
        let mock = MockTransport::new(|_, _, _| Ok(json!({})));
        let config = BrowserConfig {
            load_images: false,
            ..BrowserConfig::default()
        };
        let driver = StepQueueDriver::new(1, mock.clone(), &config).await.unwrap();

        let settings = &mock.params_of("settings")[0];
        assert_eq!(settings["loadImages"], json!(false));
        assert_eq!(settings["ignoreSslErrors"], json!(true));
        assert_eq!(settings["viewportSize"]["width"], json!(1280));

        driver.teardown().await.unwrap();
        assert!(mock.commands().contains(&"close".to_string()));
        assert!(mock.is_closed());
        assert_eq!(mock.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dialogs_bypass_queue() {
        let mock = MockTransport::new(|_, _, _| Ok(json!({})));
        let driver = StepQueueDriver::new(1, mock.clone(), &BrowserConfig::default())
            .await
            .unwrap();
        driver
            .dialogs()
            .set_prompt(Arc::new(|message: &str| Some(format!("{}!", message))));

        mock.emit(
            "dialog.opening",
            json!({ "id": 9, "type": "prompt", "message": "hello" }),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            mock.params_of("dialog.reply"),
            vec![json!({ "id": "9", "accept": true, "promptText": "hello!" })]
        );
        assert_eq!(driver.queue().state(), StepState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_resource_is_aborted() {
        let mock = MockTransport::new(|_, method, _| match method {
            "abort" => Err(TransportError::Closed),
            _ => Ok(json!({})),
        });
        let config = BrowserConfig {
            blacklist: vec!["ads.test".to_string()],
            ..BrowserConfig::default()
        };
        let _driver = StepQueueDriver::new(1, mock.clone(), &config).await.unwrap();

        mock.emit("resource.requested", json!({ "id": 4, "url": "http://ads.test/pixel.gif" }));
        mock.emit("resource.requested", json!({ "id": 5, "url": "http://a.test/" }));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(mock.params_of("abort"), vec![json!({ "id": "4" })]);
    }

    #[test]
    fn test_translate_vocabulary() {
        let raw = |name: &str, params: Value| RawEvent {
            name: name.to_string(),
            params,
        };

        assert_eq!(
            translate(&raw("resource.requested", json!({ "id": 3, "url": "http://a.test/" }))),
            Some(PageEvent::Request {
                id: "3".to_string(),
                url: "http://a.test/".to_string()
            })
        );
        assert_eq!(
            translate(&raw(
                "resource.received",
                json!({ "id": 3, "url": "http://a.test/", "stage": "start", "redirectURL": "http://b.test/" })
            )),
            Some(PageEvent::Redirect {
                id: "3".to_string(),
                from: "http://a.test/".to_string(),
                to: "http://b.test/".to_string()
            })
        );
        assert_eq!(
            translate(&raw(
                "resource.received",
                json!({ "id": 4, "url": "http://b.test/", "stage": "start", "status": null, "redirectURL": null })
            )),
            Some(PageEvent::Response {
                id: "4".to_string(),
                url: "http://b.test/".to_string(),
                status: None,
                status_text: None
            })
        );
        assert_eq!(
            translate(&raw("resource.received", json!({ "id": 4, "url": "http://b.test/", "stage": "end", "status": 200 }))),
            Some(PageEvent::Finished { id: "4".to_string() })
        );
        assert_eq!(
            translate(&raw("load.finished", json!({ "status": "fail" }))),
            Some(PageEvent::LoadFailed { message: None })
        );
    }
}
