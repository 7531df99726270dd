//! Event-streaming backend: a Chrome DevTools target
//!
//! Network.* and Page.* events are translated into `PageEvent`; in-page
//! work goes through Runtime.evaluate.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::dialog::{DialogHandler, DialogKind};
use super::watch::{EventWatch, PageEvent};
use super::{BackendKind, NavigationStart, OpenOptions, PageDriver};
use crate::cdp::protocol::{
    EvaluateResult, LoadingFailed, LoadingFinished, NavigateResult, RequestPaused,
    RequestWillBeSent, ResponseReceived,
};
use crate::config::BrowserConfig;
use crate::error::{self, NickError, Result};
use crate::policy::UrlPolicy;
use crate::transport::{ListenerId, RawEvent, Transport};

/// Events an operation may need to correlate
const NETWORK_EVENTS: [&str; 5] = [
    "Network.requestWillBeSent",
    "Network.responseReceived",
    "Network.loadingFinished",
    "Network.loadingFailed",
    "Page.loadEventFired",
];

/// Appends a script element and settles once it ran (or failed to load)
const INCLUDE_SCRIPT: &str = r#"function (src) {
    return new Promise(function (resolve, reject) {
        var script = document.createElement('script');
        script.src = src;
        script.onload = function () { resolve(true); };
        script.onerror = function () { reject(new Error('failed to load ' + src)); };
        (document.head || document.documentElement).appendChild(script);
    });
}"#;

/// Called when the target reports a renderer crash
pub type CrashHook = Arc<dyn Fn() + Send + Sync>;

pub struct CdpDriver {
    tab_id: u64,
    transport: Arc<dyn Transport>,
    /// Listeners living as long as the tab
    persistent: Mutex<Vec<ListenerId>>,
    /// Headers of the current navigation are installed
    extra_headers: AtomicBool,
    dialogs: Arc<DialogHandler>,
}

impl CdpDriver {
    /// Wrap an attached target and apply the browser configuration to it
    pub async fn new(
        tab_id: u64,
        transport: Arc<dyn Transport>,
        config: &BrowserConfig,
        on_crash: CrashHook,
    ) -> Result<Self> {
        let driver = Self {
            tab_id,
            transport,
            persistent: Mutex::new(Vec::new()),
            extra_headers: AtomicBool::new(false),
            dialogs: DialogHandler::new(config.accept_dialogs),
        };

        driver
            .command(
                "Emulation.setDeviceMetricsOverride",
                json!({
                    "width": config.width,
                    "height": config.height,
                    "deviceScaleFactor": 1,
                    "mobile": false,
                }),
            )
            .await?;

        if let Some(user_agent) = &config.user_agent {
            driver
                .command(
                    "Network.setUserAgentOverride",
                    json!({ "userAgent": user_agent }),
                )
                .await?;
        }

        if config.ignore_ssl_errors {
            driver
                .command(
                    "Security.setIgnoreCertificateErrors",
                    json!({ "ignore": true }),
                )
                .await?;
        }

        let policy = UrlPolicy::from_config(config);
        if policy.is_restrictive() || config.proxy.is_some() || !config.load_images {
            driver.intercept_requests(policy, config).await?;
        }
        driver.answer_dialogs();

        let crash_id = driver.transport.on(
            "Inspector.targetCrashed",
            Arc::new(move |_event: RawEvent| {
                tracing::warn!("[Tab {}] Target crashed", tab_id);
                on_crash();
            }),
        );
        let error_id = driver.transport.on(
            "Runtime.exceptionThrown",
            Arc::new(move |event: RawEvent| {
                let details = &event.params["exceptionDetails"];
                let message = details["exception"]["description"]
                    .as_str()
                    .or_else(|| details["text"].as_str())
                    .unwrap_or("unknown exception");
                tracing::debug!("[Tab {}] Page JavaScript error: {}", tab_id, message);
            }),
        );
        driver.keep(crash_id);
        driver.keep(error_id);

        Ok(driver)
    }

    pub fn dialogs(&self) -> &Arc<DialogHandler> {
        &self.dialogs
    }

    /// Answer every JavaScript dialog as soon as it opens
    fn answer_dialogs(&self) {
        let tab_id = self.tab_id;
        let dialogs = self.dialogs.clone();
        let weak: Weak<dyn Transport> = Arc::downgrade(&self.transport);

        let id = self.transport.on(
            "Page.javascriptDialogOpening",
            Arc::new(move |event: RawEvent| {
                let kind = DialogKind::parse(event.params["type"].as_str().unwrap_or_default());
                let message = event.params["message"].as_str().unwrap_or_default();
                let reply = dialogs.reply(kind, message);
                tracing::debug!(
                    "[Tab {}] {:?} dialog \"{}\" answered (accept: {})",
                    tab_id,
                    kind,
                    message,
                    reply.accept
                );
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                let mut params = json!({ "accept": reply.accept });
                if let Some(text) = reply.prompt_text {
                    params["promptText"] = Value::String(text);
                }
                tokio::spawn(async move {
                    if let Err(e) = transport
                        .send_command("Page.handleJavaScriptDialog", Some(params))
                        .await
                    {
                        tracing::warn!("[Tab {}] Page.handleJavaScriptDialog failed: {}", tab_id, e);
                    }
                });
            }),
        );
        self.keep(id);
    }

    fn keep(&self, id: ListenerId) {
        if let Ok(mut persistent) = self.persistent.lock() {
            persistent.push(id);
        }
    }

    async fn command(&self, method: &str, params: Value) -> Result<Value> {
        self.transport
            .send_command(method, Some(params))
            .await
            .map_err(|e| error::normalize(BackendKind::Cdp, e))
    }

    /// Pause every request and let the policy decide; answer proxy auth
    async fn intercept_requests(&self, policy: UrlPolicy, config: &BrowserConfig) -> Result<()> {
        let tab_id = self.tab_id;
        let load_images = config.load_images;
        let weak: Weak<dyn Transport> = Arc::downgrade(&self.transport);

        let paused_id = self.transport.on(
            "Fetch.requestPaused",
            Arc::new(move |event: RawEvent| {
                let Ok(paused) = serde_json::from_value::<RequestPaused>(event.params) else {
                    return;
                };
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                let image = paused.resource_type.as_deref() == Some("Image");
                let (method, params) = if !load_images && image {
                    tracing::debug!("[Tab {}] Aborted (image): {}", tab_id, paused.request.url);
                    (
                        "Fetch.failRequest",
                        json!({ "requestId": paused.request_id, "errorReason": "BlockedByClient" }),
                    )
                } else if policy.is_url_allowed(&paused.request.url) {
                    ("Fetch.continueRequest", json!({ "requestId": paused.request_id }))
                } else {
                    tracing::debug!("[Tab {}] Aborted: {}", tab_id, paused.request.url);
                    (
                        "Fetch.failRequest",
                        json!({ "requestId": paused.request_id, "errorReason": "BlockedByClient" }),
                    )
                };
                tokio::spawn(async move {
                    if let Err(e) = transport.send_command(method, Some(params)).await {
                        tracing::warn!("[Tab {}] {} failed: {}", tab_id, method, e);
                    }
                });
            }),
        );
        self.keep(paused_id);

        if let Some(proxy) = config.proxy.clone() {
            let weak: Weak<dyn Transport> = Arc::downgrade(&self.transport);
            let auth_id = self.transport.on(
                "Fetch.authRequired",
                Arc::new(move |event: RawEvent| {
                    let Some(request_id) = event.params["requestId"].as_str().map(String::from)
                    else {
                        return;
                    };
                    let Some(transport) = weak.upgrade() else {
                        return;
                    };
                    let params = json!({
                        "requestId": request_id,
                        "authChallengeResponse": {
                            "response": "ProvideCredentials",
                            "username": proxy.username,
                            "password": proxy.password,
                        },
                    });
                    tokio::spawn(async move {
                        if let Err(e) = transport
                            .send_command("Fetch.continueWithAuth", Some(params))
                            .await
                        {
                            tracing::warn!("[Tab {}] Fetch.continueWithAuth failed: {}", tab_id, e);
                        }
                    });
                }),
            );
            self.keep(auth_id);
        }

        self.command(
            "Fetch.enable",
            json!({
                "patterns": [{ "urlPattern": "*" }],
                "handleAuthRequests": config.proxy.is_some(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn runtime_evaluate(&self, expression: String, await_promise: bool) -> Result<Value> {
        let raw = self
            .command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": await_promise,
                }),
            )
            .await?;
        let result: EvaluateResult = serde_json::from_value(raw)
            .map_err(|e| NickError::TransportProtocol(e.to_string()))?;
        if let Some(details) = &result.exception_details {
            return Err(error::page_exception(BackendKind::Cdp, details.message()));
        }
        Ok(result.result.value.unwrap_or(Value::Null))
    }
}

fn translate(raw: &RawEvent) -> Option<PageEvent> {
    match raw.name.as_str() {
        "Network.requestWillBeSent" => {
            let event: RequestWillBeSent = serde_json::from_value(raw.params.clone()).ok()?;
            Some(match event.redirect_response {
                Some(redirect) => PageEvent::Redirect {
                    id: event.request_id,
                    from: redirect.url,
                    to: event.request.url,
                },
                None => PageEvent::Request {
                    id: event.request_id,
                    url: event.request.url,
                },
            })
        }
        "Network.responseReceived" => {
            let event: ResponseReceived = serde_json::from_value(raw.params.clone()).ok()?;
            Some(PageEvent::Response {
                id: event.request_id,
                url: event.response.url,
                // file:// and data: responses report 0
                status: event
                    .response
                    .status
                    .map(|s| s as u16)
                    .filter(|s| *s > 0),
                status_text: event.response.status_text.filter(|s| !s.is_empty()),
            })
        }
        "Network.loadingFinished" => {
            let event: LoadingFinished = serde_json::from_value(raw.params.clone()).ok()?;
            Some(PageEvent::Finished {
                id: event.request_id,
            })
        }
        "Network.loadingFailed" => {
            let event: LoadingFailed = serde_json::from_value(raw.params.clone()).ok()?;
            let message = event
                .error_text
                .filter(|s| !s.is_empty())
                .or(event.blocked_reason.map(|r| format!("blocked: {}", r)));
            Some(PageEvent::Failed {
                id: event.request_id,
                message,
            })
        }
        "Page.loadEventFired" => Some(PageEvent::LoadComplete),
        _ => None,
    }
}

#[async_trait]
impl PageDriver for CdpDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Cdp
    }

    fn watch(&self) -> EventWatch {
        EventWatch::new(self.transport.clone(), &NETWORK_EVENTS, translate)
    }

    async fn clear(&self) -> Result<()> {
        self.command("Page.stopLoading", json!({})).await?;
        Ok(())
    }

    async fn begin_navigation(&self, url: &str, options: &OpenOptions) -> Result<NavigationStart> {
        let mut params = options.0.clone();
        if let Some(headers) = params.remove("headers") {
            self.extra_headers.store(true, Ordering::SeqCst);
            self.command("Network.setExtraHTTPHeaders", json!({ "headers": headers }))
                .await?;
        }
        params.insert("url".to_string(), Value::String(url.to_string()));

        let raw = self.command("Page.navigate", Value::Object(params)).await?;
        let result: NavigateResult = serde_json::from_value(raw)
            .map_err(|e| NickError::TransportProtocol(e.to_string()))?;

        Ok(NavigationStart {
            error: result.error_text.filter(|s| !s.is_empty()),
            same_document: result.loader_id.is_none(),
        })
    }

    async fn end_navigation(&self) {
        if !self.extra_headers.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .command("Network.setExtraHTTPHeaders", json!({ "headers": {} }))
            .await
        {
            tracing::warn!("[Tab {}] Resetting extra headers failed: {}", self.tab_id, e);
        }
    }

    async fn include_script(&self, url: &str) -> Result<()> {
        self.evaluate(INCLUDE_SCRIPT, Value::String(url.to_string()))
            .await
            .map(|_| ())
    }

    async fn run_script(&self, source: &str) -> Result<()> {
        self.runtime_evaluate(source.to_string(), false)
            .await
            .map(|_| ())
    }

    async fn evaluate(&self, function: &str, arg: Value) -> Result<Value> {
        self.runtime_evaluate(format!("({})({})", function, arg), true)
            .await
    }

    async fn teardown(&self) -> Result<()> {
        let listeners: Vec<ListenerId> = match self.persistent.lock() {
            Ok(mut persistent) => persistent.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for id in listeners {
            self.transport.remove_listener(id);
        }
        self.transport
            .close()
            .await
            .map_err(|e| error::normalize(BackendKind::Cdp, e))
    }
}
