//! Tab - one controllable page
//!
//! Every public operation validates its arguments, then goes through the
//! tab's `ActionGate`. They all return `Result<Action<T>>`: the outer
//! error is misuse detected before anything was sent, the action resolves
//! with the outcome of the attempt.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::backend::{Backend, BackendKind, OpenOptions};
use crate::browser::ProcessHandle;
use crate::config::BrowserConfig;
use crate::engine::{InjectSource, NavigationOutcome, Selectors, WaitArg, WaitMode, WaitSpec};
use crate::error::{NickError, Result};
use crate::events::BrowserEvent;
use crate::gate::{Action, ActionGate};

pub struct Tab {
    id: u64,
    gate: Arc<ActionGate>,
    backend: Arc<Backend>,
    config: Arc<BrowserConfig>,
    process: Arc<ProcessHandle>,
}

impl Tab {
    pub(crate) fn new(
        id: u64,
        gate: Arc<ActionGate>,
        backend: Backend,
        config: Arc<BrowserConfig>,
        process: Arc<ProcessHandle>,
    ) -> Self {
        Self {
            id,
            gate,
            backend: Arc::new(backend),
            config,
            process,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn backend(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn is_closed(&self) -> bool {
        self.gate.is_closed()
    }

    pub fn is_crashed(&self) -> bool {
        self.gate.is_crashed()
    }

    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    /// Answer `confirm()` dialogs with `handler`. Runs on the transport's
    /// event task, so it must return promptly
    pub fn on_confirm<F>(&self, handler: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.backend.dialogs().set_confirm(Arc::new(handler));
    }

    /// Answer `prompt()` dialogs with `handler`; None cancels the prompt
    pub fn on_prompt<F>(&self, handler: F)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.backend.dialogs().set_prompt(Arc::new(handler));
    }

    /// Navigate; non-2xx responses are reported in the outcome, not as errors
    pub fn open(&self, url: &str) -> Result<Action<NavigationOutcome>> {
        self.open_with_options(url, OpenOptions::new())
    }

    pub fn open_with_options(
        &self,
        url: &str,
        options: OpenOptions,
    ) -> Result<Action<NavigationOutcome>> {
        self.gate.check()?;
        let url = with_scheme(url)?;

        let tab_id = self.id;
        let backend = self.backend.clone();
        let config = self.config.clone();
        let process = self.process.clone();
        self.gate.run(async move {
            tracing::info!("[Tab {}] Opening {}", tab_id, url);
            let outcome = backend.navigate(&url, &options, &config).await?;
            process.events().publish(BrowserEvent::NavigationComplete {
                tab_id,
                url: outcome.url.clone().unwrap_or_else(|| url.clone()),
                http_code: outcome.http_code,
            });
            Ok(outcome)
        })
    }

    /// Wait until the selectors are visible. `first`/`second` are the
    /// duration (ms) and the operator, in either order
    pub fn wait_until_visible(
        &self,
        selectors: impl Into<Selectors>,
        first: impl Into<WaitArg>,
        second: impl Into<WaitArg>,
    ) -> Result<Action<Option<String>>> {
        self.wait(WaitMode::UntilVisible, selectors.into(), first.into(), second.into())
    }

    pub fn wait_while_visible(
        &self,
        selectors: impl Into<Selectors>,
        first: impl Into<WaitArg>,
        second: impl Into<WaitArg>,
    ) -> Result<Action<Option<String>>> {
        self.wait(WaitMode::WhileVisible, selectors.into(), first.into(), second.into())
    }

    pub fn wait_until_present(
        &self,
        selectors: impl Into<Selectors>,
        first: impl Into<WaitArg>,
        second: impl Into<WaitArg>,
    ) -> Result<Action<Option<String>>> {
        self.wait(WaitMode::UntilPresent, selectors.into(), first.into(), second.into())
    }

    pub fn wait_while_present(
        &self,
        selectors: impl Into<Selectors>,
        first: impl Into<WaitArg>,
        second: impl Into<WaitArg>,
    ) -> Result<Action<Option<String>>> {
        self.wait(WaitMode::WhilePresent, selectors.into(), first.into(), second.into())
    }

    fn wait(
        &self,
        mode: WaitMode,
        selectors: Selectors,
        first: WaitArg,
        second: WaitArg,
    ) -> Result<Action<Option<String>>> {
        self.gate.check()?;
        let spec = WaitSpec::with_default(mode, selectors, first, second, self.config.default_wait())?;

        let backend = self.backend.clone();
        let config = self.config.clone();
        self.gate
            .run(async move { backend.watch_condition(&spec, &config).await })
    }

    /// Inject a script: `http(s)://` targets are loaded by the page, anything
    /// else is read from disk
    pub fn inject(&self, target: &str) -> Result<Action<()>> {
        self.gate.check()?;
        let source = InjectSource::parse(target)?;

        let tab_id = self.id;
        let backend = self.backend.clone();
        let config = self.config.clone();
        self.gate.run(async move {
            tracing::debug!("[Tab {}] Injecting {:?}", tab_id, source);
            backend.inject(&source, &config).await
        })
    }

    /// Call `function` (JavaScript source) in the page with `arg`
    pub fn evaluate<A: Serialize>(&self, function: &str, arg: A) -> Result<Action<Value>> {
        self.gate.check()?;
        if function.trim().is_empty() {
            return Err(NickError::InvalidArgument(
                "evaluate needs a function".into(),
            ));
        }
        let arg = serde_json::to_value(arg)
            .map_err(|e| NickError::InvalidArgument(format!("argument is not serializable: {}", e)))?;

        let function = function.to_string();
        let backend = self.backend.clone();
        self.gate
            .run(async move { backend.evaluate(&function, arg).await })
    }

    pub fn url(&self) -> Result<Action<String>> {
        self.read_string("function () { return window.location.href; }")
    }

    /// Serialized DOM of the current page
    pub fn content(&self) -> Result<Action<String>> {
        self.read_string("function () { return document.documentElement.outerHTML; }")
    }

    fn read_string(&self, function: &'static str) -> Result<Action<String>> {
        let backend = self.backend.clone();
        self.gate.run(async move {
            let value = backend.evaluate(function, Value::Null).await?;
            Ok(value.as_str().map(String::from).unwrap_or_default())
        })
    }

    /// Close the page; afterwards every call fails with `SessionClosed`
    pub fn close(&self) -> Result<Action<()>> {
        let tab_id = self.id;
        let gate = self.gate.clone();
        let backend = self.backend.clone();
        let process = self.process.clone();
        self.gate.run(async move {
            backend.close().await?;
            gate.mark_closed();
            process.unregister(tab_id);
            process.events().publish(BrowserEvent::TabClosed { tab_id });
            tracing::info!("[Tab {}] Closed", tab_id);
            Ok(())
        })
    }
}

/// Trim, reject empty, default the scheme to `http://`
fn with_scheme(url: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(NickError::InvalidArgument("url must not be empty".into()));
    }
    let lower = url.to_ascii_lowercase();
    let has_scheme = lower.contains("://")
        || ["about:", "data:", "javascript:", "blob:"]
            .iter()
            .any(|scheme| lower.starts_with(scheme));
    if has_scheme {
        Ok(url.to_string())
    } else {
        Ok(format!("http://{}", url))
    }
}
