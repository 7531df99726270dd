//! Backends - the two protocol implementations behind a tab
//!
//! `PageDriver` is the small set of primitives the engines need.
//! `Backend` is the tagged variant a tab holds; its five capabilities
//! run the shared engines against whichever driver is inside.

pub mod cdp;
pub mod dialog;
pub mod step_queue;
pub mod watch;

pub use cdp::CdpDriver;
pub use dialog::{ConfirmHandler, DialogHandler, DialogKind, DialogReply, PromptHandler};
pub use step_queue::{StepQueue, StepQueueDriver, StepState};
pub use watch::{EventWatch, PageEvent};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::BrowserConfig;
use crate::engine::condition::{self, WaitSpec};
use crate::engine::injection::{self, InjectSource};
use crate::engine::navigation::{self, NavigationOutcome};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Event-streaming remote-debugging protocol
    #[default]
    Cdp,
    /// Legacy step-queue automation engine
    StepQueue,
}

/// Opaque navigation options, forwarded to the backend's navigate command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenOptions(pub Map<String, Value>);

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

/// What the navigate command itself reported
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NavigationStart {
    /// Immediate failure reported by the command (DNS, refused, ...)
    pub error: Option<String>,
    /// No document load will follow (fragment-only change)
    pub same_document: bool,
}

#[async_trait]
pub trait PageDriver: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Subscribe to the normalized network/lifecycle events
    fn watch(&self) -> EventWatch;

    /// Drop pending work left over by a previous operation
    async fn clear(&self) -> Result<()>;

    async fn begin_navigation(&self, url: &str, options: &OpenOptions) -> Result<NavigationStart>;

    /// Undo per-navigation settings; runs once the navigation ended, on
    /// every path
    async fn end_navigation(&self) {}

    /// Ask the page to load an external script; returns once acknowledged
    async fn include_script(&self, url: &str) -> Result<()>;

    /// Run script source in the page context
    async fn run_script(&self, source: &str) -> Result<()>;

    /// Call `function` (source text) with `arg` in the page, by value
    async fn evaluate(&self, function: &str, arg: Value) -> Result<Value>;

    /// Remove persistent listeners and close the page
    async fn teardown(&self) -> Result<()>;
}

/// Tagged backend held by a tab
pub enum Backend {
    Cdp(CdpDriver),
    StepQueue(StepQueueDriver),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Cdp(_) => BackendKind::Cdp,
            Backend::StepQueue(_) => BackendKind::StepQueue,
        }
    }

    pub fn dialogs(&self) -> &Arc<DialogHandler> {
        match self {
            Backend::Cdp(d) => d.dialogs(),
            Backend::StepQueue(d) => d.dialogs(),
        }
    }

    pub async fn navigate(
        &self,
        url: &str,
        options: &OpenOptions,
        config: &BrowserConfig,
    ) -> Result<NavigationOutcome> {
        match self {
            Backend::Cdp(d) => navigation::open(d, url, options, config).await,
            Backend::StepQueue(d) => navigation::open(d, url, options, config).await,
        }
    }

    pub async fn watch_condition(
        &self,
        spec: &WaitSpec,
        config: &BrowserConfig,
    ) -> Result<Option<String>> {
        match self {
            Backend::Cdp(d) => condition::wait(d, spec, config.poll_interval()).await,
            Backend::StepQueue(d) => condition::wait(d, spec, config.poll_interval()).await,
        }
    }

    pub async fn inject(&self, source: &InjectSource, config: &BrowserConfig) -> Result<()> {
        match self {
            Backend::Cdp(d) => injection::inject(d, source, config).await,
            Backend::StepQueue(d) => injection::inject(d, source, config).await,
        }
    }

    pub async fn evaluate(&self, function: &str, arg: Value) -> Result<Value> {
        match self {
            Backend::Cdp(d) => d.evaluate(function, arg).await,
            Backend::StepQueue(d) => d.evaluate(function, arg).await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            Backend::Cdp(d) => d.teardown().await,
            Backend::StepQueue(d) => d.teardown().await,
        }
    }
}
