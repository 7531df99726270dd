//! Browser - owner of the remote browser process and of its tabs
//!
//! Process start and connection are delegated to a `Bootstrap`. The
//! browser only reacts to the process going away: every open tab is
//! marked crashed at once, which also resolves its in-flight action.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, OnceCell};

use crate::backend::{Backend, BackendKind, CdpDriver, StepQueueDriver};
use crate::cdp::{CDPClient, CDPSession};
use crate::config::BrowserConfig;
use crate::error::{self, NickError, Result};
use crate::events::{BrowserEvent, EventBus};
use crate::gate::ActionGate;
use crate::tab::Tab;
use crate::transport::Transport;

/// Exit-only state shared by every tab of one process
pub struct ProcessHandle {
    died: AtomicBool,
    tabs: DashMap<u64, Arc<ActionGate>>,
    events: EventBus,
}

impl ProcessHandle {
    pub fn new(events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            died: AtomicBool::new(false),
            tabs: DashMap::new(),
            events,
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn has_exited(&self) -> bool {
        self.died.load(Ordering::SeqCst)
    }

    pub(crate) fn register(&self, tab_id: u64, gate: Arc<ActionGate>) {
        self.tabs.insert(tab_id, gate);
    }

    pub(crate) fn unregister(&self, tab_id: u64) {
        self.tabs.remove(&tab_id);
    }

    pub fn open_tabs(&self) -> usize {
        self.tabs.len()
    }

    /// The process is gone: mark every open tab crashed. Idempotent
    pub fn fire(&self) {
        if self.died.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::error!(
            "[Browser] Process exited, {} open tab(s) marked crashed",
            self.tabs.len()
        );
        for entry in self.tabs.iter() {
            entry.value().mark_crashed();
            self.events
                .publish(BrowserEvent::TabCrashed { tab_id: *entry.key() });
        }
        self.events.publish(BrowserEvent::ProcessExited);
    }
}

/// Process start and per-tab connection
#[async_trait]
pub trait Bootstrap: Send + Sync {
    /// Make the browser reachable; call `process.fire()` once it dies
    async fn spawn(&self, config: &BrowserConfig, process: Arc<ProcessHandle>) -> Result<()>;

    /// Transport for a fresh page
    async fn connect(&self, config: &BrowserConfig, tab_id: u64) -> Result<Arc<dyn Transport>>;

    async fn terminate(&self) -> Result<()>;
}

/// Fire the process handle once `client` disconnects
fn watch_connection(client: &CDPClient, process: Arc<ProcessHandle>) {
    let mut closed = client.closed();
    tokio::spawn(async move {
        let _ = closed.wait_for(|closed| *closed).await;
        tracing::warn!("[Browser] Connection to the browser lost");
        process.fire();
    });
}

/// Chrome over the DevTools protocol: one WebSocket, one target per tab
#[derive(Default)]
pub struct CdpBootstrap {
    client: OnceCell<Arc<CDPClient>>,
}

impl CdpBootstrap {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bootstrap for CdpBootstrap {
    async fn spawn(&self, config: &BrowserConfig, process: Arc<ProcessHandle>) -> Result<()> {
        let client = self
            .client
            .get_or_try_init(|| async {
                CDPClient::connect(&config.endpoint)
                    .await
                    .map_err(|e| error::normalize(BackendKind::Cdp, e))
            })
            .await?;
        watch_connection(client, process);
        Ok(())
    }

    async fn connect(&self, _config: &BrowserConfig, tab_id: u64) -> Result<Arc<dyn Transport>> {
        let client = self.client.get().cloned().ok_or(NickError::BackendCrashed)?;
        let session = CDPSession::create(client, "about:blank")
            .await
            .map_err(|e| error::normalize(BackendKind::Cdp, e))?;
        tracing::debug!("[Tab {}] Attached to target {}", tab_id, session.target_id);
        Ok(Arc::new(session))
    }

    async fn terminate(&self) -> Result<()> {
        if let Some(client) = self.client.get() {
            if let Err(e) = client.send_request("Browser.close", None, None).await {
                tracing::debug!("[Browser] Browser.close: {}", e);
            }
            let _ = client.close().await;
        }
        Ok(())
    }
}

/// Legacy engine behind a JSON-RPC bridge: one connection per page, plus
/// a control connection whose loss means the engine died
#[derive(Default)]
pub struct LegacyBootstrap {
    control: OnceCell<Arc<CDPClient>>,
    /// Page connections are owned by their tabs; closing a tab closes its
    /// connection
    pages: Mutex<Vec<Weak<CDPClient>>>,
}

impl LegacyBootstrap {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bootstrap for LegacyBootstrap {
    async fn spawn(&self, config: &BrowserConfig, process: Arc<ProcessHandle>) -> Result<()> {
        let control = self
            .control
            .get_or_try_init(|| async {
                CDPClient::connect(&config.endpoint)
                    .await
                    .map_err(|e| error::normalize(BackendKind::StepQueue, e))
            })
            .await?;
        watch_connection(control, process);
        Ok(())
    }

    async fn connect(&self, config: &BrowserConfig, tab_id: u64) -> Result<Arc<dyn Transport>> {
        let client = CDPClient::connect(&config.endpoint)
            .await
            .map_err(|e| error::normalize(BackendKind::StepQueue, e))?;
        tracing::debug!("[Tab {}] Connected to {}", tab_id, config.endpoint);
        if let Ok(mut pages) = self.pages.lock() {
            pages.retain(|page| page.upgrade().is_some_and(|page| !page.is_closed()));
            pages.push(Arc::downgrade(&client));
        }
        Ok(client)
    }

    async fn terminate(&self) -> Result<()> {
        let pages: Vec<Arc<CDPClient>> = match self.pages.lock() {
            Ok(mut pages) => pages.drain(..).filter_map(|page| page.upgrade()).collect(),
            Err(_) => Vec::new(),
        };
        for page in pages {
            let _ = page.close().await;
        }
        if let Some(control) = self.control.get() {
            let _ = control.send_request("exit", None, None).await;
            let _ = control.close().await;
        }
        Ok(())
    }
}

/// Session factory for one remote browser
pub struct Browser {
    config: Arc<BrowserConfig>,
    bootstrap: Arc<dyn Bootstrap>,
    process: Arc<ProcessHandle>,
    started: OnceCell<()>,
    next_tab: AtomicU64,
}

impl Browser {
    /// Browser with the stock bootstrap of the configured backend
    pub fn new(config: BrowserConfig) -> Result<Self> {
        let bootstrap: Arc<dyn Bootstrap> = match config.backend {
            BackendKind::Cdp => Arc::new(CdpBootstrap::new()),
            BackendKind::StepQueue => Arc::new(LegacyBootstrap::new()),
        };
        Self::with_bootstrap(config, bootstrap)
    }

    pub fn with_bootstrap(config: BrowserConfig, bootstrap: Arc<dyn Bootstrap>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            bootstrap,
            process: ProcessHandle::new(EventBus::new()),
            started: OnceCell::new(),
            next_tab: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrowserEvent> {
        self.process.events().subscribe()
    }

    pub fn open_tabs(&self) -> usize {
        self.process.open_tabs()
    }

    pub fn has_exited(&self) -> bool {
        self.process.has_exited()
    }

    /// Start the browser; concurrent and repeated calls spawn it once
    pub async fn initialize(&self) -> Result<()> {
        self.started
            .get_or_try_init(|| async {
                tracing::info!(
                    "[Browser {}] Starting ({:?} backend, {})",
                    self.config.id,
                    self.config.backend,
                    self.config.endpoint
                );
                self.bootstrap
                    .spawn(&self.config, self.process.clone())
                    .await?;
                self.process.events().publish(BrowserEvent::Started);
                Ok::<(), NickError>(())
            })
            .await?;
        Ok(())
    }

    /// Open a new tab, starting the browser first if needed
    pub async fn new_tab(&self) -> Result<Tab> {
        if self.process.has_exited() {
            return Err(NickError::BackendCrashed);
        }
        self.initialize().await?;

        let tab_id = self.next_tab.fetch_add(1, Ordering::SeqCst);
        let gate = ActionGate::new(tab_id);
        let transport = self.bootstrap.connect(&self.config, tab_id).await?;

        let backend = match self.config.backend {
            BackendKind::Cdp => {
                let crashed = gate.clone();
                let events = self.process.events().clone();
                let on_crash = Arc::new(move || {
                    crashed.mark_crashed();
                    events.publish(BrowserEvent::TabCrashed { tab_id });
                });
                Backend::Cdp(CdpDriver::new(tab_id, transport, &self.config, on_crash).await?)
            }
            BackendKind::StepQueue => {
                Backend::StepQueue(StepQueueDriver::new(tab_id, transport, &self.config).await?)
            }
        };

        // The process may have died while this tab was being set up
        self.process.register(tab_id, gate.clone());
        if self.process.has_exited() {
            gate.mark_crashed();
        }
        self.process
            .events()
            .publish(BrowserEvent::TabOpened { tab_id });
        tracing::info!("[Tab {}] Opened", tab_id);

        Ok(Tab::new(
            tab_id,
            gate,
            backend,
            self.config.clone(),
            self.process.clone(),
        ))
    }

    /// Terminate the process; every open tab becomes crashed
    pub async fn exit(&self) -> Result<()> {
        tracing::info!("[Browser {}] Exiting", self.config.id);
        let terminated = self.bootstrap.terminate().await;
        self.process.fire();
        self.process.events().publish(BrowserEvent::Stopped);
        terminated
    }
}
