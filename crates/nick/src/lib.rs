//! Nick - drive a remote browser through one uniform, gated tab API
//!
//! A `Browser` hands out `Tab`s. Each tab runs one action at a time
//! (navigate, wait for selectors, inject, evaluate, close) over either of
//! two backends:
//!
//! - **Cdp**: a Chrome DevTools target, events streamed over a WebSocket
//! - **StepQueue**: a legacy automation engine that only acts in steps
//!
//! ```no_run
//! use nick::{Browser, BrowserConfig};
//!
//! # async fn run() -> nick::Result<()> {
//! let browser = Browser::new(BrowserConfig::default())?;
//! let tab = browser.new_tab().await?;
//! let outcome = tab.open("example.com")?.await?;
//! println!("HTTP {:?}", outcome.http_code);
//! tab.wait_until_visible("#content", 5000, "and")?.await?;
//! tab.close()?.await?;
//! browser.exit().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod browser;
pub mod cdp;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod gate;
pub mod policy;
pub mod tab;
pub mod transport;

#[cfg(test)]
mod testing;

pub use backend::{Backend, BackendKind, DialogKind, OpenOptions, PageDriver, PageEvent};
pub use browser::{Bootstrap, Browser, CdpBootstrap, LegacyBootstrap, ProcessHandle};
pub use cdp::{CDPClient, CDPSession};
pub use config::{BrowserConfig, ProxyCredentials};
pub use engine::{InjectSource, NavigationOutcome, Operator, WaitArg, WaitMode, WaitSpec};
pub use error::{NickError, Result};
pub use events::{BrowserEvent, EventBus};
pub use gate::{Action, ActionGate};
pub use policy::UrlPolicy;
pub use tab::Tab;
pub use transport::{Transport, TransportError};
