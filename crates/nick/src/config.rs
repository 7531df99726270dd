//! Browser configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::backend::BackendKind;
use crate::error::{NickError, Result};

/// Credentials answered to proxy authentication challenges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

/// Immutable configuration of one browser instance, shared by its tabs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub id: String,
    /// DevTools (or legacy bridge) WebSocket endpoint
    pub endpoint: String,
    pub backend: BackendKind,
    pub width: u32,
    pub height: u32,
    pub user_agent: Option<String>,
    pub resource_timeout_ms: u64,
    pub navigation_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub default_wait_ms: u64,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub proxy: Option<ProxyCredentials>,
    /// Default answer to confirm/prompt dialogs; tabs may override it
    pub accept_dialogs: bool,
    /// Continue through invalid or self-signed certificates
    pub ignore_ssl_errors: bool,
    /// When false, image requests are aborted
    pub load_images: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            endpoint: "ws://localhost:9222".to_string(),
            backend: BackendKind::Cdp,
            width: 1280,
            height: 1024,
            user_agent: None,
            resource_timeout_ms: 10_000,
            navigation_timeout_ms: 30_000,
            poll_interval_ms: 25,
            default_wait_ms: 10_000,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            proxy: None,
            accept_dialogs: true,
            ignore_ssl_errors: true,
            load_images: true,
        }
    }
}

impl BrowserConfig {
    pub fn resource_timeout(&self) -> Duration {
        Duration::from_millis(self.resource_timeout_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_wait(&self) -> Duration {
        Duration::from_millis(self.default_wait_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(NickError::InvalidArgument("endpoint must not be empty".into()));
        }
        let timings = [
            ("resource_timeout_ms", self.resource_timeout_ms),
            ("navigation_timeout_ms", self.navigation_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("default_wait_ms", self.default_wait_ms),
        ];
        for (name, value) in timings {
            if value == 0 {
                return Err(NickError::InvalidArgument(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }
        if self.width == 0 || self.height == 0 {
            return Err(NickError::InvalidArgument(
                "viewport size must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
