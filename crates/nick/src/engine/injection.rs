//! Script injection from disk or from a URL
//!
//! From a URL, the include command alone does not prove the code is
//! usable: completion is decided on a poll tick from the resource events
//! of the script request (following redirects) and the include result.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use super::fetch::{urls_match, FetchState};
use crate::backend::{PageDriver, PageEvent};
use crate::config::BrowserConfig;
use crate::error::{NickError, Result};

/// Added to the resource timeout to bound a from-URL injection
pub const INJECTION_GRACE: Duration = Duration::from_secs(5);

const RESOLVE_TICK: Duration = Duration::from_millis(50);

/// How long an include failure waits for a more precise network error
const SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectSource {
    Path(PathBuf),
    Url(String),
}

impl InjectSource {
    /// `http://` and `https://` targets are fetched by the page; anything
    /// else is read from disk
    pub fn parse(target: &str) -> Result<Self> {
        let target = target.trim();
        if target.is_empty() {
            return Err(NickError::InvalidArgument(
                "inject needs a path or URL".into(),
            ));
        }
        let lower = target.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Ok(InjectSource::Url(target.to_string()))
        } else {
            Ok(InjectSource::Path(PathBuf::from(target)))
        }
    }
}

pub async fn inject<D: PageDriver + ?Sized>(
    driver: &D,
    source: &InjectSource,
    config: &BrowserConfig,
) -> Result<()> {
    match source {
        InjectSource::Path(path) => from_disk(driver, path).await,
        InjectSource::Url(url) => {
            from_url(driver, url, config.resource_timeout() + INJECTION_GRACE).await
        }
    }
}

async fn from_disk<D: PageDriver + ?Sized>(driver: &D, path: &Path) -> Result<()> {
    let source = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| NickError::InjectionIo {
            path: path.to_path_buf(),
            source,
        })?;

    driver.run_script(&source).await.map_err(|e| match e {
        NickError::PageContext(message) => NickError::PageContext(format!(
            "error while running {}: {}",
            path.display(),
            message
        )),
        other => other,
    })
}

#[derive(Default)]
struct Delivery {
    fetch: FetchState,
    delivered: bool,
    included: Option<(Result<()>, Instant)>,
}

impl Delivery {
    fn apply(&mut self, event: PageEvent) {
        let fetch = &mut self.fetch;
        match event {
            PageEvent::Request { id, url } => {
                fetch.identify(&id, &url);
            }
            PageEvent::Redirect { id, from, to } => {
                if fetch.is_ours(&id) || urls_match(&from, &fetch.watched) {
                    tracing::debug!("[Injection] Redirected {} -> {}", from, to);
                    fetch.request_id.get_or_insert(id);
                    fetch.redirect(&to);
                }
            }
            PageEvent::Response {
                id,
                url,
                status,
                status_text,
            } => {
                if fetch.is_ours(&id) {
                    fetch.rebind = false;
                    fetch.url = Some(url);
                    fetch.http_code = status;
                    fetch.http_status = status_text;
                }
            }
            PageEvent::Finished { id } => {
                if fetch.is_ours(&id) && !fetch.rebind {
                    self.delivered = true;
                }
            }
            PageEvent::Failed { id, message } => {
                if let Some(message) = &message {
                    fetch.errors.push(id.clone(), message.clone());
                }
                if fetch.is_ours(&id) {
                    fetch.error = Some(fetch.failure_message(message.as_deref()));
                }
            }
            PageEvent::LoadComplete | PageEvent::LoadFailed { .. } => {}
        }
    }

    /// Single exit point, evaluated on every tick
    fn resolve(&mut self, url: &str) -> Option<Result<()>> {
        let network = |fetch: &FetchState, message: String| NickError::InjectionNetwork {
            url: url.to_string(),
            message,
            http_code: fetch.http_code,
            http_status: fetch.http_status.clone(),
        };

        if let Some(message) = self.fetch.error.clone() {
            return Some(Err(network(&self.fetch, message)));
        }

        if self.delivered {
            match self.fetch.http_code {
                Some(code) if !(200..300).contains(&code) => {
                    let message = self
                        .fetch
                        .http_status
                        .clone()
                        .unwrap_or_else(|| format!("HTTP {}", code));
                    return Some(Err(network(&self.fetch, message)));
                }
                None => {
                    let message = self.fetch.failure_message(None);
                    return Some(Err(network(&self.fetch, message)));
                }
                Some(_) => {}
            }
        }

        match self.included.take() {
            Some((Err(e), at)) if at.elapsed() >= SETTLE => Some(Err(e)),
            Some((Ok(()), _)) if self.delivered => Some(Ok(())),
            // Served without network events (memory cache)
            Some((Ok(()), at)) if self.fetch.request_id.is_none() && at.elapsed() >= SETTLE => {
                Some(Ok(()))
            }
            other => {
                self.included = other;
                None
            }
        }
    }
}

async fn from_url<D: PageDriver + ?Sized>(driver: &D, url: &str, deadline: Duration) -> Result<()> {
    let started = Instant::now();
    let mut state = Delivery {
        fetch: FetchState::new(url),
        ..Default::default()
    };

    let mut events = driver.watch();
    let include = driver.include_script(url);
    tokio::pin!(include);
    let mut pending_include = true;

    let mut tick = tokio::time::interval(RESOLVE_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = &mut include, if pending_include => {
                pending_include = false;
                state.included = Some((result, Instant::now()));
            }
            Some(event) = events.next() => state.apply(event),
            _ = tick.tick() => {
                if let Some(outcome) = state.resolve(url) {
                    return outcome;
                }
                if started.elapsed() >= deadline {
                    return Err(NickError::InjectionTimeout {
                        url: url.to_string(),
                        timeout: deadline,
                    });
                }
            }
        }
    }
}
