//! `open(url)`: issue the navigate command and correlate the event stream
//! until the document's load either completes or fails.

use serde::{Deserialize, Serialize};

use super::fetch::{is_local_scheme, FetchState};
use crate::backend::{EventWatch, OpenOptions, PageDriver, PageEvent};
use crate::config::BrowserConfig;
use crate::error::{NickError, Result};

/// Result of a completed navigation; non-2xx codes are not errors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NavigationOutcome {
    pub http_code: Option<u16>,
    pub http_status: Option<String>,
    /// Final URL after redirects
    pub url: Option<String>,
}

impl NavigationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.http_code, Some(code) if (200..300).contains(&code))
    }
}

pub async fn open<D: PageDriver + ?Sized>(
    driver: &D,
    url: &str,
    options: &OpenOptions,
    config: &BrowserConfig,
) -> Result<NavigationOutcome> {
    driver.clear().await?;

    let timeout = config.navigation_timeout();
    let navigation = async {
        let mut events = driver.watch();
        let start = driver.begin_navigation(url, options).await?;
        if let Some(message) = start.error {
            return Err(network_error(url, message, None, None));
        }
        if start.same_document {
            tracing::debug!("[Navigation] Same-document navigation to {}", url);
            return Ok(NavigationOutcome {
                url: Some(url.to_string()),
                ..Default::default()
            });
        }
        follow(&mut events, url).await
    };

    let result = match tokio::time::timeout(timeout, navigation).await {
        Ok(result) => result,
        Err(_) => Err(NickError::NavigationTimeout {
            url: url.to_string(),
            timeout,
        }),
    };
    driver.end_navigation().await;
    result
}

fn network_error(
    url: &str,
    message: String,
    http_code: Option<u16>,
    http_status: Option<String>,
) -> NickError {
    NickError::NavigationNetwork {
        url: url.to_string(),
        message,
        http_code,
        http_status,
    }
}

async fn follow(events: &mut EventWatch, target: &str) -> Result<NavigationOutcome> {
    let mut state = FetchState::new(target);

    while let Some(event) = events.next().await {
        match event {
            PageEvent::Request { id, url } => {
                state.identify(&id, &url);
            }
            PageEvent::Redirect { id, from, to } => {
                if state.is_ours(&id) || state.identify(&id, &from) {
                    tracing::debug!("[Navigation] Redirected {} -> {}", from, to);
                    state.redirect(&to);
                }
            }
            PageEvent::Response {
                id,
                url,
                status,
                status_text,
            } => {
                if !state.is_ours(&id) || state.url.is_some() {
                    continue;
                }
                state.rebind = false;
                if status.is_none() && !is_local_scheme(&url) {
                    state.error = Some(
                        state
                            .errors
                            .lookup(&id)
                            .unwrap_or("unknown error")
                            .to_string(),
                    );
                }
                state.url = Some(url);
                state.http_code = status;
                state.http_status = status_text;
            }
            PageEvent::Finished { .. } => {}
            PageEvent::Failed { id, message } => {
                if let Some(message) = &message {
                    state.errors.push(id.clone(), message.clone());
                }
                if state.is_ours(&id) {
                    let message = state.failure_message(message.as_deref());
                    return Err(network_error(
                        target,
                        message,
                        state.http_code,
                        state.http_status.take(),
                    ));
                }
            }
            PageEvent::LoadComplete => return settle(state, target),
            PageEvent::LoadFailed { message } => {
                let message = state.failure_message(message.as_deref());
                return Err(network_error(
                    target,
                    message,
                    state.http_code,
                    state.http_status.take(),
                ));
            }
        }
    }

    // Every listener is gone: the transport itself went away
    Err(NickError::BackendCrashed)
}

fn settle(state: FetchState, target: &str) -> Result<NavigationOutcome> {
    let FetchState {
        url,
        http_code,
        http_status,
        error,
        ..
    } = state;

    if let Some(message) = error {
        return Err(network_error(target, message, http_code, http_status));
    }

    let url = url.unwrap_or_else(|| target.to_string());
    if http_code.is_none() && !is_local_scheme(&url) {
        return Err(NickError::UnknownNavigation {
            url: target.to_string(),
        });
    }

    Ok(NavigationOutcome {
        http_code,
        http_status,
        url: Some(url),
    })
}
