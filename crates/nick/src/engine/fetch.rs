//! Bookkeeping shared by navigation and injection: which request is
//! "ours", and what failures were seen along the way.

use std::collections::VecDeque;
use url::Url;

/// Failures kept per operation for late error lookup
pub const ERROR_RING_CAPACITY: usize = 50;

/// Bounded history of resource failures; oldest entries are evicted first
#[derive(Debug)]
pub struct ErrorRingBuffer {
    entries: VecDeque<(String, String)>,
    capacity: usize,
}

impl Default for ErrorRingBuffer {
    fn default() -> Self {
        Self::with_capacity(ERROR_RING_CAPACITY)
    }
}

impl ErrorRingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, request_id: impl Into<String>, message: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((request_id.into(), message.into()));
    }

    /// Most recent message recorded for `request_id`
    pub fn lookup(&self, request_id: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(id, _)| id == request_id)
            .map(|(_, message)| message.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-operation tracking of the one request the operation cares about
#[derive(Debug, Default)]
pub struct FetchState {
    /// URL currently being waited for; follows redirects
    pub watched: String,
    /// Backend id of the identified request
    pub request_id: Option<String>,
    /// Set after a redirect: the next request for `watched` takes over
    pub rebind: bool,
    pub url: Option<String>,
    pub http_code: Option<u16>,
    pub http_status: Option<String>,
    pub error: Option<String>,
    pub errors: ErrorRingBuffer,
}

impl FetchState {
    pub fn new(target: &str) -> Self {
        Self {
            watched: target.to_string(),
            ..Default::default()
        }
    }

    pub fn is_ours(&self, id: &str) -> bool {
        self.request_id.as_deref() == Some(id)
    }

    /// Bind `id` if it is the first request for the watched URL, or the
    /// follow-up request after a redirect
    pub fn identify(&mut self, id: &str, url: &str) -> bool {
        if self.is_ours(id) {
            return true;
        }
        if (self.request_id.is_none() || self.rebind) && urls_match(url, &self.watched) {
            self.request_id = Some(id.to_string());
            self.rebind = false;
            return true;
        }
        false
    }

    /// Our request was redirected to `to`
    pub fn redirect(&mut self, to: &str) {
        self.watched = to.to_string();
        self.rebind = true;
        self.url = None;
        self.http_code = None;
        self.http_status = None;
    }

    /// Best available message for a failure of our request
    pub fn failure_message(&self, event_message: Option<&str>) -> String {
        event_message
            .map(String::from)
            .or_else(|| {
                self.request_id
                    .as_deref()
                    .and_then(|id| self.errors.lookup(id))
                    .map(String::from)
            })
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

/// Whether two URLs name the same resource (exact, trailing slash, or
/// equal once normalized)
pub fn urls_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    if a.trim_end_matches('/') == b.trim_end_matches('/') {
        return true;
    }
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Lowercased scheme of `url`, if it has one
pub fn scheme_of(url: &str) -> Option<String> {
    Url::parse(url).ok().map(|u| u.scheme().to_ascii_lowercase())
}

/// Schemes that load without an HTTP exchange
pub fn is_local_scheme(url: &str) -> bool {
    matches!(
        scheme_of(url).as_deref(),
        Some("file") | Some("data") | Some("about")
    )
}
