//! Error taxonomy and the per-backend error normalizer
//!
//! Every user-visible failure is one `NickError`; its `Display` is the
//! descriptive string handed to callers.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::backend::BackendKind;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum NickError {
    #[error("this tab has been closed - no other actions can be done with it")]
    SessionClosed,

    #[error("cannot do this while another action is already running - each tab can execute only one action at a time")]
    ConcurrentAction,

    #[error("the browser process has exited or the tab crashed")]
    BackendCrashed,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("opening {url} timed out after {timeout:?}")]
    NavigationTimeout { url: String, timeout: Duration },

    #[error("{message}")]
    NavigationNetwork {
        url: String,
        message: String,
        http_code: Option<u16>,
        http_status: Option<String>,
    },

    #[error("unknown error while opening {url}")]
    UnknownNavigation { url: String },

    #[error("waited {}ms but {} still {}", .elapsed.as_millis(), describe_selectors(.selectors), .condition)]
    ConditionTimeout {
        selectors: Vec<String>,
        elapsed: Duration,
        condition: String,
    },

    #[error("cannot read script {}: {source}", .path.display())]
    InjectionIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to inject {url}: {message}")]
    InjectionNetwork {
        url: String,
        message: String,
        http_code: Option<u16>,
        http_status: Option<String>,
    },

    #[error("injecting {url} timed out after {timeout:?}")]
    InjectionTimeout { url: String, timeout: Duration },

    #[error("{0}")]
    PageContext(String),

    #[error("execution context destroyed: {0}")]
    ContextDestroyed(String),

    #[error("transport error: {0}")]
    TransportProtocol(String),
}

pub type Result<T> = std::result::Result<T, NickError>;

impl NickError {
    /// Transient: the page context went away under an outstanding evaluation
    pub fn is_context_destroyed(&self) -> bool {
        matches!(self, NickError::ContextDestroyed(_))
    }

    /// Errors raised before any asynchronous work started
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            NickError::SessionClosed | NickError::ConcurrentAction | NickError::InvalidArgument(_)
        )
    }
}

fn describe_selectors(selectors: &[String]) -> String {
    let quoted: Vec<String> = selectors.iter().map(|s| format!("\"{}\"", s)).collect();
    if quoted.len() > 1 {
        format!("elements {}", quoted.join(", "))
    } else {
        format!("element {}", quoted.join(""))
    }
}

/// Messages Chrome uses when an evaluation outlives its execution context
const CDP_CONTEXT_GONE: [&str; 4] = [
    "Cannot find context with specified id",
    "Execution context was destroyed",
    "Inspected target navigated or closed",
    "Promise was collected",
];

/// Error codes of the legacy engine's RPC bridge
pub(crate) const LEGACY_PAGE_EXCEPTION: i64 = 1;
pub(crate) const LEGACY_CONTEXT_UNLOADED: i64 = 2;

/// Classify a raw transport failure for the given backend
pub fn normalize(kind: BackendKind, err: TransportError) -> NickError {
    match (kind, err) {
        (BackendKind::Cdp, TransportError::Protocol { message, .. })
            if CDP_CONTEXT_GONE.iter().any(|m| message.contains(m)) =>
        {
            NickError::ContextDestroyed(message)
        }
        (BackendKind::StepQueue, TransportError::Protocol { code, message })
            if code == LEGACY_CONTEXT_UNLOADED =>
        {
            NickError::ContextDestroyed(message)
        }
        (BackendKind::StepQueue, TransportError::Protocol { code, message })
            if code == LEGACY_PAGE_EXCEPTION =>
        {
            NickError::PageContext(message)
        }
        (_, TransportError::Closed) => NickError::BackendCrashed,
        (_, other) => NickError::TransportProtocol(other.to_string()),
    }
}

/// Classify an exception thrown by evaluated code (CDP reports these inline)
pub fn page_exception(kind: BackendKind, message: String) -> NickError {
    if kind == BackendKind::Cdp && CDP_CONTEXT_GONE.iter().any(|m| message.contains(m)) {
        return NickError::ContextDestroyed(message);
    }
    NickError::PageContext(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol(code: i64, message: &str) -> TransportError {
        TransportError::Protocol {
            code,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_cdp_context_destroyed() {
        let err = normalize(
            BackendKind::Cdp,
            protocol(-32000, "Execution context was destroyed."),
        );
        assert!(err.is_context_destroyed());

        let err = normalize(
            BackendKind::Cdp,
            protocol(-32000, "Cannot find context with specified id"),
        );
        assert!(err.is_context_destroyed());
    }

    #[test]
    fn test_cdp_protocol_fault() {
        let err = normalize(BackendKind::Cdp, protocol(-32601, "'Foo.bar' wasn't found"));
        assert!(matches!(err, NickError::TransportProtocol(_)));
        assert!(err.to_string().contains("Foo.bar"));
    }

    #[test]
    fn test_legacy_codes() {
        let err = normalize(BackendKind::StepQueue, protocol(2, "page is loading"));
        assert!(err.is_context_destroyed());

        let err = normalize(BackendKind::StepQueue, protocol(1, "ReferenceError: x"));
        assert!(matches!(err, NickError::PageContext(ref m) if m == "ReferenceError: x"));

        // Code 2 means nothing special to Chrome
        let err = normalize(BackendKind::Cdp, protocol(2, "page is loading"));
        assert!(matches!(err, NickError::TransportProtocol(_)));
    }

    #[test]
    fn test_closed_is_crash() {
        assert!(matches!(
            normalize(BackendKind::Cdp, TransportError::Closed),
            NickError::BackendCrashed
        ));
    }

    #[test]
    fn test_condition_timeout_message() {
        let single = NickError::ConditionTimeout {
            selectors: vec!["#login".to_string()],
            elapsed: Duration::from_millis(5010),
            condition: "not visible".to_string(),
        };
        assert_eq!(
            single.to_string(),
            "waited 5010ms but element \"#login\" still not visible"
        );

        let many = NickError::ConditionTimeout {
            selectors: vec!["#a".to_string(), "#b".to_string()],
            elapsed: Duration::from_millis(300),
            condition: "present".to_string(),
        };
        assert_eq!(
            many.to_string(),
            "waited 300ms but elements \"#a\", \"#b\" still present"
        );
    }
}
