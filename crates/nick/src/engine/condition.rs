//! Condition waits: until/while visible/present, over one or more
//! selectors combined with AND or OR.
//!
//! The predicate runs in the page, so a navigation can destroy the
//! context under an outstanding check. That is retried with whatever
//! time is left rather than reported.

use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

use crate::backend::PageDriver;
use crate::error::{NickError, Result};

pub const DEFAULT_WAIT: Duration = Duration::from_millis(10_000);

/// Runs in the page; `arg` is `{ selectors, visible }`. Answers one
/// boolean per selector, so every selector is checked in one round-trip
const PREDICATE: &str = r#"function (arg) {
    return arg.selectors.map(function (selector) {
        var nodes = document.querySelectorAll(selector);
        if (!arg.visible) {
            return nodes.length > 0;
        }
        for (var i = 0; i < nodes.length; i++) {
            var style = window.getComputedStyle(nodes[i]);
            var rect = nodes[i].getBoundingClientRect();
            if (style.display !== 'none' && style.visibility !== 'hidden'
                && rect.width > 0 && rect.height > 0) {
                return true;
            }
        }
        return false;
    });
}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operator {
    #[default]
    And,
    Or,
}

impl FromStr for Operator {
    type Err = NickError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "and" => Ok(Operator::And),
            "or" => Ok(Operator::Or),
            other => Err(NickError::InvalidArgument(format!(
                "operator must be \"and\" or \"or\", got \"{}\"",
                other
            ))),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::And => f.write_str("and"),
            Operator::Or => f.write_str("or"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    UntilVisible,
    WhileVisible,
    UntilPresent,
    WhilePresent,
}

impl WaitMode {
    fn visible(self) -> bool {
        matches!(self, WaitMode::UntilVisible | WaitMode::WhileVisible)
    }

    fn inverted(self) -> bool {
        matches!(self, WaitMode::WhileVisible | WaitMode::WhilePresent)
    }

    /// How an unmet selector is described on timeout ("... still not visible")
    pub fn condition(self) -> &'static str {
        match self {
            WaitMode::UntilVisible => "not visible",
            WaitMode::WhileVisible => "visible",
            WaitMode::UntilPresent => "not present",
            WaitMode::WhilePresent => "present",
        }
    }
}

/// Loosely typed optional argument; duration and operator may arrive in
/// either position
#[derive(Debug, Clone, PartialEq, Default)]
pub enum WaitArg {
    Number(i64),
    Text(String),
    #[default]
    Default,
}

macro_rules! wait_arg_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for WaitArg {
            fn from(n: $t) -> Self {
                WaitArg::Number(i64::try_from(n).unwrap_or(i64::MAX))
            }
        })*
    };
}

wait_arg_from_int!(i32, u32, i64, u64, usize);

impl From<Duration> for WaitArg {
    fn from(d: Duration) -> Self {
        WaitArg::Number(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }
}

impl From<&str> for WaitArg {
    fn from(s: &str) -> Self {
        WaitArg::Text(s.to_string())
    }
}

impl From<String> for WaitArg {
    fn from(s: String) -> Self {
        WaitArg::Text(s)
    }
}

impl From<Operator> for WaitArg {
    fn from(op: Operator) -> Self {
        WaitArg::Text(op.to_string())
    }
}

impl From<Option<i64>> for WaitArg {
    fn from(n: Option<i64>) -> Self {
        n.map(WaitArg::Number).unwrap_or_default()
    }
}

/// One selector or a list of them
#[derive(Debug, Clone, PartialEq)]
pub struct Selectors(pub Vec<String>);

impl From<&str> for Selectors {
    fn from(s: &str) -> Self {
        Selectors(vec![s.to_string()])
    }
}

impl From<String> for Selectors {
    fn from(s: String) -> Self {
        Selectors(vec![s])
    }
}

impl From<Vec<String>> for Selectors {
    fn from(v: Vec<String>) -> Self {
        Selectors(v)
    }
}

impl From<Vec<&str>> for Selectors {
    fn from(v: Vec<&str>) -> Self {
        Selectors(v.into_iter().map(String::from).collect())
    }
}

impl From<&[&str]> for Selectors {
    fn from(v: &[&str]) -> Self {
        Selectors(v.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Selectors {
    fn from(v: [&str; N]) -> Self {
        Selectors(v.iter().map(|s| s.to_string()).collect())
    }
}

/// A validated condition wait
#[derive(Debug, Clone, PartialEq)]
pub struct WaitSpec {
    pub mode: WaitMode,
    pub selectors: Vec<String>,
    pub duration: Duration,
    pub operator: Operator,
}

impl WaitSpec {
    pub fn new(
        mode: WaitMode,
        selectors: impl Into<Selectors>,
        first: impl Into<WaitArg>,
        second: impl Into<WaitArg>,
    ) -> Result<Self> {
        Self::with_default(mode, selectors, first, second, DEFAULT_WAIT)
    }

    /// Like `new`, with the duration used when none is given
    pub fn with_default(
        mode: WaitMode,
        selectors: impl Into<Selectors>,
        first: impl Into<WaitArg>,
        second: impl Into<WaitArg>,
        default_duration: Duration,
    ) -> Result<Self> {
        let Selectors(selectors) = selectors.into();
        if selectors.is_empty() {
            return Err(NickError::InvalidArgument(
                "at least one selector is required".into(),
            ));
        }
        if selectors.iter().any(|s| s.trim().is_empty()) {
            return Err(NickError::InvalidArgument(
                "selectors must not be empty".into(),
            ));
        }

        let (first, second) = (first.into(), second.into());
        // Operator given where the duration belongs
        let transposed = matches!(
            (&first, &second),
            (WaitArg::Text(text), WaitArg::Number(_) | WaitArg::Default)
                if text.trim().parse::<i64>().is_err()
        );
        let (duration, operator) = if transposed {
            (second, first)
        } else {
            (first, second)
        };

        let duration = match duration {
            WaitArg::Default => default_duration,
            WaitArg::Number(ms) if ms > 0 => Duration::from_millis(ms as u64),
            WaitArg::Text(text) => match text.trim().parse::<i64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms as u64),
                _ => {
                    return Err(NickError::InvalidArgument(format!(
                        "duration must be a positive number of milliseconds, got \"{}\"",
                        text
                    )))
                }
            },
            WaitArg::Number(ms) => {
                return Err(NickError::InvalidArgument(format!(
                    "duration must be greater than 0, got {}",
                    ms
                )))
            }
        };

        let operator = match operator {
            WaitArg::Default => Operator::default(),
            WaitArg::Text(text) => text.parse()?,
            WaitArg::Number(n) => {
                return Err(NickError::InvalidArgument(format!(
                    "operator must be \"and\" or \"or\", got {}",
                    n
                )))
            }
        };

        Ok(Self {
            mode,
            selectors,
            duration,
            operator,
        })
    }
}

/// Index of the first selector satisfying `mode`, if any
async fn check<D: PageDriver + ?Sized>(
    driver: &D,
    selectors: &[String],
    mode: WaitMode,
) -> Result<Option<usize>> {
    let value = driver
        .evaluate(
            PREDICATE,
            json!({ "selectors": selectors, "visible": mode.visible() }),
        )
        .await?;
    let states = value.as_array().map(Vec::as_slice).unwrap_or_default();
    Ok((0..selectors.len()).find(|&i| {
        let matched = states.get(i).and_then(|v| v.as_bool()).unwrap_or(false);
        matched != mode.inverted()
    }))
}

/// Poll `selectors` until one satisfies `mode` or `budget` runs out.
/// A running check is only ever cut short by the budget itself
async fn poll_until<D: PageDriver + ?Sized>(
    driver: &D,
    selectors: &[String],
    mode: WaitMode,
    budget: Duration,
    poll: Duration,
) -> Result<Option<usize>> {
    let started = Instant::now();
    loop {
        let remaining = budget.saturating_sub(started.elapsed()).max(poll);
        match tokio::time::timeout(remaining, check(driver, selectors, mode)).await {
            Ok(Ok(Some(index))) => return Ok(Some(index)),
            Ok(Ok(None)) | Err(_) => {}
            Ok(Err(e)) if e.is_context_destroyed() => {
                tracing::debug!(
                    "[Condition] Context destroyed while checking {}, retrying with {:?} left",
                    selectors.join(", "),
                    budget.saturating_sub(started.elapsed())
                );
            }
            Ok(Err(e)) => return Err(e),
        }
        if started.elapsed() > budget {
            return Ok(None);
        }
        tokio::time::sleep(poll).await;
    }
}

/// Run a wait; OR returns the selector that matched, AND returns None
pub async fn wait<D: PageDriver + ?Sized>(
    driver: &D,
    spec: &WaitSpec,
    poll: Duration,
) -> Result<Option<String>> {
    tracing::debug!(
        "[Condition] {:?} {} ({}, {:?})",
        spec.mode,
        spec.selectors.join(", "),
        spec.operator,
        spec.duration
    );
    match spec.operator {
        Operator::And => wait_all(driver, spec, poll).await.map(|_| None),
        Operator::Or => wait_any(driver, spec, poll).await.map(Some),
    }
}

async fn wait_all<D: PageDriver + ?Sized>(driver: &D, spec: &WaitSpec, poll: Duration) -> Result<()> {
    let started = Instant::now();
    for selector in &spec.selectors {
        let budget = spec.duration.saturating_sub(started.elapsed()).max(poll * 2);
        let single = std::slice::from_ref(selector);
        if poll_until(driver, single, spec.mode, budget, poll).await?.is_none() {
            return Err(NickError::ConditionTimeout {
                selectors: vec![selector.clone()],
                elapsed: started.elapsed(),
                condition: spec.mode.condition().to_string(),
            });
        }
    }
    Ok(())
}

/// Every selector is tested on every poll, so each gets the whole budget
async fn wait_any<D: PageDriver + ?Sized>(
    driver: &D,
    spec: &WaitSpec,
    poll: Duration,
) -> Result<String> {
    let started = Instant::now();
    match poll_until(driver, &spec.selectors, spec.mode, spec.duration, poll).await? {
        Some(index) => Ok(spec.selectors[index].clone()),
        None => Err(NickError::ConditionTimeout {
            selectors: spec.selectors.clone(),
            elapsed: started.elapsed(),
            condition: spec.mode.condition().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CdpDriver;
    use crate::config::BrowserConfig;
    use crate::backend::StepQueueDriver;
    use crate::testing::{evaluated, states, MockTransport, SlowTransport};
    use crate::transport::TransportError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const POLL: Duration = Duration::from_millis(25);

    async fn driver(mock: Arc<MockTransport>) -> CdpDriver {
        CdpDriver::new(1, mock, &BrowserConfig::default(), Arc::new(|| {}))
            .await
            .unwrap()
    }

    #[test]
    fn test_spec_defaults() {
        let spec = WaitSpec::new(WaitMode::UntilVisible, "#login", WaitArg::Default, WaitArg::Default)
            .unwrap();
        assert_eq!(spec.selectors, vec!["#login".to_string()]);
        assert_eq!(spec.duration, DEFAULT_WAIT);
        assert_eq!(spec.operator, Operator::And);
    }

    #[test]
    fn test_spec_transposed_arguments() {
        let spec = WaitSpec::new(WaitMode::UntilPresent, ["#a", "#b"], "OR", 5000).unwrap();
        assert_eq!(spec.duration, Duration::from_millis(5000));
        assert_eq!(spec.operator, Operator::Or);

        let spec = WaitSpec::new(WaitMode::UntilPresent, "#a", "or", WaitArg::Default).unwrap();
        assert_eq!(spec.duration, DEFAULT_WAIT);
        assert_eq!(spec.operator, Operator::Or);
    }

    #[test]
    fn test_spec_validation() {
        let invalid = |r: Result<WaitSpec>| matches!(r, Err(NickError::InvalidArgument(_)));

        assert!(invalid(WaitSpec::new(WaitMode::UntilVisible, Vec::<String>::new(), 100, "and")));
        assert!(invalid(WaitSpec::new(WaitMode::UntilVisible, vec!["#a", "  "], 100, "and")));
        assert!(invalid(WaitSpec::new(WaitMode::UntilVisible, "#a", 0, "and")));
        assert!(invalid(WaitSpec::new(WaitMode::UntilVisible, "#a", -5, "and")));
        assert!(invalid(WaitSpec::new(WaitMode::UntilVisible, "#a", 100, "xor")));
        assert!(invalid(WaitSpec::new(WaitMode::UntilVisible, "#a", "soon", "and")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_and_fails_on_unmet_selector() {
        let mock = MockTransport::new(|_, method, params| match method {
            "Runtime.evaluate" => Ok(evaluated(states(params, |s| s == "#a"))),
            _ => Ok(json!({})),
        });
        let driver = driver(mock).await;
        let spec = WaitSpec::new(WaitMode::UntilVisible, ["#a", "#b"], 1000, "and").unwrap();

        let err = wait(&driver, &spec, POLL).await.unwrap_err();
        match err {
            NickError::ConditionTimeout {
                ref selectors,
                elapsed,
                ..
            } => {
                assert_eq!(selectors, &vec!["#b".to_string()]);
                assert!(elapsed >= Duration::from_millis(1000));
            }
            ref other => panic!("Expected condition timeout, got {:?}", other),
        }
        assert_eq!(err.to_string().split(" but ").nth(1), Some("element \"#b\" still not visible"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_or_tries_every_selector() {
        let mock = MockTransport::new(|_, method, params| match method {
            "Runtime.evaluate" => Ok(evaluated(states(params, |s| s == "#guest"))),
            _ => Ok(json!({})),
        });
        let driver = driver(mock).await;
        let spec = WaitSpec::new(WaitMode::UntilVisible, ["#login", "#guest"], 5000, "or").unwrap();

        let matched = wait(&driver, &spec, POLL).await.unwrap();
        assert_eq!(matched.as_deref(), Some("#guest"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_or_timeout_lists_all() {
        let mock = MockTransport::new(|_, method, params| match method {
            "Runtime.evaluate" => Ok(evaluated(states(params, |_| false))),
            _ => Ok(json!({})),
        });
        let driver = driver(mock).await;
        let spec = WaitSpec::new(WaitMode::UntilPresent, ["#a", "#b"], 300, "or").unwrap();

        let err = wait(&driver, &spec, POLL).await.unwrap_err();
        assert!(matches!(
            err,
            NickError::ConditionTimeout { ref selectors, elapsed, .. }
                if selectors.len() == 2 && elapsed > Duration::from_millis(300)
        ));
        assert!(err.to_string().contains("elements \"#a\", \"#b\" still not present"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_evaluate_still_matches() {
        let mock = MockTransport::new(|_, method, params| match method {
            "Runtime.evaluate" => Ok(evaluated(states(params, |_| true))),
            _ => Ok(json!({})),
        });
        let slow = SlowTransport::new(mock.clone(), "Runtime.evaluate", Duration::from_millis(80));
        let driver = CdpDriver::new(1, slow, &BrowserConfig::default(), Arc::new(|| {}))
            .await
            .unwrap();

        let started = Instant::now();
        let any = WaitSpec::new(WaitMode::UntilPresent, ["#a", "#b"], 2000, "or").unwrap();
        assert_eq!(wait(&driver, &any, POLL).await.unwrap().as_deref(), Some("#a"));
        let all = WaitSpec::new(WaitMode::UntilPresent, ["#a", "#b"], 2000, "and").unwrap();
        assert_eq!(wait(&driver, &all, POLL).await.unwrap(), None);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_or_checks_all_selectors_at_once() {
        let mock = MockTransport::new(|_, method, params| match method {
            "Runtime.evaluate" => Ok(evaluated(states(params, |s| s == "#c"))),
            _ => Ok(json!({})),
        });
        let driver = driver(mock.clone()).await;
        let spec = WaitSpec::new(WaitMode::UntilVisible, ["#a", "#b", "#c"], 1000, "or").unwrap();

        assert_eq!(wait(&driver, &spec, POLL).await.unwrap().as_deref(), Some("#c"));
        assert_eq!(mock.params_of("Runtime.evaluate").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_queue_wait() {
        let mock = MockTransport::new(|_, method, params| match method {
            "evaluate" => Ok(json!({ "value": states(params, |s| s == "#b") })),
            _ => Ok(json!({})),
        });
        let driver = StepQueueDriver::new(1, mock, &BrowserConfig::default())
            .await
            .unwrap();

        let any = WaitSpec::new(WaitMode::UntilPresent, ["#a", "#b"], 1000, "or").unwrap();
        assert_eq!(wait(&driver, &any, POLL).await.unwrap().as_deref(), Some("#b"));

        let all = WaitSpec::new(WaitMode::UntilPresent, ["#b", "#a"], 300, "and").unwrap();
        let err = wait(&driver, &all, POLL).await.unwrap_err();
        assert!(matches!(
            err,
            NickError::ConditionTimeout { ref selectors, .. } if selectors == &vec!["#a".to_string()]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_while_visible_waits_for_disappearance() {
        let started = Instant::now();
        let mock = MockTransport::new(move |_, method, params| match method {
            "Runtime.evaluate" => Ok(evaluated(states(params, |_| {
                started.elapsed() < Duration::from_millis(200)
            }))),
            _ => Ok(json!({})),
        });
        let driver = driver(mock).await;
        let spec = WaitSpec::new(WaitMode::WhileVisible, ".spinner", 1000, "and").unwrap();

        assert_eq!(wait(&driver, &spec, POLL).await.unwrap(), None);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_destroyed_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mock = MockTransport::new(move |_, method, params| match method {
            "Runtime.evaluate" => {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(TransportError::Protocol {
                        code: -32000,
                        message: "Execution context was destroyed.".into(),
                    })
                } else {
                    Ok(evaluated(states(params, |_| true)))
                }
            }
            _ => Ok(json!({})),
        });
        let driver = driver(mock).await;
        let spec = WaitSpec::new(WaitMode::UntilVisible, "#login", 1000, "and").unwrap();

        assert_eq!(wait(&driver, &spec, POLL).await.unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_destroyed_keeps_budget() {
        let mock = MockTransport::new(|_, method, _| match method {
            "Runtime.evaluate" => Err(TransportError::Protocol {
                code: -32000,
                message: "Cannot find context with specified id".into(),
            }),
            _ => Ok(json!({})),
        });
        let driver = driver(mock).await;
        let spec = WaitSpec::new(WaitMode::UntilVisible, "#login", 400, "and").unwrap();

        let started = Instant::now();
        let err = wait(&driver, &spec, POLL).await.unwrap_err();
        assert!(matches!(err, NickError::ConditionTimeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_page_exception_surfaces() {
        let mock = MockTransport::new(|_, method, _| match method {
            "Runtime.evaluate" => Ok(json!({
                "result": { "type": "object" },
                "exceptionDetails": {
                    "text": "Uncaught",
                    "exception": { "description": "SyntaxError: '##' is not a valid selector" },
                },
            })),
            _ => Ok(json!({})),
        });
        let driver = driver(mock).await;
        let spec = WaitSpec::new(WaitMode::UntilPresent, "##", 1000, "and").unwrap();

        let err = wait(&driver, &spec, POLL).await.unwrap_err();
        assert!(matches!(err, NickError::PageContext(_)));
    }
}
