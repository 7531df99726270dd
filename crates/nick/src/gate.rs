//! Action Gate: one outstanding operation per tab
//!
//! `run` checks the tab state synchronously, then drives the operation on
//! its own task, racing it against the crash signal. The in-progress flag
//! is released before the result is delivered, so a continuation may
//! start the next action right away.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{NickError, Result};

pub struct ActionGate {
    tab_id: u64,
    closed: AtomicBool,
    in_progress: AtomicBool,
    crashed: watch::Sender<bool>,
}

impl ActionGate {
    pub fn new(tab_id: u64) -> Arc<Self> {
        Arc::new(Self {
            tab_id,
            closed: AtomicBool::new(false),
            in_progress: AtomicBool::new(false),
            crashed: watch::Sender::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_crashed(&self) -> bool {
        *self.crashed.borrow()
    }

    pub fn is_busy(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Terminal; any in-flight action resolves with `BackendCrashed`
    pub fn mark_crashed(&self) {
        if !self.crashed.send_replace(true) {
            tracing::warn!("[Tab {}] Marked as crashed", self.tab_id);
        }
    }

    /// The preconditions of `run`, without taking the gate
    pub fn check(&self) -> Result<()> {
        if self.is_closed() {
            return Err(NickError::SessionClosed);
        }
        if self.is_crashed() {
            return Err(NickError::BackendCrashed);
        }
        if self.is_busy() {
            return Err(NickError::ConcurrentAction);
        }
        Ok(())
    }

    fn acquire(self: &Arc<Self>) -> Result<GateGuard> {
        if self.is_closed() {
            return Err(NickError::SessionClosed);
        }
        if self.is_crashed() {
            return Err(NickError::BackendCrashed);
        }
        self.in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| NickError::ConcurrentAction)?;
        Ok(GateGuard { gate: self.clone() })
    }

    /// Start `operation` if the tab is free; misuse fails here, before any
    /// work is spawned
    pub fn run<T, F>(self: &Arc<Self>, operation: F) -> Result<Action<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.acquire()?;
        let crashed = self.crashed.subscribe();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let result = tokio::select! {
                result = operation => result,
                _ = crash_signal(crashed) => Err(NickError::BackendCrashed),
            };
            drop(guard);
            let _ = tx.send(result);
        });

        Ok(Action { rx })
    }

    /// Callback form of `run`
    pub fn run_with<T, F, C>(self: &Arc<Self>, operation: F, callback: C) -> Result<JoinHandle<()>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(Result<T>) + Send + 'static,
    {
        Ok(self.run(operation)?.then(callback))
    }
}

async fn crash_signal(mut crashed: watch::Receiver<bool>) {
    let signalled = crashed.wait_for(|c| *c).await.is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}

struct GateGuard {
    gate: Arc<ActionGate>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.in_progress.store(false, Ordering::SeqCst);
    }
}

/// Completion of one gated action
#[must_use = "an action reports its result only when awaited"]
pub struct Action<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T: Send + 'static> Action<T> {
    /// Deliver the result to `callback` instead of awaiting it
    pub fn then<C>(self, callback: C) -> JoinHandle<()>
    where
        C: FnOnce(Result<T>) + Send + 'static,
    {
        tokio::spawn(async move { callback(self.await) })
    }
}

impl<T> Future for Action<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(NickError::BackendCrashed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok, assert_pending, assert_ready_ok, task};

    #[tokio::test]
    async fn test_run_resets_flag() {
        let gate = ActionGate::new(1);
        let value = assert_ok!(gate.run(async { Ok(42) })).await;
        assert_eq!(value.unwrap(), 42);
        assert!(!gate.is_busy());

        let err = gate
            .run(async { Err::<(), _>(NickError::PageContext("boom".into())) })
            .unwrap()
            .await;
        assert!(matches!(err, Err(NickError::PageContext(_))));
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn test_second_action_fails_immediately() {
        let gate = ActionGate::new(1);
        let (release, wait) = oneshot::channel::<()>();
        let mut first = task::spawn(
            gate.run(async move {
                let _ = wait.await;
                Ok("first")
            })
            .unwrap(),
        );
        assert_pending!(first.poll());
        assert!(gate.is_busy());

        let second = gate.run(async { Ok("second") });
        assert!(matches!(second, Err(NickError::ConcurrentAction)));
        assert!(matches!(gate.check(), Err(NickError::ConcurrentAction)));

        release.send(()).unwrap();
        assert_eq!(first.await.unwrap(), "first");
        assert_ok!(gate.check());
    }

    #[tokio::test]
    async fn test_closed_gate_rejects() {
        let gate = ActionGate::new(1);
        gate.mark_closed();
        assert!(matches!(
            gate.run(async { Ok(()) }),
            Err(NickError::SessionClosed)
        ));
        assert_err!(gate.check());
    }

    #[tokio::test]
    async fn test_crash_resolves_inflight_action() {
        let gate = ActionGate::new(1);
        let pending = gate
            .run(std::future::pending::<Result<()>>())
            .unwrap();

        gate.mark_crashed();
        assert!(matches!(pending.await, Err(NickError::BackendCrashed)));
        assert!(!gate.is_busy());
        assert!(matches!(
            gate.run(async { Ok(()) }),
            Err(NickError::BackendCrashed)
        ));
    }

    #[tokio::test]
    async fn test_callback_sees_free_gate() {
        let gate = ActionGate::new(1);
        let (tx, rx) = oneshot::channel();
        let observer = gate.clone();

        let handle = gate
            .run_with(async { Ok(7) }, move |result| {
                let _ = tx.send((result.ok(), observer.is_busy()));
            })
            .unwrap();
        handle.await.unwrap();

        assert_eq!(rx.await.unwrap(), (Some(7), false));
    }

    #[tokio::test]
    async fn test_action_is_a_future() {
        let gate = ActionGate::new(1);
        let mut action = task::spawn(gate.run(async { Ok(1) }).unwrap());
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(assert_ready_ok!(action.poll()), 1);
    }
}
