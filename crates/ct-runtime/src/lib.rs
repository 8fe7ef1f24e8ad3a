#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod config;
mod controller;
pub mod monitor;
pub mod process;
pub mod target;

pub use config::{ConfigCleanup, ConfigFile};
pub use controller::{LifecycleController, StartParams};
pub use monitor::{ResourceConsumption, ResourceMonitor, ResourceSpec};
pub use process::ProcessTarget;
pub use target::{Target, TargetContext, TargetError, TargetKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl LifecycleState {
    /// Legal edges of the lifecycle state machine. `Failed` is absorbing.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use LifecycleState::{Failed, NotStarted, Running, Starting, Stopped, Stopping};
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (NotStarted, Stopped)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal lifecycle transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Shared lifecycle state. Writers go through [`StateCell::transition`], so
/// only legal edges are ever taken.
#[derive(Debug, Clone)]
pub struct StateCell {
    inner: Arc<Mutex<LifecycleState>>,
}

impl StateCell {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LifecycleState::NotStarted)),
        }
    }

    #[must_use]
    pub fn get(&self) -> LifecycleState {
        *self.inner.lock()
    }

    pub fn transition(&self, to: LifecycleState) -> Result<LifecycleState, IllegalTransition> {
        let mut state = self.inner.lock();
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(IllegalTransition { from, to });
        }
        *state = to;
        tracing::debug!(%from, %to, "lifecycle transition");
        Ok(from)
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

/// One-shot cancellation signal that sleeping waiters can observe promptly.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        if !*cancelled {
            *cancelled = true;
            self.inner.signal.notify_all();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Sleeps up to `timeout`; returns `true` as soon as the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self
                .inner
                .signal
                .wait_until(&mut cancelled, deadline)
                .timed_out()
            {
                break;
            }
        }
        *cancelled
    }

    /// Blocks until the token is cancelled.
    pub fn wait(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            self.inner.signal.wait(&mut cancelled);
        }
    }
}

/// Poll interval plus the maximum total time a wait may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitBudget {
    pub interval_ms: u64,
    pub max_wait_ms: u64,
}

impl WaitBudget {
    #[must_use]
    pub const fn new(interval: Duration, max_wait: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            max_wait_ms: max_wait.as_millis() as u64,
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Outcome of one probe inside [`wait_until`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep<T, E> {
    Ready(T),
    Pending,
    Abort(E),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError<E> {
    #[error("wait timed out after {waited_ms} ms")]
    TimedOut { waited_ms: u64 },
    #[error("wait cancelled")]
    Cancelled,
    #[error("wait aborted")]
    Aborted(E),
}

/// Runs `probe` every `budget.interval()` until it is ready, aborts, the
/// deadline passes or `cancel` fires. The probe always runs at least once.
pub fn wait_until<T, E>(
    budget: &WaitBudget,
    cancel: Option<&CancelToken>,
    mut probe: impl FnMut() -> PollStep<T, E>,
) -> Result<T, WaitError<E>> {
    let started = Instant::now();
    let deadline = started + budget.max_wait();
    loop {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(WaitError::Cancelled);
        }
        match probe() {
            PollStep::Ready(value) => return Ok(value),
            PollStep::Abort(err) => return Err(WaitError::Aborted(err)),
            PollStep::Pending => {}
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::TimedOut {
                waited_ms: now.duration_since(started).as_millis() as u64,
            });
        }
        let pause = budget.interval().min(deadline - now);
        match cancel {
            Some(token) => {
                if token.wait_timeout(pause) {
                    return Err(WaitError::Cancelled);
                }
            }
            None => thread::sleep(pause),
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to persist target config: {0}")]
    ConfigWrite(#[source] std::io::Error),
    #[error("failed to remove target config: {0}")]
    ConfigCleanup(#[source] std::io::Error),
    #[error("target config must be prepared before start")]
    ConfigNotPrepared,
    #[error("target was already started")]
    AlreadyStarted,
    #[error("failed to spawn target thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(
        "target reported {state} while starting: {}",
        .reason.as_deref().unwrap_or("no reason reported")
    )]
    TargetFailed {
        state: LifecycleState,
        reason: Option<String>,
    },
    #[error("target did not report running within {waited_ms} ms")]
    ReadyTimeout { waited_ms: u64 },
    #[error("target thread did not exit within {waited_ms} ms")]
    StopTimeout { waited_ms: u64 },
    #[error("lifecycle wait cancelled")]
    Cancelled,
    #[error(transparent)]
    Transition(#[from] IllegalTransition),
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{
        CancelToken, IllegalTransition, LifecycleState, PollStep, StateCell, WaitBudget,
        WaitError, wait_until,
    };

    #[test]
    fn failed_is_absorbing() {
        for next in [
            LifecycleState::NotStarted,
            LifecycleState::Starting,
            LifecycleState::Running,
            LifecycleState::Stopping,
            LifecycleState::Stopped,
        ] {
            assert!(!LifecycleState::Failed.can_transition_to(next), "{next}");
        }
    }

    #[test]
    fn state_cell_rejects_illegal_edges() {
        let cell = StateCell::new();
        let err = cell
            .transition(LifecycleState::Running)
            .expect_err("cannot skip starting");
        assert_eq!(
            err,
            IllegalTransition {
                from: LifecycleState::NotStarted,
                to: LifecycleState::Running
            }
        );
        cell.transition(LifecycleState::Starting).expect("start");
        cell.transition(LifecycleState::Running).expect("run");
        cell.transition(LifecycleState::Stopping).expect("stop");
        cell.transition(LifecycleState::Stopped).expect("stopped");
        assert!(cell.get().is_terminal());
        assert!(cell.transition(LifecycleState::Failed).is_err());
    }

    #[test]
    fn cancel_wakes_waiter_early() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(handle.join().expect("waiter"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wait_timeout_without_cancel_returns_false() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(5)));
        token.cancel();
        assert!(token.wait_timeout(Duration::from_secs(5)));
        token.wait();
    }

    #[test]
    fn wait_until_returns_ready_value() {
        let budget = WaitBudget::new(Duration::from_millis(1), Duration::from_secs(5));
        let mut calls = 0;
        let result: Result<u32, WaitError<()>> = wait_until(&budget, None, || {
            calls += 1;
            if calls == 3 {
                PollStep::Ready(7)
            } else {
                PollStep::Pending
            }
        });
        assert_eq!(result, Ok(7));
        assert_eq!(calls, 3);
    }

    #[test]
    fn wait_until_times_out_instead_of_hanging() {
        let budget = WaitBudget::new(Duration::from_millis(5), Duration::from_millis(30));
        let result: Result<(), WaitError<()>> = wait_until(&budget, None, || PollStep::Pending);
        match result {
            Err(WaitError::TimedOut { waited_ms }) => assert!(waited_ms >= 30),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn wait_until_stops_on_abort_without_further_polls() {
        let budget = WaitBudget::new(Duration::from_millis(1), Duration::from_secs(5));
        let mut calls = 0;
        let result: Result<(), WaitError<&str>> = wait_until(&budget, None, || {
            calls += 1;
            PollStep::Abort("boom")
        });
        assert_eq!(result, Err(WaitError::Aborted("boom")));
        assert_eq!(calls, 1);
    }

    #[test]
    fn wait_until_honours_cancellation() {
        let token = CancelToken::new();
        let canceller = token.clone();
        let budget = WaitBudget::new(Duration::from_millis(50), Duration::from_secs(30));
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        let result: Result<(), WaitError<()>> =
            wait_until(&budget, Some(&token), || PollStep::Pending);
        handle.join().expect("canceller");
        assert_eq!(result, Err(WaitError::Cancelled));
    }
}
