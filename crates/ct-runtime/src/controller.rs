use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{ConfigCleanup, ConfigFile};
use crate::monitor::{ResourceConsumption, ResourceMonitor, ResourceSpec};
use crate::target::{Target, TargetContext, TargetKind};
use crate::{
    CancelToken, LifecycleError, LifecycleState, PollStep, StateCell, WaitBudget, WaitError,
    wait_until,
};

const DEFAULT_READY_BUDGET: WaitBudget =
    WaitBudget::new(Duration::from_secs(1), Duration::from_secs(30));
const DEFAULT_STOP_BUDGET: WaitBudget =
    WaitBudget::new(Duration::from_millis(10), Duration::from_secs(10));

#[derive(Debug, Clone)]
pub struct StartParams {
    pub name: String,
    pub args: Vec<String>,
    pub log_path: Option<PathBuf>,
    pub resource_spec: ResourceSpec,
    pub ready_budget: WaitBudget,
}

impl StartParams {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            log_path: None,
            resource_spec: ResourceSpec::default(),
            ready_budget: DEFAULT_READY_BUDGET,
        }
    }

    #[must_use]
    pub fn ready_budget(mut self, budget: WaitBudget) -> Self {
        self.ready_budget = budget;
        self
    }
}

/// Owns one system under test and its background thread.
///
/// `start` and `stop` block the caller until the target has reported running
/// or its thread has exited, each bounded by a [`WaitBudget`].
pub struct LifecycleController {
    target: Option<Box<dyn Target>>,
    kind: TargetKind,
    name: String,
    state: StateCell,
    shutdown: CancelToken,
    abort: CancelToken,
    config: Option<ConfigFile>,
    config_dir: Option<PathBuf>,
    worker: Option<JoinHandle<()>>,
    failure: Arc<Mutex<Option<String>>>,
    pid: Arc<Mutex<Option<u32>>>,
    resource_spec: ResourceSpec,
    monitor: Option<ResourceMonitor>,
    stop_budget: WaitBudget,
    stopped: bool,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("config", &self.config.as_ref().map(ConfigFile::path))
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    #[must_use]
    pub fn new(target: impl Target) -> Self {
        let kind = target.kind();
        Self {
            target: Some(Box::new(target)),
            kind,
            name: String::new(),
            state: StateCell::new(),
            shutdown: CancelToken::new(),
            abort: CancelToken::new(),
            config: None,
            config_dir: None,
            worker: None,
            failure: Arc::new(Mutex::new(None)),
            pid: Arc::new(Mutex::new(None)),
            resource_spec: ResourceSpec::default(),
            monitor: None,
            stop_budget: DEFAULT_STOP_BUDGET,
            stopped: false,
        }
    }

    #[must_use]
    pub fn with_stop_budget(mut self, budget: WaitBudget) -> Self {
        self.stop_budget = budget;
        self
    }

    /// Directory for the temporary config file; defaults to the system temp dir.
    #[must_use]
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    #[must_use]
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_ref().map(ConfigFile::path)
    }

    /// Token that interrupts a blocked `start` from another thread.
    #[must_use]
    pub fn abort_handle(&self) -> CancelToken {
        self.abort.clone()
    }

    /// Persists `text` where the target can read it at startup. A second call
    /// replaces the previous file.
    pub fn prepare_config(&mut self, text: &str) -> Result<ConfigCleanup, LifecycleError> {
        if self.worker.is_some() || self.stopped {
            return Err(LifecycleError::AlreadyStarted);
        }
        if let Some(previous) = self.config.take() {
            previous.cleanup()?;
        }
        let config = ConfigFile::write(text, self.config_dir.as_deref())?;
        tracing::debug!(path = %config.path().display(), "target config prepared");
        let handle = config.handle();
        self.config = Some(config);
        Ok(handle)
    }

    pub fn start(&mut self, params: StartParams) -> Result<(), LifecycleError> {
        if self.stopped || self.state.get() != LifecycleState::NotStarted {
            return Err(LifecycleError::AlreadyStarted);
        }
        let config_path = match &self.config {
            Some(config) if config.is_present() => config.path().to_path_buf(),
            _ => return Err(LifecycleError::ConfigNotPrepared),
        };
        let mut target = self.target.take().ok_or(LifecycleError::AlreadyStarted)?;

        self.name = params.name.clone();
        self.resource_spec = params.resource_spec;
        self.state.transition(LifecycleState::Starting)?;
        tracing::info!(target_name = %self.name, kind = ?self.kind, "starting target");

        let ctx = TargetContext {
            name: params.name.clone(),
            config_path,
            args: params.args.clone(),
            log_path: params.log_path.clone(),
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
            pid: Arc::clone(&self.pid),
        };
        let state = self.state.clone();
        let failure = Arc::clone(&self.failure);
        let spawned = thread::Builder::new()
            .name(format!("ct-target-{}", params.name))
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| target.run(&ctx)));
                let reason = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(_) => Some("target panicked".to_owned()),
                };
                settle_exit(&ctx, &state, &failure, reason);
            });
        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(err) => {
                let _ = self.state.transition(LifecycleState::Failed);
                return Err(LifecycleError::Spawn(err));
            }
        }

        let worker = self.worker.as_ref();
        let state = self.state.clone();
        let waited = wait_until(&params.ready_budget, Some(&self.abort), || {
            match state.get() {
                LifecycleState::Running => PollStep::Ready(()),
                LifecycleState::Starting if !worker.is_some_and(JoinHandle::is_finished) => {
                    PollStep::Pending
                }
                other => PollStep::Abort(other),
            }
        });
        match waited {
            Ok(()) => {
                tracing::info!(target_name = %self.name, "target running");
                Ok(())
            }
            Err(WaitError::Aborted(state)) => {
                let reason = self.failure.lock().clone();
                tracing::error!(
                    target_name = %self.name,
                    %state,
                    reason = reason.as_deref().unwrap_or(""),
                    "target failed to start"
                );
                Err(LifecycleError::TargetFailed { state, reason })
            }
            Err(WaitError::TimedOut { waited_ms }) => {
                tracing::error!(target_name = %self.name, waited_ms, "target never reported running");
                Err(LifecycleError::ReadyTimeout { waited_ms })
            }
            Err(WaitError::Cancelled) => Err(LifecycleError::Cancelled),
        }
    }

    /// Shuts the target down and waits for its thread. Returns `Ok(false)`
    /// on every call after the first without touching anything.
    ///
    /// When the thread outlives the stop budget the call still counts as the
    /// one stop: the config is removed and `StopTimeout` is returned.
    pub fn stop(&mut self) -> Result<bool, LifecycleError> {
        if self.stopped {
            return Ok(false);
        }
        self.stopped = true;

        match self.state.get() {
            LifecycleState::Starting | LifecycleState::Running => {
                // The thread may settle concurrently; losing that race is fine.
                let _ = self.state.transition(LifecycleState::Stopping);
            }
            LifecycleState::NotStarted => {
                let _ = self.state.transition(LifecycleState::Stopped);
            }
            LifecycleState::Stopping | LifecycleState::Stopped | LifecycleState::Failed => {}
        }
        self.shutdown.cancel();
        tracing::info!(target_name = %self.name, "stopping target");

        let joined = self.join_worker();
        let cleaned = self.remove_config();
        joined?;
        cleaned?;
        tracing::info!(target_name = %self.name, state = %self.state.get(), "target stopped");
        Ok(true)
    }

    fn join_worker(&mut self) -> Result<(), LifecycleError> {
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        let finished = wait_until(&self.stop_budget, None, || {
            if handle.is_finished() {
                PollStep::Ready(())
            } else {
                PollStep::<(), ()>::Pending
            }
        });
        match finished {
            Ok(()) => {
                // Panics are caught inside the thread, so join only fails if
                // the settle step itself panicked.
                if handle.join().is_err() {
                    tracing::error!(target_name = %self.name, "target thread panicked while exiting");
                }
                Ok(())
            }
            Err(WaitError::TimedOut { waited_ms }) => {
                tracing::error!(target_name = %self.name, waited_ms, "target thread did not exit");
                Err(LifecycleError::StopTimeout { waited_ms })
            }
            Err(WaitError::Cancelled | WaitError::Aborted(())) => Err(LifecycleError::Cancelled),
        }
    }

    #[cfg(not(windows))]
    fn remove_config(&mut self) -> Result<(), LifecycleError> {
        match &self.config {
            Some(config) => config.cleanup().map(|_| ()),
            None => Ok(()),
        }
    }

    // The just-stopped process may still hold the file open; the caller's
    // ConfigCleanup handle removes it later.
    #[cfg(windows)]
    fn remove_config(&mut self) -> Result<(), LifecycleError> {
        Ok(())
    }

    /// Starts sampling CPU/RAM. A no-op for in-process targets and on
    /// platforms without process sampling.
    pub fn watch_resource_consumption(&mut self) {
        if self.kind != TargetKind::Process {
            tracing::debug!(target_name = %self.name, "resource monitoring unavailable for in-process target");
            return;
        }
        let Some(pid) = *self.pid.lock() else {
            tracing::debug!(target_name = %self.name, "resource monitoring unavailable: no pid");
            return;
        };
        let mut monitor = ResourceMonitor::new(pid, self.resource_spec);
        if monitor.sample().is_none() {
            tracing::debug!(target_name = %self.name, pid, "resource monitoring unavailable on this platform");
            return;
        }
        self.monitor = Some(monitor);
    }

    /// Takes a fresh sample and renders it; empty when monitoring is off.
    pub fn get_resource_consumption(&mut self) -> String {
        let Some(monitor) = self.monitor.as_mut() else {
            return String::new();
        };
        match monitor.sample() {
            Some((cpu, ram)) => format!("PID={} CPU={cpu:.1}% RAM={ram:.1}MiB", monitor.pid()),
            None => String::new(),
        }
    }

    #[must_use]
    pub fn get_total_consumption(&self) -> ResourceConsumption {
        self.monitor
            .as_ref()
            .map(ResourceMonitor::total)
            .unwrap_or_default()
    }
}

fn settle_exit(
    ctx: &TargetContext,
    state: &StateCell,
    failure: &Mutex<Option<String>>,
    reason: Option<String>,
) {
    let current = state.get();
    let next = match current {
        LifecycleState::Stopping => LifecycleState::Stopped,
        LifecycleState::Starting | LifecycleState::Running => LifecycleState::Failed,
        LifecycleState::NotStarted | LifecycleState::Stopped | LifecycleState::Failed => return,
    };
    let reason = match (next, reason) {
        (LifecycleState::Failed, None) => Some("target exited before shutdown was requested".to_owned()),
        (_, reason) => reason,
    };
    if let Some(reason) = &reason {
        if next == LifecycleState::Failed {
            tracing::error!(target_name = ctx.name(), reason = %reason, "target failed");
        } else {
            tracing::warn!(target_name = ctx.name(), reason = %reason, "target reported an error while stopping");
        }
    }
    *failure.lock() = reason;
    if let Err(err) = state.transition(next) {
        tracing::warn!(target_name = ctx.name(), error = %err, "target exit raced another transition");
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        if !self.stopped
            && let Err(err) = self.stop()
        {
            tracing::warn!(target_name = %self.name, error = %err, "stop on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{LifecycleController, StartParams};
    use crate::target::{Target, TargetContext, TargetError, TargetKind};
    use crate::{LifecycleError, LifecycleState, WaitBudget};

    fn quick(max_wait_ms: u64) -> WaitBudget {
        WaitBudget::new(Duration::from_millis(5), Duration::from_millis(max_wait_ms))
    }

    struct ReadyTarget {
        runs: Arc<AtomicUsize>,
        exits: Arc<AtomicUsize>,
    }

    impl Target for ReadyTarget {
        fn kind(&self) -> TargetKind {
            TargetKind::InProcess
        }

        fn run(&mut self, ctx: &TargetContext) -> Result<(), TargetError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            assert!(ctx.config_path().exists(), "config must exist while running");
            ctx.report_ready();
            ctx.shutdown().wait();
            self.exits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingTarget;

    impl Target for FailingTarget {
        fn kind(&self) -> TargetKind {
            TargetKind::InProcess
        }

        fn run(&mut self, _ctx: &TargetContext) -> Result<(), TargetError> {
            Err(TargetError::Failed("bad config".to_owned()))
        }
    }

    struct SilentTarget;

    impl Target for SilentTarget {
        fn kind(&self) -> TargetKind {
            TargetKind::InProcess
        }

        fn run(&mut self, ctx: &TargetContext) -> Result<(), TargetError> {
            ctx.shutdown().wait();
            Ok(())
        }
    }

    struct StubbornTarget;

    impl Target for StubbornTarget {
        fn kind(&self) -> TargetKind {
            TargetKind::InProcess
        }

        fn run(&mut self, ctx: &TargetContext) -> Result<(), TargetError> {
            ctx.report_ready();
            ctx.shutdown().wait();
            thread::sleep(Duration::from_millis(300));
            Ok(())
        }
    }

    struct PanickingTarget;

    impl Target for PanickingTarget {
        fn kind(&self) -> TargetKind {
            TargetKind::InProcess
        }

        fn run(&mut self, _ctx: &TargetContext) -> Result<(), TargetError> {
            panic!("target blew up");
        }
    }

    #[test]
    fn start_blocks_until_running_and_stop_joins() {
        let runs = Arc::new(AtomicUsize::new(0));
        let exits = Arc::new(AtomicUsize::new(0));
        let mut controller = LifecycleController::new(ReadyTarget {
            runs: Arc::clone(&runs),
            exits: Arc::clone(&exits),
        });
        let config = controller.prepare_config("pipelines: {}\n").expect("config");
        let path = config.path().to_path_buf();
        controller
            .start(StartParams::new("ready").ready_budget(quick(2_000)))
            .expect("start");
        assert_eq!(controller.state(), LifecycleState::Running);
        assert!(path.exists());

        assert!(controller.stop().expect("stop"));
        assert_eq!(controller.state(), LifecycleState::Stopped);
        assert_eq!(exits.load(Ordering::SeqCst), 1, "thread exited before stop returned");
        assert!(!path.exists(), "stop removes the config");
        drop(config);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_stop_is_a_no_op() {
        let mut controller = LifecycleController::new(ReadyTarget {
            runs: Arc::new(AtomicUsize::new(0)),
            exits: Arc::new(AtomicUsize::new(0)),
        });
        let _config = controller.prepare_config("x: 1\n").expect("config");
        controller
            .start(StartParams::new("twice").ready_budget(quick(2_000)))
            .expect("start");
        assert!(controller.stop().expect("first stop"));
        assert!(!controller.stop().expect("second stop"));
        assert_eq!(controller.state(), LifecycleState::Stopped);
    }

    #[test]
    fn start_without_config_is_rejected() {
        let mut controller = LifecycleController::new(SilentTarget);
        let err = controller
            .start(StartParams::new("no-config"))
            .expect_err("config required");
        assert!(matches!(err, LifecycleError::ConfigNotPrepared), "{err:?}");
        assert_eq!(controller.state(), LifecycleState::NotStarted);
        assert!(controller.stop().expect("stop before start"));
        assert_eq!(controller.state(), LifecycleState::Stopped);
    }

    #[test]
    fn failed_start_then_stop_cleans_up_once() {
        let mut controller = LifecycleController::new(FailingTarget);
        let config = controller.prepare_config("broken: true\n").expect("config");
        let path = config.path().to_path_buf();
        let err = controller
            .start(StartParams::new("failing").ready_budget(quick(2_000)))
            .expect_err("start must fail");
        match err {
            LifecycleError::TargetFailed { state, reason } => {
                assert_eq!(state, LifecycleState::Failed);
                assert_eq!(reason.as_deref(), Some("target failed: bad config"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let started = Instant::now();
        assert!(controller.stop().expect("stop after failed start"));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!path.exists());
        assert_eq!(controller.state(), LifecycleState::Failed);
        assert!(!controller.stop().expect("idempotent"));
        assert!(!config.cleanup().expect("already cleaned"));
    }

    #[test]
    fn readiness_wait_is_bounded() {
        let mut controller = LifecycleController::new(SilentTarget);
        let _config = controller.prepare_config("x: 1\n").expect("config");
        let err = controller
            .start(StartParams::new("silent").ready_budget(quick(50)))
            .expect_err("never ready");
        assert!(matches!(err, LifecycleError::ReadyTimeout { .. }), "{err:?}");
        assert!(controller.stop().expect("stop"));
        assert_eq!(controller.state(), LifecycleState::Stopped);
    }

    #[test]
    fn abort_handle_interrupts_readiness_wait() {
        let mut controller = LifecycleController::new(SilentTarget);
        let _config = controller.prepare_config("x: 1\n").expect("config");
        let abort = controller.abort_handle();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            abort.cancel();
        });
        let err = controller
            .start(StartParams::new("aborted").ready_budget(quick(30_000)))
            .expect_err("aborted");
        canceller.join().expect("canceller");
        assert!(matches!(err, LifecycleError::Cancelled), "{err:?}");
        assert!(controller.stop().expect("stop"));
    }

    #[test]
    fn stop_wait_is_bounded() {
        let mut controller =
            LifecycleController::new(StubbornTarget).with_stop_budget(quick(20));
        let config = controller.prepare_config("x: 1\n").expect("config");
        let path = config.path().to_path_buf();
        controller
            .start(StartParams::new("stubborn").ready_budget(quick(2_000)))
            .expect("start");
        let err = controller.stop().expect_err("thread outlives budget");
        assert!(matches!(err, LifecycleError::StopTimeout { .. }), "{err:?}");
        assert!(!path.exists(), "config removed even on timeout");
        assert!(!controller.stop().expect("second stop"));
    }

    #[test]
    fn panicking_target_is_reported_failed() {
        let mut controller = LifecycleController::new(PanickingTarget);
        let _config = controller.prepare_config("x: 1\n").expect("config");
        let err = controller
            .start(StartParams::new("panics").ready_budget(quick(2_000)))
            .expect_err("panic");
        match err {
            LifecycleError::TargetFailed { reason, .. } => {
                assert_eq!(reason.as_deref(), Some("target panicked"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(controller.stop().expect("stop"));
    }

    #[test]
    fn prepare_config_replaces_previous_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut controller = LifecycleController::new(SilentTarget).with_config_dir(dir.path());
        let first = controller.prepare_config("a: 1\n").expect("first");
        let first_path = first.path().to_path_buf();
        let second = controller.prepare_config("a: 2\n").expect("second");
        assert!(!first_path.exists());
        assert_eq!(fs::read_to_string(second.path()).expect("read"), "a: 2\n");
        assert_eq!(controller.config_path(), Some(second.path()));
    }

    #[test]
    fn in_process_targets_report_zero_consumption() {
        let mut controller = LifecycleController::new(ReadyTarget {
            runs: Arc::new(AtomicUsize::new(0)),
            exits: Arc::new(AtomicUsize::new(0)),
        });
        let _config = controller.prepare_config("x: 1\n").expect("config");
        controller
            .start(StartParams::new("zero").ready_budget(quick(2_000)))
            .expect("start");
        controller.watch_resource_consumption();
        assert_eq!(controller.get_resource_consumption(), "");
        assert!(controller.get_total_consumption().is_unavailable());
        controller.stop().expect("stop");
    }

    #[test]
    fn dropping_a_running_controller_stops_it() {
        let exits = Arc::new(AtomicUsize::new(0));
        {
            let mut controller = LifecycleController::new(ReadyTarget {
                runs: Arc::new(AtomicUsize::new(0)),
                exits: Arc::clone(&exits),
            });
            let _config = controller.prepare_config("x: 1\n").expect("config");
            controller
                .start(StartParams::new("dropped").ready_budget(quick(2_000)))
                .expect("start");
        }
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }
}
