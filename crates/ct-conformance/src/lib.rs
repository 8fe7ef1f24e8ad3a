#![forbid(unsafe_code)]

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ct_corpus::{CorpusError, DuplicatePolicy};
use ct_diff::{DiffLogEntry, DiffSummary, Tolerance};
use ct_runtime::{LifecycleError, ResourceConsumption, ResourceSpec, WaitBudget};
use ct_types::{RecordKey, TypeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod case;
pub mod echo;
pub mod results;
pub mod template;
pub mod transport;

pub use case::CorrectnessTestCase;
pub use echo::EchoService;
pub use results::{CorrectnessResults, ResultRow, ResultsDir};
pub use template::{ComponentDescriptor, TargetConfigTemplate};
pub use transport::{
    ChannelReceiver, ChannelSender, PipeEnds, RecordCallback, RecordReceiver, RecordSender,
    TransportError, channel_pipeline,
};

/// Harness-wide settings. Every field has a default, so a YAML file only
/// needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub results_root: PathBuf,
    /// Readiness wait inside target start.
    pub start_budget: WaitBudget,
    /// Thread-exit wait inside target stop.
    pub stop_budget: WaitBudget,
    /// All-observed wait while records are in flight.
    pub observe_budget: WaitBudget,
    pub tolerance: Tolerance,
    pub duplicate_policy: DuplicatePolicy,
    /// Dispatch the next record when egress stays silent for a whole
    /// observe interval, so a target that drops records cannot stall the run.
    pub stall_kick: bool,
    pub resource_spec: ResourceSpec,
    /// Fields the corpus readers derive record keys from.
    pub key_fields: Vec<String>,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        Self {
            results_root: repo_root.join("artifacts/correctness"),
            start_budget: WaitBudget::new(Duration::from_secs(1), Duration::from_secs(30)),
            stop_budget: WaitBudget::new(Duration::from_millis(10), Duration::from_secs(10)),
            observe_budget: WaitBudget::new(Duration::from_millis(100), Duration::from_secs(30)),
            tolerance: Tolerance::default(),
            duplicate_policy: DuplicatePolicy::Ignore,
            stall_kick: true,
            resource_spec: ResourceSpec::default(),
            key_fields: vec!["id".to_owned()],
        }
    }

    pub fn from_yaml_path(path: &Path) -> Result<Self, HarnessError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPhase {
    Ready,
    Stop,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ready => "target readiness",
            Self::Stop => "target shutdown",
        })
    }
}

/// Failures that abort a case before a verdict exists.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error("target config preparation failed: {0}")]
    ConfigPrepare(#[source] LifecycleError),
    #[error("target failed to start: {0}")]
    TargetStart(#[source] LifecycleError),
    #[error("timed out waiting for {phase} after {waited_ms} ms")]
    Timeout { phase: TimeoutPhase, waited_ms: u64 },
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pass,
    Fail,
}

impl CaseStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub test_name: String,
    pub result: CaseStatus,
    pub diff_count: usize,
}

/// A reason a completed run failed. One run can carry several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RunFailure {
    /// The corpus was never fully observed within the observe budget.
    Timeout {
        waited_ms: u64,
        unobserved: Vec<RecordKey>,
    },
    /// Egress produced keys that were never part of the corpus.
    UnrecognizedKeys { keys: Vec<RecordKey> },
    ContentMismatch { diff_count: usize },
    /// Repeat arrivals, reported only under [`DuplicatePolicy::Anomaly`].
    DuplicateDelivery { keys: Vec<RecordKey> },
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout {
                waited_ms,
                unobserved,
            } => write!(
                f,
                "timeout after {waited_ms} ms with {} record(s) unobserved",
                unobserved.len()
            ),
            Self::UnrecognizedKeys { keys } => {
                write!(f, "{} unrecognized key(s) on egress", keys.len())
            }
            Self::ContentMismatch { diff_count } => {
                write!(f, "{diff_count} record(s) differ from expectation")
            }
            Self::DuplicateDelivery { keys } => {
                write!(f, "{} duplicate delivery(ies)", keys.len())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectnessReport {
    pub verdict: Verdict,
    pub failures: Vec<RunFailure>,
    pub expected_records: usize,
    pub observed_records: usize,
    pub dispatched_records: usize,
    pub duplicate_arrivals: usize,
    pub summary: DiffSummary,
    pub diff_log: Vec<DiffLogEntry>,
    pub resources: ResourceConsumption,
    pub elapsed_ms: u64,
    pub forensic_log: ForensicLog,
}

impl CorrectnessReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.verdict.result == CaseStatus::Pass
    }

    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.failures
            .iter()
            .any(|failure| matches!(failure, RunFailure::Timeout { .. }))
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// Timeline events of one correctness run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ForensicEventKind {
    CaseStart {
        test_name: String,
        records: usize,
    },
    ConfigPrepared {
        path: String,
    },
    TargetStarted {
        test_name: String,
    },
    FirstDispatch {
        key: String,
    },
    StallKick {
        dispatched: usize,
        observed: usize,
    },
    ObserveFinished {
        observed: usize,
        expected: usize,
        timed_out: bool,
    },
    TargetStopped {
        stopped: bool,
    },
    CaseEnd {
        test_name: String,
        status: CaseStatus,
        diff_count: usize,
        elapsed_ms: u64,
    },
    Error {
        phase: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForensicEvent {
    pub ts_unix_ms: u64,
    pub event: ForensicEventKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForensicLog {
    pub events: Vec<ForensicEvent>,
}

impl ForensicLog {
    #[must_use]
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: ForensicEventKind) {
        self.events.push(ForensicEvent {
            ts_unix_ms: now_unix_ms(),
            event,
        });
    }

    /// Write the forensic log as JSONL to the given path.
    pub fn write_jsonl(&self, path: &Path) -> Result<(), HarnessError> {
        let mut file = fs::File::create(path)?;
        for entry in &self.events {
            let line = serde_json::to_string(entry)?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
/// Later calls are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
