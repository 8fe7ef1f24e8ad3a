#![forbid(unsafe_code)]

//! End-to-end correctness runs through the in-memory channel pipeline.
//!
//! Each scenario starts a real controller thread, a real egress delivery
//! thread and the orchestrator's observe loop.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use ct_conformance::{
    CaseStatus, ChannelReceiver, ChannelSender, CorrectnessResults, CorrectnessTestCase,
    EchoService, HarnessConfig, HarnessError, PipeEnds, RecordCallback, RecordReceiver,
    RecordSender, ResultsDir, RunFailure, TimeoutPhase, TransportError, channel_pipeline,
};
use ct_corpus::{DuplicatePolicy, corpus_from_jsonl_str};
use ct_diff::Tolerance;
use ct_runtime::{LifecycleError, Target, TargetContext, TargetError, TargetKind, WaitBudget};
use ct_types::{Corpus, FieldDiff, FieldValue, Fields, Record, RecordKey};
use parking_lot::Mutex;

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn fast_config() -> HarnessConfig {
    HarnessConfig {
        start_budget: WaitBudget::new(Duration::from_millis(5), Duration::from_secs(5)),
        stop_budget: WaitBudget::new(Duration::from_millis(5), Duration::from_secs(5)),
        observe_budget: WaitBudget::new(Duration::from_millis(10), Duration::from_secs(10)),
        ..HarnessConfig::default_paths()
    }
}

fn lossy_config() -> HarnessConfig {
    HarnessConfig {
        observe_budget: WaitBudget::new(Duration::from_millis(10), Duration::from_millis(300)),
        ..fast_config()
    }
}

fn record(key: &str, score: f64) -> Record {
    let mut fields = Fields::new();
    fields.insert("id".to_owned(), FieldValue::from(key));
    fields.insert("score".to_owned(), FieldValue::Float64(score));
    fields.insert("active".to_owned(), FieldValue::Bool(true));
    Record::new(key, fields)
}

fn abc() -> Corpus {
    Corpus::new(vec![record("A", 1.5), record("B", 2.5), record("C", 3.5)]).expect("corpus")
}

fn keys(names: &[&str]) -> Vec<RecordKey> {
    names.iter().map(|name| RecordKey::new(*name)).collect()
}

/// Emits every ingress record twice.
struct DoublingTarget {
    ends: PipeEnds,
}

impl Target for DoublingTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::InProcess
    }

    fn run(&mut self, ctx: &TargetContext) -> Result<(), TargetError> {
        ctx.report_ready();
        while !ctx.shutdown().is_cancelled() {
            match self.ends.ingress.recv_timeout(Duration::from_millis(5)) {
                Ok(record) => {
                    for copy in [record.clone(), record] {
                        self.ends
                            .egress
                            .send(copy)
                            .map_err(|_| TargetError::Failed("egress gone".to_owned()))?;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => ctx.shutdown().wait(),
            }
        }
        Ok(())
    }
}

/// Remembers where its config was written, then refuses to start.
struct RefusingTarget {
    seen_config: Arc<Mutex<Option<PathBuf>>>,
}

impl Target for RefusingTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::InProcess
    }

    fn run(&mut self, ctx: &TargetContext) -> Result<(), TargetError> {
        *self.seen_config.lock() = Some(ctx.config_path().to_path_buf());
        Err(TargetError::Failed("refusing to start".to_owned()))
    }
}

/// Never reports running.
struct MuteTarget;

impl Target for MuteTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::InProcess
    }

    fn run(&mut self, ctx: &TargetContext) -> Result<(), TargetError> {
        ctx.shutdown().wait();
        Ok(())
    }
}

/// Reports ready and idles until shutdown; the transport does the echoing.
struct IdleTarget;

impl Target for IdleTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::InProcess
    }

    fn run(&mut self, ctx: &TargetContext) -> Result<(), TargetError> {
        ctx.report_ready();
        ctx.shutdown().wait();
        Ok(())
    }
}

type CallbackSlot = Arc<Mutex<Option<RecordCallback>>>;

/// Delivers each sent record to the receive callback on the sending thread.
struct LoopbackSender {
    slot: CallbackSlot,
}

impl RecordSender for LoopbackSender {
    fn start(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn send(&mut self, record: Record) -> Result<(), TransportError> {
        let mut slot = self.slot.lock();
        let callback = slot.as_mut().ok_or(TransportError::NotStarted)?;
        callback(record);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct LoopbackReceiver {
    slot: CallbackSlot,
}

impl RecordReceiver for LoopbackReceiver {
    fn start(&mut self, on_record: RecordCallback) -> Result<(), TransportError> {
        *self.slot.lock() = Some(on_record);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        self.slot.lock().take();
        Ok(())
    }
}

fn loopback() -> (LoopbackSender, LoopbackReceiver) {
    let slot: CallbackSlot = Arc::new(Mutex::new(None));
    (
        LoopbackSender {
            slot: Arc::clone(&slot),
        },
        LoopbackReceiver { slot },
    )
}

#[derive(Debug, Default)]
struct FlightLog {
    sent: usize,
    acknowledged: BTreeSet<RecordKey>,
    max_in_flight: usize,
}

/// Channel sender that notes how many records are unacknowledged per send.
struct TrackedSender {
    inner: ChannelSender,
    log: Arc<Mutex<FlightLog>>,
}

impl RecordSender for TrackedSender {
    fn start(&mut self) -> Result<(), TransportError> {
        self.inner.start()
    }

    fn send(&mut self, record: Record) -> Result<(), TransportError> {
        {
            let mut log = self.log.lock();
            log.sent += 1;
            let in_flight = log.sent - log.acknowledged.len();
            log.max_in_flight = log.max_in_flight.max(in_flight);
        }
        self.inner.send(record)
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        self.inner.stop()
    }
}

struct TrackedReceiver {
    inner: ChannelReceiver,
    log: Arc<Mutex<FlightLog>>,
}

impl RecordReceiver for TrackedReceiver {
    fn start(&mut self, mut on_record: RecordCallback) -> Result<(), TransportError> {
        let log = Arc::clone(&self.log);
        self.inner.start(Box::new(move |record: Record| {
            log.lock().acknowledged.insert(record.key.clone());
            on_record(record);
        }))
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        self.inner.stop()
    }
}

#[test]
fn echo_target_passes_with_zero_diffs() {
    init_test_tracing();
    let case = CorrectnessTestCase::new("echo", abc(), fast_config());
    let (sender, receiver, ends) = channel_pipeline();
    let report = case
        .run(EchoService::new(ends), sender, receiver)
        .expect("run");

    assert_eq!(report.verdict.result, CaseStatus::Pass);
    assert_eq!(report.verdict.diff_count, 0);
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.observed_records, 3);
    assert_eq!(report.dispatched_records, 3);
    assert_eq!(report.summary.accepted, 3);
    assert!(report.diff_log.is_empty());
    assert!(report.is_green());
    assert!(report.resources.is_unavailable());
}

#[test]
fn single_mutation_counts_one_diff_and_fails() {
    init_test_tracing();
    let case = CorrectnessTestCase::new("mutated", abc(), fast_config());
    let (sender, receiver, ends) = channel_pipeline();
    let target = EchoService::new(ends).with_transform(|record| {
        if record.key.as_str() == "B" {
            Some(record.with_field("score", 99.0))
        } else {
            Some(record)
        }
    });
    let report = case.run(target, sender, receiver).expect("run");

    assert_eq!(report.verdict.result, CaseStatus::Fail);
    assert_eq!(report.verdict.diff_count, 1);
    assert_eq!(
        report.failures,
        vec![RunFailure::ContentMismatch { diff_count: 1 }]
    );
    assert!(!report.timed_out());
    assert_eq!(report.diff_log.len(), 1);
    assert_eq!(report.diff_log[0].key, RecordKey::new("B"));
    assert_eq!(report.diff_log[0].diffs[0].field, "score");
}

#[test]
fn dropped_record_times_out_without_content_diffs() {
    init_test_tracing();
    let case = CorrectnessTestCase::new("lossy", abc(), lossy_config());
    let (sender, receiver, ends) = channel_pipeline();
    let target = EchoService::new(ends)
        .with_transform(|record| (record.key.as_str() != "B").then_some(record));
    let started = Instant::now();
    let report = case.run(target, sender, receiver).expect("run");

    assert!(started.elapsed() < Duration::from_secs(5), "must not hang");
    assert_eq!(report.verdict.result, CaseStatus::Fail);
    assert_eq!(report.verdict.diff_count, 0);
    assert!(report.timed_out());
    assert_eq!(report.failures.len(), 1, "{:?}", report.failures);
    match &report.failures[0] {
        RunFailure::Timeout { unobserved, .. } => assert_eq!(unobserved, &keys(&["B"])),
        other => panic!("expected timeout, got {other:?}"),
    }
    // C was still sent and judged: the stall kick moved past the lost B.
    assert_eq!(report.dispatched_records, 3);
    assert_eq!(report.observed_records, 2);
}

#[test]
fn without_stall_kick_a_dropped_record_blocks_the_chain() {
    init_test_tracing();
    let config = HarnessConfig {
        stall_kick: false,
        ..lossy_config()
    };
    let case = CorrectnessTestCase::new("lossy-no-kick", abc(), config);
    let (sender, receiver, ends) = channel_pipeline();
    let target = EchoService::new(ends)
        .with_transform(|record| (record.key.as_str() != "B").then_some(record));
    let report = case.run(target, sender, receiver).expect("run");

    assert!(report.timed_out());
    assert_eq!(report.dispatched_records, 2);
    assert_eq!(report.observed_records, 1);
    match &report.failures[0] {
        RunFailure::Timeout { unobserved, .. } => {
            assert_eq!(unobserved, &keys(&["B", "C"]));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn unrecognized_key_is_reported_separately() {
    init_test_tracing();
    let case = CorrectnessTestCase::new("renamed", abc(), lossy_config());
    let (sender, receiver, ends) = channel_pipeline();
    let target = EchoService::new(ends).with_transform(|mut record| {
        if record.key.as_str() == "B" {
            record.key = RecordKey::new("Z");
        }
        Some(record)
    });
    let report = case.run(target, sender, receiver).expect("run");

    assert_eq!(report.verdict.result, CaseStatus::Fail);
    assert_eq!(report.verdict.diff_count, 0);
    assert!(report.failures.contains(&RunFailure::UnrecognizedKeys {
        keys: keys(&["Z"])
    }));
    assert!(report.timed_out(), "B itself never arrived");
    // The unknown arrival still advanced the chain to C.
    assert_eq!(report.observed_records, 2);
}

#[test]
fn repeat_deliveries_are_ignored_by_default() {
    init_test_tracing();
    let case = CorrectnessTestCase::new("doubled", abc(), fast_config());
    let (sender, receiver, ends) = channel_pipeline();
    let report = case
        .run(DoublingTarget { ends }, sender, receiver)
        .expect("run");

    assert_eq!(report.verdict.result, CaseStatus::Pass);
    assert_eq!(report.verdict.diff_count, 0);
    assert_eq!(report.duplicate_arrivals, 3);
    assert_eq!(report.summary.accepted, 3, "repeats are not diffed");
}

#[test]
fn repeat_deliveries_never_put_a_second_record_in_flight() {
    init_test_tracing();
    let config = HarnessConfig {
        stall_kick: false,
        ..fast_config()
    };
    let case = CorrectnessTestCase::new("doubled-in-flight", abc(), config);
    let (sender, receiver, ends) = channel_pipeline();
    let log = Arc::new(Mutex::new(FlightLog::default()));
    let sender = TrackedSender {
        inner: sender,
        log: Arc::clone(&log),
    };
    let receiver = TrackedReceiver {
        inner: receiver,
        log: Arc::clone(&log),
    };
    let report = case
        .run(DoublingTarget { ends }, sender, receiver)
        .expect("run");

    assert_eq!(report.verdict.result, CaseStatus::Pass);
    assert_eq!(report.dispatched_records, 3);
    let log = log.lock();
    assert_eq!(log.sent, 3);
    assert_eq!(log.max_in_flight, 1, "{log:?}");
}

#[test]
fn synchronous_loopback_transport_completes_without_deadlock() {
    init_test_tracing();
    let config = HarnessConfig {
        observe_budget: WaitBudget::new(Duration::from_millis(10), Duration::from_millis(500)),
        ..fast_config()
    };
    let case = CorrectnessTestCase::new("loopback", abc(), config);
    let (done_tx, done_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let (sender, receiver) = loopback();
        let _ = done_tx.send(case.run(IdleTarget, sender, receiver));
    });

    let report = done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("run must return within its budgets")
        .expect("run");
    assert_eq!(report.verdict.result, CaseStatus::Pass);
    assert_eq!(report.observed_records, 3);
    assert_eq!(report.dispatched_records, 3);
}

#[test]
fn repeat_deliveries_fail_under_anomaly_policy() {
    init_test_tracing();
    let config = HarnessConfig {
        duplicate_policy: DuplicatePolicy::Anomaly,
        ..fast_config()
    };
    let case = CorrectnessTestCase::new("doubled-strict", abc(), config);
    let (sender, receiver, ends) = channel_pipeline();
    let report = case
        .run(DoublingTarget { ends }, sender, receiver)
        .expect("run");

    assert_eq!(report.verdict.result, CaseStatus::Fail);
    assert_eq!(report.verdict.diff_count, 0);
    assert!(!report.timed_out());
    match &report.failures[..] {
        [RunFailure::DuplicateDelivery { keys: repeated }] => {
            let mut repeated = repeated.clone();
            repeated.sort();
            assert_eq!(repeated, keys(&["A", "B", "C"]));
        }
        other => panic!("unexpected failures: {other:?}"),
    }
}

#[test]
fn failed_start_is_a_setup_error_and_cleans_config() {
    init_test_tracing();
    let seen_config = Arc::new(Mutex::new(None));
    let case = CorrectnessTestCase::new("refused", abc(), fast_config());
    let (sender, receiver, _ends) = channel_pipeline();
    let started = Instant::now();
    let err = case
        .run(
            RefusingTarget {
                seen_config: Arc::clone(&seen_config),
            },
            sender,
            receiver,
        )
        .expect_err("target refuses");

    assert!(started.elapsed() < Duration::from_secs(5));
    match err {
        HarnessError::TargetStart(LifecycleError::TargetFailed { reason, .. }) => {
            assert_eq!(reason.as_deref(), Some("target failed: refusing to start"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let path = seen_config.lock().clone().expect("target saw its config");
    assert!(!path.exists(), "config must be removed after a failed start");
}

#[test]
fn invalid_target_config_fails_start() {
    init_test_tracing();
    let case = CorrectnessTestCase::new("bad-config", abc(), fast_config())
        .with_target_config("receivers: [unterminated\n");
    let (sender, receiver, ends) = channel_pipeline();
    let err = case
        .run(EchoService::new(ends), sender, receiver)
        .expect_err("bad config");
    assert!(matches!(err, HarnessError::TargetStart(_)), "{err:?}");
}

#[test]
fn target_that_never_becomes_ready_times_out() {
    init_test_tracing();
    let config = HarnessConfig {
        start_budget: WaitBudget::new(Duration::from_millis(5), Duration::from_millis(50)),
        ..fast_config()
    };
    let case = CorrectnessTestCase::new("mute", abc(), config);
    let (sender, receiver, _ends) = channel_pipeline();
    let err = case
        .run(MuteTarget, sender, receiver)
        .expect_err("never ready");
    assert!(
        matches!(
            err,
            HarnessError::Timeout {
                phase: TimeoutPhase::Ready,
                ..
            }
        ),
        "{err:?}"
    );
}

#[test]
fn empty_corpus_passes_immediately() {
    init_test_tracing();
    let case = CorrectnessTestCase::new("empty", Corpus::empty(), fast_config());
    let (sender, receiver, ends) = channel_pipeline();
    let report = case
        .run(EchoService::new(ends), sender, receiver)
        .expect("run");
    assert_eq!(report.verdict.result, CaseStatus::Pass);
    assert_eq!(report.expected_records, 0);
    assert_eq!(report.dispatched_records, 0);
}

#[test]
fn float_noise_within_tolerance_passes() {
    init_test_tracing();
    let config = HarnessConfig {
        tolerance: Tolerance {
            absolute: 1e-6,
            relative: 0.0,
        },
        ..fast_config()
    };
    let case = CorrectnessTestCase::new("noisy", abc(), config);
    let (sender, receiver, ends) = channel_pipeline();
    let target = EchoService::new(ends).with_transform(|record| {
        let score = match record.field("score") {
            Some(FieldValue::Float64(value)) => *value,
            _ => 0.0,
        };
        Some(record.with_field("score", score + 1e-9))
    });
    let report = case.run(target, sender, receiver).expect("run");
    assert_eq!(report.verdict.result, CaseStatus::Pass);
}

#[test]
fn custom_differ_replaces_field_comparison() {
    init_test_tracing();
    let case = CorrectnessTestCase::new("keys-only", abc(), fast_config())
        .with_differ(|_expected: &Record, _actual: &Record| Vec::<FieldDiff>::new());
    let (sender, receiver, ends) = channel_pipeline();
    let target = EchoService::new(ends)
        .with_transform(|record| Some(record.with_field("score", -1.0)));
    let report = case.run(target, sender, receiver).expect("run");
    assert_eq!(report.verdict.result, CaseStatus::Pass);
}

#[test]
fn jsonl_corpus_runs_and_results_are_written() {
    init_test_tracing();
    let corpus = corpus_from_jsonl_str(
        "{\"id\": 1, \"city\": \"Oslo\", \"temp\": -3.5}\n\
         {\"id\": 2, \"city\": \"Lima\", \"temp\": 19.0}\n",
        &["id".to_owned()],
    )
    .expect("corpus");
    let dir = tempfile::tempdir().expect("tempdir");
    let results_dir = ResultsDir::new(dir.path());

    let mut results = CorrectnessResults::new();
    for (name, mutate) in [("weather-echo", false), ("weather-mutated", true)] {
        let case = CorrectnessTestCase::new(name, corpus.clone(), fast_config());
        let (sender, receiver, ends) = channel_pipeline();
        let target = EchoService::new(ends).with_transform(move |record| {
            if mutate {
                Some(record.with_field("city", "Bergen"))
            } else {
                Some(record)
            }
        });
        let report = case.run(target, sender, receiver).expect("run");
        results_dir.write_case(&report).expect("write case");
        results.add(&report);
    }

    assert_eq!(results.passed(), 1);
    assert_eq!(results.failed(), 1);
    let written = results.write(&results_dir).expect("write results");
    assert!(written.json_path.exists());
    assert!(written.markdown_path.exists());
    assert!(dir.path().join("weather-echo/report.json").exists());
    let forensic = std::fs::read_to_string(dir.path().join("weather-mutated/forensic.jsonl"))
        .expect("forensic log");
    assert!(forensic.lines().count() >= 4);
    assert!(forensic.contains("\"kind\":\"case_end\""));
}

#[test]
fn repeated_runs_of_the_same_case_are_independent() {
    init_test_tracing();
    let case = CorrectnessTestCase::new("twice", abc(), fast_config());
    for _ in 0..2 {
        let (sender, receiver, ends) = channel_pipeline();
        let report = case
            .run(EchoService::new(ends), sender, receiver)
            .expect("run");
        assert_eq!(report.verdict.result, CaseStatus::Pass);
        assert_eq!(report.observed_records, 3);
    }
}
