use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use ct_corpus::{DuplicatePolicy, IndexError, MarkOutcome, ReceivedIndex, RecordSupplier};
use ct_diff::{DiffAccumulator, FieldDiffer, RecordDiffer};
use ct_runtime::{
    LifecycleController, LifecycleError, PollStep, StartParams, Target, WaitError, wait_until,
};
use ct_types::{Corpus, Record, RecordKey};
use parking_lot::Mutex;

use crate::template::{ComponentDescriptor, TargetConfigTemplate};
use crate::transport::{RecordReceiver, RecordSender, TransportError};
use crate::{
    CaseStatus, CorrectnessReport, ForensicEventKind, ForensicLog, HarnessConfig, HarnessError,
    RunFailure, TimeoutPhase, Verdict,
};

/// Feeds records to the sender one at a time. Shared by the receive
/// callback, which asks for the next record per acknowledged arrival, and
/// the orchestrator, which asks for the first one.
///
/// No lock is held across `send`. A request that comes in while another
/// caller is sending (including a transport that delivers egress on the
/// sending thread) leaves a credit behind, and the sending caller drains it.
#[derive(Clone)]
struct Dispatcher {
    state: Arc<Mutex<DispatchState>>,
    sender: Arc<Mutex<Box<dyn RecordSender>>>,
}

struct DispatchState {
    supplier: RecordSupplier,
    open: bool,
    pumping: bool,
    credits: usize,
}

impl Dispatcher {
    fn new(corpus: Corpus, sender: Box<dyn RecordSender>) -> Self {
        Self {
            state: Arc::new(Mutex::new(DispatchState {
                supplier: RecordSupplier::new(corpus),
                open: false,
                pumping: false,
                credits: 0,
            })),
            sender: Arc::new(Mutex::new(sender)),
        }
    }

    fn open(&self) -> Result<(), TransportError> {
        self.sender.lock().start()?;
        self.state.lock().open = true;
        Ok(())
    }

    /// Requests one more record. Returns the keys this call sent, which is
    /// empty when closed, exhausted, or when another caller is sending and
    /// will pick the request up.
    fn dispatch_next(&self) -> Result<Vec<RecordKey>, TransportError> {
        {
            let mut state = self.state.lock();
            if !state.open {
                return Ok(Vec::new());
            }
            state.credits += 1;
            if state.pumping {
                return Ok(Vec::new());
            }
            state.pumping = true;
        }

        let mut sent = Vec::new();
        loop {
            let record = {
                let mut state = self.state.lock();
                let next = if state.open && state.credits > 0 {
                    state.supplier.next_record()
                } else {
                    None
                };
                match next {
                    Some(record) => {
                        state.credits -= 1;
                        record
                    }
                    None => {
                        state.credits = 0;
                        state.pumping = false;
                        return Ok(sent);
                    }
                }
            };
            let key = record.key.clone();
            if let Err(err) = self.sender.lock().send(record) {
                let mut state = self.state.lock();
                state.credits = 0;
                state.pumping = false;
                return Err(err);
            }
            sent.push(key);
        }
    }

    fn exhausted(&self) -> bool {
        self.state.lock().supplier.is_done()
    }

    fn dispatched(&self) -> usize {
        self.state.lock().supplier.dispensed()
    }

    fn close(&self) -> Result<(), TransportError> {
        self.state.lock().open = false;
        self.sender.lock().stop()
    }
}

#[derive(Debug, Default)]
struct ArrivalLog {
    arrivals: usize,
    unknown: Vec<RecordKey>,
}

/// Everything the receive callback touches.
struct ReceivePath {
    index: ReceivedIndex,
    accumulator: DiffAccumulator,
    differ: Arc<dyn RecordDiffer>,
    arrivals: Arc<Mutex<ArrivalLog>>,
    dispatcher: Dispatcher,
}

impl ReceivePath {
    /// Judges one arrival. Only a first observation or an unknown key
    /// acknowledges the record in flight; repeats never release another one.
    fn on_record(&self, actual: Record) {
        let key = actual.key.clone();
        let acknowledged = match self.index.observe(&key) {
            Ok((entry, MarkOutcome::FirstObservation)) => {
                let diffs = self.differ.diff(&entry.expected, &actual);
                self.accumulator.accept(&key, diffs);
                true
            }
            Ok((_, MarkOutcome::Duplicate)) => {
                tracing::debug!(key = %key, "ignoring repeat delivery");
                false
            }
            Err(IndexError::UnknownKey { key }) => {
                tracing::error!(key = %key, "egress produced a key that is not in the corpus");
                self.arrivals.lock().unknown.push(key);
                true
            }
            Err(IndexError::DuplicateDelivery { key }) => {
                tracing::error!(key = %key, "record delivered more than once");
                false
            }
        };
        self.arrivals.lock().arrivals += 1;
        if !acknowledged {
            return;
        }
        match self.dispatcher.dispatch_next() {
            Ok(sent) => {
                for next in sent {
                    tracing::trace!(key = %next, "dispatched");
                }
            }
            Err(err) => tracing::error!(error = %err, "dispatch after arrival failed"),
        }
    }
}

/// One end-to-end correctness run of a corpus through a target.
pub struct CorrectnessTestCase {
    name: String,
    corpus: Corpus,
    config: HarnessConfig,
    differ: Arc<dyn RecordDiffer>,
    target_config: String,
    target_args: Vec<String>,
    target_log: Option<PathBuf>,
}

impl std::fmt::Debug for CorrectnessTestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrectnessTestCase")
            .field("name", &self.name)
            .field("records", &self.corpus.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CorrectnessTestCase {
    /// Uses a [`FieldDiffer`] with the configured tolerance and a minimal
    /// pass-through target config until overridden.
    #[must_use]
    pub fn new(name: impl Into<String>, corpus: Corpus, config: HarnessConfig) -> Self {
        let differ = FieldDiffer::new(config.tolerance);
        let target_config = TargetConfigTemplate::new(
            ComponentDescriptor::new("harness_in", "{}"),
            ComponentDescriptor::new("harness_out", "{}"),
        )
        .render();
        Self {
            name: name.into(),
            corpus,
            config,
            differ: Arc::new(differ),
            target_config,
            target_args: Vec::new(),
            target_log: None,
        }
    }

    #[must_use]
    pub fn with_differ(mut self, differ: impl RecordDiffer + 'static) -> Self {
        self.differ = Arc::new(differ);
        self
    }

    #[must_use]
    pub fn with_target_config(mut self, text: impl Into<String>) -> Self {
        self.target_config = text.into();
        self
    }

    #[must_use]
    pub fn with_target_args(mut self, args: Vec<String>) -> Self {
        self.target_args = args;
        self
    }

    #[must_use]
    pub fn with_target_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.target_log = Some(path.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    /// Runs the corpus through `target`.
    ///
    /// Setup failures and a target that never starts or never stops are
    /// errors. Everything that goes wrong with the data itself (missing,
    /// unknown, repeated or differing records) ends up in the report.
    pub fn run(
        &self,
        target: impl Target,
        sender: impl RecordSender + 'static,
        mut receiver: impl RecordReceiver,
    ) -> Result<CorrectnessReport, HarnessError> {
        let started = Instant::now();
        let mut forensic = ForensicLog::new();
        forensic.record(ForensicEventKind::CaseStart {
            test_name: self.name.clone(),
            records: self.corpus.len(),
        });
        tracing::info!(test_name = %self.name, records = self.corpus.len(), "correctness case starting");

        let mut controller =
            LifecycleController::new(target).with_stop_budget(self.config.stop_budget);
        let _config_cleanup = controller
            .prepare_config(&self.target_config)
            .map_err(HarnessError::ConfigPrepare)?;
        if let Some(path) = controller.config_path() {
            forensic.record(ForensicEventKind::ConfigPrepared {
                path: path.display().to_string(),
            });
        }

        let index = ReceivedIndex::new(self.corpus.clone(), self.config.duplicate_policy);
        let accumulator = DiffAccumulator::new();
        let arrivals = Arc::new(Mutex::new(ArrivalLog::default()));
        let dispatcher = Dispatcher::new(self.corpus.clone(), Box::new(sender));
        let path = ReceivePath {
            index: index.clone(),
            accumulator: accumulator.clone(),
            differ: Arc::clone(&self.differ),
            arrivals: Arc::clone(&arrivals),
            dispatcher: dispatcher.clone(),
        };

        receiver.start(Box::new(move |record: Record| path.on_record(record)))?;

        let params = StartParams {
            args: self.target_args.clone(),
            log_path: self.target_log.clone(),
            resource_spec: self.config.resource_spec,
            ..StartParams::new(self.name.clone()).ready_budget(self.config.start_budget)
        };
        if let Err(err) = controller.start(params) {
            forensic.record(ForensicEventKind::Error {
                phase: "target_start".to_owned(),
                message: err.to_string(),
            });
            abandon(&dispatcher, &mut controller, &mut receiver);
            return Err(match err {
                LifecycleError::ReadyTimeout { waited_ms } => HarnessError::Timeout {
                    phase: TimeoutPhase::Ready,
                    waited_ms,
                },
                other => HarnessError::TargetStart(other),
            });
        }
        forensic.record(ForensicEventKind::TargetStarted {
            test_name: self.name.clone(),
        });
        controller.watch_resource_consumption();

        if let Err(err) = dispatcher.open() {
            abandon(&dispatcher, &mut controller, &mut receiver);
            return Err(err.into());
        }
        match dispatcher.dispatch_next() {
            Ok(sent) => match sent.first() {
                Some(key) => forensic.record(ForensicEventKind::FirstDispatch {
                    key: key.to_string(),
                }),
                None if self.corpus.is_empty() => {
                    tracing::info!(test_name = %self.name, "empty corpus, nothing to send");
                }
                None => {}
            },
            Err(err) => {
                abandon(&dispatcher, &mut controller, &mut receiver);
                return Err(err.into());
            }
        }

        let observe_started = Instant::now();
        let stall_kick = self.config.stall_kick;
        let mut seen_arrivals = 0_usize;
        let mut primed = false;
        let observed = wait_until(&self.config.observe_budget, None, || {
            if index.all_observed() {
                return PollStep::Ready(());
            }
            let usage = controller.get_resource_consumption();
            if !usage.is_empty() {
                tracing::debug!(test_name = %self.name, usage = %usage, "target resources");
            }
            let arrived = arrivals.lock().arrivals;
            if primed && stall_kick && arrived == seen_arrivals && !dispatcher.exhausted() {
                match dispatcher.dispatch_next() {
                    Ok(sent) if !sent.is_empty() => {
                        tracing::debug!(keys = sent.len(), "egress idle for a full interval, dispatching next record");
                        forensic.record(ForensicEventKind::StallKick {
                            dispatched: dispatcher.dispatched(),
                            observed: index.observed_count(),
                        });
                    }
                    Ok(_) => {}
                    Err(err) => tracing::error!(error = %err, "stall dispatch failed"),
                }
            }
            primed = true;
            seen_arrivals = arrived;
            PollStep::<(), ()>::Pending
        });

        let mut failures = Vec::new();
        let timed_out = match observed {
            Ok(()) => false,
            Err(wait_err) => {
                let waited_ms = match wait_err {
                    WaitError::TimedOut { waited_ms } => waited_ms,
                    WaitError::Cancelled | WaitError::Aborted(()) => {
                        observe_started.elapsed().as_millis() as u64
                    }
                };
                let unobserved = index.unobserved_keys();
                tracing::error!(
                    test_name = %self.name,
                    waited_ms,
                    unobserved = unobserved.len(),
                    "corpus not fully observed before the deadline"
                );
                failures.push(RunFailure::Timeout {
                    waited_ms,
                    unobserved,
                });
                true
            }
        };
        forensic.record(ForensicEventKind::ObserveFinished {
            observed: index.observed_count(),
            expected: index.len(),
            timed_out,
        });
        let resources = controller.get_total_consumption();

        if let Err(err) = dispatcher.close() {
            tracing::warn!(error = %err, "sender stop failed");
        }
        let target_stop = controller.stop();
        // Records the receiver already holds are still judged.
        let receiver_stop = receiver.stop();
        match target_stop {
            Ok(stopped) => forensic.record(ForensicEventKind::TargetStopped { stopped }),
            Err(LifecycleError::StopTimeout { waited_ms }) => {
                return Err(HarnessError::Timeout {
                    phase: TimeoutPhase::Stop,
                    waited_ms,
                });
            }
            Err(err) => return Err(err.into()),
        }
        receiver_stop?;

        let arrivals = std::mem::take(&mut *arrivals.lock());
        if !arrivals.unknown.is_empty() {
            failures.push(RunFailure::UnrecognizedKeys {
                keys: arrivals.unknown,
            });
        }
        let repeated = index.duplicate_keys();
        if self.config.duplicate_policy == DuplicatePolicy::Anomaly && !repeated.is_empty() {
            failures.push(RunFailure::DuplicateDelivery { keys: repeated });
        }
        let diff_count = accumulator.diff_count();
        if diff_count > 0 {
            failures.push(RunFailure::ContentMismatch { diff_count });
        }

        let result = if failures.is_empty() {
            CaseStatus::Pass
        } else {
            CaseStatus::Fail
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        forensic.record(ForensicEventKind::CaseEnd {
            test_name: self.name.clone(),
            status: result,
            diff_count,
            elapsed_ms,
        });
        if result == CaseStatus::Pass {
            tracing::info!(test_name = %self.name, elapsed_ms, "correctness case passed");
        } else {
            for failure in &failures {
                tracing::error!(test_name = %self.name, failure = %failure, "correctness case failed");
            }
        }

        Ok(CorrectnessReport {
            verdict: Verdict {
                test_name: self.name.clone(),
                result,
                diff_count,
            },
            failures,
            expected_records: index.len(),
            observed_records: index.observed_count(),
            dispatched_records: dispatcher.dispatched(),
            duplicate_arrivals: index.repeat_arrivals(),
            summary: accumulator.summary(),
            diff_log: accumulator.entries(),
            resources,
            elapsed_ms,
            forensic_log: forensic,
        })
    }
}

/// Tears down whatever a failed setup already started. Errors are logged;
/// the setup failure is what the caller reports.
fn abandon(
    dispatcher: &Dispatcher,
    controller: &mut LifecycleController,
    receiver: &mut impl RecordReceiver,
) {
    if let Err(err) = dispatcher.close() {
        tracing::warn!(error = %err, "sender stop after failed setup");
    }
    if let Err(err) = controller.stop() {
        tracing::warn!(error = %err, "target stop after failed setup");
    }
    if let Err(err) = receiver.stop() {
        tracing::warn!(error = %err, "receiver stop after failed setup");
    }
}
