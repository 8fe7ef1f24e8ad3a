//! Sender/receiver capability pair plus an in-memory channel implementation.
//!
//! The channel pipeline is the reference transport: the harness writes into
//! the ingress half, an in-process target reads it through [`PipeEnds`] and
//! writes to egress, and [`ChannelReceiver`] delivers egress records to the
//! receive callback on its own thread.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ct_runtime::CancelToken;
use ct_types::Record;
use thiserror::Error;

const DELIVERY_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport was not started")]
    NotStarted,
    #[error("transport was already started")]
    AlreadyStarted,
    #[error("transport peer is gone")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Callback invoked once per record arriving on egress.
pub type RecordCallback = Box<dyn FnMut(Record) + Send + 'static>;

/// Sends records to the target's ingress.
pub trait RecordSender: Send {
    fn start(&mut self) -> Result<(), TransportError>;

    fn send(&mut self, record: Record) -> Result<(), TransportError>;

    fn stop(&mut self) -> Result<(), TransportError>;
}

/// Receives records from the target's egress and hands each to a callback.
///
/// `stop` returns only after every record already accepted by the receiver
/// has been passed to the callback.
pub trait RecordReceiver: Send {
    fn start(&mut self, on_record: RecordCallback) -> Result<(), TransportError>;

    fn stop(&mut self) -> Result<(), TransportError>;
}

/// Builds a connected sender, receiver and the target-side channel ends.
#[must_use]
pub fn channel_pipeline() -> (ChannelSender, ChannelReceiver, PipeEnds) {
    let (ingress_tx, ingress_rx) = mpsc::channel();
    let (egress_tx, egress_rx) = mpsc::channel();
    (
        ChannelSender {
            pending: Some(ingress_tx),
            live: None,
        },
        ChannelReceiver {
            egress: Some(egress_rx),
            halt: CancelToken::new(),
            worker: None,
        },
        PipeEnds {
            ingress: ingress_rx,
            egress: egress_tx,
        },
    )
}

#[derive(Debug)]
pub struct ChannelSender {
    pending: Option<Sender<Record>>,
    live: Option<Sender<Record>>,
}

impl RecordSender for ChannelSender {
    fn start(&mut self) -> Result<(), TransportError> {
        let tx = self.pending.take().ok_or(TransportError::AlreadyStarted)?;
        self.live = Some(tx);
        Ok(())
    }

    fn send(&mut self, record: Record) -> Result<(), TransportError> {
        let tx = self.live.as_ref().ok_or(TransportError::NotStarted)?;
        tx.send(record).map_err(|_| TransportError::Closed)
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        // Dropping the sender disconnects ingress for the target.
        self.live = None;
        Ok(())
    }
}

#[derive(Debug)]
pub struct ChannelReceiver {
    egress: Option<Receiver<Record>>,
    halt: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl RecordReceiver for ChannelReceiver {
    fn start(&mut self, mut on_record: RecordCallback) -> Result<(), TransportError> {
        let egress = self.egress.take().ok_or(TransportError::AlreadyStarted)?;
        let halt = self.halt.clone();
        let worker = thread::Builder::new()
            .name("ct-egress".to_owned())
            .spawn(move || {
                let mut delivered = 0_usize;
                loop {
                    if halt.is_cancelled() {
                        // Drain whatever the target already emitted.
                        loop {
                            match egress.try_recv() {
                                Ok(record) => {
                                    delivered += 1;
                                    on_record(record);
                                }
                                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                            }
                        }
                        break;
                    }
                    match egress.recv_timeout(DELIVERY_POLL) {
                        Ok(record) => {
                            delivered += 1;
                            on_record(record);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            halt.wait();
                            break;
                        }
                    }
                }
                tracing::debug!(delivered, "egress delivery stopped");
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        self.halt.cancel();
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        if worker.join().is_err() {
            tracing::error!("receive callback panicked");
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl Drop for ChannelReceiver {
    fn drop(&mut self) {
        if self.worker.is_some()
            && let Err(err) = self.stop()
        {
            tracing::warn!(error = %err, "receiver stop on drop failed");
        }
    }
}

/// The target's side of a channel pipeline.
#[derive(Debug)]
pub struct PipeEnds {
    pub ingress: Receiver<Record>,
    pub egress: Sender<Record>,
}
