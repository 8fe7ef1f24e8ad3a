use std::fmt;
use std::fs;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use ct_runtime::{Target, TargetContext, TargetError, TargetKind};
use ct_types::Record;

use crate::transport::PipeEnds;

const INGRESS_POLL: Duration = Duration::from_millis(10);

/// Rewrites a record on its way through; `None` drops it.
pub type Transform = Box<dyn FnMut(Record) -> Option<Record> + Send + 'static>;

/// In-process target that forwards ingress to egress.
///
/// Without a transform every record comes back unchanged. The target refuses
/// to start when its config file is not valid YAML.
pub struct EchoService {
    ends: PipeEnds,
    transform: Option<Transform>,
}

impl fmt::Debug for EchoService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EchoService")
            .field("transform", &self.transform.is_some())
            .finish_non_exhaustive()
    }
}

impl EchoService {
    #[must_use]
    pub fn new(ends: PipeEnds) -> Self {
        Self {
            ends,
            transform: None,
        }
    }

    #[must_use]
    pub fn with_transform(
        mut self,
        transform: impl FnMut(Record) -> Option<Record> + Send + 'static,
    ) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }

    fn forward(&mut self, record: Record) -> Result<(), TargetError> {
        let key = record.key.clone();
        let output = match self.transform.as_mut() {
            Some(transform) => transform(record),
            None => Some(record),
        };
        match output {
            Some(output) => self
                .ends
                .egress
                .send(output)
                .map_err(|_| TargetError::Failed("egress receiver is gone".to_owned())),
            None => {
                tracing::debug!(key = %key, "echo dropped record");
                Ok(())
            }
        }
    }
}

impl Target for EchoService {
    fn kind(&self) -> TargetKind {
        TargetKind::InProcess
    }

    fn run(&mut self, ctx: &TargetContext) -> Result<(), TargetError> {
        let text = fs::read_to_string(ctx.config_path())?;
        serde_yaml::from_str::<serde_yaml::Value>(&text)
            .map_err(|err| TargetError::Failed(format!("invalid config: {err}")))?;
        ctx.report_ready();

        let mut forwarded = 0_usize;
        loop {
            if ctx.shutdown().is_cancelled() {
                break;
            }
            match self.ends.ingress.recv_timeout(INGRESS_POLL) {
                Ok(record) => {
                    self.forward(record)?;
                    forwarded += 1;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Sender stopped first; idle until shutdown.
                    ctx.shutdown().wait();
                    break;
                }
            }
        }
        tracing::debug!(target_name = ctx.name(), forwarded, "echo service exiting");
        Ok(())
    }
}
