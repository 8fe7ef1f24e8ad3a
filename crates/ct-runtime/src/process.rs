use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use crate::target::{Target, TargetContext, TargetError, TargetKind};

const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_millis(100);

/// Runs the system under test as a child process.
///
/// The process receives `config_flag <config path>` after its fixed arguments
/// and the per-start arguments. It counts as ready once spawned and still alive
/// after the first liveness check.
#[derive(Debug, Clone)]
pub struct ProcessTarget {
    program: PathBuf,
    args: Vec<String>,
    config_flag: String,
    liveness_interval: Duration,
}

impl ProcessTarget {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            config_flag: "--config".to_owned(),
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn config_flag(mut self, flag: impl Into<String>) -> Self {
        self.config_flag = flag.into();
        self
    }

    #[must_use]
    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    fn spawn(&self, ctx: &TargetContext) -> Result<Child, TargetError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(ctx.args())
            .arg(&self.config_flag)
            .arg(ctx.config_path())
            .stdin(Stdio::null());
        match ctx.log_path() {
            Some(path) => {
                let log = File::create(path)?;
                command.stdout(log.try_clone()?).stderr(log);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        Ok(command.spawn()?)
    }
}

fn terminate(child: &mut Child) -> Result<(), TargetError> {
    if child.try_wait()?.is_none() {
        // kill() fails with InvalidInput if the child exited in between.
        if let Err(err) = child.kill()
            && err.kind() != std::io::ErrorKind::InvalidInput
        {
            return Err(err.into());
        }
    }
    child.wait()?;
    Ok(())
}

impl ProcessTarget {
    /// Polls the child until shutdown. The child is killed and reaped on
    /// every way out, including a failed poll.
    fn watch(
        &self,
        ctx: &TargetContext,
        child: &mut Child,
        mut poll: impl FnMut(&mut Child) -> io::Result<Option<ExitStatus>>,
    ) -> Result<(), TargetError> {
        match self.supervise(ctx, child, &mut poll) {
            Ok(()) => terminate(child),
            Err(err) => {
                if let Err(kill_err) = terminate(child) {
                    tracing::warn!(
                        target_name = ctx.name(),
                        error = %kill_err,
                        "could not reap target process"
                    );
                }
                Err(err)
            }
        }
    }

    fn supervise(
        &self,
        ctx: &TargetContext,
        child: &mut Child,
        poll: &mut impl FnMut(&mut Child) -> io::Result<Option<ExitStatus>>,
    ) -> Result<(), TargetError> {
        let mut ready = false;
        loop {
            if let Some(status) = poll(child)? {
                return Err(TargetError::Exited {
                    code: status.code(),
                });
            }
            if !ready {
                ready = true;
                ctx.report_ready();
            }
            if ctx.shutdown().wait_timeout(self.liveness_interval) {
                return Ok(());
            }
        }
    }
}

impl Target for ProcessTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Process
    }

    fn run(&mut self, ctx: &TargetContext) -> Result<(), TargetError> {
        let mut child = self.spawn(ctx)?;
        ctx.report_pid(child.id());
        tracing::info!(
            target_name = ctx.name(),
            pid = child.id(),
            program = %self.program.display(),
            "target process spawned"
        );

        self.watch(ctx, &mut child, Child::try_wait)?;
        tracing::info!(target_name = ctx.name(), "target process stopped");
        Ok(())
    }
}
