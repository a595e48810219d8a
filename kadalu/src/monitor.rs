//! Child-process supervision.
//!
//! A [`Monitor`] owns a fixed set of processes. It restarts any of them that
//! exits, forwards signals on request, and terminates all of them on
//! shutdown.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
const STOP_GRACE: Duration = Duration::from_secs(10);

/// One supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new<I, S>(name: impl Into<String>, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Parse `NAME=PROGRAM [ARGS...]` as given on the command line.
pub fn parse_process_spec(raw: &str) -> Result<ProcessSpec, String> {
    let (name, command) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=COMMAND, got {raw:?}"))?;
    let mut words = command.split_whitespace();
    let program = words
        .next()
        .ok_or_else(|| format!("process {name:?} has an empty command"))?;
    if name.trim().is_empty() {
        return Err(format!("process name missing in {raw:?}"));
    }
    Ok(ProcessSpec::new(name.trim(), program, words))
}

pub struct Monitor {
    specs: Vec<ProcessSpec>,
    children: Vec<Option<Child>>,
    poll_interval: Duration,
}

impl Monitor {
    pub fn new(specs: Vec<ProcessSpec>) -> Self {
        let children = specs.iter().map(|_| None).collect();
        Self {
            specs,
            children,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn spawn(spec: &ProcessSpec) -> anyhow::Result<Child> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {} ({})", spec.name, spec.program))?;
        info!(name = %spec.name, pid = child.id(), "process started");
        Ok(child)
    }

    /// Start every process. Fails on the first one that cannot be spawned.
    pub fn start(&mut self) -> anyhow::Result<()> {
        for (spec, slot) in self.specs.iter().zip(self.children.iter_mut()) {
            *slot = Some(Self::spawn(spec)?);
        }
        Ok(())
    }

    /// Restart processes that exited. Returns how many were restarted.
    pub fn poll(&mut self) -> usize {
        let mut restarted = 0;
        for (spec, slot) in self.specs.iter().zip(self.children.iter_mut()) {
            let exited = match slot.as_mut().map(Child::try_wait) {
                Some(Ok(Some(status))) => {
                    warn!(name = %spec.name, %status, "process exited, restarting");
                    true
                }
                Some(Ok(None)) => false,
                Some(Err(e)) => {
                    warn!(name = %spec.name, error = %e, "cannot query process status");
                    false
                }
                None => true,
            };
            if !exited {
                continue;
            }
            *slot = match Self::spawn(spec) {
                Ok(child) => {
                    restarted += 1;
                    Some(child)
                }
                Err(e) => {
                    error!(error = %e, "restart failed");
                    None
                }
            };
        }
        restarted
    }

    /// Send `signal` to every running process.
    pub fn signal(&self, signal: Signal) {
        for (spec, child) in self.specs.iter().zip(&self.children) {
            let Some(pid) = child.as_ref().and_then(Child::id) else {
                continue;
            };
            match kill(Pid::from_raw(pid as i32), signal) {
                Ok(()) => debug!(name = %spec.name, pid, ?signal, "signal sent"),
                Err(errno) => warn!(name = %spec.name, pid, ?signal, %errno, "signal failed"),
            }
        }
    }

    /// SIGTERM every process, then SIGKILL whatever is still running after a
    /// grace period.
    pub async fn stop(&mut self) {
        self.signal(Signal::SIGTERM);
        for (spec, slot) in self.specs.iter().zip(self.children.iter_mut()) {
            let Some(mut child) = slot.take() else {
                continue;
            };
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => info!(name = %spec.name, %status, "process stopped"),
                Ok(Err(e)) => warn!(name = %spec.name, error = %e, "wait failed"),
                Err(_) => {
                    warn!(name = %spec.name, "process ignored SIGTERM, killing");
                    if let Err(e) = child.kill().await {
                        warn!(name = %spec.name, error = %e, "kill failed");
                    }
                }
            }
        }
    }

    /// Supervise until `shutdown` resolves, forwarding every signal received
    /// on `signals` to the children. Stops all children before returning.
    pub async fn run<F>(mut self, shutdown: F, mut signals: mpsc::Receiver<Signal>)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(signal) = signals.recv() => self.signal(signal),
                _ = ticker.tick() => {
                    self.poll();
                }
            }
        }
        info!("shutting down supervised processes");
        self.stop().await;
    }
}
