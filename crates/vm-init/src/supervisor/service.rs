//! A single supervised process and its lifecycle.
//!
//! ```text
//! Created -> Initialized -> Running <-> Restarting
//!                              \            /
//!                               -> Stopped <-
//! ```
//!
//! [`Service::start`] runs the optional init callback, starts the first
//! process and hands the rest of the lifecycle to a background task. A
//! stop request never restarts the process again; delivering a signal to
//! it is the caller's job.

use std::fmt;
use std::future::Future;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use futures_util::future::BoxFuture;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config;
use crate::error::{InitError, Result};
use crate::reaper::{Child, ExitStatus, Reaper};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Main,
    Chrony,
    Sshd,
}

impl ServiceKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Chrony => "chrony",
            Self::Sshd => "sshd",
        }
    }

    /// The workload is never restarted: its exit ends the VM.
    fn restarts(self) -> bool {
        !matches!(self, Self::Main)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    /// The init callback finished (or there was none).
    Initialized,
    Running,
    Restarting,
    Stopped,
}

/// How to start the process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub argv: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl LaunchSpec {
    /// Auxiliary services run as root with no environment beyond `PATH`.
    pub fn system(argv: &[&str]) -> Self {
        Self {
            argv: argv.iter().map(|a| a.to_string()).collect(),
            working_dir: PathBuf::from("/"),
            env: vec![("PATH".into(), config::DEFAULT_PATH.into())],
            uid: None,
            gid: None,
        }
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    /// The command for a supervised child, in a process group of its own so
    /// signals reach the whole service tree.
    pub fn command(&self) -> Result<Command> {
        let mut cmd = self.exec_command()?;
        cmd.stdin(Stdio::null()).process_group(0);
        Ok(cmd)
    }

    /// The command to exec in place of the init.
    pub fn exec_command(&self) -> Result<Command> {
        let (program, args) = self.argv.split_first().ok_or(InitError::NoCommand)?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.working_dir)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k, v)));
        if let Some(gid) = self.gid {
            cmd.gid(gid);
        }
        if let Some(uid) = self.uid {
            cmd.uid(uid);
        }
        Ok(cmd)
    }
}

type InitFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

pub struct Service {
    kind: ServiceKind,
    launch: LaunchSpec,
    init: Option<InitFn>,
    optional: bool,
    restart_delay: Duration,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("kind", &self.kind)
            .field("launch", &self.launch)
            .field("init", &self.init.is_some())
            .field("optional", &self.optional)
            .finish()
    }
}

impl Service {
    pub fn new(kind: ServiceKind, launch: LaunchSpec) -> Self {
        Self {
            kind,
            launch,
            init: None,
            optional: false,
            restart_delay: config::RESTART_DELAY,
        }
    }

    /// Work to do once, before the first process starts.
    pub fn with_init<F, Fut>(mut self, init: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.init = Some(Box::new(move || Box::pin(init())));
        self
    }

    /// A service whose failure to start does not stop the boot.
    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    /// Run the init callback now rather than at start. It runs at most once.
    pub async fn prepare(&mut self) -> Result<()> {
        if let Some(init) = self.init.take() {
            init().await?;
        }
        Ok(())
    }

    pub async fn start(mut self, reaper: &Reaper) -> Result<ServiceHandle> {
        let (state_tx, state_rx) = watch::channel(ServiceState::Created);
        self.prepare().await?;
        state_tx.send_replace(ServiceState::Initialized);

        let child = spawn(reaper, self.kind, &self.launch)?;
        let (pid_tx, pid_rx) = watch::channel(Some(child.pid()));
        state_tx.send_replace(ServiceState::Running);

        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(supervise(
            Supervised {
                kind: self.kind,
                launch: self.launch,
                reaper: reaper.clone(),
                restart_delay: self.restart_delay,
                stop: stop_rx,
                state: state_tx,
                pid: pid_tx,
            },
            child,
        ));

        Ok(ServiceHandle {
            kind: self.kind,
            stop: stop_tx,
            state: state_rx,
            pid: pid_rx,
            task,
            exit: None,
        })
    }
}

fn spawn(reaper: &Reaper, kind: ServiceKind, launch: &LaunchSpec) -> Result<Child> {
    let child = reaper
        .spawn(&mut launch.command()?)
        .map_err(|source| InitError::Spawn {
            program: launch.program().to_string(),
            source,
        })?;
    info!(service = %kind, pid = %child.pid(), "started");
    Ok(child)
}

struct Supervised {
    kind: ServiceKind,
    launch: LaunchSpec,
    reaper: Reaper,
    restart_delay: Duration,
    stop: mpsc::UnboundedReceiver<()>,
    state: watch::Sender<ServiceState>,
    pid: watch::Sender<Option<Pid>>,
}

impl Supervised {
    /// Wait for a stop request. Pends forever once every handle is gone.
    async fn stopped(&mut self) {
        if self.stop.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

async fn supervise(mut s: Supervised, mut child: Child) -> ExitStatus {
    let mut stopping = false;
    loop {
        let exited = child.wait();
        tokio::pin!(exited);
        let status = loop {
            tokio::select! {
                status = &mut exited => break status,
                () = s.stopped(), if !stopping => stopping = true,
            }
        };
        s.pid.send_replace(None);

        if stopping || !s.kind.restarts() {
            info!(service = %s.kind, %status, "exited");
            s.state.send_replace(ServiceState::Stopped);
            return status;
        }

        warn!(service = %s.kind, %status, "crashed, restarting");
        s.state.send_replace(ServiceState::Restarting);
        child = loop {
            tokio::select! {
                () = tokio::time::sleep(s.restart_delay) => {}
                () = s.stopped() => {
                    info!(service = %s.kind, "stopped while waiting to restart");
                    s.state.send_replace(ServiceState::Stopped);
                    return status;
                }
            }
            match spawn(&s.reaper, s.kind, &s.launch) {
                Ok(next) => break next,
                Err(e) => error!(service = %s.kind, error = %e, "restart failed"),
            }
        };
        s.pid.send_replace(Some(child.pid()));
        s.state.send_replace(ServiceState::Running);
    }
}

/// Handle to a started service.
#[derive(Debug)]
pub struct ServiceHandle {
    kind: ServiceKind,
    stop: mpsc::UnboundedSender<()>,
    state: watch::Receiver<ServiceState>,
    pid: watch::Receiver<Option<Pid>>,
    task: JoinHandle<ExitStatus>,
    exit: Option<ExitStatus>,
}

impl ServiceHandle {
    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    /// Mark the service as stopping. The current process keeps running
    /// until it is signalled; it will not be restarted.
    pub fn stop(&self) {
        // The task is gone if the service already stopped.
        let _ = self.stop.send(());
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn pid(&self) -> Option<Pid> {
        *self.pid.borrow()
    }

    /// Observe pid changes, e.g. across restarts.
    pub fn watch_pid(&self) -> watch::Receiver<Option<Pid>> {
        self.pid.clone()
    }

    /// Signal the current process group, if a process is running.
    pub fn signal(&self, sig: Signal) {
        let Some(pid) = self.pid() else {
            return;
        };
        match killpg(pid, sig) {
            Ok(()) => debug!(service = %self.kind, %pid, %sig, "signalled"),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!(service = %self.kind, %pid, %sig, error = %e, "signal failed"),
        }
    }

    /// Wait for the service to stop for good. Safe to call again, and safe
    /// to cancel.
    pub async fn wait(&mut self) -> ExitStatus {
        if let Some(status) = self.exit {
            return status;
        }
        let status = (&mut self.task).await.unwrap_or(ExitStatus::Exited(1));
        self.exit = Some(status);
        status
    }
}
