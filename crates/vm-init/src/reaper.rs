//! Child process ownership and zombie reaping.
//!
//! Every process the init starts is spawned through [`Reaper::spawn`], which
//! registers the pid before the child can be reaped. On `SIGCHLD` the reaper
//! collects exits of registered children and hands each status to whoever
//! holds the matching [`Child`].
//!
//! As PID 1 the reaper also inherits orphans. It peeks at exited children
//! with `waitid(WNOWAIT)` so that a registered child is never reaped behind
//! its owner's back, then reaps orphans and discards their status. Outside
//! PID 1 (tests) only registered children are touched.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::process::{ChildStderr, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::Pid;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// How a child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ExitStatus {
    /// Shell-style exit code: `128 + signal` for signal deaths.
    pub fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(sig) => 128 + sig,
        }
    }

    pub fn success(self) -> bool {
        self == Self::Exited(0)
    }

    fn from_wait(status: WaitStatus) -> Option<(Pid, Self)> {
        match status {
            WaitStatus::Exited(pid, code) => Some((pid, Self::Exited(code))),
            WaitStatus::Signaled(pid, sig, _) => Some((pid, Self::Signaled(sig as i32))),
            _ => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Signaled(sig) => write!(f, "signal {sig}"),
        }
    }
}

/// A running child registered with a [`Reaper`].
#[derive(Debug)]
pub struct Child {
    pid: Pid,
    process: std::process::Child,
    exit: oneshot::Receiver<ExitStatus>,
}

impl Child {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.process.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.process.stderr.take()
    }

    /// Wait for the child to exit.
    pub async fn wait(self) -> ExitStatus {
        // The sender only drops without a value if the reaper task is gone,
        // which happens when the runtime shuts down.
        self.exit.await.unwrap_or(ExitStatus::Exited(1))
    }
}

/// Captured result of [`Reaper::output`].
#[derive(Debug)]
pub struct Output {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Reaper {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    waiters: Mutex<HashMap<Pid, oneshot::Sender<ExitStatus>>>,
    reap_orphans: bool,
}

impl Reaper {
    /// Start reaping on the current runtime. Orphans are reaped only when
    /// this process is PID 1.
    pub fn start() -> io::Result<Self> {
        Self::with_orphan_reaping(std::process::id() == 1)
    }

    fn with_orphan_reaping(reap_orphans: bool) -> io::Result<Self> {
        // Registered before any child exists, so no SIGCHLD is missed.
        let mut sigchld = signal(SignalKind::child())?;
        let reaper = Self {
            inner: Arc::new(Inner {
                waiters: Mutex::new(HashMap::new()),
                reap_orphans,
            }),
        };
        let inner = reaper.inner.clone();
        tokio::spawn(async move {
            while sigchld.recv().await.is_some() {
                inner.reap();
            }
        });
        Ok(reaper)
    }

    /// Spawn `cmd` and register it. Holding the registry lock across the
    /// spawn keeps the reaper from seeing the exit before the pid is known.
    pub fn spawn(&self, cmd: &mut Command) -> io::Result<Child> {
        let mut waiters = self.inner.lock();
        let process = cmd.spawn()?;
        let pid = Pid::from_raw(i32::try_from(process.id()).map_err(io::Error::other)?);
        let (tx, rx) = oneshot::channel();
        waiters.insert(pid, tx);
        trace!(%pid, "registered child");
        Ok(Child {
            pid,
            process,
            exit: rx,
        })
    }

    /// Run `cmd` to completion, capturing stdout and stderr.
    pub async fn output(&self, cmd: &mut Command) -> io::Result<Output> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = self.spawn(cmd)?;
        let stdout = drain(child.take_stdout());
        let stderr = drain(child.take_stderr());
        let status = child.wait().await;
        Ok(Output {
            status,
            stdout: stdout.await.unwrap_or_default(),
            stderr: stderr.await.unwrap_or_default(),
        })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> tokio::task::JoinHandle<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            // A read error just truncates the capture.
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<Pid, oneshot::Sender<ExitStatus>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reap(&self) {
        let mut waiters = self.lock();
        if self.reap_orphans {
            reap_all(&mut waiters);
        } else {
            reap_registered(&mut waiters);
        }
    }
}

fn reap_registered(waiters: &mut HashMap<Pid, oneshot::Sender<ExitStatus>>) {
    let pids: Vec<Pid> = waiters.keys().copied().collect();
    for pid in pids {
        if let Ok(status) = waitpid(pid, Some(WaitPidFlag::WNOHANG))
            && let Some((pid, status)) = ExitStatus::from_wait(status)
        {
            dispatch(waiters, pid, status);
        }
    }
}

fn reap_all(waiters: &mut HashMap<Pid, oneshot::Sender<ExitStatus>>) {
    loop {
        // Peek first; the status stays collectable until waitpid below.
        let peeked = waitid(
            Id::All,
            WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT,
        );
        let pid = match peeked.ok().and_then(|s| s.pid()) {
            Some(pid) => pid,
            // StillAlive or ECHILD: nothing left to reap.
            None => break,
        };
        let Ok(status) = waitpid(pid, Some(WaitPidFlag::WNOHANG)) else {
            break;
        };
        match ExitStatus::from_wait(status) {
            Some((pid, status)) if waiters.contains_key(&pid) => dispatch(waiters, pid, status),
            Some((pid, status)) => debug!(%pid, %status, "reaped orphan"),
            None => break,
        }
    }
}

fn dispatch(
    waiters: &mut HashMap<Pid, oneshot::Sender<ExitStatus>>,
    pid: Pid,
    status: ExitStatus,
) {
    trace!(%pid, %status, "child exited");
    if let Some(tx) = waiters.remove(&pid) {
        // The owner may have stopped caring.
        let _ = tx.send(status);
    }
}
