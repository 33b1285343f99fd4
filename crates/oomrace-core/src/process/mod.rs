//! Hog process launching, completion tracking, and termination.
//!
//! Every spawned hog gets its own supervising task that owns the
//! [`tokio::process::Child`]. The task reaps the child and publishes its exit
//! through a watch channel. It also serves kill requests, so a kill never
//! races the reap.

use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use oomrace_cgroups::MemoryDomain;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::strategy::Footprint;
use crate::Result;

type KillRequest = oneshot::Sender<io::Result<()>>;

/// How a hog process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own with this code
    Exited(i32),
    /// Killed by this signal (SIGKILL from us or from the OOM killer)
    Signaled(i32),
    /// The exit status could not be collected
    Unknown,
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            Self::Exited(code)
        } else if let Some(signal) = status.signal() {
            Self::Signaled(signal)
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {}", code),
            Self::Signaled(signal) => write!(f, "signal {}", signal),
            Self::Unknown => f.write_str("unknown status"),
        }
    }
}

/// Configuration for launching hog processes
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Hog executable
    pub program: PathBuf,
    /// Arguments passed ahead of the footprint
    pub args: Vec<String>,
    /// Discard hog stdout/stderr instead of inheriting them
    pub quiet: bool,
}

/// Starts hog processes inside memory domains
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: LauncherConfig,
}

impl ProcessLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    pub fn program(&self) -> &Path {
        &self.config.program
    }

    /// Spawn the hog with `footprint` as arguments, already attached to `domain`.
    ///
    /// The child writes its own pid into the domain's membership file between
    /// fork and exec, so it is accounted before the hog allocates anything.
    pub fn launch(
        &self,
        label: &str,
        footprint: &Footprint,
        domain: &MemoryDomain,
    ) -> Result<ProcessHandle> {
        let procs = domain.open_procs()?;

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .args(footprint.args())
            .stdin(Stdio::null());
        if self.config.quiet {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        // SAFETY: the hook only calls getpid(2) and write(2) on an fd opened
        // before the fork, both async-signal-safe.
        unsafe {
            cmd.pre_exec(move || join_domain(&procs));
        }

        let child = cmd.spawn().map_err(|source| Error::Launch {
            program: self.config.program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        tokio::spawn(supervise(label.to_string(), child, kill_rx, exit_tx));

        info!("Launched {} (pid {}) with {} in domain {}", label, pid, footprint, domain.id());
        Ok(ProcessHandle {
            label: label.to_string(),
            pid,
            footprint: footprint.clone(),
            kill_tx,
            exit_rx,
        })
    }
}

async fn supervise(
    label: String,
    mut child: Child,
    mut kill_rx: mpsc::Receiver<KillRequest>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let exit = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => ProcessExit::from(status),
                    Err(e) => {
                        warn!("Failed to wait for {}: {}", label, e);
                        ProcessExit::Unknown
                    }
                };
            }
            Some(ack) = kill_rx.recv() => {
                let _ = ack.send(child.start_kill());
            }
        }
    };

    info!("{} done ({})", label, exit);
    exit_tx.send_replace(Some(exit));
}

/// Write `<pid>\n` of the calling process into the membership file.
fn join_domain(procs: &File) -> io::Result<()> {
    let mut buf = [0u8; 12];
    let pid = nix::unistd::getpid().as_raw().unsigned_abs();
    let line = format_pid(pid, &mut buf);
    nix::unistd::write(procs, line)?;
    Ok(())
}

/// Allocation-free decimal formatting for use after fork.
fn format_pid(pid: u32, buf: &mut [u8; 12]) -> &[u8] {
    let mut start = buf.len() - 1;
    buf[start] = b'\n';
    let mut rest = pid;
    loop {
        start -= 1;
        buf[start] = b'0' + (rest % 10) as u8;
        rest /= 10;
        if rest == 0 {
            break;
        }
    }
    &buf[start..]
}

/// /proc introspection results for one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub environ_bytes: Option<usize>,
    pub cmdline_bytes: Option<usize>,
}

/// A launched hog process
#[derive(Debug)]
pub struct ProcessHandle {
    label: String,
    pid: u32,
    footprint: Footprint,
    kill_tx: mpsc::Sender<KillRequest>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn footprint(&self) -> &Footprint {
        &self.footprint
    }

    /// Exit status, if the process has already been reaped
    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Notification that fires once the process has exited, for any reason
    pub fn completion(&self) -> CompletionSignal {
        CompletionSignal {
            label: self.label.clone(),
            rx: self.exit_rx.clone(),
        }
    }

    /// Send SIGKILL. A process that already exited counts as success.
    pub async fn terminate(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.kill_tx.send(ack_tx).await.is_err() {
            debug!("{} already exited, nothing to kill", self.label);
            return Ok(());
        }

        match ack_rx.await {
            Ok(Ok(())) => {
                debug!("Sent SIGKILL to {} (pid {})", self.label, self.pid);
                Ok(())
            }
            Ok(Err(source)) => Err(Error::Signal {
                label: self.label.clone(),
                source,
            }),
            // The child was reaped while the request was queued
            Err(_) => Ok(()),
        }
    }

    /// Wait until the process has been reaped
    pub async fn reap(&self) -> ProcessExit {
        self.completion().wait().await
    }

    /// Read the process environment and command line from /proc
    pub fn probe(&self) -> ProbeReport {
        let read = |name: &str| {
            std::fs::read(format!("/proc/{}/{}", self.pid, name))
                .map(|bytes| bytes.len())
                .ok()
        };
        ProbeReport {
            environ_bytes: read("environ"),
            cmdline_bytes: read("cmdline"),
        }
    }
}

/// One-shot exit notification for a process
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    label: String,
    rx: watch::Receiver<Option<ProcessExit>>,
}

impl CompletionSignal {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn has_fired(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for the process to exit
    pub async fn wait(mut self) -> ProcessExit {
        match self.rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.unwrap_or(ProcessExit::Unknown),
            Err(_) => ProcessExit::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oomrace_cgroups::{MemoryController, UsageSample};
    use std::time::Duration;
    use tempfile::TempDir;

    fn launcher(program: &str) -> ProcessLauncher {
        ProcessLauncher::new(LauncherConfig {
            program: PathBuf::from(program),
            args: Vec::new(),
            quiet: true,
        })
    }

    fn domain(dir: &TempDir) -> MemoryDomain {
        MemoryController::emulated(dir.path(), UsageSample::default())
            .create(1 << 20)
            .unwrap()
    }

    #[test]
    fn test_format_pid() {
        let mut buf = [0u8; 12];
        assert_eq!(format_pid(0, &mut buf), b"0\n");
        assert_eq!(format_pid(4242, &mut buf), b"4242\n");
        assert_eq!(format_pid(u32::MAX, &mut buf), b"4294967295\n");
    }

    #[test]
    fn test_exit_from_status() {
        assert_eq!(ProcessExit::from(ExitStatus::from_raw(0)), ProcessExit::Exited(0));
        assert_eq!(ProcessExit::from(ExitStatus::from_raw(3 << 8)), ProcessExit::Exited(3));
        assert_eq!(ProcessExit::from(ExitStatus::from_raw(9)), ProcessExit::Signaled(9));
    }

    #[tokio::test]
    async fn test_launch_attaches_child_to_domain() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);

        let handle = launcher("sleep").launch("hog", &Footprint::single(30), &domain).unwrap();
        assert_eq!(domain.members().unwrap(), vec![handle.pid()]);

        handle.terminate().await.unwrap();
        assert_eq!(handle.reap().await, ProcessExit::Signaled(9));
    }

    #[tokio::test]
    async fn test_completion_fires_on_natural_exit() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);

        let handle = launcher("false").launch("hog", &Footprint::single(0), &domain).unwrap();
        let signal = handle.completion();
        let exit = tokio::time::timeout(Duration::from_secs(5), signal.clone().wait())
            .await
            .unwrap();
        assert!(matches!(exit, ProcessExit::Exited(code) if code != 0));
        assert!(signal.has_fired());
        assert_eq!(handle.exit(), Some(exit));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);

        let handle = launcher("sleep").launch("hog", &Footprint::single(30), &domain).unwrap();
        handle.terminate().await.unwrap();
        handle.terminate().await.unwrap();
        handle.reap().await;
        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_after_exit_succeeds() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);

        let handle = launcher("true").launch("hog", &Footprint::single(1), &domain).unwrap();
        assert_eq!(handle.reap().await, ProcessExit::Exited(0));
        handle.terminate().await.unwrap();
        domain.remove().unwrap();
    }

    #[tokio::test]
    async fn test_launch_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);

        let err = launcher("/nonexistent/hog")
            .launch("hog", &Footprint::single(1), &domain)
            .unwrap_err();
        assert!(matches!(err, Error::Launch { .. }));
    }

    #[tokio::test]
    async fn test_launch_into_removed_domain_fails() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);
        domain.remove().unwrap();

        let err = launcher("true")
            .launch("hog", &Footprint::single(1), &domain)
            .unwrap_err();
        assert!(matches!(err, Error::Cgroup(_)));
    }

    #[tokio::test]
    async fn test_probe_reads_proc_of_live_process() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);

        let handle = launcher("sleep").launch("hog", &Footprint::single(30), &domain).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = handle.probe();
        assert!(report.cmdline_bytes.unwrap_or_default() > 0);

        handle.terminate().await.unwrap();
        handle.reap().await;
        assert_eq!(handle.probe().cmdline_bytes, None);
    }
}
