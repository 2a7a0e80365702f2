//! Interpreter process supervision.
//!
//! A [`Launcher`] turns a [`LaunchSpec`] into a running interpreter and hands
//! back a [`ProcessHandle`]. The handle is the kernel's only view of the
//! process: it can request termination and observe the exit asynchronously.
//! [`RSupervisor`] is the real launcher; tests plug in their own.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex as StdMutex;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};

use crate::settings::Settings;

/// Bridge script evaluated by the interpreter. Connects back to the kernel
/// and serves eval/cancel requests.
pub const BRIDGE_SCRIPT: &str = include_str!("../resources/notebook.R");

/// File name the bridge script is installed under.
pub const BRIDGE_SCRIPT_NAME: &str = "notebook.R";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install bridge script at {}: {source}", .path.display())]
    Script {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How the process ended. `code` is `None` when it was killed by a signal
/// or its status could not be collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    NotStarted,
    Starting,
    Running,
    Exited(Option<i32>),
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::NotStarted => write!(f, "not started"),
            ProcessStatus::Starting => write!(f, "starting"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Exited(Some(code)) => write!(f, "exited ({})", code),
            ProcessStatus::Exited(None) => write!(f, "exited"),
        }
    }
}

/// Everything a launcher needs to start one interpreter.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Bridge script passed with `-f`
    pub script: PathBuf,
    /// Working directory (the document's directory)
    pub cwd: PathBuf,
    /// Loopback port the interpreter must connect back to
    pub port: u16,
}

/// Starts interpreter processes.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, SupervisorError>;
}

/// Kernel-side handle to a launched process.
///
/// Dropping the handle requests termination, like `kill_on_drop`.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: StdMutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

/// Launcher-side half of a [`ProcessHandle`]: receives the kill request and
/// reports the exit.
#[derive(Debug)]
pub struct ProcessControl {
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>) -> (Self, ProcessControl) {
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        (
            Self {
                pid,
                kill_tx: StdMutex::new(Some(kill_tx)),
                exit_rx,
            },
            ProcessControl { kill_rx, exit_tx },
        )
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request termination. Idempotent; returns immediately.
    pub fn terminate(&self) {
        let tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = tx {
            debug!("[r-process] Terminating pid {:?}", self.pid);
            let _ = tx.send(());
        }
    }

    /// Wait for the process to exit. If the launcher side disappears without
    /// reporting, the exit code is unknown.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let result = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => *exit,
            Err(_) => None,
        };
        result.unwrap_or(ProcessExit { code: None })
    }

    /// Non-blocking exit check.
    pub fn try_exit(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    pub fn status(&self) -> ProcessStatus {
        match self.try_exit() {
            Some(exit) => ProcessStatus::Exited(exit.code),
            None => ProcessStatus::Running,
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl ProcessControl {
    /// Resolves when termination was requested or the handle was dropped.
    pub async fn kill_requested(&mut self) {
        let _ = (&mut self.kill_rx).await;
    }

    pub fn report_exit(&self, code: Option<i32>) {
        self.exit_tx.send_replace(Some(ProcessExit { code }));
    }
}

/// Launches the R interpreter.
#[derive(Debug, Clone)]
pub struct RSupervisor {
    r_path: PathBuf,
    r_args: Vec<String>,
    locale: String,
}

impl RSupervisor {
    pub fn new(settings: &Settings) -> Self {
        Self {
            r_path: settings.r_path.clone(),
            r_args: settings.r_args.clone(),
            locale: settings.locale.clone(),
        }
    }

    /// Command-line arguments after the program name.
    pub fn args(&self, spec: &LaunchSpec) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.r_args.iter().map(OsString::from).collect();
        args.push("-f".into());
        args.push(spec.script.clone().into_os_string());
        args.push("--args".into());
        args.push(format!("port={}", spec.port).into());
        args
    }
}

impl Launcher for RSupervisor {
    fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, SupervisorError> {
        let mut cmd = Command::new(&self.r_path);
        cmd.args(self.args(spec))
            .current_dir(&spec.cwd)
            .env("LC_ALL", &self.locale)
            .env("LANG", &self.locale)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: self.r_path.display().to_string(),
                source,
            })?;

        let pid = child.id();
        info!(
            "[r-process] Started {} (pid {:?}) in {} on port {}",
            self.r_path.display(),
            pid,
            spec.cwd.display(),
            spec.port
        );

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, pid, false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, pid, true);
        }

        let (handle, mut control) = ProcessHandle::new(pid);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = control.kill_requested() => {
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        kill_process_group(pid as i32);
                    }
                    if let Err(e) = child.start_kill() {
                        debug!("[r-process] start_kill failed for pid {:?}: {}", pid, e);
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("[r-process] Failed to collect exit status of pid {:?}: {}", pid, e);
                    None
                }
            };
            info!("[r-process] pid {:?} exited with code {:?}", pid, code);
            control.report_exit(code);
        });

        Ok(handle)
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: i32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        if e != nix::errno::Errno::ESRCH {
            error!("[r-process] Failed to kill process group {}: {}", pgid, e);
        }
    }
}

/// Drain a child stream into the log, one line at a time.
fn forward_output<R>(stream: R, pid: Option<u32>, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if is_stderr => warn!("[r-process] {:?} stderr: {}", pid, line),
                Ok(Some(line)) => debug!("[r-process] {:?} stdout: {}", pid, line),
                Ok(None) => break,
                Err(e) => {
                    debug!("[r-process] Output stream of pid {:?} ended: {}", pid, e);
                    break;
                }
            }
        }
    });
}

/// Write the bridge script into `dir`, leaving an identical file untouched.
pub fn install_bridge_script(dir: &Path) -> Result<PathBuf, SupervisorError> {
    let path = dir.join(BRIDGE_SCRIPT_NAME);
    let to_error = |source| SupervisorError::Script {
        path: path.clone(),
        source,
    };

    if std::fs::read_to_string(&path).ok().as_deref() == Some(BRIDGE_SCRIPT) {
        return Ok(path);
    }
    std::fs::create_dir_all(dir).map_err(to_error)?;
    std::fs::write(&path, BRIDGE_SCRIPT).map_err(to_error)?;
    debug!("[r-process] Installed bridge script at {}", path.display());
    Ok(path)
}
