//! Cell execution controller.
//!
//! Owns the registry of open documents. Each document gets its own kernel,
//! parsed cells and run state. Cell state lives behind a short-lived
//! per-document lock that is never held across an await on the kernel;
//! evaluations of one document are serialized through a separate async lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use base64::prelude::*;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;

use crate::kernel::{Kernel, KernelConfig, KernelError, KernelStatus};
use crate::notebook::{self, Cell};
use crate::protocol::{Response, ResponseKind};
use crate::settings::Settings;
use crate::supervisor::Launcher;

/// Run state of a code cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
}

/// Typed output of a finished cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CellOutput {
    Text { text: String },
    /// Image embedded as base64 with its MIME type
    Plot {
        mime: String,
        data: String,
        path: PathBuf,
    },
    Viewer { text: String },
    Browser { text: String },
    Error { message: String },
}

/// Execution bookkeeping for one cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CellRun {
    pub state: RunState,
    pub execution_order: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub output: Option<CellOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentCell {
    #[serde(flatten)]
    pub cell: Cell,
    pub run: CellRun,
}

#[derive(Debug)]
pub struct Document {
    pub path: PathBuf,
    pub cells: Vec<DocumentCell>,
    /// Last execution order handed out
    pub execution_counter: u64,
}

impl Document {
    fn cells(&self) -> Vec<Cell> {
        self.cells.iter().map(|c| c.cell.clone()).collect()
    }
}

/// Where an editor command points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellRef {
    Index(usize),
    /// 0-based line in the document text
    Line(usize),
}

/// Editor-facing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotebookCommand {
    RunCurrentCell(CellRef),
    RunAll,
    RunAbove(CellRef),
    RunBelow(CellRef),
    RunCurrentAndBelow(CellRef),
    RunPrevious(CellRef),
    RunNext(CellRef),
    CancelCurrent(CellRef),
    CancelAll,
    RestartKernel,
}

/// One open document with its kernel.
pub struct NotebookSession {
    uri: String,
    document: StdMutex<Document>,
    kernel: Arc<Kernel>,
    /// Serializes evaluations within the document
    exec_lock: tokio::sync::Mutex<()>,
    /// Bumped by cancel-all and restart; batch runs stop when it changes
    cancel_epoch: AtomicU64,
}

impl NotebookSession {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    fn lock_document(&self) -> MutexGuard<'_, Document> {
        self.document.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the cells and their run state.
    pub fn cells(&self) -> Vec<DocumentCell> {
        self.lock_document().cells.clone()
    }

    pub fn cell(&self, index: usize) -> Option<DocumentCell> {
        self.lock_document().cells.get(index).cloned()
    }

    pub fn serialize(&self) -> String {
        notebook::serialize(&self.lock_document().cells())
    }

    fn resolve(&self, cell: CellRef) -> Result<usize> {
        let document = self.lock_document();
        match cell {
            CellRef::Index(index) if index < document.cells.len() => Ok(index),
            CellRef::Index(index) => bail!("cell {} out of range", index),
            CellRef::Line(line) => notebook::cell_at_line(&document.cells(), line)
                .ok_or_else(|| anyhow!("no cell at line {}", line)),
        }
    }

    /// Indices of runnable cells selected by `filter`, in document order.
    fn runnable_where(&self, filter: impl Fn(usize, &Cell) -> bool) -> Vec<usize> {
        self.lock_document()
            .cells
            .iter()
            .enumerate()
            .filter(|(i, c)| c.cell.runnable && filter(*i, &c.cell))
            .map(|(i, _)| i)
            .collect()
    }

    fn epoch(&self) -> u64 {
        self.cancel_epoch.load(Ordering::SeqCst)
    }

    fn bump_epoch(&self) {
        self.cancel_epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn document_dir(&self) -> PathBuf {
        document_dir(&self.lock_document().path)
    }
}

/// Directory relative paths in a document resolve against.
fn document_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Open documents keyed by URI.
#[derive(Default)]
pub struct Registry {
    sessions: StdMutex<HashMap<String, Arc<NotebookSession>>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<NotebookSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, uri: &str) -> Option<Arc<NotebookSession>> {
        self.lock().get(uri).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn remove(&self, uri: &str) -> Option<Arc<NotebookSession>> {
        self.lock().remove(uri)
    }

    fn drain(&self) -> Vec<Arc<NotebookSession>> {
        self.lock().drain().map(|(_, s)| s).collect()
    }
}

pub struct Controller {
    settings: Settings,
    launcher: Arc<dyn Launcher>,
    script: PathBuf,
    registry: Registry,
}

impl Controller {
    pub fn new(settings: Settings, launcher: Arc<dyn Launcher>, script: PathBuf) -> Self {
        Self {
            settings,
            launcher,
            script,
            registry: Registry::default(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn session(&self, uri: &str) -> Result<Arc<NotebookSession>> {
        self.registry
            .get(uri)
            .ok_or_else(|| anyhow!("document {} is not open", uri))
    }

    /// Register a document and parse its cells. The kernel starts lazily.
    /// Opening an already open document returns the existing session.
    pub fn open(&self, uri: &str, path: &Path, text: &str) -> Arc<NotebookSession> {
        let mut sessions = self.registry.lock();
        if let Some(existing) = sessions.get(uri) {
            return existing.clone();
        }

        let cells = notebook::parse(text, &self.settings.target_language)
            .into_iter()
            .map(|cell| DocumentCell {
                cell,
                run: CellRun::default(),
            })
            .collect::<Vec<_>>();
        let kernel = Kernel::new(
            self.launcher.clone(),
            KernelConfig {
                script: self.script.clone(),
                cwd: document_dir(path),
                connect_timeout: self.settings.connect_timeout(),
            },
        );
        info!("[controller] Opened {} ({} cells)", uri, cells.len());

        let session = Arc::new(NotebookSession {
            uri: uri.to_string(),
            document: StdMutex::new(Document {
                path: path.to_path_buf(),
                cells,
                execution_counter: 0,
            }),
            kernel: Arc::new(kernel),
            exec_lock: tokio::sync::Mutex::new(()),
            cancel_epoch: AtomicU64::new(0),
        });
        sessions.insert(uri.to_string(), session.clone());
        session
    }

    /// Stop the document's kernel and forget it.
    pub async fn close(&self, uri: &str) {
        if let Some(session) = self.registry.remove(uri) {
            session.bump_epoch();
            session.kernel.stop().await;
            info!("[controller] Closed {}", uri);
        }
    }

    /// Stop every kernel. Used on deactivation.
    pub async fn shutdown_all(&self) {
        for session in self.registry.drain() {
            session.bump_epoch();
            session.kernel.stop().await;
        }
    }

    pub fn serialize(&self, uri: &str) -> Result<String> {
        Ok(self.session(uri)?.serialize())
    }

    /// Restart the kernel if one is running, then evaluate every runnable
    /// cell in order, one at a time.
    pub async fn run_all(&self, uri: &str) -> Result<()> {
        let session = self.session(uri)?;
        if session.kernel.status() != KernelStatus::Stopped {
            // Also stops a batch that is still in progress.
            self.restart_session(&session)
                .await
                .with_context(|| format!("failed to restart kernel for {}", uri))?;
        }
        let indices = session.runnable_where(|_, cell| cell.evaluates());
        self.run_sequence(&session, indices).await
    }

    async fn run_sequence(&self, session: &NotebookSession, indices: Vec<usize>) -> Result<()> {
        let epoch = session.epoch();
        for index in indices {
            if session.epoch() != epoch {
                info!("[controller] Run of {} cancelled", session.uri);
                break;
            }
            let state = self.run_cell(session, index).await?;
            if state == RunState::Failed && self.settings.stop_on_error {
                info!(
                    "[controller] Stopping {} at failed cell {}",
                    session.uri, index
                );
                break;
            }
        }
        Ok(())
    }

    /// Evaluate one cell. A cell that is already running is left alone.
    pub async fn run_one(&self, uri: &str, index: usize) -> Result<RunState> {
        let session = self.session(uri)?;
        self.run_cell(&session, index).await
    }

    async fn run_cell(&self, session: &NotebookSession, index: usize) -> Result<RunState> {
        let (order, source, epoch, started) = {
            let mut document = session.lock_document();
            let next_order = document.execution_counter + 1;
            let entry = document
                .cells
                .get_mut(index)
                .ok_or_else(|| anyhow!("cell {} out of range", index))?;
            if !entry.cell.runnable {
                bail!(
                    "cell {} is not runnable ({})",
                    index,
                    entry.cell.language
                );
            }
            if entry.run.state == RunState::Running {
                debug!("[controller] Cell {} is already running", index);
                return Ok(RunState::Running);
            }
            entry.run = CellRun {
                state: RunState::Running,
                execution_order: Some(next_order),
                started_at: Some(Utc::now()),
                duration_ms: None,
                output: None,
            };
            let source = entry.cell.source.clone();
            document.execution_counter = next_order;
            // Duration covers any wait behind a cell that is still running.
            (next_order, source, session.epoch(), Instant::now())
        };

        let _exec = session.exec_lock.lock().await;

        if session.epoch() != epoch {
            self.finish(session, index, order, RunState::Idle, None, started);
            return Ok(RunState::Idle);
        }

        if let Err(e) = self.ensure_kernel(session).await {
            self.finish(
                session,
                index,
                order,
                RunState::Failed,
                Some(CellOutput::Error {
                    message: e.to_string(),
                }),
                started,
            );
            return Err(anyhow::Error::new(e)
                .context(format!("failed to start kernel for {}", session.uri)));
        }

        match session.kernel.eval(order, source).await {
            Ok(response) => {
                let (state, output) = self.project(session, response).await;
                self.finish(session, index, order, state, Some(output), started);
                Ok(state)
            }
            Err(KernelError::Stopped) => {
                // Restarted or closed underneath us.
                self.finish(session, index, order, RunState::Idle, None, started);
                Ok(RunState::Idle)
            }
            Err(e) => {
                self.finish(
                    session,
                    index,
                    order,
                    RunState::Failed,
                    Some(CellOutput::Error {
                        message: e.to_string(),
                    }),
                    started,
                );
                Err(anyhow::Error::new(e).context(format!("evaluation of cell {} failed", index)))
            }
        }
    }

    async fn ensure_kernel(&self, session: &NotebookSession) -> Result<(), KernelError> {
        match session.kernel.status() {
            KernelStatus::Ready | KernelStatus::Evaluating => Ok(()),
            KernelStatus::Errored => {
                warn!("[controller] Kernel for {} errored, restarting", session.uri);
                session.kernel.restart().await
            }
            KernelStatus::Stopped | KernelStatus::Starting => session.kernel.start().await,
        }
    }

    /// Record the outcome of a run, unless the cell was re-run meanwhile.
    fn finish(
        &self,
        session: &NotebookSession,
        index: usize,
        order: u64,
        state: RunState,
        output: Option<CellOutput>,
        started: Instant,
    ) {
        let mut document = session.lock_document();
        let Some(entry) = document.cells.get_mut(index) else {
            return;
        };
        if entry.run.execution_order != Some(order) {
            return;
        }
        entry.run.state = state;
        entry.run.output = output;
        entry.run.duration_ms = Some(started.elapsed().as_millis() as u64);
        debug!(
            "[controller] Cell {} of {} finished: {:?}",
            index, session.uri, state
        );
    }

    async fn project(&self, session: &NotebookSession, response: Response) -> (RunState, CellOutput) {
        match response.kind {
            ResponseKind::Text => (
                RunState::Succeeded,
                CellOutput::Text {
                    text: response.result,
                },
            ),
            ResponseKind::Viewer => (
                RunState::Succeeded,
                CellOutput::Viewer {
                    text: response.result,
                },
            ),
            ResponseKind::Browser => (
                RunState::Succeeded,
                CellOutput::Browser {
                    text: response.result,
                },
            ),
            ResponseKind::Error => (
                RunState::Failed,
                CellOutput::Error {
                    message: response.result,
                },
            ),
            ResponseKind::Plot => {
                let mut path = PathBuf::from(response.result.trim());
                if path.is_relative() {
                    path = session.document_dir().join(path);
                }
                match plot_output(&path).await {
                    Ok(output) => (RunState::Succeeded, output),
                    Err(e) => (
                        RunState::Failed,
                        CellOutput::Error {
                            message: format!("{:#}", e),
                        },
                    ),
                }
            }
        }
    }

    /// Ask the interpreter to abandon a running cell. No-op otherwise.
    /// Returns whether a cancel was sent.
    pub async fn cancel_one(&self, uri: &str, index: usize) -> Result<bool> {
        let session = self.session(uri)?;
        let order = {
            let document = session.lock_document();
            match document.cells.get(index) {
                Some(entry) if entry.run.state == RunState::Running => entry.run.execution_order,
                Some(_) => None,
                None => bail!("cell {} out of range", index),
            }
        };
        let Some(order) = order else {
            return Ok(false);
        };
        session.kernel.cancel(Some(order)).await?;
        Ok(true)
    }

    /// Cancel every running cell and stop any batch run in progress.
    /// Returns the number of cancels sent.
    pub async fn cancel_all(&self, uri: &str) -> Result<usize> {
        let session = self.session(uri)?;
        session.bump_epoch();
        let running: Vec<u64> = session
            .lock_document()
            .cells
            .iter()
            .filter(|c| c.run.state == RunState::Running)
            .filter_map(|c| c.run.execution_order)
            .collect();
        for order in &running {
            session.kernel.cancel(Some(*order)).await?;
        }
        Ok(running.len())
    }

    /// Restart the document's kernel. Cells that were running go back to idle.
    pub async fn restart(&self, uri: &str) -> Result<()> {
        let session = self.session(uri)?;
        self.restart_session(&session)
            .await
            .with_context(|| format!("failed to restart kernel for {}", uri))
    }

    async fn restart_session(&self, session: &NotebookSession) -> Result<(), KernelError> {
        session.bump_epoch();
        let result = session.kernel.restart().await;
        let mut document = session.lock_document();
        for entry in document.cells.iter_mut() {
            if entry.run.state == RunState::Running {
                entry.run.state = RunState::Idle;
            }
        }
        result
    }

    pub async fn execute(&self, uri: &str, command: NotebookCommand) -> Result<()> {
        let session = self.session(uri)?;
        debug!("[controller] {:?} on {}", command, uri);
        match command {
            NotebookCommand::RunAll => self.run_all(uri).await,
            NotebookCommand::RunCurrentCell(cell) => {
                let index = session.resolve(cell)?;
                self.run_cell(&session, index).await.map(|_| ())
            }
            NotebookCommand::RunAbove(cell) => {
                let current = session.resolve(cell)?;
                let indices = session.runnable_where(|i, c| i < current && c.evaluates());
                self.run_sequence(&session, indices).await
            }
            NotebookCommand::RunBelow(cell) => {
                let current = session.resolve(cell)?;
                let indices = session.runnable_where(|i, c| i > current && c.evaluates());
                self.run_sequence(&session, indices).await
            }
            NotebookCommand::RunCurrentAndBelow(cell) => {
                let current = session.resolve(cell)?;
                let indices = session.runnable_where(|i, c| i >= current && c.evaluates());
                self.run_sequence(&session, indices).await
            }
            NotebookCommand::RunPrevious(cell) => {
                let current = session.resolve(cell)?;
                let previous = session.runnable_where(|i, _| i < current).pop();
                match previous {
                    Some(index) => self.run_cell(&session, index).await.map(|_| ()),
                    None => Ok(()),
                }
            }
            NotebookCommand::RunNext(cell) => {
                let current = session.resolve(cell)?;
                let next = session.runnable_where(|i, _| i > current).first().copied();
                match next {
                    Some(index) => self.run_cell(&session, index).await.map(|_| ()),
                    None => Ok(()),
                }
            }
            NotebookCommand::CancelCurrent(cell) => {
                let index = session.resolve(cell)?;
                self.cancel_one(uri, index).await.map(|_| ())
            }
            NotebookCommand::CancelAll => self.cancel_all(uri).await.map(|_| ()),
            NotebookCommand::RestartKernel => self.restart(uri).await,
        }
    }
}

/// MIME type for an image artifact, from its extension.
pub fn plot_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "svg" => Some("image/svg+xml"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

async fn plot_output(path: &Path) -> Result<CellOutput> {
    let Some(mime) = plot_mime(path) else {
        // Not embeddable; show where it is.
        return Ok(CellOutput::Text {
            text: path.display().to_string(),
        });
    };
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read plot {}", path.display()))?;
    Ok(CellOutput::Plot {
        mime: mime.to_string(),
        data: BASE64_STANDARD.encode(bytes),
        path: path.to_path_buf(),
    })
}
