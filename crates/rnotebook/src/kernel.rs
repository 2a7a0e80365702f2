//! Kernel: one interpreter process plus one connection per document.
//!
//! The kernel binds a loopback listener, asks its [`Launcher`] to start the
//! interpreter with the port, and waits for the connect-back. Requests are
//! correlated to responses through a pending map keyed by request id, so
//! several evaluations may be in flight and responses may arrive in any
//! order.
//!
//! A monitor task per session routes responses and watches for process exit
//! or connection loss. Every session gets a fresh generation number; state
//! mutations from a monitor whose generation is stale are ignored, so a
//! restart can never be confused by the previous process dying late.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::protocol::{Request, Response, CANCEL_CURRENT};
use crate::supervisor::{LaunchSpec, Launcher, ProcessHandle, ProcessStatus};
use crate::transport::{Connection, Listener, TransportEvent};

/// After the socket closes, how long to wait for the process exit before
/// reporting a plain connection loss.
const EXIT_GRACE: Duration = Duration::from_millis(200);

const EVENT_CAPACITY: usize = 64;

/// Kernel status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    /// No process
    Stopped,
    /// Process launched, waiting for it to connect
    Starting,
    /// Connected and idle
    Ready,
    /// At least one evaluation in flight
    Evaluating,
    /// Process exited or connection lost; needs a restart
    Errored,
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::Stopped => write!(f, "stopped"),
            KernelStatus::Starting => write!(f, "starting"),
            KernelStatus::Ready => write!(f, "ready"),
            KernelStatus::Evaluating => write!(f, "evaluating"),
            KernelStatus::Errored => write!(f, "errored"),
        }
    }
}

/// Published on every kernel state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    Status(KernelStatus),
    Exited { code: Option<i32> },
    ConnectionLost { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("failed to start interpreter: {0}")]
    SpawnFailure(String),

    #[error("interpreter did not connect within {0:?}")]
    ConnectionTimeout(Duration),

    #[error("interpreter exited unexpectedly (code {code:?})")]
    UnexpectedExit { code: Option<i32> },

    #[error("connection to interpreter lost: {0}")]
    ConnectionLost(String),

    #[error("kernel is not running")]
    NotReady,

    #[error("request {0} is already in flight")]
    DuplicateRequest(u64),

    #[error("kernel was stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Bridge script handed to the launcher
    pub script: PathBuf,
    /// Interpreter working directory
    pub cwd: PathBuf,
    pub connect_timeout: Duration,
}

type PendingReply = oneshot::Sender<Result<Response, KernelError>>;

struct Session {
    process: ProcessHandle,
    connection: Connection,
    port: u16,
}

struct KernelState {
    status: KernelStatus,
    generation: u64,
    pending: HashMap<u64, PendingReply>,
    session: Option<Arc<Session>>,
    monitor: Option<JoinHandle<()>>,
    start_attempts: u64,
    last_start_error: Option<KernelError>,
}

type SharedState = Arc<StdMutex<KernelState>>;

fn lock(state: &StdMutex<KernelState>) -> MutexGuard<'_, KernelState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Kernel {
    launcher: Arc<dyn Launcher>,
    config: KernelConfig,
    /// Serializes start/stop/restart
    lifecycle: tokio::sync::Mutex<()>,
    state: SharedState,
    events: broadcast::Sender<KernelEvent>,
}

impl Kernel {
    pub fn new(launcher: Arc<dyn Launcher>, config: KernelConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            launcher,
            config,
            lifecycle: tokio::sync::Mutex::new(()),
            state: Arc::new(StdMutex::new(KernelState {
                status: KernelStatus::Stopped,
                generation: 0,
                pending: HashMap::new(),
                session: None,
                monitor: None,
                start_attempts: 0,
                last_start_error: None,
            })),
            events,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn status(&self) -> KernelStatus {
        lock(&self.state).status
    }

    pub fn process_status(&self) -> ProcessStatus {
        let state = lock(&self.state);
        match (&state.session, state.status) {
            (Some(session), _) => session.process.status(),
            (None, KernelStatus::Starting) => ProcessStatus::Starting,
            (None, _) => ProcessStatus::NotStarted,
        }
    }

    /// Port of the current session, if connected.
    pub fn port(&self) -> Option<u16> {
        lock(&self.state).session.as_ref().map(|s| s.port)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: KernelEvent) {
        let _ = self.events.send(event);
    }

    /// Start the interpreter and wait until it connects.
    ///
    /// No-op when already running. Concurrent callers share one attempt: the
    /// ones that queued behind it get its result instead of launching again.
    pub async fn start(&self) -> Result<(), KernelError> {
        let attempt = lock(&self.state).start_attempts;
        let _guard = self.lifecycle.lock().await;
        {
            let state = lock(&self.state);
            if matches!(state.status, KernelStatus::Ready | KernelStatus::Evaluating) {
                return Ok(());
            }
            if state.start_attempts != attempt {
                if let Some(e) = &state.last_start_error {
                    return Err(e.clone());
                }
            }
        }
        self.start_locked().await
    }

    /// Terminate the interpreter, close the connection and fail everything
    /// pending. Always succeeds.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked().await;
    }

    /// Stop, then start. In-flight evaluations fail with [`KernelError::Stopped`].
    pub async fn restart(&self) -> Result<(), KernelError> {
        let _guard = self.lifecycle.lock().await;
        info!("[kernel] Restarting");
        self.stop_locked().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<(), KernelError> {
        if let Some(old) = self.teardown(KernelError::Stopped) {
            close_session(&old).await;
        }

        let generation = {
            let mut state = lock(&self.state);
            state.start_attempts += 1;
            state.last_start_error = None;
            state.status = KernelStatus::Starting;
            state.generation
        };
        self.publish(KernelEvent::Status(KernelStatus::Starting));
        info!("[kernel] Starting interpreter in {}", self.config.cwd.display());

        match self.launch().await {
            Ok((session, transport)) => {
                let port = session.port;
                let session = Arc::new(session);
                {
                    let mut state = lock(&self.state);
                    let monitor = tokio::spawn(monitor_session(
                        self.state.clone(),
                        self.events.clone(),
                        session.clone(),
                        transport,
                        generation,
                    ));
                    state.session = Some(session);
                    state.monitor = Some(monitor);
                    state.status = KernelStatus::Ready;
                }
                info!("[kernel] Ready on port {}", port);
                self.publish(KernelEvent::Status(KernelStatus::Ready));
                Ok(())
            }
            Err(e) => {
                let status = match e {
                    KernelError::UnexpectedExit { .. } => KernelStatus::Errored,
                    _ => KernelStatus::Stopped,
                };
                error!("[kernel] Start failed: {}", e);
                {
                    let mut state = lock(&self.state);
                    state.status = status;
                    state.last_start_error = Some(e.clone());
                }
                if let KernelError::UnexpectedExit { code } = e {
                    self.publish(KernelEvent::Exited { code });
                }
                self.publish(KernelEvent::Status(status));
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
    ) -> Result<(Session, mpsc::UnboundedReceiver<TransportEvent>), KernelError> {
        let listener = Listener::bind()
            .await
            .map_err(|e| KernelError::SpawnFailure(format!("failed to bind listener: {}", e)))?;
        let port = listener.port();
        let spec = LaunchSpec {
            script: self.config.script.clone(),
            cwd: self.config.cwd.clone(),
            port,
        };
        let process = self
            .launcher
            .launch(&spec)
            .map_err(|e| KernelError::SpawnFailure(e.to_string()))?;

        let timeout = self.config.connect_timeout;
        let stream = tokio::select! {
            accepted = tokio::time::timeout(timeout, listener.accept()) => match accepted {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    process.terminate();
                    return Err(KernelError::SpawnFailure(format!("accept failed: {}", e)));
                }
                Err(_) => {
                    warn!("[kernel] Interpreter did not connect within {:?}", timeout);
                    process.terminate();
                    return Err(KernelError::ConnectionTimeout(timeout));
                }
            },
            exit = process.wait() => {
                return Err(KernelError::UnexpectedExit { code: exit.code });
            }
        };

        let (connection, transport) = Connection::open(stream);
        Ok((
            Session {
                process,
                connection,
                port,
            },
            transport,
        ))
    }

    async fn stop_locked(&self) {
        let session = self.teardown(KernelError::Stopped);
        let changed = {
            let mut state = lock(&self.state);
            let changed = state.status != KernelStatus::Stopped;
            state.status = KernelStatus::Stopped;
            changed
        };
        if let Some(session) = session {
            info!("[kernel] Stopping interpreter on port {}", session.port);
            close_session(&session).await;
        }
        if changed {
            self.publish(KernelEvent::Status(KernelStatus::Stopped));
        }
    }

    /// Invalidate the current generation and detach its session.
    fn teardown(&self, error: KernelError) -> Option<Arc<Session>> {
        let (pending, session, monitor) = {
            let mut state = lock(&self.state);
            state.generation += 1;
            (
                std::mem::take(&mut state.pending),
                state.session.take(),
                state.monitor.take(),
            )
        };
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        if !pending.is_empty() {
            debug!("[kernel] Failing {} pending request(s): {}", pending.len(), error);
        }
        for (_, reply) in pending {
            let _ = reply.send(Err(error.clone()));
        }
        session
    }

    /// Evaluate `expr` and wait for its response.
    ///
    /// An `error` response is a successful round trip; transport and process
    /// failures surface as [`KernelError`].
    pub async fn eval(&self, id: u64, expr: impl Into<String>) -> Result<Response, KernelError> {
        let (reply_rx, session, generation, became_busy) = {
            let mut state = lock(&self.state);
            if !matches!(state.status, KernelStatus::Ready | KernelStatus::Evaluating) {
                return Err(KernelError::NotReady);
            }
            let Some(session) = state.session.clone() else {
                return Err(KernelError::NotReady);
            };
            if state.pending.contains_key(&id) {
                return Err(KernelError::DuplicateRequest(id));
            }
            let (tx, rx) = oneshot::channel();
            state.pending.insert(id, tx);
            let became_busy = state.status == KernelStatus::Ready;
            state.status = KernelStatus::Evaluating;
            (rx, session, state.generation, became_busy)
        };
        if became_busy {
            self.publish(KernelEvent::Status(KernelStatus::Evaluating));
        }

        debug!("[kernel] eval id={}", id);
        let request = Request::Eval {
            id,
            expr: expr.into(),
        };
        if let Err(e) = session.connection.send(&request).await {
            error!("[kernel] Failed to send eval {}: {}", id, e);
            self.forget(id, generation);
            return Err(KernelError::ConnectionLost(e.to_string()));
        }

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(KernelError::Stopped),
        }
    }

    fn forget(&self, id: u64, generation: u64) {
        let became_idle = {
            let mut state = lock(&self.state);
            if state.generation != generation {
                return;
            }
            state.pending.remove(&id);
            settle_idle(&mut state)
        };
        if became_idle {
            self.publish(KernelEvent::Status(KernelStatus::Ready));
        }
    }

    /// Ask the interpreter to abandon evaluation `id`, or whatever is running
    /// when `None`. Best-effort: the pending eval still resolves with
    /// whatever the interpreter sends back.
    pub async fn cancel(&self, id: Option<u64>) -> Result<(), KernelError> {
        let session = {
            let state = lock(&self.state);
            if !matches!(state.status, KernelStatus::Ready | KernelStatus::Evaluating) {
                return Err(KernelError::NotReady);
            }
            state.session.clone().ok_or(KernelError::NotReady)?
        };
        let id = id.unwrap_or(CANCEL_CURRENT);
        debug!("[kernel] cancel id={}", id);
        session
            .connection
            .send(&Request::Cancel { id })
            .await
            .map_err(|e| KernelError::ConnectionLost(e.to_string()))
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.generation += 1;
        if let Some(monitor) = state.monitor.take() {
            monitor.abort();
        }
        if let Some(session) = state.session.take() {
            session.process.terminate();
        }
    }
}

async fn close_session(session: &Session) {
    session.process.terminate();
    session.connection.close().await;
}

/// Evaluating → Ready once nothing is pending. Returns true on transition.
fn settle_idle(state: &mut KernelState) -> bool {
    if state.pending.is_empty() && state.status == KernelStatus::Evaluating {
        state.status = KernelStatus::Ready;
        true
    } else {
        false
    }
}

fn resolve(
    state: &StdMutex<KernelState>,
    events: &broadcast::Sender<KernelEvent>,
    generation: u64,
    response: Response,
) {
    let (reply, became_idle) = {
        let mut state = lock(state);
        if state.generation != generation {
            return;
        }
        let Some(reply) = state.pending.remove(&response.id) else {
            warn!(
                "[kernel] Dropping {} response for unknown request {}",
                response.kind, response.id
            );
            return;
        };
        (reply, settle_idle(&mut state))
    };

    if became_idle {
        let _ = events.send(KernelEvent::Status(KernelStatus::Ready));
    }
    let id = response.id;
    if reply.send(Ok(response)).is_err() {
        debug!("[kernel] Caller for request {} went away", id);
    }
}

fn fail_session(
    state: &StdMutex<KernelState>,
    events: &broadcast::Sender<KernelEvent>,
    generation: u64,
    error: KernelError,
) {
    let pending = {
        let mut state = lock(state);
        if state.generation != generation {
            return;
        }
        state.status = KernelStatus::Errored;
        std::mem::take(&mut state.pending)
    };

    error!(
        "[kernel] {} ({} pending request(s) failed)",
        error,
        pending.len()
    );
    let event = match &error {
        KernelError::UnexpectedExit { code } => KernelEvent::Exited { code: *code },
        other => KernelEvent::ConnectionLost {
            reason: other.to_string(),
        },
    };
    let _ = events.send(event);
    let _ = events.send(KernelEvent::Status(KernelStatus::Errored));

    for (_, reply) in pending {
        let _ = reply.send(Err(error.clone()));
    }
}

async fn monitor_session(
    state: SharedState,
    events: broadcast::Sender<KernelEvent>,
    session: Arc<Session>,
    mut transport: mpsc::UnboundedReceiver<TransportEvent>,
    generation: u64,
) {
    loop {
        tokio::select! {
            biased;

            event = transport.recv() => match event {
                Some(TransportEvent::Response(response)) => {
                    resolve(&state, &events, generation, response);
                }
                other => {
                    let reason = match other {
                        Some(TransportEvent::Closed { reason }) => reason,
                        _ => "transport reader stopped".to_string(),
                    };
                    // A closing socket usually means the process is on its
                    // way out; report the exit if it follows promptly.
                    let error = match tokio::time::timeout(EXIT_GRACE, session.process.wait()).await {
                        Ok(exit) => KernelError::UnexpectedExit { code: exit.code },
                        Err(_) => KernelError::ConnectionLost(reason),
                    };
                    session.process.terminate();
                    fail_session(&state, &events, generation, error);
                    return;
                }
            },

            exit = session.process.wait() => {
                while let Ok(TransportEvent::Response(response)) = transport.try_recv() {
                    resolve(&state, &events, generation, response);
                }
                fail_session(
                    &state,
                    &events,
                    generation,
                    KernelError::UnexpectedExit { code: exit.code },
                );
                return;
            }
        }
    }
}
