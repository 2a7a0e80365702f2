//! In-process stand-in for the R bridge.
//!
//! `FakeInterpreter` implements `Launcher`: every launch spawns a task that
//! connects back to the kernel's port and answers requests the way the
//! bridge script would. A few magic expressions drive failure paths:
//!
//! - `1+1` answers `[1] 2`
//! - `stop("msg")` answers an error with `msg`
//! - `plot:<path>` answers a plot pointing at `<path>`
//! - `hang` never answers
//! - `exit` makes the "process" exit with code 1 while the socket stays open
//! - `disconnect` closes the socket while the "process" keeps running
//! - `stray` first answers a request id nobody sent, then echoes
//!
//! Anything else is echoed back as text.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use rnotebook::connection::{send_json_frame, FramedReader};
use rnotebook::protocol::{Request, Response, ResponseKind};
use rnotebook::supervisor::{
    LaunchSpec, Launcher, ProcessControl, ProcessHandle, SupervisorError,
};
use tokio::net::TcpStream;

/// Added to the real id for the unsolicited answer sent by `stray`.
pub const STRAY_OFFSET: u64 = 1000;

#[derive(Debug, Clone, Default)]
pub struct FakeOptions {
    /// Delay before connecting back
    pub connect_delay: Duration,
    /// Delay before each answer
    pub reply_delay: Duration,
    /// Hold answers and send them in pairs, newest first
    pub reverse_pairs: bool,
}

#[derive(Default)]
struct Shared {
    launches: AtomicUsize,
    kills: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: StdMutex<Vec<Request>>,
    specs: StdMutex<Vec<LaunchSpec>>,
}

#[derive(Clone, Default)]
pub struct FakeInterpreter {
    options: FakeOptions,
    shared: Arc<Shared>,
}

impl FakeInterpreter {
    pub fn new(options: FakeOptions) -> Self {
        Self {
            options,
            shared: Arc::default(),
        }
    }

    pub fn launches(&self) -> usize {
        self.shared.launches.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.shared.kills.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.shared.requests.lock().unwrap().clone()
    }

    pub fn specs(&self) -> Vec<LaunchSpec> {
        self.shared.specs.lock().unwrap().clone()
    }

    pub fn eval_ids(&self) -> Vec<u64> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                Request::Eval { id, .. } => Some(id),
                Request::Cancel { .. } => None,
            })
            .collect()
    }

    pub fn cancels(&self) -> Vec<u64> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                Request::Cancel { id } => Some(id),
                Request::Eval { .. } => None,
            })
            .collect()
    }
}

impl Launcher for FakeInterpreter {
    fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, SupervisorError> {
        let pid = self.shared.launches.fetch_add(1, Ordering::SeqCst) as u32 + 1000;
        self.shared.specs.lock().unwrap().push(spec.clone());
        let (handle, control) = ProcessHandle::new(Some(pid));
        tokio::spawn(serve(
            spec.port,
            control,
            self.options.clone(),
            self.shared.clone(),
        ));
        Ok(handle)
    }
}

fn answer(id: u64, expr: &str) -> Response {
    let expr = expr.trim();
    if expr == "1+1" {
        return Response::new(id, ResponseKind::Text, "[1] 2");
    }
    if let Some(message) = expr
        .strip_prefix("stop(\"")
        .and_then(|rest| rest.strip_suffix("\")"))
    {
        return Response::new(id, ResponseKind::Error, message);
    }
    if let Some(path) = expr.strip_prefix("plot:") {
        return Response::new(id, ResponseKind::Plot, path);
    }
    Response::new(id, ResponseKind::Text, expr)
}

async fn serve(port: u16, mut control: ProcessControl, options: FakeOptions, shared: Arc<Shared>) {
    tokio::time::sleep(options.connect_delay).await;
    let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await else {
        control.report_exit(Some(2));
        return;
    };
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FramedReader::new(read_half);
    let mut held: Vec<Response> = Vec::new();

    loop {
        tokio::select! {
            biased;

            _ = control.kill_requested() => {
                shared.kills.fetch_add(1, Ordering::SeqCst);
                control.report_exit(None);
                return;
            }
            request = reader.next_json::<Request>() => {
                let Ok(Some(request)) = request else {
                    control.report_exit(Some(0));
                    return;
                };
                shared.requests.lock().unwrap().push(request.clone());

                let Request::Eval { id, expr } = request else {
                    continue;
                };
                let now = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                shared.max_in_flight.fetch_max(now, Ordering::SeqCst);

                match expr.trim() {
                    "hang" => continue,
                    "exit" => {
                        control.report_exit(Some(1));
                        control.kill_requested().await;
                        shared.kills.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                    "disconnect" => {
                        drop(reader);
                        drop(write_half);
                        control.kill_requested().await;
                        shared.kills.fetch_add(1, Ordering::SeqCst);
                        control.report_exit(None);
                        return;
                    }
                    "stray" => {
                        let stray = Response::new(id + STRAY_OFFSET, ResponseKind::Text, "stray");
                        if send_json_frame(&mut write_half, &stray).await.is_err() {
                            control.report_exit(Some(0));
                            return;
                        }
                    }
                    _ => {}
                }

                tokio::time::sleep(options.reply_delay).await;
                let response = answer(id, &expr);
                let outgoing = if options.reverse_pairs {
                    held.push(response);
                    if held.len() < 2 {
                        continue;
                    }
                    held.drain(..).rev().collect()
                } else {
                    vec![response]
                };
                for response in outgoing {
                    shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                    if send_json_frame(&mut write_half, &response).await.is_err() {
                        control.report_exit(Some(0));
                        return;
                    }
                }
            }
        }
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn script_path() -> PathBuf {
    PathBuf::from("notebook.R")
}
