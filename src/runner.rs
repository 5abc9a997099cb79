//! Service supervision engine.
//!
//! The `Runner` owns one state record per configured service and runs each
//! service according to its kind: long-running processes, one-shot commands,
//! periodic commands and single HTTP requests. Output of every child is
//! captured line by line into the service's ring buffer and pushed onto the
//! engine event queue.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use thiserror::Error;
use tokio::io::{AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::events::{EngineEvent, StateChange};
use crate::output::{
    read_line_capped, sanitize_line, LineFilter, LogLine, StreamKind, MAX_LINE_BYTES,
};
use crate::ports;
use crate::service::{
    read_overlay, HttpProbe, ServiceDefinition, ServiceKind, ServiceSnapshot, ServiceState,
    ServiceStatus,
};

/// Environment forced on every child so tools print plain, non-interactive output.
const CHILD_ENV: [(&str, &str); 4] = [
    ("CI", "true"),
    ("TERM", "dumb"),
    ("NO_COLOR", "1"),
    ("FORCE_COLOR", "0"),
];

/// Time between the polite and the forced termination signal.
pub const STOP_GRACE: Duration = Duration::from_millis(100);
/// Delay between stopping and starting again on restart.
pub const RESTART_SETTLE: Duration = Duration::from_millis(500);
/// Number of log lines returned when the caller asks for zero.
pub const DEFAULT_LOG_LINES: usize = 100;

const IDLE_WAIT: Duration = Duration::from_secs(5);
const READER_DRAIN: Duration = Duration::from_millis(250);
const PORT_RELEASE: Duration = Duration::from_millis(300);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const HTTP_BODY_PREVIEW: usize = 200;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("invalid log filter: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// A buffered log line together with the service that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceLogLine {
    pub service: String,
    pub line: LogLine,
}

/// Result of probing the port declared by one service.
#[derive(Debug, Clone, PartialEq)]
pub struct PortCheck {
    pub service: String,
    pub port: u16,
    /// Occupied by a process that is not one of ours.
    pub in_use: bool,
    pub pid: Option<u32>,
}

/// Handle to the supervision engine. Cheap to clone.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<Inner>,
}

struct Inner {
    services: Vec<Arc<ServiceHandle>>,
    filter: LineFilter,
    events: mpsc::Sender<EngineEvent>,
    http: reqwest::Client,
    /// Set once by `shutdown`; no service is launched afterwards.
    closed: AtomicBool,
}

struct ServiceHandle {
    def: ServiceDefinition,
    state: Mutex<ServiceState>,
    /// True while an execution unit exists for the service.
    active: watch::Sender<bool>,
}

impl ServiceHandle {
    fn new(def: ServiceDefinition) -> Self {
        let (active, _) = watch::channel(false);
        Self {
            def,
            state: Mutex::new(ServiceState::new()),
            active,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// Marks the service active. Returns `false` if it already was.
    fn claim(&self) -> bool {
        self.active.send_if_modified(|active| {
            if *active {
                false
            } else {
                *active = true;
                true
            }
        })
    }

    async fn wait_idle(&self, limit: Duration) -> bool {
        let mut rx = self.active.subscribe();
        let idle = matches!(
            tokio::time::timeout(limit, rx.wait_for(|active| !*active)).await,
            Ok(Ok(_))
        );
        idle
    }
}

/// Final state of one execution unit.
struct Exit {
    status: ServiceStatus,
    exit_code: Option<i32>,
}

/// What a stop request did to a service.
enum StopRequest {
    NotRunning,
    /// An interval loop was told to exit.
    Loop,
    /// A process group was sent the polite signal.
    Process(u32),
    /// The unit has not spawned its process yet; it will see the request.
    Pending,
    /// An http request is in flight and is left to complete.
    InFlight,
}

struct Spawned {
    child: Child,
    readers: Vec<JoinHandle<()>>,
}

impl Runner {
    /// Creates an engine for the given services. Nothing is started.
    pub fn new(
        services: Vec<ServiceDefinition>,
        filter: LineFilter,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("devrack/", env!("CARGO_PKG_VERSION")))
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                services: services
                    .into_iter()
                    .map(|def| Arc::new(ServiceHandle::new(def)))
                    .collect(),
                filter,
                events,
                http,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn from_config(
        config: &Config,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<Self, EngineError> {
        let filter = LineFilter::new(config.filter.as_deref(), config.exclude.as_deref())?;
        Self::new(config.services.clone(), filter, events)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.inner
            .services
            .iter()
            .map(|handle| handle.def.name.clone())
            .collect()
    }

    fn handle(&self, name: &str) -> Result<&Arc<ServiceHandle>, EngineError> {
        self.inner
            .services
            .iter()
            .find(|handle| handle.def.name == name)
            .ok_or_else(|| EngineError::UnknownService(name.to_string()))
    }

    fn targets(&self, name: Option<&str>) -> Result<Vec<Arc<ServiceHandle>>, EngineError> {
        match name {
            Some(name) => Ok(vec![self.handle(name)?.clone()]),
            None => Ok(self.inner.services.clone()),
        }
    }

    /// Fails on the first name that is not a configured service.
    pub fn ensure_known(&self, names: &[String]) -> Result<(), EngineError> {
        names.iter().try_for_each(|name| self.handle(name).map(|_| ()))
    }

    /// Starts the named services.
    ///
    /// Every name is validated before anything is spawned. Services that are
    /// still active are skipped. Returns the names that were launched.
    pub fn start(&self, names: &[String]) -> Result<Vec<String>, EngineError> {
        let handles = names
            .iter()
            .map(|name| self.handle(name).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        let mut launched = Vec::with_capacity(handles.len());
        for handle in handles {
            let name = handle.def.name.clone();
            if self.launch(handle) {
                launched.push(name);
            }
        }
        Ok(launched)
    }

    fn launch(&self, handle: Arc<ServiceHandle>) -> bool {
        if !handle.claim() {
            debug!(service = %handle.def.name, "service already active, not starting");
            return false;
        }
        // `shutdown` sets the flag before it looks for active services.
        if self.inner.closed.load(Ordering::SeqCst) {
            handle.active.send_replace(false);
            debug!(service = %handle.def.name, "engine shut down, not starting");
            return false;
        }
        self.update(&handle, |state| {
            state.status = ServiceStatus::Running;
            state.stop_requested = false;
            state.exit_code = None;
        });
        info!(service = %handle.def.name, kind = handle.def.kind.label(), "starting service");
        let runner = self.clone();
        tokio::spawn(async move { runner.execute(handle).await });
        true
    }

    async fn execute(self, handle: Arc<ServiceHandle>) {
        let exit = match handle.def.kind.clone() {
            ServiceKind::LongRunning => self.run_long_running(&handle).await,
            ServiceKind::Oneshot => self.run_oneshot(&handle).await,
            ServiceKind::Interval { every } => self.run_interval(&handle, every).await,
            ServiceKind::Http(probe) => self.run_http(&handle, &probe).await,
        };
        self.finish(&handle, exit);
    }

    /// Stops one service, or every active service when `name` is `None`.
    ///
    /// Stopping a service that is not running succeeds without doing anything.
    pub async fn stop(&self, name: Option<&str>) -> Result<(), EngineError> {
        let targets = self.targets(name)?;
        let mut signalled = Vec::new();
        let mut pending = Vec::new();
        for handle in &targets {
            match self.request_stop(handle) {
                StopRequest::NotRunning | StopRequest::InFlight => {}
                StopRequest::Loop | StopRequest::Pending => signalled.push(handle.clone()),
                StopRequest::Process(pid) => {
                    pending.push((handle.clone(), pid));
                    signalled.push(handle.clone());
                }
            }
        }
        if !pending.is_empty() {
            tokio::time::sleep(STOP_GRACE).await;
            for (handle, pid) in &pending {
                force_stop(handle, *pid);
            }
        }
        for handle in signalled {
            if !handle.wait_idle(IDLE_WAIT).await {
                warn!(service = %handle.def.name, "service did not stop in time");
            }
        }
        Ok(())
    }

    /// Stops every service and refuses any later launch, including pending restarts.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.stop(None).await
    }

    /// Restarts a service in the background. Returns once the stop has been issued.
    pub fn restart(&self, name: &str) -> Result<(), EngineError> {
        let handle = self.handle(name)?.clone();
        let request = self.request_stop(&handle);
        let runner = self.clone();
        tokio::spawn(async move {
            if let StopRequest::Process(pid) = request {
                tokio::time::sleep(STOP_GRACE).await;
                force_stop(&handle, pid);
            }
            tokio::time::sleep(RESTART_SETTLE).await;
            if !handle.wait_idle(IDLE_WAIT).await {
                warn!(service = %handle.def.name, "previous run still active, restart skipped");
                return;
            }
            runner.launch(handle);
        });
        Ok(())
    }

    fn request_stop(&self, handle: &ServiceHandle) -> StopRequest {
        let mut state = handle.lock();
        if !handle.is_active() {
            return StopRequest::NotRunning;
        }
        state.stop_requested = true;
        if let Some(stop_tx) = state.stop_tx.take() {
            let _ = stop_tx.try_send(());
            return StopRequest::Loop;
        }
        match state.pid {
            Some(pid) => {
                drop(state);
                debug!(service = %handle.def.name, pid, "sending terminate signal");
                ports::terminate_tree(pid);
                StopRequest::Process(pid)
            }
            None if matches!(handle.def.kind, ServiceKind::Http(_)) => StopRequest::InFlight,
            None => StopRequest::Pending,
        }
    }

    /// Point-in-time view of every service, in configuration order.
    pub fn status(&self) -> Vec<ServiceSnapshot> {
        self.inner
            .services
            .iter()
            .map(|handle| snapshot(handle))
            .collect()
    }

    /// The most recent lines of one service, or of all services merged by time.
    pub fn logs(
        &self,
        name: Option<&str>,
        max_lines: usize,
    ) -> Result<Vec<ServiceLogLine>, EngineError> {
        let max_lines = if max_lines == 0 {
            DEFAULT_LOG_LINES
        } else {
            max_lines
        };
        let mut lines: Vec<ServiceLogLine> = self
            .targets(name)?
            .iter()
            .flat_map(|handle| {
                let service = handle.def.name.clone();
                let tail = handle.lock().logs.tail(max_lines);
                tail.into_iter().map(move |line| ServiceLogLine {
                    service: service.clone(),
                    line,
                })
            })
            .collect();
        lines.sort_by_key(|entry| entry.line.timestamp);
        let excess = lines.len().saturating_sub(max_lines);
        lines.drain(..excess);
        Ok(lines)
    }

    pub fn clear_logs(&self, name: Option<&str>) -> Result<(), EngineError> {
        for handle in self.targets(name)? {
            handle.lock().logs.clear();
        }
        Ok(())
    }

    /// Probes the port of every service that declares one.
    pub async fn check_ports(&self) -> Vec<PortCheck> {
        let own_pids: Vec<u32> = self
            .inner
            .services
            .iter()
            .filter_map(|handle| handle.lock().pid)
            .collect();
        let mut checks = Vec::new();
        for handle in &self.inner.services {
            let Some(port) = handle.def.port else {
                continue;
            };
            let (in_use, pid) = match ports::port_owner(port).await {
                Some(pid) => {
                    let ours = own_pids.contains(&pid)
                        || ports::process_group(pid).is_some_and(|pgid| own_pids.contains(&pgid));
                    (!ours, Some(pid).filter(|_| !ours))
                }
                None => (ports::is_port_bound(port) && !handle.is_active(), None),
            };
            checks.push(PortCheck {
                service: handle.def.name.clone(),
                port,
                in_use,
                pid,
            });
        }
        checks
    }

    /// Kills whatever listens on `port`. Returns `false` if nothing was killed.
    pub async fn kill_port(&self, port: u16) -> bool {
        match ports::port_owner(port).await {
            Some(pid) => {
                info!(port, pid, "killing port owner");
                ports::kill_process(pid)
            }
            None => false,
        }
    }

    /// Kills the owners of several ports, returning `(killed, failed)`.
    pub async fn kill_ports(&self, ports: &[u16]) -> (Vec<u16>, Vec<u16>) {
        let mut killed = Vec::new();
        let mut failed = Vec::new();
        for &port in ports {
            if self.kill_port(port).await {
                killed.push(port);
            } else {
                failed.push(port);
            }
        }
        (killed, failed)
    }

    /// Kills foreign processes holding the ports of the named services.
    pub async fn free_ports(&self, names: &[String]) -> Vec<u16> {
        let conflicts: Vec<u16> = self
            .check_ports()
            .await
            .into_iter()
            .filter(|check| check.in_use && names.contains(&check.service))
            .map(|check| check.port)
            .collect();
        let (killed, _) = self.kill_ports(&conflicts).await;
        if !killed.is_empty() {
            tokio::time::sleep(PORT_RELEASE).await;
        }
        killed
    }

    async fn run_long_running(&self, handle: &Arc<ServiceHandle>) -> Exit {
        self.begin_run(handle);
        let spawned = match self.spawn_child(handle) {
            Ok(spawned) => spawned,
            Err(err) => return self.spawn_failed(handle, err),
        };
        let started = match handle.def.port {
            Some(port) => format!("Started (port {port})"),
            None => "Started".to_string(),
        };
        self.record(handle, LogLine::notice(started));
        let status = self.wait_child(handle, spawned).await;
        self.record(handle, LogLine::notice("Stopped"));
        Exit {
            status: ServiceStatus::Stopped,
            exit_code: status.and_then(|status| status.code()),
        }
    }

    async fn run_oneshot(&self, handle: &Arc<ServiceHandle>) -> Exit {
        self.begin_run(handle);
        self.record(handle, LogLine::notice("[oneshot] Running..."));
        let spawned = match self.spawn_child(handle) {
            Ok(spawned) => spawned,
            Err(err) => return self.spawn_failed(handle, err),
        };
        let code = self
            .wait_child(handle, spawned)
            .await
            .map(|status| status.code().unwrap_or(-1));

        if handle.lock().stop_requested {
            self.record(handle, LogLine::notice("Stopped"));
            return Exit {
                status: ServiceStatus::Stopped,
                exit_code: code,
            };
        }
        match code {
            Some(0) => {
                self.record(handle, LogLine::notice("[oneshot] Completed"));
                Exit {
                    status: ServiceStatus::Completed,
                    exit_code: Some(0),
                }
            }
            Some(code) => {
                self.record(handle, LogLine::failure(format!("[oneshot] Failed (exit {code})")));
                Exit {
                    status: ServiceStatus::Failed,
                    exit_code: Some(code),
                }
            }
            None => {
                self.record(handle, LogLine::failure("[oneshot] Failed"));
                Exit {
                    status: ServiceStatus::Failed,
                    exit_code: None,
                }
            }
        }
    }

    async fn run_interval(&self, handle: &Arc<ServiceHandle>, every: Duration) -> Exit {
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        {
            let mut state = handle.lock();
            if state.stop_requested {
                let _ = stop_tx.try_send(());
            } else {
                state.stop_tx = Some(stop_tx);
            }
        }
        self.record(
            handle,
            LogLine::notice(format!("[interval] Started (every {})", format_every(every))),
        );

        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick: u32 = 0;
        let mut last_code = None;

        'ticks: loop {
            tokio::select! {
                biased;
                _ = stop_rx.recv() => break 'ticks,
                _ = ticker.tick() => {}
            }
            tick += 1;
            let now = Utc::now();
            self.update(handle, |state| {
                state.status = ServiceStatus::Running;
                state.run_count += 1;
                state.last_run = Some(now);
                state.next_run = chrono::Duration::from_std(every).ok().map(|every| now + every);
            });
            self.record(handle, LogLine::notice(format!("[interval #{tick}] Running...")));

            let spawned = match self.spawn_child(handle) {
                Ok(spawned) => spawned,
                Err(err) => {
                    self.record(handle, LogLine::failure(format!("Failed to start: {err}")));
                    self.update(handle, |state| {
                        state.status = ServiceStatus::Failed;
                        state.exit_code = Some(-1);
                    });
                    continue;
                }
            };
            let pid = spawned.child.id();
            let wait = self.wait_child(handle, spawned);
            tokio::pin!(wait);

            let mut stopping = false;
            let status = loop {
                tokio::select! {
                    status = &mut wait => break status,
                    _ = stop_rx.recv(), if !stopping => stopping = true,
                }
                if let Some(pid) = pid {
                    ports::terminate_tree(pid);
                }
                match tokio::time::timeout(STOP_GRACE, &mut wait).await {
                    Ok(status) => break status,
                    Err(_) => {
                        if let Some(pid) = pid {
                            ports::kill_tree(pid);
                        }
                    }
                }
            };
            let code = status.map(|status| status.code().unwrap_or(-1));
            last_code = code;
            if stopping {
                break 'ticks;
            }

            match code {
                Some(0) => self.update(handle, |state| {
                    state.status = ServiceStatus::Waiting;
                    state.exit_code = Some(0);
                }),
                other => {
                    let shown = other.map_or_else(|| "unknown".to_string(), |c| c.to_string());
                    self.record(
                        handle,
                        LogLine::failure(format!("[interval #{tick}] Failed (exit {shown})")),
                    );
                    self.update(handle, |state| {
                        state.status = ServiceStatus::Failed;
                        state.exit_code = other;
                    });
                }
            }
        }

        self.record(handle, LogLine::notice("[interval] Stopped"));
        Exit {
            status: ServiceStatus::Stopped,
            exit_code: last_code,
        }
    }

    async fn run_http(&self, handle: &Arc<ServiceHandle>, probe: &HttpProbe) -> Exit {
        self.begin_run(handle);
        self.record(
            handle,
            LogLine::notice(format!("[http] {} {}", probe.method, probe.url)),
        );
        let failed = |runner: &Self, message: String| {
            runner.record(handle, LogLine::failure(message));
            Exit {
                status: ServiceStatus::Failed,
                exit_code: None,
            }
        };

        let method = match reqwest::Method::from_bytes(probe.method.as_bytes()) {
            Ok(method) => method,
            Err(err) => return failed(self, format!("[http] Error: {err}")),
        };
        let mut headers = HeaderMap::new();
        if probe.body.is_some() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        for (name, value) in &probe.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(service = %handle.def.name, header = %name, "skipping invalid header"),
            }
        }
        let mut request = self.inner.http.request(method, &probe.url).headers(headers);
        if let Some(body) = &probe.body {
            request = request.body(body.clone());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return failed(self, format!("[http] Error: {err}")),
        };
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let code = status.as_u16();
        let summary = format!("[http] {} {}", code, status.canonical_reason().unwrap_or(""))
            .trim_end()
            .to_string();
        let is_failure = code >= 400;
        self.record(
            handle,
            if is_failure {
                LogLine::failure(summary)
            } else {
                LogLine::notice(summary)
            },
        );
        if let Some(preview) = body_preview(&body) {
            self.record(handle, LogLine::notice(preview));
        }
        Exit {
            status: if is_failure {
                ServiceStatus::Failed
            } else {
                ServiceStatus::Completed
            },
            exit_code: Some(i32::from(code)),
        }
    }

    fn begin_run(&self, handle: &ServiceHandle) {
        self.update(handle, |state| {
            state.status = ServiceStatus::Running;
            state.run_count += 1;
            state.last_run = Some(Utc::now());
        });
    }

    fn spawn_failed(&self, handle: &ServiceHandle, err: io::Error) -> Exit {
        warn!(service = %handle.def.name, error = %err, "failed to spawn service");
        self.record(handle, LogLine::failure(format!("Failed to start: {err}")));
        Exit {
            status: ServiceStatus::Failed,
            exit_code: Some(-1),
        }
    }

    fn spawn_child(&self, handle: &Arc<ServiceHandle>) -> io::Result<Spawned> {
        let words = shell_words::split(&handle.def.cmd)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let Some((program, args)) = words.split_first() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&handle.def.work_dir)
            .envs(CHILD_ENV)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        ports::detach_process_group(&mut command);

        let mut child = command.spawn()?;
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(self.clone().read_stream(
                handle.clone(),
                StreamKind::Stdout,
                stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(self.clone().read_stream(
                handle.clone(),
                StreamKind::Stderr,
                stderr,
            )));
        }

        // Interval children are owned by their loop, not by stop requests.
        if !matches!(handle.def.kind, ServiceKind::Interval { .. }) {
            if let Some(pid) = child.id() {
                let stop_requested = {
                    let mut state = handle.lock();
                    state.pid = Some(pid);
                    state.stop_requested
                };
                if stop_requested {
                    debug!(service = %handle.def.name, pid, "stop requested before spawn");
                    ports::terminate_tree(pid);
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(STOP_GRACE).await;
                        force_stop(&handle, pid);
                    });
                }
            }
        }
        Ok(Spawned { child, readers })
    }

    /// Waits for the child, then gives its readers a moment to flush.
    async fn wait_child(&self, handle: &ServiceHandle, spawned: Spawned) -> Option<ExitStatus> {
        let Spawned { mut child, readers } = spawned;
        let status = match child.wait().await {
            Ok(status) => Some(status),
            Err(err) => {
                warn!(service = %handle.def.name, error = %err, "failed to wait for child");
                None
            }
        };
        handle.lock().pid = None;

        let deadline = tokio::time::Instant::now() + READER_DRAIN;
        for mut reader in readers {
            if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
                reader.abort();
            }
        }
        status
    }

    async fn read_stream<R>(self, handle: Arc<ServiceHandle>, stream: StreamKind, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        loop {
            match read_line_capped(&mut reader, MAX_LINE_BYTES).await {
                Ok(Some(raw)) => {
                    let Some(text) = sanitize_line(&raw) else {
                        continue;
                    };
                    if self.inner.filter.allows(&text) {
                        self.record(&handle, LogLine::captured(text, stream));
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(service = %handle.def.name, error = %err, "output stream closed");
                    break;
                }
            }
        }
    }

    fn record(&self, handle: &ServiceHandle, line: LogLine) {
        if handle.lock().logs.push(line.clone()) {
            trace!(service = %handle.def.name, "log buffer full, dropped oldest line");
        }
        self.emit(EngineEvent::Log {
            service: handle.def.name.clone(),
            line,
        });
    }

    fn update<F>(&self, handle: &ServiceHandle, apply: F)
    where
        F: FnOnce(&mut ServiceState),
    {
        let change = {
            let mut state = handle.lock();
            apply(&mut state);
            state_change(handle, &state, handle.is_active())
        };
        self.emit(EngineEvent::State(change));
    }

    /// Records the final state and releases the service for the next start.
    fn finish(&self, handle: &ServiceHandle, exit: Exit) {
        let change = {
            let mut state = handle.lock();
            state.status = exit.status;
            state.exit_code = exit.exit_code;
            state.pid = None;
            state.stop_tx = None;
            state.next_run = None;
            handle.active.send_replace(false);
            state_change(handle, &state, false)
        };
        info!(service = %handle.def.name, status = change.status.as_str(), "service finished");
        self.emit(EngineEvent::State(change));
    }

    fn emit(&self, event: EngineEvent) {
        if let Err(err) = self.inner.events.try_send(event) {
            trace!("dropping engine event: {err}");
        }
    }
}

fn state_change(handle: &ServiceHandle, state: &ServiceState, running: bool) -> StateChange {
    StateChange {
        service: handle.def.name.clone(),
        status: state.status,
        running,
        exit_code: state.exit_code,
        run_count: state.run_count,
    }
}

fn force_stop(handle: &ServiceHandle, pid: u32) {
    let still_running = handle.lock().pid == Some(pid);
    if still_running {
        debug!(service = %handle.def.name, pid, "grace period elapsed, killing process group");
        ports::kill_tree(pid);
    }
}

fn snapshot(handle: &ServiceHandle) -> ServiceSnapshot {
    let now = Instant::now();
    let stale = handle.lock().overlay.is_stale(now);
    if stale {
        let overlay = read_overlay(&handle.def.work_dir);
        handle.lock().overlay.store(overlay, now);
    }

    let def = &handle.def;
    let state = handle.lock();
    let mut snapshot = ServiceSnapshot {
        name: def.name.clone(),
        kind: def.kind.label().to_string(),
        running: handle.is_active(),
        status: state.status.as_str().to_string(),
        port: def.port,
        color: def.color.clone(),
        icon: def.icon.clone(),
        message: None,
        exit_code: state.exit_code,
        run_count: state.run_count,
        last_run: state.last_run,
        next_run: state.next_run,
    };
    if let Some(overlay) = state.overlay.value() {
        snapshot.apply_overlay(overlay);
    }
    snapshot
}

fn body_preview(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    let mut preview: String = body.chars().take(HTTP_BODY_PREVIEW).collect();
    if body.chars().count() > HTTP_BODY_PREVIEW {
        preview.push_str("...");
    }
    Some(preview)
}

/// Formats an interval the way it is written in the config ("250ms", "5s", "2m").
pub fn format_every(every: Duration) -> String {
    if every.subsec_millis() != 0 || every.as_secs() == 0 {
        return format!("{}ms", every.as_millis());
    }
    let secs = every.as_secs();
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
