//! The per-project background daemon.
//!
//! A `Daemon` owns exactly one `Runner`, listens on a socket derived from the
//! configuration root, answers requests from any number of clients and
//! broadcasts engine events to all of them. The `Registry` knows where each
//! project's socket lives and how to start a daemon in the background.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, OnceCell, RwLock};
use tracing::{debug, info, trace, warn};

use crate::client::{Client, ClientError, MAX_MESSAGE_BYTES, QUEUE_CAPACITY};
use crate::config::Config;
use crate::events::{EngineEvent, EVENT_QUEUE_CAPACITY};
use crate::output::read_line_capped;
use crate::ports;
use crate::protocol::{
    self, KillPortsRequest, KillResponse, LogEntry, LogsRequest, LogsResponse, Message,
    PortStatus, PortsResponse, RestartRequest, ServiceStateEvent, ServiceTarget, StartRequest,
    StartedResponse, StatusResponse,
};
use crate::runner::{EngineError, Runner};
use crate::transport::{self, Listener, Stream};

const SPAWN_WAIT: Duration = Duration::from_secs(5);
const SPAWN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("a daemon is already running at {}", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("daemon did not come up at {}", .0.display())]
    SpawnTimeout(PathBuf),
}

fn io_err(path: &Path, source: io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Locates per-project daemons.
///
/// Constructed once at startup and passed to whatever needs to find or start
/// a daemon.
#[derive(Debug, Clone)]
pub struct Registry {
    runtime_dir: PathBuf,
}

impl Registry {
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
        }
    }

    /// Uses `$XDG_RUNTIME_DIR`, falling back to the system temp directory.
    pub fn from_env() -> Self {
        let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        Self::new(runtime_dir)
    }

    /// First 16 hex characters of the SHA-256 of the absolute root path.
    pub fn project_key(root: &Path) -> String {
        let digest = Sha256::digest(root.to_string_lossy().as_bytes());
        hex::encode(&digest[..8])
    }

    pub fn socket_path(&self, root: &Path) -> PathBuf {
        self.runtime_dir
            .join(format!("devrack-{}.sock", Self::project_key(root)))
    }

    /// Where a background daemon writes its own diagnostics.
    pub fn log_path(&self, root: &Path) -> PathBuf {
        self.runtime_dir
            .join(format!("devrack-{}.log", Self::project_key(root)))
    }

    pub async fn connect(&self, root: &Path) -> Result<Client, ClientError> {
        Client::connect(&self.socket_path(root)).await
    }

    /// Connects to the project's daemon, starting one in the background if needed.
    pub async fn connect_or_spawn(
        &self,
        config: &Config,
        config_path: &Path,
    ) -> Result<Client, DaemonError> {
        let root = &config.root_dir;
        if let Ok(client) = self.connect(root).await {
            return Ok(client);
        }
        self.spawn(config_path, root)?;

        let socket = self.socket_path(root);
        let deadline = tokio::time::Instant::now() + SPAWN_WAIT;
        loop {
            match Client::connect(&socket).await {
                Ok(client) => return Ok(client),
                Err(err) if tokio::time::Instant::now() >= deadline => {
                    debug!("giving up on background daemon: {err}");
                    return Err(DaemonError::SpawnTimeout(socket));
                }
                Err(_) => tokio::time::sleep(SPAWN_POLL).await,
            }
        }
    }

    fn spawn(&self, config_path: &Path, root: &Path) -> Result<(), DaemonError> {
        let exe = std::env::current_exe().map_err(|source| io_err(Path::new("devrack"), source))?;
        std::fs::create_dir_all(&self.runtime_dir)
            .map_err(|source| io_err(&self.runtime_dir, source))?;
        let log_path = self.log_path(root);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|source| io_err(&log_path, source))?;
        let log_err = log.try_clone().map_err(|source| io_err(&log_path, source))?;

        let mut command = Command::new(exe);
        command
            .arg("--config")
            .arg(config_path)
            .arg("daemon")
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        ports::detach_process_group(&mut command);
        let child = command
            .spawn()
            .map_err(|source| io_err(config_path, source))?;
        info!(pid = child.id(), log = %log_path.display(), "started background daemon");
        Ok(())
    }
}

type Clients = RwLock<HashMap<u64, mpsc::Sender<Message>>>;

struct Shared {
    runner: Runner,
    defaults: Vec<String>,
    socket_path: PathBuf,
    clients: Clients,
    next_client: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    stopped: OnceCell<()>,
}

/// A bound daemon, ready to `run`.
pub struct Daemon {
    shared: Arc<Shared>,
    listener: Listener,
    events: mpsc::Receiver<EngineEvent>,
}

/// Lets other tasks stop a running daemon.
#[derive(Clone)]
pub struct DaemonHandle {
    shared: Arc<Shared>,
}

impl DaemonHandle {
    /// Stops every service, closes all connections and removes the socket.
    pub async fn shutdown(&self) {
        self.shared.shutdown().await;
    }
}

impl Daemon {
    /// Claims the socket for this project and builds the engine.
    ///
    /// A leftover socket nobody answers on is removed. A live one means
    /// another daemon already serves the project.
    pub async fn bind(config: Config, socket_path: PathBuf) -> Result<Self, DaemonError> {
        prepare_socket(&socket_path).await?;
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| io_err(parent, source))?;
        }
        let listener = transport::bind(&socket_path).map_err(|source| DaemonError::Bind {
            path: socket_path.clone(),
            source,
        })?;

        let (events_tx, events) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let runner = Runner::from_config(&config, events_tx)?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                runner,
                defaults: config.defaults,
                socket_path,
                clients: RwLock::new(HashMap::new()),
                next_client: AtomicU64::new(1),
                shutdown_tx,
                stopped: OnceCell::new(),
            }),
            listener,
            events,
        })
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            shared: self.shared.clone(),
        }
    }

    /// Accepts connections until shut down.
    pub async fn run(self) -> Result<(), DaemonError> {
        let Daemon {
            shared,
            listener,
            events,
        } = self;
        info!(
            socket = %shared.socket_path.display(),
            services = shared.runner.service_names().len(),
            "daemon listening"
        );
        let forwarder = tokio::spawn(forward_events(shared.clone(), events));

        let mut shutdown = shared.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        tokio::spawn(serve_connection(shared.clone(), stream));
                    }
                    Err(err) => warn!("accept failed: {err}"),
                },
                _ = shutdown.changed() => break,
            }
        }

        drop(listener);
        shared.shutdown().await;
        let _ = forwarder.await;
        info!("daemon stopped");
        Ok(())
    }
}

async fn prepare_socket(path: &Path) -> Result<(), DaemonError> {
    if !path.exists() {
        return Ok(());
    }
    if transport::connect(path).await.is_ok() {
        return Err(DaemonError::AlreadyRunning(path.to_path_buf()));
    }
    warn!(socket = %path.display(), "removing stale socket");
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(io_err(path, source)),
    }
}

impl Shared {
    async fn shutdown(&self) {
        self.stopped
            .get_or_init(|| async {
                info!("shutting down, stopping all services");
                if let Err(err) = self.runner.shutdown().await {
                    warn!("failed to stop services: {err}");
                }
                self.shutdown_tx.send_replace(true);
                self.clients.write().await.clear();
                match std::fs::remove_file(&self.socket_path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        let socket = self.socket_path.display();
                        warn!(%socket, "failed to remove socket: {err}");
                    }
                }
            })
            .await;
    }

    /// Answers one request on the connection that sent it.
    async fn dispatch(self: &Arc<Self>, request: Message, reply: &mpsc::Sender<Message>) {
        let Some(response_kind) = protocol::response_for(&request.kind) else {
            debug!(kind = %request.kind, "ignoring unhandled message");
            return;
        };
        debug!(kind = %request.kind, id = ?request.id, "dispatching request");

        let message = match self.handle_request(&request).await {
            Ok(payload) => Message {
                kind: response_kind.to_string(),
                id: request.id,
                payload,
            },
            Err(err) => {
                debug!(kind = %request.kind, "request failed: {err:#}");
                Message::error(err.to_string()).with_id(request.id)
            }
        };
        if let Err(err) = reply.try_send(message) {
            warn!("dropping reply: {err}");
        }

        if request.is(protocol::SHUTDOWN) {
            let shared = self.clone();
            tokio::spawn(async move { shared.shutdown().await });
        }
    }

    async fn handle_request(&self, request: &Message) -> anyhow::Result<Value> {
        let runner = &self.runner;
        let payload = match request.kind.as_str() {
            protocol::START => {
                let start: StartRequest = request.parse()?;
                let services = if start.services.is_empty() {
                    self.defaults.clone()
                } else {
                    start.services
                };
                runner.ensure_known(&services)?;
                if start.kill_ports {
                    let freed = runner.free_ports(&services).await;
                    if !freed.is_empty() {
                        info!(ports = ?freed, "freed ports before start");
                    }
                }
                runner.start(&services)?;
                serde_json::to_value(StartedResponse { services })?
            }
            protocol::STOP => {
                let target: ServiceTarget = request.parse()?;
                runner.stop(target.service.as_deref()).await?;
                serde_json::to_value(target)?
            }
            protocol::RESTART => {
                let restart: RestartRequest = request.parse()?;
                if restart.service.is_empty() {
                    return Err(anyhow!("restart requires a service name"));
                }
                runner.restart(&restart.service)?;
                serde_json::to_value(restart)?
            }
            protocol::STATUS => serde_json::to_value(StatusResponse {
                services: runner.status(),
            })?,
            protocol::LOGS => {
                let logs: LogsRequest = request.parse()?;
                let entries = runner.logs(logs.service.as_deref(), logs.lines)?;
                serde_json::to_value(LogsResponse {
                    logs: entries.into_iter().map(LogEntry::from).collect(),
                })?
            }
            protocol::CHECK_PORTS => {
                let ports: Vec<PortStatus> = runner
                    .check_ports()
                    .await
                    .into_iter()
                    .map(PortStatus::from)
                    .collect();
                let has_conflict = ports.iter().any(|port| port.in_use);
                serde_json::to_value(PortsResponse {
                    ports,
                    has_conflict,
                })?
            }
            protocol::KILL_PORTS => {
                let kill: KillPortsRequest = request.parse()?;
                let (killed, failed) = runner.kill_ports(&kill.ports).await;
                serde_json::to_value(KillResponse { killed, failed })?
            }
            protocol::CLEAR_LOGS => {
                let target: ServiceTarget = request.parse()?;
                runner.clear_logs(target.service.as_deref())?;
                serde_json::to_value(target)?
            }
            protocol::SHUTDOWN => Value::Object(Default::default()),
            other => return Err(anyhow!("unsupported request {other}")),
        };
        Ok(payload)
    }

    async fn broadcast(&self, message: Message) {
        let clients = self.clients.read().await;
        for (id, tx) in clients.iter() {
            if let Err(err) = tx.try_send(message.clone()) {
                trace!(client = id, "dropping broadcast: {err}");
            }
        }
    }
}

/// Turns engine events into `log_entry` and `service_state` broadcasts.
async fn forward_events(shared: Arc<Shared>, mut events: mpsc::Receiver<EngineEvent>) {
    let mut shutdown = shared.shutdown_tx.subscribe();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        let message = match event {
            EngineEvent::Log { service, line } => Message::new(
                protocol::LOG_ENTRY,
                &LogEntry {
                    time: line.timestamp,
                    service,
                    level: line.level,
                    message: line.text,
                },
            ),
            EngineEvent::State(change) => {
                Message::new(protocol::SERVICE_STATE, &ServiceStateEvent::from(change))
            }
        };
        match message {
            Ok(message) => shared.broadcast(message).await,
            Err(err) => warn!("failed to encode event: {err}"),
        }
    }
}

async fn serve_connection(shared: Arc<Shared>, stream: Stream) {
    let id = shared.next_client.fetch_add(1, Ordering::Relaxed);
    let (read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let mut shutdown = shared.shutdown_tx.subscribe();
    if *shutdown.borrow() {
        return;
    }
    shared.clients.write().await.insert(id, tx.clone());
    debug!(client = id, "client connected");
    let writer = tokio::spawn(write_messages(write_half, rx));

    let mut reader = BufReader::new(read_half);
    loop {
        let line = tokio::select! {
            line = read_line_capped(&mut reader, MAX_MESSAGE_BYTES) => line,
            _ = shutdown.changed() => break,
        };
        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match Message::decode(&line) {
                    Ok(request) => shared.dispatch(request, &tx).await,
                    Err(err) => debug!(client = id, "dropping malformed message: {err}"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(client = id, "read failed: {err}");
                break;
            }
        }
    }

    // Leave the broadcast set before the queue closes.
    shared.clients.write().await.remove(&id);
    drop(tx);
    let _ = writer.await;
    debug!(client = id, "client disconnected");
}

async fn write_messages<W>(mut writer: W, mut rx: mpsc::Receiver<Message>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let line = match message.encode() {
            Ok(line) => line,
            Err(err) => {
                warn!("failed to encode message: {err}");
                continue;
            }
        };
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Runs a daemon in the foreground until a signal or a `shutdown` request.
pub async fn run_foreground(config: Config, socket_path: PathBuf) -> anyhow::Result<()> {
    let daemon = Daemon::bind(config, socket_path)
        .await
        .context("failed to start daemon")?;
    spawn_signal_listener(daemon.handle());
    daemon.run().await?;
    Ok(())
}

fn spawn_signal_listener(handle: DaemonHandle) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let (Ok(mut sigterm), Ok(mut sigint)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            warn!("failed to install signal handlers");
            return;
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        handle.shutdown().await;
    });

    #[cfg(not(unix))]
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C");
            handle.shutdown().await;
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Mutex;

    use tempfile::TempDir;

    use super::*;
    use crate::config::{load_config, CONFIG_FILE_NAME};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        _dir: TempDir,
        socket: PathBuf,
        handle: DaemonHandle,
        task: tokio::task::JoinHandle<Result<(), DaemonError>>,
    }

    impl Harness {
        async fn start(config: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join(CONFIG_FILE_NAME), config).unwrap();
            let config = load_config(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
            let socket = dir.path().join("daemon.sock");
            let daemon = Daemon::bind(config, socket.clone()).await.unwrap();
            let handle = daemon.handle();
            let task = tokio::spawn(daemon.run());
            Self {
                _dir: dir,
                socket,
                handle,
                task,
            }
        }

        async fn client(&self) -> Client {
            Client::connect(&self.socket).await.unwrap()
        }

        async fn stop(self) {
            self.handle.shutdown().await;
            self.task.await.unwrap().unwrap();
            assert!(!self.socket.exists());
        }
    }

    async fn service(client: &Client, name: &str) -> crate::service::ServiceSnapshot {
        client
            .status(TIMEOUT)
            .await
            .unwrap()
            .into_iter()
            .find(|snap| snap.name == name)
            .unwrap()
    }

    async fn wait_for_status(client: &Client, name: &str, status: &str) {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        while service(client, name).await.status != status {
            assert!(tokio::time::Instant::now() < deadline, "{name} never became {status}");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[test]
    fn socket_path_is_stable_per_project() {
        let registry = Registry::new("/run/user/1000");
        let a = registry.socket_path(Path::new("/work/shop"));
        let b = registry.socket_path(Path::new("/work/blog"));
        assert_eq!(a, registry.socket_path(Path::new("/work/shop")));
        assert_ne!(a, b);
        assert_eq!(a.parent().unwrap(), Path::new("/run/user/1000"));

        let name = a.file_name().unwrap().to_string_lossy().to_string();
        let key = name
            .strip_prefix("devrack-")
            .and_then(|rest| rest.strip_suffix(".sock"))
            .unwrap();
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(registry
            .log_path(Path::new("/work/shop"))
            .to_string_lossy()
            .ends_with(&format!("devrack-{key}.log")));
    }

    #[tokio::test]
    async fn long_running_service_reports_running() {
        let harness = Harness::start(
            "[services.api]\ndir = \".\"\ncmd = \"sleep 1000\"\nport = 9999\n",
        )
        .await;
        let client = harness.client().await;

        let started = client
            .start_and_wait(&["api".to_string()], false, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(started, vec!["api"]);

        let api = service(&client, "api").await;
        assert!(api.running);
        assert_eq!(api.status, "running");
        assert_eq!(api.port, Some(9999));
        assert_eq!(api.kind, "long-running");

        client.stop_and_wait(Some("api"), TIMEOUT).await.unwrap();
        let api = service(&client, "api").await;
        assert!(!api.running);
        assert_eq!(api.status, "stopped");
        harness.stop().await;
    }

    #[tokio::test]
    async fn oneshot_success_and_failure() {
        let harness = Harness::start(
            "[services.ok]\ntype = \"oneshot\"\ncmd = \"true\"\n\n\
             [services.bad]\ntype = \"oneshot\"\ncmd = \"false\"\n",
        )
        .await;
        let client = harness.client().await;

        client
            .start_and_wait(&["ok".to_string(), "bad".to_string()], false, TIMEOUT)
            .await
            .unwrap();
        wait_for_status(&client, "ok", "completed").await;
        wait_for_status(&client, "bad", "failed").await;

        let ok = service(&client, "ok").await;
        assert_eq!(ok.exit_code, Some(0));
        assert_eq!(ok.run_count, 1);
        assert_eq!(service(&client, "bad").await.exit_code, Some(1));
        harness.stop().await;
    }

    #[tokio::test]
    async fn interval_service_ticks() {
        let harness = Harness::start(
            "[services.tick]\ntype = \"interval\"\ninterval = \"100ms\"\ncmd = \"echo tick\"\n",
        )
        .await;
        let client = harness.client().await;

        client
            .start_and_wait(&["tick".to_string()], false, TIMEOUT)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        let tick = service(&client, "tick").await;
        assert!(tick.run_count >= 3, "run count {}", tick.run_count);

        let logs = client.logs(Some("tick"), 0, TIMEOUT).await.unwrap();
        assert!(logs.iter().any(|entry| entry.message == "tick"));
        harness.stop().await;
    }

    #[tokio::test]
    async fn kill_ports_reports_unowned_port_as_failed() {
        let harness = Harness::start("[services.x]\ntype = \"oneshot\"\ncmd = \"true\"\n").await;
        let client = harness.client().await;
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let response = client.kill_ports(&[port], TIMEOUT).await.unwrap();
        assert!(response.killed.is_empty());
        assert_eq!(response.failed, vec![port]);
        harness.stop().await;
    }

    #[tokio::test]
    async fn unknown_service_is_an_error_and_changes_nothing() {
        let harness = Harness::start(
            "[services.api]\ndir = \".\"\ncmd = \"sleep 1000\"\n\n\
             [services.job]\ntype = \"oneshot\"\ncmd = \"true\"\n",
        )
        .await;
        let client = harness.client().await;
        client
            .start_and_wait(&["api".to_string()], false, TIMEOUT)
            .await
            .unwrap();
        let before = service(&client, "api").await;

        let err = client
            .start_and_wait(&["job".to_string(), "nope".to_string()], false, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Daemon(message) if message.contains("nope")));
        assert!(matches!(
            client.restart_and_wait("nope", TIMEOUT).await,
            Err(ClientError::Daemon(_))
        ));
        assert!(matches!(
            client.stop_and_wait(Some("nope"), TIMEOUT).await,
            Err(ClientError::Daemon(_))
        ));

        let after = service(&client, "api").await;
        assert_eq!(after.status, before.status);
        assert_eq!(after.run_count, before.run_count);
        assert_eq!(service(&client, "job").await.status, "stopped");
        harness.stop().await;
    }

    #[tokio::test]
    async fn idle_clients_see_the_same_broadcasts() {
        let harness = Harness::start(
            "[services.talk]\ntype = \"oneshot\"\ncmd = \"sh -c 'echo one; echo two; echo three'\"\n",
        )
        .await;

        let mut watchers = Vec::new();
        let mut seen = Vec::new();
        for _ in 0..2 {
            let client = harness.client().await;
            let lines = Arc::new(Mutex::new(Vec::new()));
            let sink = lines.clone();
            client.on_message(protocol::LOG_ENTRY, move |message| {
                if let Ok(entry) = message.parse::<LogEntry>() {
                    sink.lock().unwrap().push(entry.message);
                }
            });
            watchers.push(client);
            seen.push(lines);
        }
        // Let the daemon register both connections.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let controller = harness.client().await;
        controller
            .start_and_wait(&["talk".to_string()], false, TIMEOUT)
            .await
            .unwrap();
        wait_for_status(&controller, "talk", "completed").await;

        let expected = vec!["[oneshot] Running...", "one", "two", "three", "[oneshot] Completed"];
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        while seen.iter().any(|lines| lines.lock().unwrap().len() < expected.len()) {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        for lines in &seen {
            assert_eq!(*lines.lock().unwrap(), expected);
        }
        drop(watchers);
        harness.stop().await;
    }

    #[tokio::test]
    async fn default_services_start_when_none_named() {
        let harness = Harness::start(
            "defaults = [\"a\"]\n\n[services.a]\ntype = \"oneshot\"\ncmd = \"true\"\n\n\
             [services.b]\ntype = \"oneshot\"\ncmd = \"true\"\n",
        )
        .await;
        let client = harness.client().await;

        let started = client.start_and_wait(&[], false, TIMEOUT).await.unwrap();
        assert_eq!(started, vec!["a"]);
        wait_for_status(&client, "a", "completed").await;
        assert_eq!(service(&client, "b").await.status, "stopped");

        client.clear_logs(None, TIMEOUT).await.unwrap();
        assert!(client.logs(None, 0, TIMEOUT).await.unwrap().is_empty());
        harness.stop().await;
    }

    #[tokio::test]
    async fn second_daemon_is_refused_and_stale_socket_replaced() {
        let harness = Harness::start("[services.x]\ntype = \"oneshot\"\ncmd = \"true\"\n").await;
        let config = load_config(&harness._dir.path().join(CONFIG_FILE_NAME)).unwrap();
        let err = Daemon::bind(config.clone(), harness.socket.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DaemonError::AlreadyRunning(_)));

        let stale = harness._dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&stale).unwrap());
        assert!(stale.exists());
        let replacement = Daemon::bind(config, stale.clone()).await.unwrap();
        let handle = replacement.handle();
        let task = tokio::spawn(replacement.run());
        Client::connect(&stale).await.unwrap();
        handle.shutdown().await;
        task.await.unwrap().unwrap();
        harness.stop().await;
    }

    #[tokio::test]
    async fn shutdown_request_stops_services_and_daemon() {
        let harness = Harness::start("[services.api]\ndir = \".\"\ncmd = \"sleep 1000\"\n").await;
        let client = harness.client().await;
        client
            .start_and_wait(&["api".to_string()], false, TIMEOUT)
            .await
            .unwrap();

        client.shutdown(TIMEOUT).await.unwrap();
        tokio::time::timeout(TIMEOUT, client.closed()).await.unwrap();
        let Harness { socket, task, .. } = harness;
        task.await.unwrap().unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let harness = Harness::start("[services.x]\ntype = \"oneshot\"\ncmd = \"true\"\n").await;
        let mut raw = transport::connect(&harness.socket).await.unwrap();
        raw.write_all(b"this is not json\n{\"type\":\"telemetry\"}\n{\"type\":\"status\",\"id\":9}\n")
            .await
            .unwrap();

        let mut reader = BufReader::new(raw);
        let line = read_line_capped(&mut reader, MAX_MESSAGE_BYTES)
            .await
            .unwrap()
            .unwrap();
        let reply = Message::decode(&line).unwrap();
        assert_eq!(reply.kind, protocol::STATUS_RESPONSE);
        assert_eq!(reply.id, Some(9));
        harness.stop().await;
    }
}
