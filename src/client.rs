//! Connection wrapper used by every front-end.
//!
//! A `Client` owns one connection to the daemon with a reader task and a
//! writer task. Inbound messages are routed to the request waiting for them
//! (by correlation id), then to a handler registered for their type, and
//! otherwise onto a bounded receive queue.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

use crate::output::read_line_capped;
use crate::protocol::{
    self, KillPortsRequest, KillResponse, LogEntry, LogsRequest, LogsResponse, Message,
    PortsResponse, RestartRequest, ServiceTarget, StartRequest, StartedResponse, StatusResponse,
};
use crate::service::ServiceSnapshot;
use crate::transport;

/// Capacity of the send and receive queues.
pub const QUEUE_CAPACITY: usize = 256;
/// Longest message line accepted from the daemon.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    Closed,

    #[error("send queue is full")]
    SendQueueFull,

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("{0}")]
    Daemon(String),

    #[error("expected {expected}, got {got}")]
    Unexpected { expected: String, got: String },
}

type Handler = Box<dyn Fn(&Message) + Send + Sync>;

struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
    handlers: RwLock<HashMap<String, Handler>>,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn route(&self, message: Message, inbound: &mpsc::Sender<Message>) {
        if let Some(id) = message.id {
            let waiter = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            if let Some(waiter) = waiter {
                let _ = waiter.send(message);
                return;
            }
        }
        {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(handler) = handlers.get(&message.kind) {
                handler(&message);
                return;
            }
        }
        if let Err(err) = inbound.try_send(message) {
            trace!("dropping inbound message: {err}");
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
        // Dropping the waiters wakes every pending request with `Closed`.
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// One connection to a daemon.
pub struct Client {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Message>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    next_id: AtomicU64,
}

impl Client {
    /// Connects to the daemon listening at `endpoint`.
    pub async fn connect(endpoint: &Path) -> Result<Self, ClientError> {
        let stream = transport::connect(endpoint)
            .await
            .map_err(|source| ClientError::Connect {
                path: endpoint.to_path_buf(),
                source,
            })?;
        Ok(Self::from_stream(stream))
    }

    /// Wraps an already connected stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            closed,
        });
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);

        tokio::spawn(read_loop(
            shared.clone(),
            shared.closed.subscribe(),
            read_half,
            inbound_tx,
        ));
        tokio::spawn(write_loop(
            shared.clone(),
            shared.closed.subscribe(),
            write_half,
            outbound_rx,
        ));

        Self {
            shared,
            outbound: outbound_tx,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a handler for every unsolicited message of `kind`.
    ///
    /// Handlers run on the reader task and must not block.
    pub fn on_message<F>(&self, kind: &str, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.to_string(), Box::new(handler));
    }

    /// Queues a message without waiting. A full queue is an error, never a wait.
    pub fn send(&self, message: Message) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        self.outbound.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => ClientError::SendQueueFull,
            TrySendError::Closed(_) => ClientError::Closed,
        })
    }

    /// Sends a request and waits for its reply.
    ///
    /// An `error` reply becomes `ClientError::Daemon`.
    pub async fn request<T: Serialize>(
        &self,
        kind: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let expected = protocol::response_for(kind).unwrap_or(protocol::ERROR);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = Message::new(kind, payload)?.with_id(Some(id));

        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);
        if let Err(err) = self.send(message) {
            self.pending().remove(&id);
            return Err(err);
        }

        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(ClientError::Closed),
            Err(_) => {
                self.pending().remove(&id);
                return Err(ClientError::Timeout(expected.to_string()));
            }
        };
        if let Some(error) = reply.error_message() {
            return Err(ClientError::Daemon(error));
        }
        if !reply.is(expected) {
            return Err(ClientError::Unexpected {
                expected: expected.to_string(),
                got: reply.kind,
            });
        }
        Ok(reply)
    }

    /// Waits for the next queued message of `kind`, discarding others.
    pub async fn next_message(
        &self,
        kind: &str,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let wait = async {
            let mut inbound = self.inbound.lock().await;
            loop {
                match inbound.recv().await {
                    Some(message) if message.is(kind) => return Ok(message),
                    Some(message) => {
                        if let Some(error) = message.error_message() {
                            return Err(ClientError::Daemon(error));
                        }
                    }
                    None => return Err(ClientError::Closed),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout(kind.to_string()))?
    }

    pub async fn start_and_wait(
        &self,
        services: &[String],
        kill_ports: bool,
        timeout: Duration,
    ) -> Result<Vec<String>, ClientError> {
        let request = StartRequest {
            services: services.to_vec(),
            kill_ports,
        };
        let reply: StartedResponse = self
            .request(protocol::START, &request, timeout)
            .await?
            .parse()?;
        Ok(reply.services)
    }

    pub async fn stop_and_wait(
        &self,
        service: Option<&str>,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let request = ServiceTarget {
            service: service.map(str::to_string),
        };
        self.request(protocol::STOP, &request, timeout).await?;
        Ok(())
    }

    pub async fn restart_and_wait(
        &self,
        service: &str,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let request = RestartRequest {
            service: service.to_string(),
        };
        self.request(protocol::RESTART, &request, timeout).await?;
        Ok(())
    }

    pub async fn status(&self, timeout: Duration) -> Result<Vec<ServiceSnapshot>, ClientError> {
        let reply: StatusResponse = self
            .request(protocol::STATUS, &serde_json::json!({}), timeout)
            .await?
            .parse()?;
        Ok(reply.services)
    }

    pub async fn logs(
        &self,
        service: Option<&str>,
        lines: usize,
        timeout: Duration,
    ) -> Result<Vec<LogEntry>, ClientError> {
        let request = LogsRequest {
            service: service.map(str::to_string),
            lines,
        };
        let reply: LogsResponse = self.request(protocol::LOGS, &request, timeout).await?.parse()?;
        Ok(reply.logs)
    }

    pub async fn check_ports(&self, timeout: Duration) -> Result<PortsResponse, ClientError> {
        Ok(self
            .request(protocol::CHECK_PORTS, &serde_json::json!({}), timeout)
            .await?
            .parse()?)
    }

    pub async fn kill_ports(
        &self,
        ports: &[u16],
        timeout: Duration,
    ) -> Result<KillResponse, ClientError> {
        let request = KillPortsRequest {
            ports: ports.to_vec(),
        };
        Ok(self
            .request(protocol::KILL_PORTS, &request, timeout)
            .await?
            .parse()?)
    }

    pub async fn clear_logs(
        &self,
        service: Option<&str>,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let request = ServiceTarget {
            service: service.map(str::to_string),
        };
        self.request(protocol::CLEAR_LOGS, &request, timeout).await?;
        Ok(())
    }

    /// Asks the daemon to stop every service and exit.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ClientError> {
        self.request(protocol::SHUTDOWN, &serde_json::json!({}), timeout)
            .await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Waits until the connection is closed from either side.
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Closes the connection. Safe to call more than once.
    pub fn close(&self) {
        self.shared.close();
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Message>>> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.close();
    }
}

async fn read_loop<R>(
    shared: Arc<Shared>,
    mut closed: watch::Receiver<bool>,
    read_half: R,
    inbound: mpsc::Sender<Message>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(read_half);
    loop {
        if *closed.borrow() {
            break;
        }
        let line = tokio::select! {
            line = read_line_capped(&mut reader, MAX_MESSAGE_BYTES) => line,
            _ = closed.changed() => break,
        };
        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match Message::decode(&line) {
                    Ok(message) => shared.route(message, &inbound),
                    Err(err) => debug!("ignoring malformed message: {err}"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!("connection read failed: {err}");
                break;
            }
        }
    }
    shared.close();
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    mut closed: watch::Receiver<bool>,
    mut write_half: W,
    mut outbound: mpsc::Receiver<Message>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        if *closed.borrow() {
            break;
        }
        let message = tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = closed.changed() => break,
        };
        let line = match message.encode() {
            Ok(line) => line,
            Err(err) => {
                debug!("failed to encode message: {err}");
                continue;
            }
        };
        if let Err(err) = write_half.write_all(line.as_bytes()).await {
            debug!("connection write failed: {err}");
            break;
        }
    }
    shared.close();
    let _ = write_half.shutdown().await;
}
