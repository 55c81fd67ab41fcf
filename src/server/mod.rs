//! Request server
//!
//! Connections are served by tokio tasks: one accept loop, one reader and
//! one writer per connection. Decoded requests go onto a single FIFO
//! [`RequestQueue`] drained by a fixed pool of worker OS threads, each of
//! which runs a [`Dispatcher`] synchronously. A run therefore occupies its
//! worker for the whole pipeline while the async side keeps accepting and
//! answering other connections.

mod dispatch;
mod protocol;
mod queue;
mod registry;

pub use dispatch::Dispatcher;
pub use protocol::{RUN_ACTION, Request, RequestDecoder, RequestError, Response, STATUS_ACTION};
pub use queue::RequestQueue;
pub use registry::{RunId, RunRecord, RunRegistry, RunSummary, TaskTable};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

/// Size of a single socket read
const READ_CHUNK: usize = 1024;

/// Pause after a failed accept, so a persistent error does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Request server settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Number of worker threads
    pub max_workers: usize,
    /// Listen backlog
    pub accept_backlog: u32,
    /// Connections served at once
    pub max_connections: usize,
    /// Largest request accepted on a connection
    pub max_request_bytes: usize,
    /// How long [`RequestServer::stop`] waits for workers
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            accept_backlog: 128,
            max_connections: 20,
            max_request_bytes: 64 * 1024,
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

impl ServerConfig {
    /// Validates the settings
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidConfig`] for zero workers, connections
    /// or request size.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_workers == 0 {
            return Err(ServerError::InvalidConfig("max_workers must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::InvalidConfig("max_connections must be at least 1".into()));
        }
        if self.max_request_bytes == 0 {
            return Err(ServerError::InvalidConfig("max_request_bytes must be at least 1".into()));
        }
        Ok(())
    }
}

/// Errors starting the request server
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listening socket could not be set up
    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The settings are unusable
    #[error("Invalid server configuration: {0}")]
    InvalidConfig(String),

    /// A worker thread could not be spawned
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Back-channel to the connection a request arrived on
///
/// Sending consumes the handle, so every queued request is answered at
/// most once. The connection's writer finishes after the last handle is
/// dropped.
#[derive(Debug, Clone)]
pub struct ReplyHandle {
    tx: mpsc::UnboundedSender<Response>,
}

impl ReplyHandle {
    /// Creates a handle and the receiver its replies arrive on
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Response>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues `response` for the connection
    ///
    /// Returns false when the connection has already gone away.
    pub fn send(self, response: Response) -> bool {
        self.tx.send(response).is_ok()
    }
}

/// A request waiting for a worker
#[derive(Debug)]
pub struct QueuedRequest {
    /// Decoded request.
    pub request: Request,
    /// Where the reply goes.
    pub reply: ReplyHandle,
}

/// Identifier of a worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Result of [`RequestServer::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    /// Workers that were started.
    pub workers: usize,
    /// Workers that exited within the grace period.
    pub exited: usize,
}

impl StopReport {
    /// Whether every worker exited in time
    #[must_use]
    pub fn all_exited(&self) -> bool {
        self.exited == self.workers
    }
}

#[derive(Clone)]
struct ConnectionContext {
    queue: Arc<RequestQueue<QueuedRequest>>,
    max_request_bytes: usize,
}

/// A running request server
#[derive(Debug)]
pub struct RequestServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<TcpListener>,
    queue: Arc<RequestQueue<QueuedRequest>>,
    exits: mpsc::UnboundedReceiver<WorkerId>,
    workers: usize,
    grace: Duration,
}

impl RequestServer {
    /// Binds `addr` and starts the accept loop and the worker pool
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidConfig`] for unusable settings,
    /// [`ServerError::Bind`] when the socket cannot be bound or listened on
    /// and [`ServerError::Spawn`] when a worker thread cannot be started.
    pub async fn start(
        addr: SocketAddr,
        config: ServerConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let listener = bind(addr, config.accept_backlog)?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let queue = Arc::new(RequestQueue::new());
        let (exit_tx, exits) = mpsc::unbounded_channel();
        for n in 0..config.max_workers {
            let id = WorkerId(n);
            let queue_ref = Arc::clone(&queue);
            let dispatcher = Arc::clone(&dispatcher);
            let exit_tx = exit_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("cci-{id}"))
                .spawn(move || worker_loop(id, &queue_ref, &dispatcher, &exit_tx));
            if let Err(err) = spawned {
                queue.close();
                return Err(ServerError::Spawn(err));
            }
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let ctx = ConnectionContext {
            queue: Arc::clone(&queue),
            max_request_bytes: config.max_request_bytes,
        };
        let limit = Arc::new(Semaphore::new(config.max_connections));
        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx, limit));

        tracing::info!(
            addr = %local_addr,
            workers = config.max_workers,
            max_connections = config.max_connections,
            "Request server listening"
        );
        Ok(Self {
            local_addr,
            shutdown,
            accept_task,
            queue,
            exits,
            workers: config.max_workers,
            grace: config.shutdown_grace,
        })
    }

    /// Address the server is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the server
    ///
    /// Accepting stops and connection readers are cancelled. Requests
    /// already queued are still handled; workers then exit. Waits up to
    /// the grace period for them before releasing the socket. Pipelines
    /// still running after that finish in the background.
    pub async fn stop(self) -> StopReport {
        tracing::info!(addr = %self.local_addr, "Stopping request server");
        self.shutdown.send_replace(true);
        let listener = match self.accept_task.await {
            Ok(listener) => Some(listener),
            Err(err) => {
                tracing::error!(error = %err, "Accept loop ended abnormally");
                None
            }
        };
        self.queue.close();

        let workers = self.workers;
        let mut exits = self.exits;
        let mut exited = 0;
        let wait = async {
            while exited < workers {
                match exits.recv().await {
                    Some(id) => {
                        tracing::debug!(worker = %id, "Worker exited");
                        exited += 1;
                    }
                    None => break,
                }
            }
        };
        if tokio::time::timeout(self.grace, wait).await.is_err() {
            tracing::warn!(
                grace = ?self.grace,
                still_running = workers - exited,
                "Workers still busy after grace period, detaching"
            );
        }

        drop(listener);
        tracing::info!(exited, workers, "Request server stopped");
        StopReport { workers, exited }
    }
}

fn bind(addr: SocketAddr, backlog: u32) -> Result<TcpListener, ServerError> {
    let bind_error = |source| ServerError::Bind { addr, source };
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_error)?;
    socket.set_reuseaddr(true).map_err(bind_error)?;
    socket.bind(addr).map_err(bind_error)?;
    socket.listen(backlog).map_err(bind_error)
}

fn worker_loop(
    id: WorkerId,
    queue: &RequestQueue<QueuedRequest>,
    dispatcher: &Dispatcher,
    exited: &mpsc::UnboundedSender<WorkerId>,
) {
    tracing::debug!(worker = %id, "Worker started");
    while let Some(QueuedRequest { request, reply }) = queue.pop() {
        let action = request.action();
        let handled = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.handle(request, reply)));
        if handled.is_err() {
            tracing::error!(worker = %id, action, "Request handler panicked");
        }
    }
    let _ = exited.send(id);
}

async fn accept_loop(
    listener: TcpListener,
    ctx: ConnectionContext,
    mut shutdown: watch::Receiver<bool>,
    limit: Arc<Semaphore>,
) -> TcpListener {
    loop {
        let permit = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            permit = Arc::clone(&limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let accepted = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(peer = %peer, "Accepted connection");
                tokio::spawn(serve_connection(
                    stream,
                    peer,
                    ctx.clone(),
                    permit,
                    shutdown.clone(),
                ));
            }
            Err(err) => {
                tracing::warn!(error = %err, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    tracing::debug!("Accept loop stopped");
    listener
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ConnectionContext,
    permit: OwnedSemaphorePermit,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, writer) = stream.into_split();
    let (reply, replies) = ReplyHandle::channel();
    let writer_task = tokio::spawn(write_replies(writer, replies, permit));

    let mut decoder = RequestDecoder::new(ctx.max_request_bytes);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let read = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            read = reader.read(&mut chunk) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(peer = %peer, error = %err, "Connection read failed");
                break;
            }
        };

        let decoded = match decoder.push(&chunk[..n]) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(peer = %peer, error = %err, "Closing connection");
                reply.clone().send(Response::error(&err));
                break;
            }
        };
        for request in decoded {
            match request {
                Ok(request) => {
                    tracing::debug!(peer = %peer, action = request.action(), "Queueing request");
                    let queued = QueuedRequest {
                        request,
                        reply: reply.clone(),
                    };
                    if let Err(rejected) = ctx.queue.push(queued) {
                        let err = RequestError::ShuttingDown {
                            action: rejected.request.action(),
                        };
                        rejected.reply.send(Response::error(&err));
                    }
                }
                Err(err) => {
                    tracing::debug!(peer = %peer, error = %err, "Rejected request");
                    reply.clone().send(Response::error(&err));
                }
            }
        }
    }

    drop(reply);
    if let Err(err) = writer_task.await {
        tracing::error!(peer = %peer, error = %err, "Reply writer ended abnormally");
    }
    tracing::debug!(peer = %peer, "Connection closed");
}

async fn write_replies(
    mut writer: OwnedWriteHalf,
    mut replies: mpsc::UnboundedReceiver<Response>,
    _permit: OwnedSemaphorePermit,
) {
    while let Some(response) = replies.recv().await {
        let mut line = match serde_json::to_vec(&response) {
            Ok(line) => line,
            Err(err) => {
                tracing::error!(error = %err, "Failed to encode reply");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(err) = writer.write_all(&line).await {
            tracing::debug!(error = %err, "Connection write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(ServerConfig::default().validate().is_ok());

        let config = ServerConfig {
            max_workers: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ServerError::InvalidConfig(_))));

        let config = ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_id_display() {
        assert_eq!(WorkerId(3).to_string(), "worker-3");
    }

    #[test]
    fn test_reply_handle_reports_closed_connection() {
        let (reply, replies) = ReplyHandle::channel();
        drop(replies);
        assert!(!reply.send(Response::status(false, "x")));
    }

    #[test]
    fn test_stop_report() {
        assert!(StopReport { workers: 2, exited: 2 }.all_exited());
        assert!(!StopReport { workers: 2, exited: 1 }.all_exited());
    }
}
