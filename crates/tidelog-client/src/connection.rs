//! Duplex RPC channel: one physical connection carrying correlated
//! request/response pairs and server-push traps.
//!
//! Outbound envelopes are serialized under a single send lock. A reader task
//! dispatches inbound envelopes: responses resolve entries in the
//! correlation table, traps fan out to registered listeners through a
//! dispatcher task that preserves arrival order. A keepalive task pings the
//! server independently of RPC traffic; its failures are swallowed because
//! the reader detects a dead connection and drives cleanup. Cleanup runs
//! exactly once even when the reader error path and an explicit close race.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use tidelog_common::{Error, Result, Value};
use tidelog_protocol::{codec, Envelope, EnvelopeCodec, EnvelopeKind};

use crate::config::ClientConfig;

/// Keepalive method name; sent as a one-way trap so it never registers a
/// correlation entry.
const PING_METHOD: &str = "tidelog.session.ping";

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Opaque RPC surface exposed to the higher layers (and mockable in tests).
#[async_trait]
pub trait Rpc: Send + Sync {
    /// Invoke a remote method and wait for its response.
    async fn call(
        &self,
        method: &str,
        params: HashMap<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Envelope>;

    /// Whether the underlying channel is closed.
    fn is_closed(&self) -> bool;
}

/// Receiver of server-push traps and channel-close notifications.
///
/// Listener faults are isolated: a panicking listener is logged and never
/// destabilizes dispatch.
#[async_trait]
pub trait TrapListener: Send + Sync {
    async fn on_trap(&self, trap: Envelope);
    async fn on_close(&self, cause: Option<&Error>);
}

/// The duplex channel.
pub struct Connection {
    writer: tokio::sync::Mutex<FramedWrite<BoxedWrite, EnvelopeCodec>>,
    /// Correlation table: outstanding request id -> waiting caller.
    /// At most one entry per id; each entry resolves exactly once, with the
    /// matching response or by being dropped on shutdown (the interrupt
    /// sentinel observed by the caller as a closed channel).
    pending: DashMap<Uuid, oneshot::Sender<Envelope>>,
    listeners: parking_lot::RwLock<Vec<Arc<dyn TrapListener>>>,
    session_token: parking_lot::Mutex<Option<String>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Connection {
    /// Dial the server over TCP and start the channel tasks.
    pub async fn open(config: &ClientConfig) -> Result<Arc<Connection>> {
        let addr = (config.host.as_str(), config.port);
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::Network(format!(
                    "connect timeout to {}:{}",
                    config.host, config.port
                ))
            })?
            .map_err(|e| {
                Error::Network(format!(
                    "cannot connect to {}:{}: {}",
                    config.host, config.port, e
                ))
            })?;
        Ok(Self::start(stream, config))
    }

    /// Start the channel over an established duplex transport.
    ///
    /// Tests drive this with an in-memory stream.
    pub fn start<S>(stream: S, config: &ClientConfig) -> Arc<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(
            Box::new(read_half) as BoxedRead,
            EnvelopeCodec::with_max_frame_size(config.max_frame_size),
        );
        let writer = FramedWrite::new(
            Box::new(write_half) as BoxedWrite,
            EnvelopeCodec::with_max_frame_size(config.max_frame_size),
        );

        let conn = Arc::new(Connection {
            writer: tokio::sync::Mutex::new(writer),
            pending: DashMap::new(),
            listeners: parking_lot::RwLock::new(Vec::new()),
            session_token: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let (trap_tx, trap_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run_reader(Arc::clone(&conn), reader, trap_tx));
        tokio::spawn(Self::run_dispatcher(Arc::clone(&conn), trap_rx));
        tokio::spawn(Self::run_keepalive(
            Arc::clone(&conn),
            config.keepalive_interval,
        ));

        conn
    }

    /// Register a trap listener.
    pub fn add_listener(&self, listener: Arc<dyn TrapListener>) {
        self.listeners.write().push(listener);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Token cancelled when the channel shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn set_session_token(&self, token: Option<String>) {
        *self.session_token.lock() = token;
    }

    /// Send one envelope under the send lock.
    async fn send(&self, env: &Envelope) -> Result<()> {
        let text = codec::encode(env);
        let mut writer = self.writer.lock().await;
        writer.send(text).await
    }

    /// Invoke a remote method and wait for the correlated response.
    ///
    /// Exactly one of three outcomes unblocks the caller: the matching
    /// response, a timeout (`Error::Timeout`), or channel shutdown
    /// (`Error::Interrupted`).
    pub async fn call(
        &self,
        method: &str,
        params: HashMap<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Envelope> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let mut req = Envelope::request(method);
        req.params = params;
        req.session = self.session_token.lock().clone();
        let id = req.id;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if let Err(e) = self.send(&req).await {
            self.pending.remove(&id);
            return Err(e);
        }

        let deadline = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        let response = tokio::select! {
            resp = rx => match resp {
                Ok(env) => env,
                // sender dropped on shutdown: the interrupt sentinel
                Err(_) => return Err(Error::Interrupted(method.to_string())),
            },
            _ = deadline => {
                self.pending.remove(&id);
                return Err(Error::Timeout(method.to_string()));
            }
            _ = self.shutdown.cancelled() => {
                self.pending.remove(&id);
                return Err(Error::Interrupted(method.to_string()));
            }
        };

        if let Some(code) = response.error_code {
            return Err(Error::Rpc {
                code,
                message: response.error_message.unwrap_or_default(),
                params: response.params,
            });
        }

        Ok(response)
    }

    /// Shut the channel down; safe to call from multiple paths, runs once.
    pub async fn shutdown_with(&self, cause: Option<Error>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("shutting down connection");
        self.shutdown.cancel();

        // Dropping the senders resolves every outstanding call with the
        // interrupt sentinel.
        self.pending.clear();

        {
            let mut writer = self.writer.lock().await;
            let _ = writer.close().await;
        }

        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in listeners {
            let call = AssertUnwindSafe(listener.on_close(cause.as_ref())).catch_unwind();
            if call.await.is_err() {
                error!("close listener panicked");
            }
        }
    }

    async fn run_reader(
        conn: Arc<Connection>,
        mut reader: FramedRead<BoxedRead, EnvelopeCodec>,
        trap_tx: mpsc::UnboundedSender<Envelope>,
    ) {
        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(text)) => conn.route_frame(&text, &trap_tx),
                    Some(Err(e)) => {
                        warn!("read error, closing connection: {}", e);
                        conn.shutdown_with(Some(e)).await;
                        break;
                    }
                    None => {
                        debug!("connection closed by peer");
                        // not initiated by this side: report it as a loss
                        conn.shutdown_with(Some(Error::Network(
                            "connection closed by peer".to_string(),
                        )))
                        .await;
                        break;
                    }
                },
                _ = conn.shutdown.cancelled() => break,
            }
        }
    }

    fn route_frame(&self, text: &str, trap_tx: &mpsc::UnboundedSender<Envelope>) {
        let env = match codec::decode(text) {
            Ok(env) => env,
            Err(e) => {
                warn!("dropping undecodable envelope: {}", e);
                return;
            }
        };

        match env.kind {
            EnvelopeKind::Response => {
                let reply_to = match env.in_reply_to {
                    Some(id) => id,
                    None => {
                        warn!(id = %env.id, "response without in_reply_to, dropping");
                        return;
                    }
                };
                match self.pending.remove(&reply_to) {
                    Some((_, tx)) => {
                        // receiver may have timed out meanwhile; not an error
                        let _ = tx.send(env);
                    }
                    None => {
                        warn!(in_reply_to = %reply_to, "no waiting call, maybe timeout");
                    }
                }
            }
            EnvelopeKind::Trap => {
                let _ = trap_tx.send(env);
            }
            EnvelopeKind::Request => {
                warn!(method = %env.method, "unexpected inbound request, dropping");
            }
        }
    }

    /// Fan traps out to listeners, preserving per-connection arrival order.
    async fn run_dispatcher(conn: Arc<Connection>, mut trap_rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(trap) = trap_rx.recv().await {
            let listeners: Vec<_> = conn.listeners.read().clone();
            for listener in listeners {
                let call = AssertUnwindSafe(listener.on_trap(trap.clone())).catch_unwind();
                if call.await.is_err() {
                    error!(method = %trap.method, "trap listener panicked");
                }
            }
        }
    }

    async fn run_keepalive(conn: Arc<Connection>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = conn.shutdown.cancelled() => break,
            }
            if conn.is_closed() {
                break;
            }
            let ping = Envelope::trap(PING_METHOD);
            if let Err(e) = conn.send(&ping).await {
                // the reader notices the dead connection and cleans up
                debug!("keepalive send failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl Rpc for Connection {
    async fn call(
        &self,
        method: &str,
        params: HashMap<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Envelope> {
        Connection::call(self, method, params, timeout).await
    }

    fn is_closed(&self) -> bool {
        Connection::is_closed(self)
    }
}
