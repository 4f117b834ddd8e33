//! High-level dmsg client API.
//!
//! A [`Client`] keeps one [`ClientConn`] per relay server it is delegated to,
//! publishes those servers in its discovery entry and dials or accepts
//! transports through them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

use super::conn::ClientConn;
use super::listener::Listener;
use super::port::PortManager;
use crate::core::{
    Addr, CloseGuard, DEFAULT_ACCEPT_BUFFER_SIZE, DEFAULT_ACCEPT_TIMEOUT,
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_RETRY_INTERVAL, Error, Result,
};
use crate::crypto::{BoxedIo, Keypair, NoiseStream, PubKey};
use crate::discovery::{Discovery, Role};
use crate::transport::{Transport, TransportConfig};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on the TCP dial and on the Noise handshake with a relay.
    pub handshake_timeout: Duration,

    /// How long a dial waits for ACCEPT.
    pub accept_timeout: Duration,

    /// Pause between relay reconnection attempts.
    pub retry_interval: Duration,

    /// Capacity of each listener's accept queue.
    pub accept_buffer_size: usize,

    /// Per-transport flow control.
    pub transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            accept_buffer_size: DEFAULT_ACCEPT_BUFFER_SIZE,
            transport: TransportConfig::default(),
        }
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the relay handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the accept timeout of dials.
    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.config.accept_timeout = timeout;
        self
    }

    /// Set the reconnection interval.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    /// Set the listener accept queue size.
    pub fn accept_buffer_size(mut self, size: usize) -> Self {
        self.config.accept_buffer_size = size;
        self
    }

    /// Set the read watermark of transports.
    pub fn read_watermark(mut self, bytes: usize) -> Self {
        self.config.transport.read_watermark = bytes;
        self
    }

    /// Set the inbound frame queue size of transports.
    pub fn frame_buffer(mut self, frames: usize) -> Self {
        self.config.transport.frame_buffer = frames;
        self
    }

    /// Build the client configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

struct Inner {
    keypair: Keypair,
    disc: Arc<dyn Discovery>,
    config: ClientConfig,
    conns: Mutex<HashMap<PubKey, ClientConn>>,
    ports: PortManager,
    guard: CloseGuard,
    token: CancellationToken,
    entry_lock: AsyncMutex<()>,
    span: Span,
}

impl Inner {
    fn conns(&self) -> MutexGuard<'_, HashMap<PubKey, ClientConn>> {
        self.conns.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn connected_servers(&self) -> Vec<PubKey> {
        let mut servers: Vec<PubKey> = self.conns().keys().copied().collect();
        servers.sort();
        servers
    }

    /// Dial and handshake one relay. Does not register the connection.
    async fn connect(&self, srv: PubKey) -> Result<ClientConn> {
        let entry = self.disc.entry(&srv).await?;
        let addr = entry.server_address().ok_or(Error::NotServer(srv))?;

        let timeout = self.config.handshake_timeout;
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::HandshakeTimeout)??;
        let _ = tcp.set_nodelay(true);

        let io: BoxedIo = Box::new(tcp);
        let stream = NoiseStream::wrap(io, &self.keypair, Some(srv), true, timeout).await?;
        info!(parent: &self.span, srv = %srv, %addr, "connected to server");
        Ok(ClientConn::new(
            stream,
            self.ports.clone(),
            self.config.clone(),
            &self.span,
        ))
    }

    /// Publish the currently connected servers.
    async fn update_entry(&self) -> Result<()> {
        let _lock = self.entry_lock.lock().await;
        let role = Role::Client {
            delegated_servers: self.connected_servers(),
        };
        self.disc.publish_entry(&self.keypair, role).await?;
        Ok(())
    }

    async fn update_entry_logged(&self) {
        if let Err(e) = self.update_entry().await {
            warn!(parent: &self.span, error = %e, "failed to update discovery entry");
        }
    }

    /// Register `conn` unless another connection to `srv` won the race.
    fn try_register(&self, srv: PubKey, conn: &ClientConn) -> Option<ClientConn> {
        let mut conns = self.conns();
        if let Some(existing) = conns.get(&srv) {
            return Some(existing.clone());
        }
        conns.insert(srv, conn.clone());
        None
    }

    fn unregister(&self, srv: &PubKey, conn: &ClientConn) {
        let mut conns = self.conns();
        if conns.get(srv).is_some_and(|c| c.same_conn(conn)) {
            conns.remove(srv);
        }
    }

    /// Connect to `srv` again at the retry interval.
    ///
    /// Only network errors are retried. Gives up on any other error or when
    /// the client closes.
    async fn reconnect(&self, srv: PubKey) -> Option<ClientConn> {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return None,
                _ = tokio::time::sleep(self.config.retry_interval) => {}
            }
            match self.connect(srv).await {
                Ok(conn) => return Some(conn),
                Err(e) if e.is_network() => {
                    debug!(parent: &self.span, srv = %srv, error = %e, "reconnect failed");
                }
                Err(e) => {
                    warn!(parent: &self.span, srv = %srv, error = %e, "giving up on server");
                    return None;
                }
            }
        }
    }

    /// Serve `conn` and reconnect to `srv` whenever it fails with a
    /// network error, until the client closes.
    async fn supervise(self: Arc<Self>, srv: PubKey, mut conn: ClientConn) {
        loop {
            let res = tokio::select! {
                _ = self.token.cancelled() => return,
                res = conn.serve() => res,
            };
            self.unregister(&srv, &conn);
            match res {
                Err(e) if e.is_network() => {
                    info!(parent: &self.span, srv = %srv, error = %e, "server connection lost");
                }
                Err(e) => {
                    warn!(parent: &self.span, srv = %srv, error = %e, "server connection failed");
                    self.update_entry_logged().await;
                    return;
                }
                Ok(()) => return,
            }
            if self.token.is_cancelled() {
                return;
            }
            self.update_entry_logged().await;

            conn = match self.reconnect(srv).await {
                Some(conn) => conn,
                None => return,
            };

            if self.try_register(srv, &conn).is_some() || self.token.is_cancelled() {
                // Someone else reconnected first and supervises that link.
                let _ = conn.close().await;
                return;
            }
            info!(parent: &self.span, srv = %srv, "reconnected to server");
            self.update_entry_logged().await;
        }
    }
}

/// A dmsg client.
///
/// Cloning is cheap; clones share the same client.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use dmsg::prelude::*;
///
/// let disc = Arc::new(HttpDiscovery::new("http://127.0.0.1:9090")?);
/// let client = Client::new(Keypair::generate(), disc, ClientConfig::default());
/// client.init_server_connections(1).await?;
///
/// let tp = client.dial(remote_pk, 5).await?;
/// tp.write_all(b"hello").await?;
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("pk", &self.inner.keypair.public_key())
            .field("servers", &self.inner.connected_servers())
            .field("state", &self.inner.guard.state())
            .finish()
    }
}

impl Client {
    /// Create a client. No connection is made until one is needed.
    pub fn new(keypair: Keypair, disc: Arc<dyn Discovery>, config: ClientConfig) -> Self {
        let span = tracing::info_span!("dmsg_client", pk = %keypair.public_key());
        Self {
            inner: Arc::new(Inner {
                keypair,
                disc,
                config,
                conns: Mutex::new(HashMap::new()),
                ports: PortManager::new(),
                guard: CloseGuard::new(),
                token: CancellationToken::new(),
                entry_lock: AsyncMutex::new(()),
                span,
            }),
        }
    }

    /// Our public key.
    pub fn public_key(&self) -> PubKey {
        self.inner.keypair.public_key()
    }

    /// Servers with a live connection, sorted.
    pub fn connected_servers(&self) -> Vec<PubKey> {
        self.inner.connected_servers()
    }

    /// Connection to `srv`, if any.
    pub fn conn(&self, srv: &PubKey) -> Option<ClientConn> {
        self.inner.conns().get(srv).cloned()
    }

    /// Whether the client was closed.
    pub fn is_closed(&self) -> bool {
        !self.inner.guard.is_open()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        Ok(())
    }

    /// Open a transport to `remote_pk:port`.
    ///
    /// Each relay the remote is delegated to is tried in turn, relays we are
    /// already connected to first.
    pub async fn dial(&self, remote_pk: PubKey, port: u16) -> Result<Transport> {
        self.ensure_open()?;
        let entry = self.inner.disc.entry(&remote_pk).await?;
        let servers = entry.delegated_servers();
        if servers.is_empty() {
            return Err(Error::NoSrv(remote_pk));
        }

        let (mut candidates, unconnected): (Vec<PubKey>, Vec<PubKey>) = {
            let conns = self.inner.conns();
            servers.iter().copied().partition(|srv| conns.contains_key(srv))
        };
        candidates.extend(unconnected);

        let mut errors = Vec::new();
        for srv in candidates {
            let attempt = async {
                let conn = self.find_or_connect(srv).await?;
                conn.dial_transport(remote_pk, port).await
            };
            match attempt.await {
                Ok(tp) => {
                    debug!(parent: &self.inner.span, srv = %srv, remote = %Addr::new(remote_pk, port), "dialed");
                    return Ok(tp);
                }
                Err(e) => {
                    warn!(parent: &self.inner.span, srv = %srv, error = %e, "dial via server failed");
                    errors.push(e);
                }
            }
        }

        if errors.len() == 1 {
            if let Some(e) = errors.pop() {
                return Err(e);
            }
        }
        Err(Error::DialFailed(errors))
    }

    /// Existing connection to `srv`, or a new supervised one.
    pub async fn find_or_connect(&self, srv: PubKey) -> Result<ClientConn> {
        self.ensure_open()?;
        if let Some(conn) = self.conn(&srv) {
            return Ok(conn);
        }

        let conn = self.inner.connect(srv).await?;
        if let Some(existing) = self.inner.try_register(srv, &conn) {
            let _ = conn.close().await;
            return Ok(existing);
        }
        if self.is_closed() {
            self.inner.unregister(&srv, &conn);
            let _ = conn.close().await;
            return Err(Error::ClientClosed);
        }

        self.inner.update_entry_logged().await;

        let span = self.inner.span.clone();
        let inner = self.inner.clone();
        tokio::spawn(inner.supervise(srv, conn.clone()).instrument(span));
        Ok(conn)
    }

    /// Connect to at least `min` servers from discovery.
    ///
    /// Retries at the retry interval until enough servers are connected or
    /// the client closes.
    pub async fn init_server_connections(&self, min: usize) -> Result<()> {
        loop {
            self.ensure_open()?;
            if self.inner.conns().len() >= min {
                return Ok(());
            }

            match self.inner.disc.available_servers().await {
                Ok(entries) => {
                    for entry in entries {
                        if self.inner.conns().len() >= min {
                            break;
                        }
                        if let Err(e) = self.find_or_connect(entry.static_pk).await {
                            warn!(parent: &self.inner.span, srv = %entry.static_pk, error = %e, "failed to connect to server");
                        }
                    }
                }
                Err(e) => warn!(parent: &self.inner.span, error = %e, "failed to list servers"),
            }
            if self.inner.conns().len() >= min {
                return Ok(());
            }

            tokio::select! {
                _ = self.inner.token.cancelled() => return Err(Error::ClientClosed),
                _ = tokio::time::sleep(self.inner.config.retry_interval) => {}
            }
        }
    }

    /// Accept transports dialed to `port`.
    pub fn listen(&self, port: u16) -> Result<Listener> {
        self.ensure_open()?;
        let addr = Addr::new(self.public_key(), port);
        let listener =
            self.inner
                .ports
                .new_listener(addr, self.inner.config.accept_buffer_size, &self.inner.span)?;
        debug!(parent: &self.inner.span, port, "listening");
        Ok(listener)
    }

    /// Close every connection and listener and stop reconnecting.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.guard.begin_close() {
            return Ok(());
        }
        self.inner.token.cancel();

        let conns: Vec<ClientConn> = self.inner.conns().drain().map(|(_, c)| c).collect();
        for conn in conns {
            let _ = conn.close().await;
        }
        self.inner.ports.close_all().await;

        self.inner.guard.finish_close();
        info!(parent: &self.inner.span, "client closed");
        Ok(())
    }
}
