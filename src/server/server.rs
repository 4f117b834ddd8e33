//! High-level dmsg relay server API.
//!
//! A [`Server`] accepts client connections, authenticates them with the
//! Noise handshake and relays transports between connected clients.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

use super::session::{Registry, ServerConn, lock_registry};
use crate::core::{CloseGuard, DEFAULT_HANDSHAKE_TIMEOUT, Error, Result};
use crate::crypto::{BoxedIo, Keypair, NoiseStream, PubKey};
use crate::discovery::{Discovery, Role};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bound on the Noise handshake with a connecting client.
    pub handshake_timeout: Duration,

    /// Maximum number of concurrently connected clients.
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_clients: 2048,
        }
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the client handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the maximum number of clients.
    pub fn max_clients(mut self, max: usize) -> Self {
        self.config.max_clients = max;
        self
    }

    /// Build the server configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

struct Inner {
    keypair: Keypair,
    disc: Arc<dyn Discovery>,
    public_addr: String,
    config: ServerConfig,
    conns: Arc<Registry>,
    guard: CloseGuard,
    token: CancellationToken,
    span: Span,
}

impl Inner {
    async fn handle_conn(self: Arc<Self>, tcp: TcpStream, peer: SocketAddr) {
        let _ = tcp.set_nodelay(true);
        let io: BoxedIo = Box::new(tcp);
        let stream = match NoiseStream::wrap(
            io,
            &self.keypair,
            None,
            false,
            self.config.handshake_timeout,
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                debug!(parent: &self.span, %peer, error = %e, "handshake failed");
                return;
            }
        };

        let conn = ServerConn::new(stream, Arc::downgrade(&self.conns), &self.span);
        let client_pk = conn.client_pk();
        let registered = {
            let mut conns = lock_registry(&self.conns);
            if !conns.contains_key(&client_pk) && conns.len() >= self.config.max_clients {
                None
            } else {
                Some(conns.insert(client_pk, conn.clone()))
            }
        };
        let Some(replaced) = registered else {
            warn!(parent: &self.span, %peer, client = %client_pk, "too many clients");
            let _ = conn.close().await;
            return;
        };
        if let Some(old) = replaced {
            debug!(parent: &self.span, client = %client_pk, "replacing previous connection");
            let _ = old.close().await;
        }
        if self.token.is_cancelled() {
            self.unregister(&conn);
            let _ = conn.close().await;
            return;
        }
        info!(parent: &self.span, %peer, client = %client_pk, "client connected");

        let res = conn.serve().await;
        self.unregister(&conn);
        let _ = conn.close().await;
        match res {
            Err(e) if !e.is_network() => {
                warn!(parent: &self.span, client = %client_pk, error = %e, "client session failed");
            }
            _ => info!(parent: &self.span, client = %client_pk, "client disconnected"),
        }
    }

    fn unregister(&self, conn: &ServerConn) {
        let mut conns = lock_registry(&self.conns);
        let pk = conn.client_pk();
        if conns.get(&pk).is_some_and(|c| c.same_conn(conn)) {
            conns.remove(&pk);
        }
    }
}

/// A dmsg relay server.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use dmsg::prelude::*;
///
/// let disc = Arc::new(HttpDiscovery::new("http://127.0.0.1:9090")?);
/// let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
/// let server = Server::new(Keypair::generate(), disc, "relay.example:8080", ServerConfig::default());
/// server.serve(listener).await?;
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("pk", &self.inner.keypair.public_key())
            .field("address", &self.inner.public_addr)
            .field("state", &self.inner.guard.state())
            .finish()
    }
}

impl Server {
    /// Create a server reachable at `public_addr` (`host:port`).
    pub fn new(
        keypair: Keypair,
        disc: Arc<dyn Discovery>,
        public_addr: impl Into<String>,
        config: ServerConfig,
    ) -> Self {
        let span = tracing::info_span!("dmsg_server", pk = %keypair.public_key());
        Self {
            inner: Arc::new(Inner {
                keypair,
                disc,
                public_addr: public_addr.into(),
                config,
                conns: Arc::new(Mutex::new(HashMap::new())),
                guard: CloseGuard::new(),
                token: CancellationToken::new(),
                span,
            }),
        }
    }

    /// Our public key.
    pub fn public_key(&self) -> PubKey {
        self.inner.keypair.public_key()
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        lock_registry(&self.inner.conns).len()
    }

    /// Connection of `client`, if connected.
    pub fn conn(&self, client: &PubKey) -> Option<ServerConn> {
        lock_registry(&self.inner.conns).get(client).cloned()
    }

    /// Publish our entry and accept clients on `listener` until closed.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if !self.inner.guard.is_open() {
            return Err(Error::ServerClosed);
        }
        let role = Role::Server {
            address: self.inner.public_addr.clone(),
        };
        self.inner
            .disc
            .publish_entry(&self.inner.keypair, role)
            .await?;
        info!(
            parent: &self.inner.span,
            address = %self.inner.public_addr,
            local = ?listener.local_addr().ok(),
            "serving"
        );

        loop {
            let accepted = tokio::select! {
                _ = self.inner.token.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((tcp, peer)) => {
                    let span = self.inner.span.clone();
                    tokio::spawn(self.inner.clone().handle_conn(tcp, peer).instrument(span));
                }
                Err(e) => warn!(parent: &self.inner.span, error = %e, "accept failed"),
            }
        }
    }

    /// Stop serving and close every client connection.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.guard.begin_close() {
            return Ok(());
        }
        self.inner.token.cancel();

        let conns: Vec<ServerConn> = lock_registry(&self.inner.conns)
            .drain()
            .map(|(_, c)| c)
            .collect();
        for conn in conns {
            let _ = conn.close().await;
        }

        self.inner.guard.finish_close();
        info!(parent: &self.inner.span, "server closed");
        Ok(())
    }
}
