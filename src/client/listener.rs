//! Accepting inbound transports on a local port.

use std::fmt;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug};

use super::port::{Slots, remove_listener_weak};
use crate::core::{Addr, CloseGuard, Error, Result};
use crate::transport::Transport;

struct Inner {
    addr: Addr,
    tx: mpsc::Sender<Transport>,
    rx: AsyncMutex<mpsc::Receiver<Transport>>,
    guard: CloseGuard,
    token: CancellationToken,
    ports: Weak<Slots>,
    span: Span,
}

/// Queue of transports dialed to one local port.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<Inner>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.inner.addr)
            .field("state", &self.inner.guard.state())
            .finish()
    }
}

impl Listener {
    pub(crate) fn new(addr: Addr, accept_buffer: usize, ports: Weak<Slots>, parent: &Span) -> Self {
        let (tx, rx) = mpsc::channel(accept_buffer.max(1));
        let span = tracing::debug_span!(parent: parent, "listener", port = addr.port);
        Self {
            inner: Arc::new(Inner {
                addr,
                tx,
                rx: AsyncMutex::new(rx),
                guard: CloseGuard::new(),
                token: CancellationToken::new(),
                ports,
                span,
            }),
        }
    }

    /// Local address transports are accepted on.
    pub fn addr(&self) -> Addr {
        self.inner.addr
    }

    /// Whether the listener was closed.
    pub fn is_closed(&self) -> bool {
        !self.inner.guard.is_open()
    }

    /// Wait for the next established transport.
    pub async fn accept(&self) -> Result<Transport> {
        if self.is_closed() {
            return Err(Error::ListenerClosed);
        }
        let mut rx = self.inner.rx.lock().await;
        tokio::select! {
            _ = self.inner.token.cancelled() => Err(Error::ListenerClosed),
            tp = rx.recv() => tp.ok_or(Error::ListenerClosed),
        }
    }

    /// Reserve a queue slot for a transport about to be accepted.
    pub(crate) fn try_reserve(&self) -> Result<mpsc::OwnedPermit<Transport>> {
        if self.is_closed() {
            return Err(Error::PortNotListening(self.inner.addr.port));
        }
        self.inner.tx.clone().try_reserve_owned().map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::AcceptBufferFull(self.inner.addr.port),
            mpsc::error::TrySendError::Closed(_) => {
                Error::PortNotListening(self.inner.addr.port)
            }
        })
    }

    /// Stop accepting, free the port and close queued transports.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.guard.begin_close() {
            return Ok(());
        }
        self.inner.token.cancel();
        remove_listener_weak(&self.inner.ports, self.inner.addr.port);

        let mut rx = self.inner.rx.lock().await;
        rx.close();
        let mut queued = Vec::new();
        while let Ok(tp) = rx.try_recv() {
            queued.push(tp);
        }
        drop(rx);
        for tp in queued {
            let _ = tp.close().await;
        }

        self.inner.guard.finish_close();
        debug!(parent: &self.inner.span, "listener closed");
        Ok(())
    }
}
