//! Relay side of one client connection.
//!
//! A transport between two clients is a pair of hops: the initiator's ID on
//! the initiator's connection and a relay-assigned odd ID on the
//! responder's connection. Frames are forwarded hop to hop with the ID
//! rewritten; FWD payloads are never inspected.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, trace, warn};

use crate::core::{CloseGuard, Error, Result};
use crate::crypto::{BoxedIo, NoiseStream, PubKey};
use crate::transport::{CloseReason, Frame, FrameType, is_initiator_id};

/// Live client connections of a server, by client key.
pub(crate) type Registry = Mutex<HashMap<PubKey, ServerConn>>;

pub(crate) fn lock_registry(registry: &Registry) -> MutexGuard<'_, HashMap<PubKey, ServerConn>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// The other end of a hop.
#[derive(Clone)]
struct NextHop {
    conn: Weak<Inner>,
    tp_id: u16,
}

struct SessionState {
    hops: HashMap<u16, NextHop>,
    next_resp_id: u16,
}

struct Inner {
    client_pk: PubKey,
    stream: NoiseStream<BoxedIo>,
    state: Mutex<SessionState>,
    registry: Weak<Registry>,
    guard: CloseGuard,
    token: CancellationToken,
    span: Span,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn write_frame(&self, frame: Frame) -> Result<()> {
        if !self.guard.is_open() {
            return Err(Error::ConnClosed);
        }
        trace!(parent: &self.span, kind = %frame.kind, tp_id = frame.tp_id, "write frame");
        self.stream.write_packet(&frame.encode()).await
    }

    fn hop(&self, tp_id: u16) -> Option<NextHop> {
        self.state().hops.get(&tp_id).cloned()
    }

    fn remove_hop(&self, tp_id: u16) -> Option<NextHop> {
        self.state().hops.remove(&tp_id)
    }

    /// Record a hop under a fresh odd ID.
    fn alloc_hop(&self, next: NextHop) -> Option<u16> {
        let mut state = self.state();
        let start = state.next_resp_id;
        let id = (0..=u16::MAX / 2)
            .map(|i| start.wrapping_add(i.wrapping_mul(2)))
            .find(|id| !state.hops.contains_key(id))?;
        state.next_resp_id = id.wrapping_add(2);
        state.hops.insert(id, next);
        Some(id)
    }
}

/// A client connected to the relay.
#[derive(Clone)]
pub struct ServerConn {
    inner: Arc<Inner>,
}

impl fmt::Debug for ServerConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConn")
            .field("client", &self.inner.client_pk)
            .field("state", &self.inner.guard.state())
            .finish()
    }
}

impl ServerConn {
    pub(crate) fn new(stream: NoiseStream<BoxedIo>, registry: Weak<Registry>, parent: &Span) -> Self {
        let client_pk = stream.remote_pk();
        let span = tracing::info_span!(parent: parent, "session", client = %client_pk);
        Self {
            inner: Arc::new(Inner {
                client_pk,
                stream,
                state: Mutex::new(SessionState {
                    hops: HashMap::new(),
                    next_resp_id: 1,
                }),
                registry,
                guard: CloseGuard::new(),
                token: CancellationToken::new(),
                span,
            }),
        }
    }

    /// Public key of the client.
    pub fn client_pk(&self) -> PubKey {
        self.inner.client_pk
    }

    /// Number of transports routed through this connection.
    pub fn hop_count(&self) -> usize {
        self.inner.state().hops.len()
    }

    /// Whether the connection was closed.
    pub fn is_closed(&self) -> bool {
        !self.inner.guard.is_open()
    }

    /// Whether two handles refer to the same connection.
    pub fn same_conn(&self, other: &ServerConn) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn peer(&self, pk: &PubKey) -> Option<ServerConn> {
        let registry = self.inner.registry.upgrade()?;
        let conn = lock_registry(&registry).get(pk).cloned();
        conn.filter(|c| !c.is_closed())
    }

    /// Relay frames until the client disconnects or breaks the protocol.
    pub(crate) async fn serve(&self) -> Result<()> {
        loop {
            let packet = tokio::select! {
                _ = self.inner.token.cancelled() => return Ok(()),
                packet = self.inner.stream.read_packet() => packet?,
            };
            let frame = Frame::decode(&packet)?;
            trace!(parent: &self.inner.span, kind = %frame.kind, tp_id = frame.tp_id, "read frame");

            match frame.kind {
                FrameType::Request => self.handle_request(frame).await?,
                _ => self.forward(frame).await?,
            }
        }
    }

    async fn reject(&self, tp_id: u16, reason: CloseReason) -> Result<()> {
        self.inner.write_frame(Frame::close(tp_id, reason)).await
    }

    async fn handle_request(&self, frame: Frame) -> Result<()> {
        let id = frame.tp_id;
        let hs = match frame.handshake() {
            Ok(hs) => hs,
            Err(e) => {
                warn!(parent: &self.inner.span, tp_id = id, error = %e, "malformed request");
                return self.reject(id, CloseReason::ProtocolViolation).await;
            }
        };
        if !is_initiator_id(id) || hs.initiator.pk != self.inner.client_pk {
            warn!(parent: &self.inner.span, tp_id = id, initiator = %hs.initiator, "invalid request");
            return self.reject(id, CloseReason::ProtocolViolation).await;
        }
        if self.inner.hop(id).is_some() {
            warn!(parent: &self.inner.span, tp_id = id, "request for transport id in use");
            return self.reject(id, CloseReason::ProtocolViolation).await;
        }

        let Some(dst) = self.peer(&hs.responder.pk) else {
            debug!(parent: &self.inner.span, tp_id = id, responder = %hs.responder.pk, "responder not connected");
            return self.reject(id, CloseReason::PeerUnavailable).await;
        };
        let back = NextHop {
            conn: Arc::downgrade(&self.inner),
            tp_id: id,
        };
        let Some(dst_id) = dst.inner.alloc_hop(back) else {
            warn!(parent: &self.inner.span, tp_id = id, error = %Error::NoFreeIds, "rejecting request");
            return self.reject(id, CloseReason::PeerUnavailable).await;
        };
        self.inner.state().hops.insert(
            id,
            NextHop {
                conn: Arc::downgrade(&dst.inner),
                tp_id: dst_id,
            },
        );

        if let Err(e) = dst.inner.write_frame(frame.with_id(dst_id)).await {
            debug!(parent: &self.inner.span, tp_id = id, error = %e, "responder link failed");
            dst.inner.remove_hop(dst_id);
            self.inner.remove_hop(id);
            return self.reject(id, CloseReason::PeerUnavailable).await;
        }
        debug!(
            parent: &self.inner.span,
            tp_id = id,
            responder = %hs.responder,
            resp_tp_id = dst_id,
            "request forwarded"
        );
        Ok(())
    }

    async fn forward(&self, frame: Frame) -> Result<()> {
        let id = frame.tp_id;
        let Some(hop) = self.inner.hop(id) else {
            trace!(parent: &self.inner.span, kind = %frame.kind, tp_id = id, "frame for unknown transport");
            return Ok(());
        };
        let is_close = frame.kind == FrameType::Close;

        let Some(dst) = hop.conn.upgrade() else {
            self.inner.remove_hop(id);
            if !is_close {
                self.reject(id, CloseReason::PeerUnavailable).await?;
            }
            return Ok(());
        };
        if is_close {
            self.inner.remove_hop(id);
            dst.remove_hop(hop.tp_id);
        }
        if let Err(e) = dst.write_frame(frame.with_id(hop.tp_id)).await {
            debug!(parent: &self.inner.span, tp_id = id, error = %e, "forward failed");
        }
        Ok(())
    }

    /// Close the connection and every transport routed through it.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.guard.begin_close() {
            return Ok(());
        }
        self.inner.token.cancel();

        let hops: Vec<NextHop> = self.inner.state().hops.drain().map(|(_, h)| h).collect();
        for hop in hops {
            let Some(dst) = hop.conn.upgrade() else {
                continue;
            };
            if dst.remove_hop(hop.tp_id).is_some() {
                let _ = dst
                    .write_frame(Frame::close(hop.tp_id, CloseReason::PeerUnavailable))
                    .await;
            }
        }
        if let Err(e) = self.inner.stream.shutdown().await {
            trace!(parent: &self.inner.span, error = %e, "stream shutdown failed");
        }

        self.inner.guard.finish_close();
        debug!(parent: &self.inner.span, "session closed");
        Ok(())
    }
}
