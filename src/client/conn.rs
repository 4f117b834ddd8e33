//! One encrypted connection from a client to a relay server.
//!
//! All transports through that relay are multiplexed over it by transport
//! ID. IDs picked by this side are even; IDs of transports dialed to us are
//! picked by the relay and are odd.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, trace, warn};

use super::client::ClientConfig;
use super::port::PortManager;
use crate::core::{Addr, CloseGuard, Error, Result};
use crate::crypto::{BoxedIo, NoiseStream, PubKey};
use crate::transport::{
    CloseReason, ConnLink, Frame, FrameType, HandshakePayload, Transport, is_initiator_id,
};

struct ConnState {
    tps: HashMap<u16, Transport>,
    next_init_id: u16,
}

struct Inner {
    stream: NoiseStream<BoxedIo>,
    state: Mutex<ConnState>,
    ports: PortManager,
    config: ClientConfig,
    close_cause: Mutex<Option<Error>>,
    guard: CloseGuard,
    token: CancellationToken,
    span: Span,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn write_frame(&self, frame: Frame) -> Result<()> {
        if !self.guard.is_open() {
            return Err(Error::ConnClosed);
        }
        trace!(parent: &self.span, kind = %frame.kind, tp_id = frame.tp_id, len = frame.payload.len(), "write frame");
        self.stream.write_packet(&frame.encode()).await
    }

    /// Remember why the connection is being torn down; the first cause wins.
    fn set_close_cause(&self, cause: Error) {
        let mut slot = self.close_cause.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(cause);
        }
    }

    fn take_close_cause(&self) -> Option<Error> {
        self.close_cause
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn release(&self, tp_id: u16) {
        let removed = self.state().tps.remove(&tp_id);
        if let Some(tp) = removed {
            if is_initiator_id(tp_id) {
                self.ports.release(tp.local_addr().port);
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.guard.begin_close() {
            return Ok(());
        }
        self.token.cancel();

        let tps: Vec<Transport> = self.state().tps.values().cloned().collect();
        for tp in tps {
            tp.force_close();
        }
        if let Err(e) = self.stream.shutdown().await {
            debug!(parent: &self.span, error = %e, "stream shutdown failed");
        }

        self.guard.finish_close();
        info!(parent: &self.span, "server connection closed");
        Ok(())
    }
}

/// Handle transports keep on their connection.
struct Link(Weak<Inner>);

#[async_trait]
impl ConnLink for Link {
    async fn write_frame(&self, frame: Frame) -> Result<()> {
        match self.0.upgrade() {
            Some(inner) => inner.write_frame(frame).await,
            None => Err(Error::ConnClosed),
        }
    }

    fn release(&self, tp_id: u16) {
        if let Some(inner) = self.0.upgrade() {
            inner.release(tp_id);
        }
    }

    async fn close_conn(&self, cause: Error) {
        if let Some(inner) = self.0.upgrade() {
            inner.set_close_cause(cause);
            let _ = inner.close().await;
        }
    }
}

/// A client's connection to one relay server.
#[derive(Clone)]
pub struct ClientConn {
    inner: Arc<Inner>,
}

impl fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConn")
            .field("server", &self.remote_pk())
            .field("state", &self.inner.guard.state())
            .finish()
    }
}

impl ClientConn {
    pub(crate) fn new(
        stream: NoiseStream<BoxedIo>,
        ports: PortManager,
        config: ClientConfig,
        parent: &Span,
    ) -> Self {
        let span = tracing::info_span!(parent: parent, "conn", srv = %stream.remote_pk());
        Self {
            inner: Arc::new(Inner {
                stream,
                state: Mutex::new(ConnState {
                    tps: HashMap::new(),
                    next_init_id: 0,
                }),
                ports,
                config,
                close_cause: Mutex::new(None),
                guard: CloseGuard::new(),
                token: CancellationToken::new(),
                span,
            }),
        }
    }

    fn link(&self) -> Arc<dyn ConnLink> {
        Arc::new(Link(Arc::downgrade(&self.inner)))
    }

    /// Public key of the relay server.
    pub fn remote_pk(&self) -> PubKey {
        self.inner.stream.remote_pk()
    }

    /// Our public key.
    pub fn local_pk(&self) -> PubKey {
        self.inner.stream.local_pk()
    }

    /// Whether the connection was closed.
    pub fn is_closed(&self) -> bool {
        !self.inner.guard.is_open()
    }

    /// Number of transports registered on the connection.
    pub fn transport_count(&self) -> usize {
        self.inner.state().tps.len()
    }

    /// Transport registered under `tp_id`.
    pub fn transport(&self, tp_id: u16) -> Option<Transport> {
        self.inner.state().tps.get(&tp_id).cloned()
    }

    /// Whether two handles refer to the same connection.
    pub fn same_conn(&self, other: &ClientConn) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read and dispatch frames until the connection fails or is closed.
    ///
    /// Always ends with an error; every transport is closed by then.
    pub async fn serve(&self) -> Result<()> {
        let res = self.serve_frames().await;
        let err = match res {
            Ok(()) => self.inner.take_close_cause().unwrap_or(Error::ConnClosed),
            Err(e) => e,
        };
        debug!(parent: &self.inner.span, error = %err, "serve loop finished");
        self.close().await?;
        Err(err)
    }

    async fn serve_frames(&self) -> Result<()> {
        loop {
            let packet = tokio::select! {
                _ = self.inner.token.cancelled() => return Ok(()),
                packet = self.inner.stream.read_packet() => packet?,
            };
            let frame = match Frame::decode(&packet) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(parent: &self.inner.span, error = %e, "malformed frame");
                    return Err(e.into());
                }
            };
            trace!(parent: &self.inner.span, kind = %frame.kind, tp_id = frame.tp_id, "read frame");

            if frame.kind == FrameType::Request {
                self.handle_request(frame).await?;
                continue;
            }
            let tp = self.transport(frame.tp_id);
            match tp {
                Some(tp) => tp.handle_frame(frame).await,
                None => debug!(
                    parent: &self.inner.span,
                    kind = %frame.kind,
                    tp_id = frame.tp_id,
                    "frame for unknown transport"
                ),
            }
        }
    }

    async fn handle_request(&self, frame: Frame) -> Result<()> {
        let id = frame.tp_id;
        let hs = frame.handshake().map_err(|e| {
            warn!(parent: &self.inner.span, tp_id = id, error = %e, "malformed request");
            Error::from(e)
        })?;

        if self.transport(id).is_some() {
            warn!(parent: &self.inner.span, tp_id = id, "request for transport id in use");
            return Err(Error::UnexpectedFrame {
                kind: FrameType::Request.name(),
                tp_id: id,
            });
        }
        if is_initiator_id(id) || hs.responder.pk != self.local_pk() {
            warn!(parent: &self.inner.span, tp_id = id, responder = %hs.responder, "invalid request");
            return self.reject(id, CloseReason::ProtocolViolation).await;
        }

        let port = hs.responder.port;
        let Some(listener) = self.inner.ports.listener(port) else {
            warn!(parent: &self.inner.span, tp_id = id, error = %Error::PortNotListening(port), "rejecting request");
            return self.reject(id, CloseReason::PortNotListening).await;
        };
        let permit = match listener.try_reserve() {
            Ok(permit) => permit,
            Err(e) => {
                warn!(parent: &self.inner.span, tp_id = id, error = %e, "rejecting request");
                let reason = match e {
                    Error::AcceptBufferFull(_) => CloseReason::AcceptBufferFull,
                    _ => CloseReason::PortNotListening,
                };
                return self.reject(id, reason).await;
            }
        };

        let tp = self.register(id, hs);
        tp.write_accept().await?;
        permit.send(tp.clone());
        if listener.is_closed() {
            tp.close().await?;
        }
        debug!(parent: &self.inner.span, tp_id = id, remote = %hs.initiator, "accepted transport");
        Ok(())
    }

    fn register(&self, id: u16, hs: HandshakePayload) -> Transport {
        let tp = Transport::new(
            id,
            hs.responder,
            hs.initiator,
            self.link(),
            self.inner.config.transport,
            &self.inner.span,
        );
        self.inner.state().tps.insert(id, tp.clone());
        tp
    }

    async fn reject(&self, tp_id: u16, reason: CloseReason) -> Result<()> {
        self.inner.write_frame(Frame::close(tp_id, reason)).await
    }

    /// Open a transport to `remote_pk:port` through this relay.
    pub async fn dial_transport(&self, remote_pk: PubKey, port: u16) -> Result<Transport> {
        if self.is_closed() {
            return Err(Error::ConnClosed);
        }
        let local_port = self.inner.ports.reserve_ephemeral()?;
        let local = Addr::new(self.local_pk(), local_port);
        let remote = Addr::new(remote_pk, port);

        let tp = {
            let mut state = self.inner.state();
            let start = state.next_init_id;
            let free = (0..=u16::MAX / 2)
                .map(|i| start.wrapping_add(i.wrapping_mul(2)))
                .find(|id| !state.tps.contains_key(id));
            let Some(id) = free else {
                drop(state);
                self.inner.ports.release(local_port);
                return Err(Error::NoFreeIds);
            };
            state.next_init_id = id.wrapping_add(2);
            let tp = Transport::new(
                id,
                local,
                remote,
                self.link(),
                self.inner.config.transport,
                &self.inner.span,
            );
            state.tps.insert(id, tp.clone());
            tp
        };

        if let Err(e) = tp.write_request().await {
            tp.force_close();
            return Err(e);
        }
        match tokio::time::timeout(self.inner.config.accept_timeout, tp.read_accept()).await {
            Ok(Ok(())) => Ok(tp),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let _ = tp.close().await;
                Err(Error::AcceptTimeout)
            }
        }
    }

    /// Close every transport and the connection.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::duplex;

    use super::*;
    use crate::crypto::Keypair;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// A client conn and the relay's end of the same Noise session.
    async fn conn_pair(config: ClientConfig) -> (ClientConn, NoiseStream<BoxedIo>, PortManager, Keypair) {
        let client_kp = Keypair::generate();
        let relay_kp = Keypair::generate();
        let (a, b) = duplex(1 << 20);

        let relay_pk = relay_kp.public_key();
        let ckp = client_kp.clone();
        let client = tokio::spawn(async move {
            NoiseStream::wrap(Box::new(a) as BoxedIo, &ckp, Some(relay_pk), true, TIMEOUT).await
        });
        let relay = NoiseStream::wrap(Box::new(b) as BoxedIo, &relay_kp, None, false, TIMEOUT)
            .await
            .unwrap();
        let stream = client.await.unwrap().unwrap();

        let ports = PortManager::new();
        let conn = ClientConn::new(stream, ports.clone(), config, &Span::none());
        (conn, relay, ports, client_kp)
    }

    async fn read_frame(relay: &NoiseStream<BoxedIo>) -> Frame {
        let packet = tokio::time::timeout(TIMEOUT, relay.read_packet())
            .await
            .unwrap()
            .unwrap();
        Frame::decode(&packet).unwrap()
    }

    async fn send_frame(relay: &NoiseStream<BoxedIo>, frame: Frame) {
        relay.write_packet(&frame.encode()).await.unwrap();
    }

    fn spawn_serve(conn: &ClientConn) -> tokio::task::JoinHandle<Result<()>> {
        let conn = conn.clone();
        tokio::spawn(async move { conn.serve().await })
    }

    #[tokio::test]
    async fn test_dial_transport_handshake() {
        let (conn, relay, ports, kp) = conn_pair(ClientConfig::default()).await;
        let _serve = spawn_serve(&conn);
        let remote = Keypair::generate().public_key();

        let dialer = conn.clone();
        let dial = tokio::spawn(async move { dialer.dial_transport(remote, 5).await });

        let req = read_frame(&relay).await;
        assert_eq!(req.kind, FrameType::Request);
        assert!(is_initiator_id(req.tp_id));
        let hs = req.handshake().unwrap();
        assert_eq!(hs.initiator.pk, kp.public_key());
        assert_eq!(hs.responder, Addr::new(remote, 5));
        assert!(ports.in_use(hs.initiator.port));

        send_frame(&relay, Frame::accept(req.tp_id, &hs)).await;
        let tp = dial.await.unwrap().unwrap();
        assert_eq!(tp.id(), req.tp_id);
        assert_eq!(conn.transport_count(), 1);

        tp.close().await.unwrap();
        let close = read_frame(&relay).await;
        assert_eq!(close.kind, FrameType::Close);
        assert_eq!(conn.transport_count(), 0);
        assert!(!ports.in_use(hs.initiator.port));
    }

    #[tokio::test]
    async fn test_dial_rejected_leaves_nothing() {
        let (conn, relay, ports, _) = conn_pair(ClientConfig::default()).await;
        let _serve = spawn_serve(&conn);

        let dialer = conn.clone();
        let remote = Keypair::generate().public_key();
        let dial = tokio::spawn(async move { dialer.dial_transport(remote, 6).await });

        let req = read_frame(&relay).await;
        send_frame(&relay, Frame::close(req.tp_id, CloseReason::PortNotListening)).await;
        let err = dial.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::RequestRejected(CloseReason::PortNotListening)
        ));
        assert_eq!(conn.transport_count(), 0);
        let port = req.handshake().unwrap().initiator.port;
        assert!(!ports.in_use(port));
    }

    #[tokio::test]
    async fn test_accept_timeout() {
        let config = ClientConfig {
            accept_timeout: Duration::from_millis(50),
            ..ClientConfig::default()
        };
        let (conn, relay, _, _) = conn_pair(config).await;
        let _serve = spawn_serve(&conn);

        let remote = Keypair::generate().public_key();
        let err = conn.dial_transport(remote, 5).await.unwrap_err();
        assert!(matches!(err, Error::AcceptTimeout));
        assert_eq!(conn.transport_count(), 0);

        let _req = read_frame(&relay).await;
        let close = read_frame(&relay).await;
        assert_eq!(close.kind, FrameType::Close);
    }

    #[tokio::test]
    async fn test_ids_are_even_and_distinct() {
        let (conn, relay, _, _) = conn_pair(ClientConfig::default()).await;
        let _serve = spawn_serve(&conn);
        let remote = Keypair::generate().public_key();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let dialer = conn.clone();
            let dial = tokio::spawn(async move { dialer.dial_transport(remote, 1).await });
            let req = read_frame(&relay).await;
            send_frame(&relay, Frame::accept(req.tp_id, &req.handshake().unwrap())).await;
            ids.push(dial.await.unwrap().unwrap().id());
        }
        assert!(ids.iter().all(|id| id % 2 == 0));
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    async fn inbound_request(
        relay: &NoiseStream<BoxedIo>,
        tp_id: u16,
        responder: Addr,
    ) -> Frame {
        let initiator = Addr::new(Keypair::generate().public_key(), 49999);
        send_frame(relay, Frame::request(tp_id, &HandshakePayload::new(initiator, responder))).await;
        read_frame(relay).await
    }

    #[tokio::test]
    async fn test_inbound_request_accepted() {
        let (conn, relay, ports, kp) = conn_pair(ClientConfig::default()).await;
        let listener = ports
            .new_listener(Addr::new(kp.public_key(), 5), 4, &Span::none())
            .unwrap();
        let _serve = spawn_serve(&conn);

        let reply = inbound_request(&relay, 3, Addr::new(kp.public_key(), 5)).await;
        assert_eq!(reply.kind, FrameType::Accept);
        assert_eq!(reply.tp_id, 3);

        let tp = tokio::time::timeout(TIMEOUT, listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tp.local_addr().port, 5);

        send_frame(&relay, Frame::fwd(3, 77, b"hello")).await;
        let ack = read_frame(&relay).await;
        assert_eq!(ack.kind, FrameType::Ack);
        assert_eq!(ack.ack_seq().unwrap(), 77);

        let mut buf = [0u8; 16];
        let n = tp.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_inbound_request_rejections() {
        let (conn, relay, ports, kp) = conn_pair(ClientConfig::default()).await;
        let _listener = ports
            .new_listener(Addr::new(kp.public_key(), 5), 1, &Span::none())
            .unwrap();
        let _serve = spawn_serve(&conn);
        let me = kp.public_key();

        let reply = inbound_request(&relay, 1, Addr::new(me, 6)).await;
        assert_eq!(reply.kind, FrameType::Close);
        assert_eq!(reply.close_reason(), CloseReason::PortNotListening);

        let stranger = Keypair::generate().public_key();
        let reply = inbound_request(&relay, 3, Addr::new(stranger, 5)).await;
        assert_eq!(reply.close_reason(), CloseReason::ProtocolViolation);

        let reply = inbound_request(&relay, 4, Addr::new(me, 5)).await;
        assert_eq!(reply.close_reason(), CloseReason::ProtocolViolation);

        // The first one fills the queue of size one.
        let reply = inbound_request(&relay, 5, Addr::new(me, 5)).await;
        assert_eq!(reply.kind, FrameType::Accept);
        let reply = inbound_request(&relay, 7, Addr::new(me, 5)).await;
        assert_eq!(reply.close_reason(), CloseReason::AcceptBufferFull);

        assert_eq!(conn.transport_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_request_closes_conn() {
        let (conn, relay, ports, kp) = conn_pair(ClientConfig::default()).await;
        let _listener = ports
            .new_listener(Addr::new(kp.public_key(), 5), 4, &Span::none())
            .unwrap();
        let serve = spawn_serve(&conn);

        let reply = inbound_request(&relay, 3, Addr::new(kp.public_key(), 5)).await;
        assert_eq!(reply.kind, FrameType::Accept);
        let tp = conn.transport(3).unwrap();

        let initiator = Addr::new(Keypair::generate().public_key(), 1);
        let hs = HandshakePayload::new(initiator, Addr::new(kp.public_key(), 5));
        send_frame(&relay, Frame::request(3, &hs)).await;

        let err = serve.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::UnexpectedFrame { kind: "REQUEST", .. }));
        assert!(conn.is_closed());
        assert!(tp.is_closed());
        assert_eq!(conn.transport_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake_frame_on_transport_is_violation() {
        let (conn, relay, ports, kp) = conn_pair(ClientConfig::default()).await;
        let listener = ports
            .new_listener(Addr::new(kp.public_key(), 5), 4, &Span::none())
            .unwrap();
        let serve = spawn_serve(&conn);

        let reply = inbound_request(&relay, 3, Addr::new(kp.public_key(), 5)).await;
        assert_eq!(reply.kind, FrameType::Accept);
        let tp = listener.accept().await.unwrap();

        send_frame(&relay, Frame::accept(3, &reply.handshake().unwrap())).await;

        let err = tokio::time::timeout(TIMEOUT, serve)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedFrame { kind: "ACCEPT", tp_id: 3 }));
        assert!(!err.is_network());
        assert!(conn.is_closed());
        assert!(tp.is_closed());
    }

    #[tokio::test]
    async fn test_read_error_closes_transports() {
        let (conn, relay, ports, kp) = conn_pair(ClientConfig::default()).await;
        let listener = ports
            .new_listener(Addr::new(kp.public_key(), 5), 4, &Span::none())
            .unwrap();
        let serve = spawn_serve(&conn);

        inbound_request(&relay, 3, Addr::new(kp.public_key(), 5)).await;
        let tp = listener.accept().await.unwrap();

        relay.shutdown().await.unwrap();
        drop(relay);

        let err = serve.await.unwrap().unwrap_err();
        assert!(err.is_network());
        let mut buf = [0u8; 4];
        assert!(matches!(tp.read(&mut buf).await, Err(Error::ClosedPipe)));
        assert!(matches!(tp.write(b"x").await, Err(Error::ClosedPipe)));
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let (conn, _relay, _, _) = conn_pair(ClientConfig::default()).await;
        let serve = spawn_serve(&conn);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = conn.clone();
            handles.push(tokio::spawn(async move { c.close().await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(conn.is_closed());
        assert!(serve.await.unwrap().is_err());
        assert!(matches!(
            conn.dial_transport(Keypair::generate().public_key(), 1).await,
            Err(Error::ConnClosed)
        ));
    }
}
