//! A virtual stream between two peers, multiplexed over one relay connection.
//!
//! ```text
//!   Handshaking ──ACCEPT──▶ Serving ──CLOSE / close()──▶ Closed
//!        │                                                 ▲
//!        └─────────────CLOSE / mismatch / timeout──────────┘
//! ```
//!
//! Flow control: every FWD is acknowledged by the receiver, and a writer
//! never has more than one unacknowledged FWD in flight. The receiver holds
//! back the ACK while its read buffer is at or above the read watermark, so
//! a slow reader stalls the writer instead of growing without bound.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, trace, warn};

use super::ack::AckWaiter;
use super::frame::{CloseReason, Frame, FrameType, HandshakePayload, is_initiator_id};
use crate::core::{Addr, DEFAULT_FRAME_BUFFER, DEFAULT_READ_WATERMARK, Error, MAX_FWD_DATA, Result};

/// Per-transport tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Buffered bytes at which ACKs are deferred until the reader drains.
    pub read_watermark: usize,
    /// Capacity of the inbound frame queue.
    pub frame_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_watermark: DEFAULT_READ_WATERMARK,
            frame_buffer: DEFAULT_FRAME_BUFFER,
        }
    }
}

/// The connection a transport is multiplexed over.
#[async_trait]
pub trait ConnLink: Send + Sync {
    /// Write one frame to the relay.
    async fn write_frame(&self, frame: Frame) -> Result<()>;

    /// Forget the transport `tp_id` and free what it holds.
    fn release(&self, tp_id: u16);

    /// Tear down the whole connection after the protocol violation `cause`.
    async fn close_conn(&self, cause: Error);
}

/// Transport lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// REQUEST sent or received, ACCEPT pending.
    Handshaking,
    /// Carrying data.
    Serving,
    /// Terminal.
    Closed,
}

#[derive(Default)]
struct ReadBuffer {
    data: Vec<u8>,
    deferred_acks: Vec<u16>,
}

struct Inner {
    id: u16,
    local: Addr,
    remote: Addr,
    link: Arc<dyn ConnLink>,
    config: TransportConfig,
    state: Mutex<TransportState>,
    buffer: Mutex<ReadBuffer>,
    readable: Notify,
    ack: AckWaiter,
    write_lock: Arc<AsyncMutex<()>>,
    frames_tx: mpsc::Sender<Frame>,
    frames_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    token: CancellationToken,
    span: Span,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn buffer(&self) -> MutexGuard<'_, ReadBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `Closed`. Only the first caller gets `true`.
    fn mark_closed(&self) -> bool {
        let mut state = self.state();
        if *state == TransportState::Closed {
            return false;
        }
        *state = TransportState::Closed;
        true
    }

    fn teardown(&self) {
        self.ack.stop_all();
        self.token.cancel();
        self.readable.notify_waiters();
    }
}

/// One end of a virtual stream.
///
/// Cloning is cheap; clones share the same stream.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.inner.id)
            .field("local", &self.inner.local)
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .finish()
    }
}

impl Transport {
    pub(crate) fn new(
        id: u16,
        local: Addr,
        remote: Addr,
        link: Arc<dyn ConnLink>,
        config: TransportConfig,
        parent: &Span,
    ) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(config.frame_buffer.max(1));
        let span = tracing::debug_span!(parent: parent, "transport", tp_id = id, remote = %remote);
        Self {
            inner: Arc::new(Inner {
                id,
                local,
                remote,
                link,
                config,
                state: Mutex::new(TransportState::Handshaking),
                buffer: Mutex::new(ReadBuffer::default()),
                readable: Notify::new(),
                ack: AckWaiter::new(),
                write_lock: Arc::new(AsyncMutex::new(())),
                frames_tx,
                frames_rx: Mutex::new(Some(frames_rx)),
                token: CancellationToken::new(),
                span,
            }),
        }
    }

    /// Transport ID on the local relay connection.
    pub fn id(&self) -> u16 {
        self.inner.id
    }

    /// Local address.
    pub fn local_addr(&self) -> Addr {
        self.inner.local
    }

    /// Remote address.
    pub fn remote_addr(&self) -> Addr {
        self.inner.remote
    }

    /// Current state.
    pub fn state(&self) -> TransportState {
        *self.inner.state()
    }

    /// Whether the transport reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state() == TransportState::Closed
    }

    fn take_frames(&self) -> Result<mpsc::Receiver<Frame>> {
        self.inner
            .frames_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(Error::ClosedPipe)
    }

    /// Initiator: send REQUEST.
    pub(crate) async fn write_request(&self) -> Result<()> {
        let hs = HandshakePayload::new(self.inner.local, self.inner.remote);
        self.inner
            .link
            .write_frame(Frame::request(self.inner.id, &hs))
            .await
    }

    /// Initiator: wait for the reply to REQUEST and check it.
    ///
    /// Callers bound this with the accept timeout.
    pub(crate) async fn read_accept(&self) -> Result<()> {
        let mut rx = self.take_frames()?;
        let frame = tokio::select! {
            _ = self.inner.token.cancelled() => return Err(Error::ConnClosed),
            frame = rx.recv() => frame.ok_or(Error::ConnClosed)?,
        };

        match frame.kind {
            FrameType::Accept => {
                if let Err(e) = self.check_accept(&frame) {
                    warn!(parent: &self.inner.span, error = %e, "rejecting accept");
                    self.close_with(CloseReason::ProtocolViolation).await?;
                    return Err(e);
                }
                self.start_serving(rx);
                Ok(())
            }
            FrameType::Close => {
                let reason = frame.close_reason();
                debug!(parent: &self.inner.span, %reason, "request rejected");
                self.force_close();
                Err(Error::RequestRejected(reason))
            }
            kind => {
                warn!(parent: &self.inner.span, %kind, "unexpected frame during handshake");
                self.inner.link.close_conn(self.unexpected(kind)).await;
                self.force_close();
                Err(self.unexpected(kind))
            }
        }
    }

    fn unexpected(&self, kind: FrameType) -> Error {
        Error::UnexpectedFrame {
            kind: kind.name(),
            tp_id: self.inner.id,
        }
    }

    fn check_accept(&self, frame: &Frame) -> Result<()> {
        if !is_initiator_id(self.inner.id) {
            return Err(Error::AcceptCheckFailed(format!(
                "transport id {} does not have initiator parity",
                self.inner.id
            )));
        }
        let got = frame
            .handshake()
            .map_err(|e| Error::AcceptCheckFailed(e.to_string()))?;
        let want = HandshakePayload::new(self.inner.local, self.inner.remote);
        if got != want {
            return Err(Error::AcceptCheckFailed(format!(
                "accept {}->{} does not match request {}->{}",
                got.initiator, got.responder, want.initiator, want.responder
            )));
        }
        Ok(())
    }

    /// Responder: send ACCEPT and start serving.
    pub(crate) async fn write_accept(&self) -> Result<()> {
        let rx = self.take_frames()?;
        let hs = HandshakePayload::new(self.inner.remote, self.inner.local);
        if let Err(e) = self
            .inner
            .link
            .write_frame(Frame::accept(self.inner.id, &hs))
            .await
        {
            self.force_close();
            return Err(e);
        }
        self.start_serving(rx);
        Ok(())
    }

    fn start_serving(&self, rx: mpsc::Receiver<Frame>) {
        {
            let mut state = self.inner.state();
            if *state != TransportState::Handshaking {
                return;
            }
            *state = TransportState::Serving;
        }
        debug!(parent: &self.inner.span, local = %self.inner.local, "transport established");
        let span = self.inner.span.clone();
        tokio::spawn(self.clone().serve(rx).instrument(span));
    }

    /// Queue an inbound frame for this transport.
    ///
    /// Waits while the queue is full. Frames for a transport that stopped
    /// serving are dropped.
    pub(crate) async fn handle_frame(&self, frame: Frame) {
        if self.inner.frames_tx.send(frame).await.is_err() {
            trace!(parent: &self.inner.span, "dropping frame for finished transport");
        }
    }

    async fn serve(self, mut rx: mpsc::Receiver<Frame>) {
        loop {
            let frame = tokio::select! {
                _ = self.inner.token.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            trace!(kind = %frame.kind, len = frame.payload.len(), "frame");

            match frame.kind {
                FrameType::Fwd => {
                    if let Err(e) = self.on_fwd(&frame).await {
                        warn!(error = %e, "closing transport");
                        let _ = self.close_with(CloseReason::ProtocolViolation).await;
                        break;
                    }
                }
                FrameType::Ack => match frame.ack_seq() {
                    Ok(seq) => self.inner.ack.done(seq),
                    Err(e) => {
                        warn!(error = %e, "closing transport");
                        let _ = self.close_with(CloseReason::ProtocolViolation).await;
                        break;
                    }
                },
                FrameType::Close => {
                    debug!(reason = %frame.close_reason(), "closed by remote");
                    self.force_close();
                    break;
                }
                FrameType::Request | FrameType::Accept => {
                    warn!(kind = %frame.kind, "handshake frame on established transport");
                    self.inner.link.close_conn(self.unexpected(frame.kind)).await;
                    self.force_close();
                    break;
                }
            }
        }
        trace!("serve loop finished");
    }

    async fn on_fwd(&self, frame: &Frame) -> Result<()> {
        let (seq, data) = frame.fwd_parts()?;
        let watermark = self.inner.config.read_watermark;

        let ack_now = {
            let mut buffer = self.inner.buffer();
            let before = buffer.data.len();
            // A peer waiting for its ACK leaves at most one FWD beyond the
            // watermark.
            if before >= watermark + MAX_FWD_DATA {
                return Err(self.unexpected(FrameType::Fwd));
            }
            buffer.data.extend_from_slice(data);
            if before < watermark {
                true
            } else {
                buffer.deferred_acks.push(seq);
                false
            }
        };
        self.inner.readable.notify_waiters();

        if ack_now {
            self.inner
                .link
                .write_frame(Frame::ack(self.inner.id, seq))
                .await?;
        } else {
            trace!(parent: &self.inner.span, seq, "ack deferred");
        }
        Ok(())
    }

    /// Read buffered data into `buf`.
    ///
    /// Waits until data arrives or the transport closes. Data buffered before
    /// the close is still returned; afterwards reads fail with
    /// [`Error::ClosedPipe`].
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.inner.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let drained = {
                let mut buffer = self.inner.buffer();
                if buffer.data.is_empty() {
                    None
                } else {
                    let n = buf.len().min(buffer.data.len());
                    buf[..n].copy_from_slice(&buffer.data[..n]);
                    buffer.data.drain(..n);
                    let acks = if buffer.data.len() < self.inner.config.read_watermark {
                        std::mem::take(&mut buffer.deferred_acks)
                    } else {
                        Vec::new()
                    };
                    Some((n, acks))
                }
            };

            if let Some((n, acks)) = drained {
                if !self.is_closed() {
                    for seq in acks {
                        trace!(parent: &self.inner.span, seq, "sending deferred ack");
                        if let Err(e) = self
                            .inner
                            .link
                            .write_frame(Frame::ack(self.inner.id, seq))
                            .await
                        {
                            debug!(parent: &self.inner.span, error = %e, "deferred ack not sent");
                        }
                    }
                }
                return Ok(n);
            }
            if self.is_closed() {
                return Err(Error::ClosedPipe);
            }
            notified.await;
        }
    }

    /// Send up to [`MAX_FWD_DATA`] bytes as one FWD and wait for its ACK.
    ///
    /// The wait is unbounded; wrap the call in a timeout to bound it. A
    /// write given up that way may still be delivered, and the next write
    /// waits for its ACK first.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let guard = Arc::clone(&self.inner.write_lock).lock_owned().await;
        if self.is_closed() {
            return Err(Error::ClosedPipe);
        }

        let chunk = data[..data.len().min(MAX_FWD_DATA)].to_vec();
        let len = chunk.len();
        let tp = self.clone();
        // Detached so the lock is held until the ACK even if the caller
        // stops waiting.
        let send = tokio::spawn(
            async move {
                let _guard = guard;
                let id = tp.inner.id;
                let link = &tp.inner.link;
                tp.inner
                    .ack
                    .wait(move |seq| async move {
                        link.write_frame(Frame::fwd(id, seq, &chunk)).await
                    })
                    .await
            }
            .instrument(self.inner.span.clone()),
        );
        send.await.map_err(|_| Error::ClosedPipe)??;
        trace!(parent: &self.inner.span, len, "fwd acknowledged");
        Ok(len)
    }

    /// Write all of `data`, one FWD per chunk.
    pub async fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Close the transport.
    ///
    /// Sends one CLOSE frame; repeated calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        self.close_with(CloseReason::Normal).await
    }

    pub(crate) async fn close_with(&self, reason: CloseReason) -> Result<()> {
        if !self.inner.mark_closed() {
            return Ok(());
        }
        self.inner.teardown();

        // The ID is released only after CLOSE is queued so it cannot be
        // reused ahead of it.
        if let Err(e) = self
            .inner
            .link
            .write_frame(Frame::close(self.inner.id, reason))
            .await
        {
            debug!(parent: &self.inner.span, error = %e, "close frame not delivered");
        }
        self.inner.link.release(self.inner.id);
        debug!(parent: &self.inner.span, %reason, "transport closed");
        Ok(())
    }

    /// Close without notifying the remote.
    pub(crate) fn force_close(&self) {
        if !self.inner.mark_closed() {
            return;
        }
        self.inner.teardown();
        self.inner.link.release(self.inner.id);
        debug!(parent: &self.inner.span, "transport closed locally");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
    use tokio::time::timeout;

    use super::*;
    use crate::crypto::Keypair;

    #[derive(Default)]
    struct TestLink {
        sent: Mutex<Vec<Frame>>,
        released: Mutex<Vec<u16>>,
        conn_closed: AtomicBool,
        forward: Mutex<Option<UnboundedSender<Frame>>>,
    }

    impl TestLink {
        fn sent_kinds(&self) -> Vec<FrameType> {
            self.sent.lock().unwrap().iter().map(|f| f.kind).collect()
        }

        fn released(&self) -> Vec<u16> {
            self.released.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConnLink for TestLink {
        async fn write_frame(&self, frame: Frame) -> Result<()> {
            self.sent.lock().unwrap().push(frame.clone());
            if let Some(tx) = self.forward.lock().unwrap().as_ref() {
                tx.send(frame).map_err(|_| Error::ConnClosed)?;
            }
            Ok(())
        }

        fn release(&self, tp_id: u16) {
            self.released.lock().unwrap().push(tp_id);
        }

        async fn close_conn(&self, _cause: Error) {
            self.conn_closed.store(true, Ordering::SeqCst);
        }
    }

    /// Deliver everything but REQUEST frames to `peer`.
    async fn pump(mut rx: UnboundedReceiver<Frame>, peer: Transport) {
        while let Some(frame) = rx.recv().await {
            if frame.kind != FrameType::Request {
                peer.handle_frame(frame).await;
            }
        }
    }

    fn addrs() -> (Addr, Addr) {
        (
            Addr::new(Keypair::generate().public_key(), 49200),
            Addr::new(Keypair::generate().public_key(), 5),
        )
    }

    struct Pair {
        a: Transport,
        b: Transport,
        link_a: Arc<TestLink>,
        link_b: Arc<TestLink>,
    }

    async fn connected_pair(config: TransportConfig) -> Pair {
        let (init, resp) = addrs();
        let link_a = Arc::new(TestLink::default());
        let link_b = Arc::new(TestLink::default());
        let (tx_a, rx_a) = unbounded_channel();
        let (tx_b, rx_b) = unbounded_channel();
        *link_a.forward.lock().unwrap() = Some(tx_a);
        *link_b.forward.lock().unwrap() = Some(tx_b);

        let a = Transport::new(2, init, resp, link_a.clone(), config, &Span::none());
        let b = Transport::new(3, resp, init, link_b.clone(), config, &Span::none());
        tokio::spawn(pump(rx_a, b.clone()));
        tokio::spawn(pump(rx_b, a.clone()));

        a.write_request().await.unwrap();
        b.write_accept().await.unwrap();
        a.read_accept().await.unwrap();
        Pair {
            a,
            b,
            link_a,
            link_b,
        }
    }

    async fn wait_closed(tp: &Transport) {
        timeout(Duration::from_secs(2), async {
            while !tp.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn initiator(id: u16) -> (Transport, Arc<TestLink>, Addr, Addr) {
        let (init, resp) = addrs();
        let link = Arc::new(TestLink::default());
        let tp = Transport::new(
            id,
            init,
            resp,
            link.clone(),
            TransportConfig::default(),
            &Span::none(),
        );
        (tp, link, init, resp)
    }

    #[tokio::test]
    async fn test_data_in_order() {
        let pair = connected_pair(TransportConfig::default()).await;
        assert_eq!(pair.a.state(), TransportState::Serving);
        assert_eq!(pair.b.state(), TransportState::Serving);

        pair.a.write_all(b"hello ").await.unwrap();
        pair.a.write_all(b"world").await.unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        while out.len() < 11 {
            let n = pair.b.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_large_write_is_chunked() {
        let pair = connected_pair(TransportConfig::default()).await;
        let data: Vec<u8> = (0..MAX_FWD_DATA * 2 + 10).map(|i| i as u8).collect();

        let a = pair.a.clone();
        let payload = data.clone();
        let writer = tokio::spawn(async move { a.write_all(&payload).await });

        let mut out = Vec::new();
        let mut buf = vec![0u8; 8192];
        while out.len() < data.len() {
            let n = pair.b.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        writer.await.unwrap().unwrap();
        assert_eq!(out, data);

        let fwds = pair
            .link_a
            .sent_kinds()
            .into_iter()
            .filter(|k| *k == FrameType::Fwd)
            .count();
        assert_eq!(fwds, 3);
    }

    #[tokio::test]
    async fn test_close_sends_one_frame() {
        let pair = connected_pair(TransportConfig::default()).await;
        pair.a.close().await.unwrap();
        pair.a.close().await.unwrap();

        let closes = pair
            .link_a
            .sent_kinds()
            .into_iter()
            .filter(|k| *k == FrameType::Close)
            .count();
        assert_eq!(closes, 1);
        assert_eq!(pair.link_a.released(), vec![2]);

        wait_closed(&pair.b).await;
        assert_eq!(pair.link_b.released(), vec![3]);
        assert!(!pair.link_b.sent_kinds().contains(&FrameType::Close));
        assert!(matches!(pair.a.write(b"x").await, Err(Error::ClosedPipe)));
    }

    #[tokio::test]
    async fn test_concurrent_close() {
        let pair = connected_pair(TransportConfig::default()).await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let a = pair.a.clone();
            handles.push(tokio::spawn(async move { a.close().await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(pair.link_a.released(), vec![2]);
    }

    #[tokio::test]
    async fn test_buffered_data_survives_close() {
        let pair = connected_pair(TransportConfig::default()).await;
        pair.a.write_all(b"tail").await.unwrap();
        pair.a.close().await.unwrap();
        wait_closed(&pair.b).await;

        let mut buf = [0u8; 16];
        let n = pair.b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tail");
        assert!(matches!(pair.b.read(&mut buf).await, Err(Error::ClosedPipe)));
    }

    #[tokio::test]
    async fn test_read_wakes_on_close() {
        let pair = connected_pair(TransportConfig::default()).await;
        let b = pair.b.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            b.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        pair.b.close().await.unwrap();
        assert!(matches!(reader.await.unwrap(), Err(Error::ClosedPipe)));
    }

    #[tokio::test]
    async fn test_backpressure_defers_ack() {
        let config = TransportConfig {
            read_watermark: 4,
            frame_buffer: 8,
        };
        let pair = connected_pair(config).await;

        // Below the watermark: acknowledged immediately.
        pair.a.write_all(b"12345678").await.unwrap();

        // At the watermark: the ACK waits for the reader.
        let a = pair.a.clone();
        let blocked = tokio::spawn(async move { a.write(b"abcd").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        let mut buf = [0u8; 64];
        let mut out = Vec::new();
        while out.len() < 12 {
            let n = pair.b.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"12345678abcd");
        assert_eq!(blocked.await.unwrap().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_abandoned_write_holds_next() {
        let config = TransportConfig {
            read_watermark: 4,
            frame_buffer: 8,
        };
        let pair = connected_pair(config).await;
        pair.a.write_all(b"12345678").await.unwrap();

        let res = timeout(Duration::from_millis(50), pair.a.write(b"abcd")).await;
        assert!(res.is_err());

        let a = pair.a.clone();
        let next = tokio::spawn(async move { a.write(b"tail").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!next.is_finished());
        let fwds = |link: &TestLink| {
            link.sent_kinds()
                .into_iter()
                .filter(|k| *k == FrameType::Fwd)
                .count()
        };
        assert_eq!(fwds(&pair.link_a), 2);

        let mut buf = [0u8; 64];
        let mut out = Vec::new();
        while out.len() < 16 {
            let n = pair.b.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"12345678abcdtail");
        assert_eq!(next.await.unwrap().unwrap(), 4);
        assert_eq!(fwds(&pair.link_a), 3);
    }

    #[tokio::test]
    async fn test_close_fails_pending_write() {
        let config = TransportConfig {
            read_watermark: 0,
            frame_buffer: 8,
        };
        let pair = connected_pair(config).await;

        let a = pair.a.clone();
        let pending = tokio::spawn(async move { a.write(b"never acked").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        pair.a.close().await.unwrap();
        assert!(matches!(pending.await.unwrap(), Err(Error::ClosedPipe)));
    }

    #[tokio::test]
    async fn test_overrun_is_violation() {
        let config = TransportConfig {
            read_watermark: 4,
            frame_buffer: 8,
        };
        let pair = connected_pair(config).await;

        // Ignore ACKs and keep sending.
        let full = vec![1u8; MAX_FWD_DATA];
        pair.b.handle_frame(Frame::fwd(3, 0, &full)).await;
        pair.b.handle_frame(Frame::fwd(3, 1, &full)).await;
        pair.b.handle_frame(Frame::fwd(3, 2, &[1; 8])).await;

        wait_closed(&pair.b).await;
        let last = pair.link_b.sent.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.kind, FrameType::Close);
        assert_eq!(last.close_reason(), CloseReason::ProtocolViolation);
    }

    #[tokio::test]
    async fn test_handshake_frame_closes_conn() {
        let pair = connected_pair(TransportConfig::default()).await;
        let hs = HandshakePayload::new(pair.a.local_addr(), pair.a.remote_addr());
        pair.a.handle_frame(Frame::accept(2, &hs)).await;

        wait_closed(&pair.a).await;
        assert!(pair.link_a.conn_closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_request_rejected() {
        let (tp, link, _, _) = initiator(2);
        tp.write_request().await.unwrap();
        tp.handle_frame(Frame::close(2, CloseReason::PortNotListening))
            .await;

        let err = tp.read_accept().await.unwrap_err();
        assert!(matches!(
            err,
            Error::RequestRejected(CloseReason::PortNotListening)
        ));
        assert!(tp.is_closed());
        assert_eq!(link.released(), vec![2]);
        assert_eq!(link.sent_kinds(), vec![FrameType::Request]);
    }

    #[tokio::test]
    async fn test_accept_mismatch() {
        let (tp, link, init, _) = initiator(2);
        let stranger = Addr::new(Keypair::generate().public_key(), 5);
        tp.handle_frame(Frame::accept(2, &HandshakePayload::new(init, stranger)))
            .await;

        let err = tp.read_accept().await.unwrap_err();
        assert!(matches!(err, Error::AcceptCheckFailed(_)));
        assert!(tp.is_closed());
        assert_eq!(link.sent_kinds(), vec![FrameType::Close]);
    }

    #[tokio::test]
    async fn test_accept_parity_check() {
        let (tp, _, init, resp) = initiator(3);
        tp.handle_frame(Frame::accept(3, &HandshakePayload::new(init, resp)))
            .await;
        let err = tp.read_accept().await.unwrap_err();
        assert!(matches!(err, Error::AcceptCheckFailed(_)));
    }

    #[tokio::test]
    async fn test_unexpected_handshake_frame() {
        let (tp, link, _, _) = initiator(2);
        tp.handle_frame(Frame::fwd(2, 0, b"early")).await;
        let err = tp.read_accept().await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedFrame { kind: "FWD", .. }));
        assert!(link.conn_closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_read_accept_fails_on_local_close() {
        let (tp, _, _, _) = initiator(2);
        let t = tp.clone();
        let waiting = tokio::spawn(async move { t.read_accept().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tp.force_close();
        assert!(matches!(waiting.await.unwrap(), Err(Error::ConnClosed)));
    }
}
