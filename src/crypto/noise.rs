//! Noise_XK handshake and encrypted packet stream.
//!
//! ```text
//! Noise_XK(s, rs):
//!   <- s                    # Responder's static key known to Initiator
//!   ...
//!   -> e, es                # Initiator sends ephemeral
//!   <- e, ee                # Responder sends ephemeral
//!   -> s, se                # Initiator sends encrypted static + identity
//! ```
//!
//! The third message carries the initiator's Ed25519 public key as payload.
//! The responder accepts it only if its Montgomery form equals the static
//! key that Noise just authenticated.
//!
//! After the handshake every packet is `[2-byte BE length][ciphertext]`.
//! Reads hold a lock and their own nonce. Writes are handed to a writer task
//! that owns the write half, so a caller that gives up on a write never
//! leaves a partial packet on the wire.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use snow::params::NoiseParams;
use snow::{Builder, StatelessTransportState};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};

use super::keys::{Keypair, PubKey};
use crate::core::{
    Error, NOISE_LEN_PREFIX_SIZE, NOISE_MAX_PACKET_SIZE, NOISE_MAX_PLAINTEXT_SIZE, NOISE_TAG_SIZE,
    PUBLIC_KEY_SIZE, Result,
};

/// Noise protocol pattern for dmsg.
const NOISE_PATTERN: &str = "Noise_XK_25519_ChaChaPoly_BLAKE2s";

/// Packets queued for the writer task.
const WRITE_QUEUE_SIZE: usize = 64;

/// Byte stream that can carry a Noise session.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

/// Type-erased stream, so connections over TCP and in-memory pipes share
/// one type.
pub type BoxedIo = Box<dyn Io>;

fn handshake_err(e: snow::Error) -> Error {
    Error::HandshakeFailed(e.to_string())
}

struct Reader<S> {
    io: ReadHalf<S>,
    nonce: u64,
    buf: Vec<u8>,
}

enum WriteCmd {
    Packet(Vec<u8>, oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<Result<()>>),
}

struct Writer<S> {
    io: WriteHalf<S>,
    cipher: Arc<StatelessTransportState>,
    nonce: u64,
    buf: Vec<u8>,
    broken: bool,
}

impl<S: AsyncWrite> Writer<S> {
    async fn run(mut self, mut rx: mpsc::Receiver<WriteCmd>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WriteCmd::Packet(payload, done) => {
                    let res = self.write_packet(&payload).await;
                    let _ = done.send(res);
                }
                WriteCmd::Shutdown(done) => {
                    let res = self.io.shutdown().await.map_err(Error::from);
                    self.broken = true;
                    let _ = done.send(res);
                }
            }
        }
    }

    async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        if self.broken {
            return Err(broken_pipe());
        }
        let ct_len = payload.len() + NOISE_TAG_SIZE;
        self.buf.resize(NOISE_LEN_PREFIX_SIZE + ct_len, 0);
        let n = self
            .cipher
            .write_message(self.nonce, payload, &mut self.buf[NOISE_LEN_PREFIX_SIZE..])
            .map_err(|_| Error::EncryptFailed)?;
        self.nonce += 1;
        self.buf[..NOISE_LEN_PREFIX_SIZE].copy_from_slice(&(n as u16).to_be_bytes());

        let res = match self.io.write_all(&self.buf[..NOISE_LEN_PREFIX_SIZE + n]).await {
            Ok(()) => self.io.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = res {
            // Framing is lost after a failed write.
            self.broken = true;
            return Err(e.into());
        }
        Ok(())
    }
}

fn broken_pipe() -> Error {
    Error::Io(io::Error::new(ErrorKind::BrokenPipe, "noise stream is shut down"))
}

/// An encrypted, length-prefixed packet stream.
pub struct NoiseStream<S> {
    cipher: Arc<StatelessTransportState>,
    reader: Mutex<Reader<S>>,
    writes: mpsc::Sender<WriteCmd>,
    local_pk: PubKey,
    remote_pk: PubKey,
    initiator: bool,
}

impl<S> NoiseStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Run the handshake over `io` and wrap it.
    ///
    /// # Arguments
    /// * `keypair` - Our identity
    /// * `remote` - The responder's identity; required when `initiator`,
    ///   optional pinning for a responder
    /// * `timeout` - Hard bound on the whole handshake
    ///
    /// On failure or timeout `io` is shut down and dropped.
    pub async fn wrap(
        mut io: S,
        keypair: &Keypair,
        remote: Option<PubKey>,
        initiator: bool,
        timeout: Duration,
    ) -> Result<Self> {
        let result = tokio::time::timeout(
            timeout,
            handshake(&mut io, keypair, remote, initiator),
        )
        .await;

        let (cipher, remote_pk) = match result {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                let _ = io.shutdown().await;
                return Err(e);
            }
            Err(_) => {
                let _ = io.shutdown().await;
                return Err(Error::HandshakeTimeout);
            }
        };

        let cipher = Arc::new(cipher);
        let (rd, wr) = io::split(io);
        let (writes, rx) = mpsc::channel(WRITE_QUEUE_SIZE);
        let writer = Writer {
            io: wr,
            cipher: Arc::clone(&cipher),
            nonce: 0,
            buf: Vec::new(),
            broken: false,
        };
        tokio::spawn(writer.run(rx));

        Ok(Self {
            cipher,
            reader: Mutex::new(Reader {
                io: rd,
                nonce: 0,
                buf: Vec::new(),
            }),
            writes,
            local_pk: keypair.public_key(),
            remote_pk,
            initiator,
        })
    }

    /// Our identity.
    pub fn local_pk(&self) -> PubKey {
        self.local_pk
    }

    /// The authenticated identity of the remote.
    pub fn remote_pk(&self) -> PubKey {
        self.remote_pk
    }

    /// Whether we initiated the handshake.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Read and decrypt one packet.
    pub async fn read_packet(&self) -> Result<Vec<u8>> {
        let mut guard = self.reader.lock().await;
        let reader = &mut *guard;

        let len = reader.io.read_u16().await? as usize;
        reader.buf.resize(len, 0);
        reader.io.read_exact(&mut reader.buf[..len]).await?;

        let mut out = vec![0u8; len];
        let n = self
            .cipher
            .read_message(reader.nonce, &reader.buf[..len], &mut out)
            .map_err(|_| Error::DecryptFailed)?;
        reader.nonce += 1;
        out.truncate(n);
        Ok(out)
    }

    /// Encrypt and write one packet.
    ///
    /// Payloads whose ciphertext would not fit the 2-byte length prefix fail
    /// with [`Error::ShortWrite`]; nothing is written.
    ///
    /// Cancel safe: once queued, a packet is written whole even if the
    /// returned future is dropped.
    pub async fn write_packet(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > NOISE_MAX_PLAINTEXT_SIZE {
            return Err(Error::ShortWrite {
                len: payload.len(),
                max: NOISE_MAX_PLAINTEXT_SIZE,
            });
        }
        let (done, result) = oneshot::channel();
        self.submit(WriteCmd::Packet(payload.to_vec(), done)).await?;
        result.await.map_err(|_| broken_pipe())?
    }

    /// Shut down the write direction once queued packets are written. The
    /// remote's reads then fail with EOF.
    pub async fn shutdown(&self) -> Result<()> {
        let (done, result) = oneshot::channel();
        self.submit(WriteCmd::Shutdown(done)).await?;
        result.await.map_err(|_| broken_pipe())?
    }

    async fn submit(&self, cmd: WriteCmd) -> Result<()> {
        self.writes.send(cmd).await.map_err(|_| broken_pipe())
    }
}

async fn handshake<S>(
    io: &mut S,
    keypair: &Keypair,
    remote: Option<PubKey>,
    initiator: bool,
) -> Result<(StatelessTransportState, PubKey)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let params: NoiseParams = NOISE_PATTERN.parse().map_err(handshake_err)?;
    let private = keypair.noise_private_key();
    let builder = Builder::new(params).local_private_key(private.as_slice());
    let mut buf = vec![0u8; NOISE_MAX_PACKET_SIZE];

    if initiator {
        let remote = remote.ok_or_else(|| {
            Error::HandshakeFailed("initiator requires the responder's static key".into())
        })?;
        let remote_static = remote
            .to_x25519()
            .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
        let mut state = builder
            .remote_public_key(&remote_static)
            .build_initiator()
            .map_err(handshake_err)?;

        // -> e, es
        let len = state.write_message(&[], &mut buf).map_err(handshake_err)?;
        write_message(io, &buf[..len]).await?;

        // <- e, ee
        let msg = read_message(io).await?;
        state.read_message(&msg, &mut buf).map_err(handshake_err)?;

        // -> s, se
        let len = state
            .write_message(keypair.public_key().as_bytes(), &mut buf)
            .map_err(handshake_err)?;
        write_message(io, &buf[..len]).await?;

        let transport = state
            .into_stateless_transport_mode()
            .map_err(handshake_err)?;
        Ok((transport, remote))
    } else {
        let mut state = builder.build_responder().map_err(handshake_err)?;

        // -> e, es
        let msg = read_message(io).await?;
        state.read_message(&msg, &mut buf).map_err(handshake_err)?;

        // <- e, ee
        let len = state.write_message(&[], &mut buf).map_err(handshake_err)?;
        write_message(io, &buf[..len]).await?;

        // -> s, se
        let msg = read_message(io).await?;
        let n = state.read_message(&msg, &mut buf).map_err(handshake_err)?;
        if n != PUBLIC_KEY_SIZE {
            return Err(Error::HandshakeFailed(
                "initiator did not present its identity".into(),
            ));
        }
        let claimed = PubKey::from_slice(&buf[..n])
            .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
        let claimed_static = claimed
            .to_x25519()
            .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
        let remote_static = state
            .get_remote_static()
            .ok_or_else(|| Error::HandshakeFailed("no remote static key".into()))?;
        if remote_static != claimed_static.as_slice() {
            return Err(Error::HandshakeFailed(
                "initiator identity does not match its static key".into(),
            ));
        }
        if let Some(expected) = remote {
            if expected != claimed {
                return Err(Error::HandshakeFailed(format!(
                    "unexpected initiator {claimed}"
                )));
            }
        }

        let transport = state
            .into_stateless_transport_mode()
            .map_err(handshake_err)?;
        Ok((transport, claimed))
    }
}

async fn read_message<S: AsyncRead + Unpin>(io: &mut S) -> Result<Vec<u8>> {
    let len = io.read_u16().await? as usize;
    let mut msg = vec![0u8; len];
    io.read_exact(&mut msg).await?;
    Ok(msg)
}

async fn write_message<S: AsyncWrite + Unpin>(io: &mut S, msg: &[u8]) -> Result<()> {
    io.write_all(&(msg.len() as u16).to_be_bytes()).await?;
    io.write_all(msg).await?;
    io.flush().await?;
    Ok(())
}
