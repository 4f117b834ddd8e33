//! Protocol constants.
//!
//! Wire sizes are fixed by the protocol and MUST NOT be changed. Defaults
//! for the tunable parameters live here too so every config type agrees.

use std::time::Duration;

// =============================================================================
// KEYS
// =============================================================================

/// Ed25519 / X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key (seed) size.
pub const SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size.
pub const SIGNATURE_SIZE: usize = 64;

/// Handshake payload version carried in REQUEST/ACCEPT frames.
pub const PROTOCOL_VERSION: u8 = 0x01;

// =============================================================================
// NOISE FRAMING
// =============================================================================

/// Size of the big-endian length prefix of every Noise packet.
pub const NOISE_LEN_PREFIX_SIZE: usize = 2;

/// Largest ciphertext representable by the length prefix.
pub const NOISE_MAX_PACKET_SIZE: usize = u16::MAX as usize;

/// ChaChaPoly authentication tag size.
pub const NOISE_TAG_SIZE: usize = 16;

/// Largest plaintext that fits one Noise packet.
pub const NOISE_MAX_PLAINTEXT_SIZE: usize = NOISE_MAX_PACKET_SIZE - NOISE_TAG_SIZE;

// =============================================================================
// FRAMES
// =============================================================================

/// Frame header size (type + transport id).
pub const FRAME_HEADER_SIZE: usize = 1 + 2;

/// Size of the ack sequence prepended to FWD data.
pub const FWD_HEADER_SIZE: usize = 2;

/// Size of an ACK payload.
pub const ACK_PAYLOAD_SIZE: usize = 2;

/// Size of a REQUEST/ACCEPT payload (version + two addresses).
pub const HANDSHAKE_PAYLOAD_SIZE: usize = 1 + 2 * (PUBLIC_KEY_SIZE + 2);

/// Largest frame carried by one Noise packet.
pub const MAX_FRAME_SIZE: usize = NOISE_MAX_PLAINTEXT_SIZE;

/// Largest data chunk carried by one FWD frame.
pub const MAX_FWD_DATA: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE - FWD_HEADER_SIZE;

// =============================================================================
// PORTS
// =============================================================================

/// First port of the ephemeral range handed out to dialers.
pub const EPHEMERAL_PORT_START: u16 = 49152;

/// Last port of the ephemeral range.
pub const EPHEMERAL_PORT_END: u16 = u16::MAX;

// =============================================================================
// DEFAULTS
// =============================================================================

/// Default Noise handshake timeout (also bounds the TCP dial).
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time to wait for ACCEPT after sending REQUEST.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between relay reconnection attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Default capacity of a listener's accept queue.
pub const DEFAULT_ACCEPT_BUFFER_SIZE: usize = 20;

/// Default buffered bytes above which a transport defers its ACKs.
pub const DEFAULT_READ_WATERMARK: usize = 64 * 1024;

/// Default capacity of the per-transport inbound frame queue.
pub const DEFAULT_FRAME_BUFFER: usize = 64;

/// Maximum attempts of a discovery update under sequence conflicts.
pub const MAX_UPDATE_ATTEMPTS: usize = 16;
