//! dmsg Protocol - Security Layer
//!
//! - **Identity**: Ed25519 keypairs ([`Keypair`], [`PubKey`], [`Sig`])
//! - **Handshake**: Noise_XK over any byte stream ([`NoiseStream`])

mod keys;
mod noise;

pub use keys::{KeyError, Keypair, PubKey, Sig};
pub use noise::{BoxedIo, Io, NoiseStream};
