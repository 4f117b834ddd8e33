//! # dmsg
//!
//! Relay-mediated, encrypted, multiplexed transport between peers that are
//! identified only by public keys.
//!
//! Neither peer needs a public address: both keep an outbound connection to
//! a relay server, and the relay pairs their transports by public key.
//!
//! - **Identity**: one Ed25519 keypair per peer, also used as the Noise key
//! - **Security**: every relay link runs Noise_XK_25519_ChaChaPoly_BLAKE2s
//! - **Multiplexing**: many transports share one relay connection
//! - **Flow control**: one unacknowledged FWD per transport, ACKs deferred
//!   while the reader lags
//!
//! ## Feature Flags
//!
//! - `client` (default): [`client::Client`], listeners and relay connections
//! - `server` (default): the relay [`server::Server`]
//! - `http` (default): [`discovery::HttpDiscovery`], the discovery HTTP client
//!
//! ## Modules
//!
//! - [`core`]: Addresses, constants, lifecycle and error types
//! - [`crypto`]: Identity keys and the Noise stream
//! - [`transport`]: Frames and the transport state machine
//! - [`discovery`]: Signed entries and discovery backends
//! - [`client`]: Client API (requires `client` feature)
//! - [`server`]: Relay server (requires `server` feature)
//!
//! ## Example Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use dmsg::prelude::*;
//!
//! let disc: Arc<dyn Discovery> = Arc::new(HttpDiscovery::new("http://127.0.0.1:9090")?);
//!
//! // Responder
//! let bob = Client::new(Keypair::generate(), disc.clone(), ClientConfig::default());
//! bob.init_server_connections(1).await?;
//! let listener = bob.listen(5)?;
//!
//! // Initiator
//! let alice = Client::new(Keypair::generate(), disc, ClientConfig::default());
//! let tp = alice.dial(bob.public_key(), 5).await?;
//! tp.write_all(b"hello").await?;
//!
//! let accepted = listener.accept().await?;
//! let mut buf = [0u8; 5];
//! accepted.read(&mut buf).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

pub mod crypto;

pub mod discovery;

pub mod transport;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{Addr, Error, Result};
    pub use crate::crypto::{Keypair, PubKey};
    #[cfg(feature = "http")]
    pub use crate::discovery::HttpDiscovery;
    pub use crate::discovery::{Discovery, Entry, MockDiscovery};
    pub use crate::transport::{Transport, TransportConfig};

    #[cfg(feature = "client")]
    pub use crate::client::{Client, ClientConfig, ClientConfigBuilder, Listener};

    #[cfg(feature = "server")]
    pub use crate::server::{Server, ServerConfig, ServerConfigBuilder};
}

// Re-export commonly used items at crate root
pub use crate::core::{Addr, Error, Result};
pub use crate::crypto::{Keypair, PubKey};
