//! dmsg client.
//!
//! [`Client`] is the entry point: it dials remote peers and listens on local
//! ports through the relay servers it connects to.

#[allow(clippy::module_inception)]
mod client;
mod conn;
mod listener;
mod port;

pub use client::{Client, ClientConfig, ClientConfigBuilder};
pub use conn::ClientConn;
pub use listener::Listener;
pub use port::PortManager;
