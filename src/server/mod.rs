//! dmsg relay server.
//!
//! Pairs client connections by public key and forwards frames between them.

#[allow(clippy::module_inception)]
mod server;
mod session;

pub use server::{Server, ServerConfig, ServerConfigBuilder};
pub use session::ServerConn;
