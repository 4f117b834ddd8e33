//! dmsg transport layer.
//!
//! Everything that travels over a relay connection is a [`Frame`]. Frames
//! carrying the same transport ID belong to one [`Transport`], a virtual
//! stream between two peers:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       Transport (per stream)            │  ← read / write / close
//! │   handshake, ack flow control           │
//! ├─────────────────────────────────────────┤
//! │       Frames (multiplexed by id)        │  ← This module
//! ├─────────────────────────────────────────┤
//! │       Noise packets                     │
//! ├─────────────────────────────────────────┤
//! │              TCP                        │
//! └─────────────────────────────────────────┘
//! ```

mod ack;
mod frame;
mod stream;

pub use ack::AckWaiter;
pub use frame::*;
pub use stream::{ConnLink, Transport, TransportConfig, TransportState};
