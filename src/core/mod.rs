//! Core types shared by every layer: constants, errors, addressing and
//! shutdown state.

mod addr;
pub mod constants;
mod error;
mod lifecycle;

pub use addr::Addr;
pub use constants::*;
pub use error::{Error, Result};
pub use lifecycle::{CloseGuard, Lifecycle};
