//! Sync Engine
//!
//! Authoritative playback state, the store that owns it, and the messages
//! exchanged between clients and the reference side.

mod protocol;
mod state;
mod store;

pub use protocol::*;
pub use state::*;
pub use store::*;
