//! Client/server networking
//!
//! TCP with one JSON frame per line.

mod codec;
mod connection;

pub use codec::{frame_id, write_frame, FrameError, FrameReader, DEFAULT_MAX_FRAME_BYTES};
pub use connection::{connect, ConnectionConfig, ConnectionHandle, NetworkError};
