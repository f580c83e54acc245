//! Client session
//!
//! Ties a server connection, the clock estimate and a playback scheduler
//! together and reports what happens through a [`SessionCallback`].

mod client;
mod handlers;
mod types;

pub use client::Session;
pub use types::{ClientConfig, CoreError, SessionCallback, DEFAULT_SERVER_ADDR};
