//! TeamSpeak 3 ServerQuery adapter.

pub mod client;
pub mod codec;
pub mod connection;
pub mod mapper;

pub use client::{QuerySettings, TeamSpeakClient};
pub use connection::EventStream;
