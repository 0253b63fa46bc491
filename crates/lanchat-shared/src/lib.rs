//! # lanchat-shared
//!
//! Types shared between the chat store and the relay server: peer
//! identities, chat pair keys, messages, and the JSON event protocol spoken
//! over the WebSocket.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
