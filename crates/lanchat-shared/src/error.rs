use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid peer address: {0:?}")]
    InvalidPeer(String),

    #[error("Invalid chat pair: {0:?}")]
    InvalidPair(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
}
