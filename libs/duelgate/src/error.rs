use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("failed to launch peer process: {0}")]
    Launch(String),

    #[error("peer heartbeat failed: {0}")]
    Heartbeat(String),

    /// The in-flight action never resolved and the peer process is gone.
    /// The bridge instance is poisoned and must be discarded.
    #[error("peer process hung while a call was in flight")]
    HungPeer,

    /// A call was attempted on a bridge that already raised `HungPeer`.
    #[error("bridge instance is poisoned after a hung peer")]
    Poisoned,

    /// The peer reported a non-success status for duel creation.
    /// The bridge instance remains usable.
    #[error("duel creation rejected by engine (status {0})")]
    CreationRejected(i32),

    #[error("shared segment transport error: {0}")]
    Transport(String),

    #[error("wire format error: {0}")]
    Wire(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
