//! duelgate: synchronous bridge to an out-of-process duel rule engine
//!
//! The rule engine is untrusted and crash-prone, so it runs in a
//! sandboxed peer process and talks to the host over a shared-memory
//! segment. This crate provides the host-side dispatcher (`ShmBridge`),
//! the peer-side serve loop (`peer::serve`), and in-process backends
//! for tests and embedding (`LocalBackend`, `MemoryBackend`).

pub mod backend;
pub mod bridge;
pub mod error;
pub mod liveness;
pub mod peer;
pub mod protocol;
pub mod segment;
pub mod supervisor;
pub mod suppliers;
pub mod wire;

// Re-export core types
pub use backend::{DuelBackend, LocalBackend, MemoryBackend};
pub use bridge::{BridgeConfig, ShmBridge};
pub use error::{BridgeError, Result};
pub use liveness::{LivenessPolicy, DEFAULT_POLL_INTERVAL};
pub use peer::{DuelEngine, EngineHost};
pub use protocol::{
    Action, CardData, DuelHandle, DuelOptions, LogKind, NewCardInfo, QueryInfo, TeamConfig,
    DUEL_CREATION_SUCCESS,
};
pub use segment::{HostSegment, PeerSegment, SegmentName, DEFAULT_CAPACITY};
pub use supervisor::{OsSupervisor, PeerCommand, PeerHandle, Supervisor};
pub use suppliers::{CollaboratorSet, DataSupplier, DuelLogger, ScriptSupplier};
