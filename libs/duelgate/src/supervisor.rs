//! Peer process lifecycle: launch, liveness poll, best-effort teardown.
//!
//! The bridge only ever talks to these traits, so tests substitute a
//! supervisor that runs the peer loop on a thread instead of spawning a
//! real process.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use crate::error::{BridgeError, Result};

/// Fully resolved command line for the peer process.
#[derive(Debug, Clone)]
pub struct PeerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl PeerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Handle to a launched peer.
pub trait PeerHandle: Send {
    /// Poll whether the peer is still running. Used by the liveness
    /// policy after every wait timeout.
    fn is_running(&mut self) -> bool;

    /// Best-effort kill + reap. Errors are swallowed; teardown never
    /// escalates to the caller.
    fn clean_up(&mut self);

    /// Identifier for diagnostics.
    fn id(&self) -> u32;
}

/// Process spawn seam.
pub trait Supervisor: Send {
    fn launch(&mut self, command: &PeerCommand) -> Result<Box<dyn PeerHandle>>;
}

/// Default supervisor over `std::process`.
#[derive(Debug, Default)]
pub struct OsSupervisor;

impl Supervisor for OsSupervisor {
    fn launch(&mut self, command: &PeerCommand) -> Result<Box<dyn PeerHandle>> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                BridgeError::Launch(format!(
                    "failed to spawn '{}': {e}",
                    command.program.display()
                ))
            })?;
        tracing::info!(
            program = %command.program.display(),
            pid = child.id(),
            "spawned peer process"
        );
        Ok(Box::new(OsPeerHandle { child }))
    }
}

struct OsPeerHandle {
    child: Child,
}

impl PeerHandle for OsPeerHandle {
    fn is_running(&mut self) -> bool {
        self.child.try_wait().ok().flatten().is_none()
    }

    fn clean_up(&mut self) {
        if self.is_running() {
            tracing::warn!(pid = self.child.id(), "killing peer process");
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }

    fn id(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for OsPeerHandle {
    fn drop(&mut self) {
        if self.is_running() {
            tracing::warn!(
                pid = self.child.id(),
                "peer handle dropped while still running, killing"
            );
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_command_builder() {
        let cmd = PeerCommand::new("duelgate-peer")
            .arg("--segment")
            .arg("dg-1-abc");
        assert_eq!(cmd.program, PathBuf::from("duelgate-peer"));
        assert_eq!(cmd.args.len(), 2);
    }

    #[test]
    fn test_launch_missing_program_fails() {
        let mut sup = OsSupervisor;
        let err = sup
            .launch(&PeerCommand::new("/nonexistent/duelgate-peer"))
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Launch(_)));
    }
}
