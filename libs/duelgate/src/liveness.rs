//! Timed-wait-then-poll policy for detecting a hung peer.
//!
//! The poll interval is the only detection latency bound: a call blocks
//! in windows of this length, and after each timeout the peer process is
//! polled. A peer that is still running keeps the call waiting with no
//! cumulative deadline; a peer that is gone fails the call. The window
//! re-arms after every callback exchange, so each leg of a chain gets a
//! fresh timeout.

use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::protocol::Action;
use crate::segment::{RawSegment, WaitOutcome};
use crate::supervisor::PeerHandle;

/// Default wait window before each liveness poll.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct LivenessPolicy {
    poll_interval: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl LivenessPolicy {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Block until the segment's action turns over from `posted`, or
    /// fail with `HungPeer` once the peer stops running.
    pub(crate) fn await_turnover(
        &self,
        segment: &RawSegment,
        posted: Action,
        peer: &mut dyn PeerHandle,
    ) -> Result<Action> {
        loop {
            match segment.wait_while(posted, self.poll_interval)? {
                WaitOutcome::Changed(next) => return Ok(next),
                WaitOutcome::TimedOut => {
                    if peer.is_running() {
                        tracing::trace!(
                            action = ?posted,
                            pid = peer.id(),
                            "wait window elapsed, peer alive, re-arming"
                        );
                        continue;
                    }
                    tracing::error!(
                        action = ?posted,
                        pid = peer.id(),
                        "peer process gone with a call in flight"
                    );
                    return Err(BridgeError::HungPeer);
                }
            }
        }
    }
}
