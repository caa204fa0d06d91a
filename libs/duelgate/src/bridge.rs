//! The host-side bridge: owns the segment and the peer process handle,
//! serializes all public operations behind one local lock, and runs the
//! notify-and-wait state machine, including synchronous re-entry into
//! the callback collaborators.
//!
//! Semantically each operation is a synchronous RPC with reentrant
//! upcalls: the peer may request host data, scripts, or logging while
//! the host's request is still outstanding, over the same single
//! channel, with no second segment and no asynchronous completion.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::backend::DuelBackend;
use crate::error::{BridgeError, Result};
use crate::liveness::LivenessPolicy;
use crate::protocol::{
    Action, CardData, DuelHandle, DuelOptions, LogKind, NewCardInfo, QueryInfo,
    DUEL_CREATION_SUCCESS,
};
use crate::segment::{HostSegment, SegmentName, DEFAULT_CAPACITY};
use crate::suppliers::CollaboratorSet;
use crate::supervisor::{PeerCommand, PeerHandle, Supervisor};
use crate::wire::{Reader, Writer};

/// Launch configuration for a bridge instance.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    program: PathBuf,
    args: Vec<OsString>,
    capacity: usize,
    liveness: LivenessPolicy,
}

impl BridgeConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            capacity: DEFAULT_CAPACITY,
            liveness: LivenessPolicy::default(),
        }
    }

    /// Extra argument passed to the peer before the segment flags.
    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_liveness(mut self, liveness: LivenessPolicy) -> Self {
        self.liveness = liveness;
        self
    }
}

struct Inner {
    segment: HostSegment,
    peer: Box<dyn PeerHandle>,
    liveness: LivenessPolicy,
    /// Capability ref → collaborators, allocated per duel at creation.
    collaborators: HashMap<u64, CollaboratorSet>,
    /// Duel handle → its capability ref.
    duel_capabilities: HashMap<u64, u64>,
    next_capability: u64,
    poisoned: bool,
}

/// Bridge to an engine running in a separate peer process, over a shared
/// memory segment. One instance services many duel handles sequentially,
/// never concurrently.
pub struct ShmBridge {
    inner: Mutex<Inner>,
}

impl ShmBridge {
    /// Allocate a segment, launch the peer, and confirm it with a
    /// heartbeat round-trip. On any failure nothing outlives the failed
    /// construction: the process (if launched) is reaped and the segment
    /// unlinked.
    pub fn launch(config: BridgeConfig, supervisor: &mut dyn Supervisor) -> Result<Self> {
        let name = SegmentName::allocate();
        let segment = HostSegment::create(&name, config.capacity)?;

        let mut command = PeerCommand::new(&config.program);
        for arg in &config.args {
            command = command.arg(arg);
        }
        let command = command
            .arg("--segment")
            .arg(name.as_str())
            .arg("--capacity")
            .arg(config.capacity.to_string());

        // Segment drop unlinks the resource if the launch fails here.
        let peer = supervisor.launch(&command)?;

        let mut inner = Inner {
            segment,
            peer,
            liveness: config.liveness,
            collaborators: HashMap::new(),
            duel_capabilities: HashMap::new(),
            next_capability: 1,
            poisoned: false,
        };
        if let Err(e) = inner.exchange(Action::Heartbeat) {
            inner.peer.clean_up();
            return Err(BridgeError::Heartbeat(e.to_string()));
        }
        tracing::info!(
            segment = %name,
            capacity = inner.segment.capacity(),
            pid = inner.peer.id(),
            "bridge established"
        );
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }
}

impl Inner {
    /// Run one request to resolution: post it, wait (bounded, with
    /// liveness polls), service any number of interleaved callbacks,
    /// finish when the peer posts no-work. An explicit loop, so stack
    /// use stays flat however long the callback chain runs.
    ///
    /// Any failure here leaves the segment in an indeterminate state, so
    /// the whole instance is poisoned; there is no partial recovery.
    fn exchange(&mut self, request: Action) -> Result<()> {
        if self.poisoned {
            return Err(BridgeError::Poisoned);
        }
        let result = self.drive(request);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn drive(&mut self, request: Action) -> Result<()> {
        // A request may only start from an idle segment; anything else
        // means the protocol turn was lost.
        let idle = self.segment.action()?;
        if idle != Action::NoWork {
            return Err(BridgeError::Protocol(format!(
                "segment busy with {idle:?} before {request:?} was posted"
            )));
        }
        let mut posted = request;
        loop {
            self.segment.post(posted)?;
            let next = self
                .liveness
                .await_turnover(&self.segment, posted, self.peer.as_mut())?;
            match next {
                Action::NoWork => return Ok(()),
                callback if callback.is_callback() => {
                    self.service_callback(callback)?;
                    posted = Action::CallbackDone;
                }
                other => {
                    return Err(BridgeError::Protocol(format!(
                        "peer posted {other:?} while {request:?} was outstanding"
                    )));
                }
            }
        }
    }

    fn collaborators_for(&self, capability: u64) -> Result<CollaboratorSet> {
        self.collaborators
            .get(&capability)
            .cloned()
            .ok_or_else(|| {
                BridgeError::Protocol(format!("peer referenced unknown capability {capability}"))
            })
    }

    fn service_callback(&mut self, callback: Action) -> Result<()> {
        tracing::debug!(action = ?callback, "servicing peer callback");
        match callback {
            Action::ReadCard => {
                let (capability, code) = {
                    let mut r = Reader::new(self.segment.buffer());
                    (r.read_u64()?, r.read_u32()?)
                };
                let set = self.collaborators_for(capability)?;
                let data = set.data.data_from_code(code);
                let mut w = Writer::new(self.segment.buffer_mut());
                data.encode(&mut w)?;
            }
            Action::CardReadDone => {
                let (capability, data) = {
                    let mut r = Reader::new(self.segment.buffer());
                    (r.read_u64()?, CardData::decode(&mut r)?)
                };
                let set = self.collaborators_for(capability)?;
                set.data.data_done(data);
            }
            Action::ReadScript => {
                let (capability, path) = {
                    let mut r = Reader::new(self.segment.buffer());
                    let capability = r.read_u64()?;
                    let path = String::from_utf8(r.read_sized()?.to_vec())
                        .map_err(|_| BridgeError::Wire("script path is not UTF-8".into()))?;
                    (capability, path)
                };
                let set = self.collaborators_for(capability)?;
                let script = set.script.script_from_path(&path);
                let mut w = Writer::new(self.segment.buffer_mut());
                w.write_sized(script.as_deref().unwrap_or("").as_bytes())?;
            }
            Action::HandleLog => {
                let (capability, kind, message) = {
                    let mut r = Reader::new(self.segment.buffer());
                    let capability = r.read_u64()?;
                    let kind = LogKind::from_i32(r.read_i32()?);
                    let message = String::from_utf8_lossy(r.read_sized()?).into_owned();
                    (capability, kind, message)
                };
                let set = self.collaborators_for(capability)?;
                match &set.logger {
                    Some(logger) => logger.log(kind, &message),
                    None => tracing::trace!(?kind, "engine log discarded, no logger configured"),
                }
            }
            other => {
                return Err(BridgeError::Protocol(format!(
                    "{other:?} is not a callback action"
                )));
            }
        }
        Ok(())
    }

    fn stage_handle(&mut self, duel: DuelHandle) -> Result<()> {
        let mut w = Writer::new(self.segment.buffer_mut());
        w.write_u64(duel.0)
    }

    fn read_payload_u32(&self) -> Result<Vec<u8>> {
        let mut r = Reader::new(self.segment.buffer());
        Ok(r.read_sized_u32()?.to_vec())
    }
}

impl DuelBackend for ShmBridge {
    fn version(&self) -> Result<(i32, i32)> {
        let mut inner = self.inner.lock();
        inner.exchange(Action::GetVersion)?;
        let mut r = Reader::new(inner.segment.buffer());
        Ok((r.read_i32()?, r.read_i32()?))
    }

    fn create_duel(
        &self,
        options: &DuelOptions,
        collaborators: CollaboratorSet,
    ) -> Result<DuelHandle> {
        let mut inner = self.inner.lock();
        let capability = inner.next_capability;
        inner.next_capability += 1;
        inner.collaborators.insert(capability, collaborators);

        let created = (|| {
            {
                let mut w = Writer::new(inner.segment.buffer_mut());
                options.encode(&mut w)?;
                w.write_u64(capability)?;
            }
            inner.exchange(Action::CreateDuel)?;
            let mut r = Reader::new(inner.segment.buffer());
            let status = r.read_i32()?;
            if status != DUEL_CREATION_SUCCESS {
                return Err(BridgeError::CreationRejected(status));
            }
            Ok(DuelHandle(r.read_u64()?))
        })();

        match created {
            Ok(handle) => {
                inner.duel_capabilities.insert(handle.0, capability);
                Ok(handle)
            }
            Err(e) => {
                inner.collaborators.remove(&capability);
                Err(e)
            }
        }
    }

    fn destroy_duel(&self, duel: DuelHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.stage_handle(duel)?;
        inner.exchange(Action::DestroyDuel)?;
        if let Some(capability) = inner.duel_capabilities.remove(&duel.0) {
            inner.collaborators.remove(&capability);
        }
        Ok(())
    }

    fn add_card(&self, duel: DuelHandle, card: &NewCardInfo) -> Result<()> {
        let mut inner = self.inner.lock();
        {
            let mut w = Writer::new(inner.segment.buffer_mut());
            w.write_u64(duel.0)?;
            card.encode(&mut w)?;
        }
        inner.exchange(Action::AddCard)
    }

    fn start_duel(&self, duel: DuelHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.stage_handle(duel)?;
        inner.exchange(Action::StartDuel)
    }

    fn process(&self, duel: DuelHandle) -> Result<i32> {
        let mut inner = self.inner.lock();
        inner.stage_handle(duel)?;
        inner.exchange(Action::Process)?;
        let mut r = Reader::new(inner.segment.buffer());
        r.read_i32()
    }

    fn get_messages(&self, duel: DuelHandle) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.stage_handle(duel)?;
        inner.exchange(Action::GetMessages)?;
        inner.read_payload_u32()
    }

    fn set_response(&self, duel: DuelHandle, response: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        {
            let mut w = Writer::new(inner.segment.buffer_mut());
            w.write_u64(duel.0)?;
            w.write_sized(response)?;
        }
        inner.exchange(Action::SetResponse)
    }

    fn load_script(&self, duel: DuelHandle, name: &str, body: &str) -> Result<i32> {
        let mut inner = self.inner.lock();
        {
            let mut w = Writer::new(inner.segment.buffer_mut());
            w.write_u64(duel.0)?;
            w.write_sized(name.as_bytes())?;
            w.write_sized(body.as_bytes())?;
        }
        inner.exchange(Action::LoadScript)?;
        let mut r = Reader::new(inner.segment.buffer());
        r.read_i32()
    }

    fn query_count(&self, duel: DuelHandle, team: u8, location: u32) -> Result<u32> {
        let mut inner = self.inner.lock();
        {
            let mut w = Writer::new(inner.segment.buffer_mut());
            w.write_u64(duel.0)?;
            w.write_u8(team)?;
            w.write_u32(location)?;
        }
        inner.exchange(Action::QueryCount)?;
        let mut r = Reader::new(inner.segment.buffer());
        r.read_u32()
    }

    fn query(&self, duel: DuelHandle, info: &QueryInfo) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        {
            let mut w = Writer::new(inner.segment.buffer_mut());
            w.write_u64(duel.0)?;
            info.encode(&mut w)?;
        }
        inner.exchange(Action::Query)?;
        inner.read_payload_u32()
    }

    fn query_location(&self, duel: DuelHandle, info: &QueryInfo) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        {
            let mut w = Writer::new(inner.segment.buffer_mut());
            w.write_u64(duel.0)?;
            info.encode(&mut w)?;
        }
        inner.exchange(Action::QueryLocation)?;
        inner.read_payload_u32()
    }

    fn query_field(&self, duel: DuelHandle) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.stage_handle(duel)?;
        inner.exchange(Action::QueryField)?;
        inner.read_payload_u32()
    }
}

impl Drop for ShmBridge {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        // No response is awaited for exit; a peer that never
        // acknowledges it still gets reaped below.
        if let Err(e) = inner.segment.post(Action::Exit) {
            tracing::warn!(error = %e, "failed to signal exit to peer");
        }
        inner.peer.clean_up();
        tracing::info!(segment = %inner.segment.name(), "bridge torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct InertPeer;

    impl PeerHandle for InertPeer {
        fn is_running(&mut self) -> bool {
            true
        }

        fn clean_up(&mut self) {}

        fn id(&self) -> u32 {
            0
        }
    }

    fn inner_with_fresh_segment() -> Inner {
        let name = SegmentName::allocate();
        Inner {
            segment: HostSegment::create(&name, 1024).unwrap(),
            peer: Box::new(InertPeer),
            liveness: LivenessPolicy::default(),
            collaborators: HashMap::new(),
            duel_capabilities: HashMap::new(),
            next_capability: 1,
            poisoned: false,
        }
    }

    #[test]
    fn test_busy_segment_fails_the_exchange_and_poisons() {
        let mut inner = inner_with_fresh_segment();
        // Another exchange's turn is still active.
        inner.segment.post(Action::Heartbeat).unwrap();

        let err = inner.exchange(Action::GetVersion).err().unwrap();
        assert!(matches!(err, BridgeError::Protocol(_)));
        assert!(matches!(
            inner.exchange(Action::GetVersion).err().unwrap(),
            BridgeError::Poisoned
        ));
    }
}
