//! Peer-side half of the protocol: the engine contract and the serve
//! loop that answers the host's requests over an attached segment.
//!
//! The serve loop is what the `duelgate-peer` binary runs, and what the
//! integration tests run on a thread against a real segment.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::protocol::{
    Action, CardData, DuelHandle, DuelOptions, LogKind, NewCardInfo, QueryInfo,
    DUEL_CREATION_SUCCESS,
};
use crate::segment::{PeerSegment, WaitOutcome};
use crate::wire::{Reader, Writer};

/// How long the peer sleeps per wait window. The peer never gives up on
/// the host; a dead host takes the peer down through the supervisor.
const PEER_WAIT: Duration = Duration::from_millis(250);

/// Upcalls available to the engine while it is servicing a request.
/// Backed by callback round-trips over the segment in the out-of-process
/// case, or by direct collaborator calls in the in-process case.
pub trait EngineHost {
    fn card_data(&mut self, code: u32) -> Result<CardData>;
    fn card_done(&mut self, data: CardData) -> Result<()>;
    fn script(&mut self, path: &str) -> Result<Option<String>>;
    fn log(&mut self, kind: LogKind, message: &str) -> Result<()>;
}

/// The engine-side mirror of the request set. Implementations are the
/// actual rule engine (linked into the peer binary) or scripted doubles
/// in tests. Errors abort the serve loop, which is the peer-process
/// equivalent of a crash.
pub trait DuelEngine: Send {
    fn version(&mut self) -> (i32, i32);

    /// Returns the creation status and, on success, the new handle.
    fn create_duel(
        &mut self,
        options: &DuelOptions,
        host: &mut dyn EngineHost,
    ) -> Result<(i32, DuelHandle)>;

    fn destroy_duel(&mut self, duel: DuelHandle) -> Result<()>;

    fn add_card(
        &mut self,
        duel: DuelHandle,
        card: &NewCardInfo,
        host: &mut dyn EngineHost,
    ) -> Result<()>;

    fn start_duel(&mut self, duel: DuelHandle, host: &mut dyn EngineHost) -> Result<()>;

    fn process(&mut self, duel: DuelHandle, host: &mut dyn EngineHost) -> Result<i32>;

    fn get_messages(&mut self, duel: DuelHandle) -> Result<Vec<u8>>;

    fn set_response(&mut self, duel: DuelHandle, response: &[u8]) -> Result<()>;

    fn load_script(
        &mut self,
        duel: DuelHandle,
        name: &str,
        body: &str,
        host: &mut dyn EngineHost,
    ) -> Result<i32>;

    fn query_count(&mut self, duel: DuelHandle, team: u8, location: u32) -> Result<u32>;

    fn query(&mut self, duel: DuelHandle, info: &QueryInfo) -> Result<Vec<u8>>;

    fn query_location(&mut self, duel: DuelHandle, info: &QueryInfo) -> Result<Vec<u8>>;

    fn query_field(&mut self, duel: DuelHandle) -> Result<Vec<u8>>;
}

/// EngineHost implementation that turns each upcall into a callback
/// round-trip: stage arguments, post the callback action, wait for
/// `CallbackDone`, decode the reply.
struct SegmentHost<'a> {
    segment: &'a mut PeerSegment,
    capability: u64,
}

impl SegmentHost<'_> {
    fn exchange(&mut self, callback: Action) -> Result<()> {
        self.segment.post(callback)?;
        loop {
            match self.segment.wait_while(callback, PEER_WAIT)? {
                WaitOutcome::Changed(Action::CallbackDone) => return Ok(()),
                WaitOutcome::Changed(other) => {
                    return Err(BridgeError::Protocol(format!(
                        "expected callback-done, host posted {other:?}"
                    )));
                }
                WaitOutcome::TimedOut => continue,
            }
        }
    }
}

impl EngineHost for SegmentHost<'_> {
    fn card_data(&mut self, code: u32) -> Result<CardData> {
        let mut w = Writer::new(self.segment.buffer_mut());
        w.write_u64(self.capability)?;
        w.write_u32(code)?;
        self.exchange(Action::ReadCard)?;
        let mut r = Reader::new(self.segment.buffer());
        CardData::decode(&mut r)
    }

    fn card_done(&mut self, data: CardData) -> Result<()> {
        let mut w = Writer::new(self.segment.buffer_mut());
        w.write_u64(self.capability)?;
        data.encode(&mut w)?;
        self.exchange(Action::CardReadDone)
    }

    fn script(&mut self, path: &str) -> Result<Option<String>> {
        let mut w = Writer::new(self.segment.buffer_mut());
        w.write_u64(self.capability)?;
        w.write_sized(path.as_bytes())?;
        self.exchange(Action::ReadScript)?;
        let mut r = Reader::new(self.segment.buffer());
        let body = r.read_sized()?;
        if body.is_empty() {
            return Ok(None);
        }
        String::from_utf8(body.to_vec())
            .map(Some)
            .map_err(|_| BridgeError::Wire("script reply is not UTF-8".into()))
    }

    fn log(&mut self, kind: LogKind, message: &str) -> Result<()> {
        let mut w = Writer::new(self.segment.buffer_mut());
        w.write_u64(self.capability)?;
        w.write_i32(kind.as_i32())?;
        w.write_sized(message.as_bytes())?;
        self.exchange(Action::HandleLog)
    }
}

/// Answer requests over `segment` until the host posts `Exit`.
///
/// An engine error aborts the loop with that error; the host then
/// observes a dead peer through its liveness policy.
pub fn serve(segment: &mut PeerSegment, engine: &mut dyn DuelEngine) -> Result<()> {
    // Capability ref chosen at duel creation, echoed in every callback
    // for that duel.
    let mut capabilities: HashMap<u64, u64> = HashMap::new();
    tracing::info!(name = %segment.name(), "peer serve loop started");

    loop {
        let request = loop {
            match segment.wait_while(Action::NoWork, PEER_WAIT)? {
                WaitOutcome::Changed(a) => break a,
                WaitOutcome::TimedOut => continue,
            }
        };
        tracing::trace!(action = ?request, "peer picked up request");

        match request {
            Action::Exit => {
                tracing::info!(name = %segment.name(), "exit requested, peer serve loop done");
                return Ok(());
            }
            Action::Heartbeat => {}
            Action::GetVersion => {
                let (major, minor) = engine.version();
                let mut w = Writer::new(segment.buffer_mut());
                w.write_i32(major)?;
                w.write_i32(minor)?;
            }
            Action::CreateDuel => {
                let (options, capability) = {
                    let mut r = Reader::new(segment.buffer());
                    let options = DuelOptions::decode(&mut r)?;
                    (options, r.read_u64()?)
                };
                let (status, handle) = {
                    let mut host = SegmentHost {
                        segment: &mut *segment,
                        capability,
                    };
                    engine.create_duel(&options, &mut host)?
                };
                if status == DUEL_CREATION_SUCCESS {
                    capabilities.insert(handle.0, capability);
                }
                let mut w = Writer::new(segment.buffer_mut());
                w.write_i32(status)?;
                w.write_u64(handle.0)?;
            }
            Action::DestroyDuel => {
                let duel = read_handle(segment)?;
                engine.destroy_duel(duel)?;
                capabilities.remove(&duel.0);
            }
            Action::AddCard => {
                let (duel, card) = {
                    let mut r = Reader::new(segment.buffer());
                    let duel = DuelHandle(r.read_u64()?);
                    (duel, NewCardInfo::decode(&mut r)?)
                };
                let capability = capability_for(&capabilities, duel);
                let mut host = SegmentHost {
                    segment: &mut *segment,
                    capability,
                };
                engine.add_card(duel, &card, &mut host)?;
            }
            Action::StartDuel => {
                let duel = read_handle(segment)?;
                let capability = capability_for(&capabilities, duel);
                let mut host = SegmentHost {
                    segment: &mut *segment,
                    capability,
                };
                engine.start_duel(duel, &mut host)?;
            }
            Action::Process => {
                let duel = read_handle(segment)?;
                let capability = capability_for(&capabilities, duel);
                let status = {
                    let mut host = SegmentHost {
                        segment: &mut *segment,
                        capability,
                    };
                    engine.process(duel, &mut host)?
                };
                let mut w = Writer::new(segment.buffer_mut());
                w.write_i32(status)?;
            }
            Action::GetMessages => {
                let duel = read_handle(segment)?;
                let messages = engine.get_messages(duel)?;
                write_sized_u32(segment, &messages)?;
            }
            Action::SetResponse => {
                let (duel, response) = {
                    let mut r = Reader::new(segment.buffer());
                    let duel = DuelHandle(r.read_u64()?);
                    (duel, r.read_sized()?.to_vec())
                };
                engine.set_response(duel, &response)?;
            }
            Action::LoadScript => {
                let (duel, name, body) = {
                    let mut r = Reader::new(segment.buffer());
                    let duel = DuelHandle(r.read_u64()?);
                    let name = decode_utf8(r.read_sized()?)?;
                    let body = decode_utf8(r.read_sized()?)?;
                    (duel, name, body)
                };
                let capability = capability_for(&capabilities, duel);
                let status = {
                    let mut host = SegmentHost {
                        segment: &mut *segment,
                        capability,
                    };
                    engine.load_script(duel, &name, &body, &mut host)?
                };
                let mut w = Writer::new(segment.buffer_mut());
                w.write_i32(status)?;
            }
            Action::QueryCount => {
                let (duel, team, location) = {
                    let mut r = Reader::new(segment.buffer());
                    (DuelHandle(r.read_u64()?), r.read_u8()?, r.read_u32()?)
                };
                let count = engine.query_count(duel, team, location)?;
                let mut w = Writer::new(segment.buffer_mut());
                w.write_u32(count)?;
            }
            Action::Query | Action::QueryLocation => {
                let (duel, info) = {
                    let mut r = Reader::new(segment.buffer());
                    let duel = DuelHandle(r.read_u64()?);
                    (duel, QueryInfo::decode(&mut r)?)
                };
                let result = if request == Action::Query {
                    engine.query(duel, &info)?
                } else {
                    engine.query_location(duel, &info)?
                };
                write_sized_u32(segment, &result)?;
            }
            Action::QueryField => {
                let duel = read_handle(segment)?;
                let field = engine.query_field(duel)?;
                write_sized_u32(segment, &field)?;
            }
            other => {
                return Err(BridgeError::Protocol(format!(
                    "unexpected action {other:?} while peer was idle"
                )));
            }
        }

        segment.post(Action::NoWork)?;
    }
}

fn read_handle(segment: &PeerSegment) -> Result<DuelHandle> {
    let mut r = Reader::new(segment.buffer());
    Ok(DuelHandle(r.read_u64()?))
}

fn capability_for(capabilities: &HashMap<u64, u64>, duel: DuelHandle) -> u64 {
    capabilities.get(&duel.0).copied().unwrap_or(0)
}

fn decode_utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| BridgeError::Wire("payload is not UTF-8".into()))
}

/// Message/query payloads carry a `u32` size prefix.
fn write_sized_u32(segment: &mut PeerSegment, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| BridgeError::Wire(format!("payload of {} bytes exceeds u32", bytes.len())))?;
    let mut w = Writer::new(segment.buffer_mut());
    w.write_u32(len)?;
    w.write_raw(bytes)
}
