//! Backend-agnostic interface to a duel engine.
//!
//! Server code talks to `DuelBackend` and never cares whether the engine
//! runs in a sandboxed peer process (`ShmBridge`), in-process
//! (`LocalBackend`), or not at all (`MemoryBackend`, a scripted double
//! for exercising callers without any engine).

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::error::{BridgeError, Result};
use crate::peer::{DuelEngine, EngineHost};
use crate::protocol::{
    CardData, DuelHandle, DuelOptions, LogKind, NewCardInfo, QueryInfo, DUEL_CREATION_SUCCESS,
};
use crate::suppliers::CollaboratorSet;

pub trait DuelBackend: Send + Sync {
    fn version(&self) -> Result<(i32, i32)>;

    /// The collaborators are bound to the new duel and serve its
    /// callbacks until the duel is destroyed.
    fn create_duel(
        &self,
        options: &DuelOptions,
        collaborators: CollaboratorSet,
    ) -> Result<DuelHandle>;

    fn destroy_duel(&self, duel: DuelHandle) -> Result<()>;

    fn add_card(&self, duel: DuelHandle, card: &NewCardInfo) -> Result<()>;

    fn start_duel(&self, duel: DuelHandle) -> Result<()>;

    fn process(&self, duel: DuelHandle) -> Result<i32>;

    fn get_messages(&self, duel: DuelHandle) -> Result<Vec<u8>>;

    fn set_response(&self, duel: DuelHandle, response: &[u8]) -> Result<()>;

    fn load_script(&self, duel: DuelHandle, name: &str, body: &str) -> Result<i32>;

    fn query_count(&self, duel: DuelHandle, team: u8, location: u32) -> Result<u32>;

    fn query(&self, duel: DuelHandle, info: &QueryInfo) -> Result<Vec<u8>>;

    fn query_location(&self, duel: DuelHandle, info: &QueryInfo) -> Result<Vec<u8>>;

    fn query_field(&self, duel: DuelHandle) -> Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// In-process backend
// ---------------------------------------------------------------------------

/// Collaborator upcalls with no wire in between.
struct DirectHost<'a> {
    set: &'a CollaboratorSet,
}

impl EngineHost for DirectHost<'_> {
    fn card_data(&mut self, code: u32) -> Result<CardData> {
        Ok(self.set.data.data_from_code(code))
    }

    fn card_done(&mut self, data: CardData) -> Result<()> {
        self.set.data.data_done(data);
        Ok(())
    }

    fn script(&mut self, path: &str) -> Result<Option<String>> {
        Ok(self.set.script.script_from_path(path))
    }

    fn log(&mut self, kind: LogKind, message: &str) -> Result<()> {
        if let Some(logger) = &self.set.logger {
            logger.log(kind, message);
        }
        Ok(())
    }
}

struct LocalState<E> {
    engine: E,
    collaborators: HashMap<u64, CollaboratorSet>,
}

/// Direct in-process calls into an engine. Same serialization contract
/// as the bridge: one operation at a time behind a local lock.
pub struct LocalBackend<E> {
    state: Mutex<LocalState<E>>,
}

impl<E: DuelEngine> LocalBackend<E> {
    pub fn new(engine: E) -> Self {
        Self {
            state: Mutex::new(LocalState {
                engine,
                collaborators: HashMap::new(),
            }),
        }
    }
}

impl<E> LocalState<E> {
    fn collaborators_for(&self, duel: DuelHandle) -> Result<CollaboratorSet> {
        self.collaborators
            .get(&duel.0)
            .cloned()
            .ok_or_else(|| BridgeError::Protocol(format!("unknown duel handle {}", duel.0)))
    }
}

impl<E: DuelEngine> DuelBackend for LocalBackend<E> {
    fn version(&self) -> Result<(i32, i32)> {
        Ok(self.state.lock().engine.version())
    }

    fn create_duel(
        &self,
        options: &DuelOptions,
        collaborators: CollaboratorSet,
    ) -> Result<DuelHandle> {
        let mut state = self.state.lock();
        let (status, handle) = {
            let mut host = DirectHost {
                set: &collaborators,
            };
            state.engine.create_duel(options, &mut host)?
        };
        if status != DUEL_CREATION_SUCCESS {
            return Err(BridgeError::CreationRejected(status));
        }
        state.collaborators.insert(handle.0, collaborators);
        Ok(handle)
    }

    fn destroy_duel(&self, duel: DuelHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.engine.destroy_duel(duel)?;
        state.collaborators.remove(&duel.0);
        Ok(())
    }

    fn add_card(&self, duel: DuelHandle, card: &NewCardInfo) -> Result<()> {
        let mut state = self.state.lock();
        let set = state.collaborators_for(duel)?;
        let mut host = DirectHost { set: &set };
        state.engine.add_card(duel, card, &mut host)
    }

    fn start_duel(&self, duel: DuelHandle) -> Result<()> {
        let mut state = self.state.lock();
        let set = state.collaborators_for(duel)?;
        let mut host = DirectHost { set: &set };
        state.engine.start_duel(duel, &mut host)
    }

    fn process(&self, duel: DuelHandle) -> Result<i32> {
        let mut state = self.state.lock();
        let set = state.collaborators_for(duel)?;
        let mut host = DirectHost { set: &set };
        state.engine.process(duel, &mut host)
    }

    fn get_messages(&self, duel: DuelHandle) -> Result<Vec<u8>> {
        self.state.lock().engine.get_messages(duel)
    }

    fn set_response(&self, duel: DuelHandle, response: &[u8]) -> Result<()> {
        self.state.lock().engine.set_response(duel, response)
    }

    fn load_script(&self, duel: DuelHandle, name: &str, body: &str) -> Result<i32> {
        let mut state = self.state.lock();
        let set = state.collaborators_for(duel)?;
        let mut host = DirectHost { set: &set };
        state.engine.load_script(duel, name, body, &mut host)
    }

    fn query_count(&self, duel: DuelHandle, team: u8, location: u32) -> Result<u32> {
        self.state.lock().engine.query_count(duel, team, location)
    }

    fn query(&self, duel: DuelHandle, info: &QueryInfo) -> Result<Vec<u8>> {
        self.state.lock().engine.query(duel, info)
    }

    fn query_location(&self, duel: DuelHandle, info: &QueryInfo) -> Result<Vec<u8>> {
        self.state.lock().engine.query_location(duel, info)
    }

    fn query_field(&self, duel: DuelHandle) -> Result<Vec<u8>> {
        self.state.lock().engine.query_field(duel)
    }
}

// ---------------------------------------------------------------------------
// In-memory test double
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    next_handle: u64,
    live: HashMap<u64, CollaboratorSet>,
    process_results: VecDeque<i32>,
    messages: VecDeque<Vec<u8>>,
    query_results: VecDeque<Vec<u8>>,
    creation_status: i32,
    calls: Vec<String>,
}

/// Scripted backend with canned responses and a call log. No engine, no
/// wire, no process.
pub struct MemoryBackend {
    version: (i32, i32),
    state: Mutex<MemoryState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            version: (1, 0),
            state: Mutex::new(MemoryState {
                next_handle: 1,
                ..Default::default()
            }),
        }
    }

    /// Queue the status returned by the next `process` call.
    pub fn push_process_result(&self, status: i32) {
        self.state.lock().process_results.push_back(status);
    }

    pub fn push_messages(&self, messages: Vec<u8>) {
        self.state.lock().messages.push_back(messages);
    }

    pub fn push_query_result(&self, result: Vec<u8>) {
        self.state.lock().query_results.push_back(result);
    }

    /// Make the next creation fail with the given non-success status.
    pub fn reject_next_creation(&self, status: i32) {
        self.state.lock().creation_status = status;
    }

    /// Names of all operations invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn live_duels(&self) -> usize {
        self.state.lock().live.len()
    }
}

impl MemoryState {
    fn check(&mut self, op: &str, duel: DuelHandle) -> Result<()> {
        self.calls.push(format!("{op}({})", duel.0));
        if self.live.contains_key(&duel.0) {
            Ok(())
        } else {
            Err(BridgeError::Protocol(format!(
                "unknown duel handle {}",
                duel.0
            )))
        }
    }
}

impl DuelBackend for MemoryBackend {
    fn version(&self) -> Result<(i32, i32)> {
        self.state.lock().calls.push("version".into());
        Ok(self.version)
    }

    fn create_duel(
        &self,
        _options: &DuelOptions,
        collaborators: CollaboratorSet,
    ) -> Result<DuelHandle> {
        let mut state = self.state.lock();
        state.calls.push("create_duel".into());
        if state.creation_status != DUEL_CREATION_SUCCESS {
            let status = state.creation_status;
            state.creation_status = DUEL_CREATION_SUCCESS;
            return Err(BridgeError::CreationRejected(status));
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.live.insert(handle, collaborators);
        Ok(DuelHandle(handle))
    }

    fn destroy_duel(&self, duel: DuelHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.check("destroy_duel", duel)?;
        state.live.remove(&duel.0);
        Ok(())
    }

    fn add_card(&self, duel: DuelHandle, card: &NewCardInfo) -> Result<()> {
        let mut state = self.state.lock();
        state.check("add_card", duel)?;
        let _ = card;
        Ok(())
    }

    fn start_duel(&self, duel: DuelHandle) -> Result<()> {
        self.state.lock().check("start_duel", duel)
    }

    fn process(&self, duel: DuelHandle) -> Result<i32> {
        let mut state = self.state.lock();
        state.check("process", duel)?;
        Ok(state.process_results.pop_front().unwrap_or(0))
    }

    fn get_messages(&self, duel: DuelHandle) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.check("get_messages", duel)?;
        Ok(state.messages.pop_front().unwrap_or_default())
    }

    fn set_response(&self, duel: DuelHandle, response: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.check("set_response", duel)?;
        let _ = response;
        Ok(())
    }

    fn load_script(&self, duel: DuelHandle, _name: &str, _body: &str) -> Result<i32> {
        let mut state = self.state.lock();
        state.check("load_script", duel)?;
        Ok(0)
    }

    fn query_count(&self, duel: DuelHandle, _team: u8, _location: u32) -> Result<u32> {
        let mut state = self.state.lock();
        state.check("query_count", duel)?;
        Ok(0)
    }

    fn query(&self, duel: DuelHandle, _info: &QueryInfo) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.check("query", duel)?;
        Ok(state.query_results.pop_front().unwrap_or_default())
    }

    fn query_location(&self, duel: DuelHandle, _info: &QueryInfo) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.check("query_location", duel)?;
        Ok(state.query_results.pop_front().unwrap_or_default())
    }

    fn query_field(&self, duel: DuelHandle) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.check("query_field", duel)?;
        Ok(state.query_results.pop_front().unwrap_or_default())
    }
}
