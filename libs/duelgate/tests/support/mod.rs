//! Shared harness: a supervisor that runs the peer serve loop on a
//! thread against the real segment, a scripted engine, and recording
//! collaborators. Everything observable in the engine is shared through
//! `EngineKnobs` so tests can steer and assert from the host side.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use duelgate::peer::{self, DuelEngine, EngineHost};
use duelgate::{
    BridgeError, CardData, DuelHandle, DuelOptions, LogKind, NewCardInfo, PeerCommand, PeerHandle,
    PeerSegment, QueryInfo, Result, SegmentName, Supervisor, DUEL_CREATION_SUCCESS,
};

// ---------------------------------------------------------------------------
// Scripted engine
// ---------------------------------------------------------------------------

/// Host-side steering wheel for the engine running on the peer thread.
#[derive(Default)]
pub struct EngineKnobs {
    /// Non-zero makes the next creation return that status.
    pub reject_creation: AtomicI32,
    /// Engine-side stall inserted into `process`, simulating a long
    /// legal computation.
    pub process_delay_ms: AtomicU32,
    /// Makes `process` fail, which aborts the serve loop the way a
    /// crashed engine would.
    pub fail_process: AtomicBool,
    /// Payload returned by `get_messages`.
    pub messages: Mutex<Vec<u8>>,
    /// Everything passed to `set_response`.
    pub responses: Mutex<Vec<Vec<u8>>>,
}

pub struct TestEngine {
    knobs: Arc<EngineKnobs>,
    next_handle: u64,
    live: HashSet<u64>,
}

impl TestEngine {
    pub fn new(knobs: Arc<EngineKnobs>) -> Self {
        Self {
            knobs,
            next_handle: 1,
            live: HashSet::new(),
        }
    }
}

impl DuelEngine for TestEngine {
    fn version(&mut self) -> (i32, i32) {
        (11, 2)
    }

    fn create_duel(
        &mut self,
        _options: &DuelOptions,
        host: &mut dyn EngineHost,
    ) -> Result<(i32, DuelHandle)> {
        let status = self.knobs.reject_creation.swap(0, Ordering::SeqCst);
        if status != DUEL_CREATION_SUCCESS {
            return Ok((status, DuelHandle(0)));
        }
        host.log(LogKind::Debug, "duel created")?;
        let handle = self.next_handle;
        self.next_handle += 1;
        self.live.insert(handle);
        Ok((DUEL_CREATION_SUCCESS, DuelHandle(handle)))
    }

    fn destroy_duel(&mut self, duel: DuelHandle) -> Result<()> {
        self.live.remove(&duel.0);
        Ok(())
    }

    fn add_card(
        &mut self,
        _duel: DuelHandle,
        card: &NewCardInfo,
        host: &mut dyn EngineHost,
    ) -> Result<()> {
        let data = host.card_data(card.code)?;
        if data.code != card.code {
            return Err(BridgeError::Protocol(format!(
                "asked for card {} and got {}",
                card.code, data.code
            )));
        }
        host.card_done(data)
    }

    fn start_duel(&mut self, _duel: DuelHandle, host: &mut dyn EngineHost) -> Result<()> {
        let _ = host.script("constant.lua")?;
        Ok(())
    }

    fn process(&mut self, duel: DuelHandle, host: &mut dyn EngineHost) -> Result<i32> {
        let delay = self.knobs.process_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(u64::from(delay)));
        }
        if self.knobs.fail_process.load(Ordering::SeqCst) {
            return Err(BridgeError::Protocol("engine fault injected".into()));
        }
        host.log(LogKind::Debug, &format!("processed duel {}", duel.0))?;
        Ok(duel.0 as i32)
    }

    fn get_messages(&mut self, _duel: DuelHandle) -> Result<Vec<u8>> {
        Ok(self.knobs.messages.lock().clone())
    }

    fn set_response(&mut self, _duel: DuelHandle, response: &[u8]) -> Result<()> {
        self.knobs.responses.lock().push(response.to_vec());
        Ok(())
    }

    fn load_script(
        &mut self,
        _duel: DuelHandle,
        name: &str,
        body: &str,
        host: &mut dyn EngineHost,
    ) -> Result<i32> {
        host.log(LogKind::Script, name)?;
        Ok(if body.is_empty() { -1 } else { 0 })
    }

    fn query_count(&mut self, _duel: DuelHandle, _team: u8, _location: u32) -> Result<u32> {
        Ok(3)
    }

    fn query(&mut self, _duel: DuelHandle, info: &QueryInfo) -> Result<Vec<u8>> {
        Ok(info.flags.to_ne_bytes().to_vec())
    }

    fn query_location(&mut self, _duel: DuelHandle, info: &QueryInfo) -> Result<Vec<u8>> {
        Ok(info.location.to_ne_bytes().to_vec())
    }

    fn query_field(&mut self, _duel: DuelHandle) -> Result<Vec<u8>> {
        Ok(vec![0xFE; 5])
    }
}

/// Route library and harness traces through the captured test writer.
/// Only the first caller installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Thread-backed supervisor
// ---------------------------------------------------------------------------

/// Runs the peer serve loop on a thread instead of spawning a process.
/// The segment, codec, and dispatch paths are the real ones; only the
/// process boundary is simulated.
pub struct MockSupervisor {
    engine: Option<Box<dyn DuelEngine>>,
    /// Name of the segment the launched peer attached to.
    pub segment_name: Arc<Mutex<Option<SegmentName>>>,
}

impl MockSupervisor {
    pub fn new(engine: impl DuelEngine + 'static) -> Self {
        init_tracing();
        Self {
            engine: Some(Box::new(engine)),
            segment_name: Arc::new(Mutex::new(None)),
        }
    }
}

impl Supervisor for MockSupervisor {
    fn launch(&mut self, command: &PeerCommand) -> Result<Box<dyn PeerHandle>> {
        let (name, capacity) = parse_segment_args(command)?;
        let mut segment = PeerSegment::attach(&name, capacity)?;
        *self.segment_name.lock() = Some(name);

        let mut engine = self
            .engine
            .take()
            .ok_or_else(|| BridgeError::Launch("supervisor already launched its peer".into()))?;
        let alive = Arc::new(AtomicBool::new(true));
        let thread_alive = alive.clone();
        let join = thread::spawn(move || {
            let result = peer::serve(&mut segment, engine.as_mut());
            thread_alive.store(false, Ordering::SeqCst);
            result
        });
        Ok(Box::new(ThreadPeer {
            alive,
            join: Some(join),
        }))
    }
}

fn parse_segment_args(command: &PeerCommand) -> Result<(SegmentName, usize)> {
    let mut name = None;
    let mut capacity = None;
    let mut args = command.args.iter();
    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--segment") => {
                name = args.next().and_then(|v| v.to_str()).map(String::from);
            }
            Some("--capacity") => {
                capacity = args.next().and_then(|v| v.to_str()).and_then(|v| v.parse().ok());
            }
            _ => {}
        }
    }
    match (name, capacity) {
        (Some(n), Some(c)) => Ok((SegmentName::from_string(n), c)),
        _ => Err(BridgeError::Launch(
            "peer command is missing segment flags".into(),
        )),
    }
}

struct ThreadPeer {
    alive: Arc<AtomicBool>,
    join: Option<JoinHandle<Result<()>>>,
}

impl PeerHandle for ThreadPeer {
    fn is_running(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn clean_up(&mut self) {
        // By the time the bridge cleans up, it has either posted exit or
        // watched the serve loop die, so the join is bounded.
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        self.alive.store(false, Ordering::SeqCst);
    }

    fn id(&self) -> u32 {
        0
    }
}

/// Supervisor whose peer is gone the moment anyone looks. Drives the
/// heartbeat handshake into the hung-peer path.
pub struct StillbornSupervisor {
    pub cleaned: Arc<AtomicBool>,
    pub segment_name: Arc<Mutex<Option<SegmentName>>>,
}

impl StillbornSupervisor {
    pub fn new() -> Self {
        init_tracing();
        Self {
            cleaned: Arc::new(AtomicBool::new(false)),
            segment_name: Arc::new(Mutex::new(None)),
        }
    }
}

impl Supervisor for StillbornSupervisor {
    fn launch(&mut self, command: &PeerCommand) -> Result<Box<dyn PeerHandle>> {
        if let Ok((name, _)) = parse_segment_args(command) {
            *self.segment_name.lock() = Some(name);
        }
        Ok(Box::new(StillbornPeer {
            cleaned: self.cleaned.clone(),
        }))
    }
}

struct StillbornPeer {
    cleaned: Arc<AtomicBool>,
}

impl PeerHandle for StillbornPeer {
    fn is_running(&mut self) -> bool {
        false
    }

    fn clean_up(&mut self) {
        self.cleaned.store(true, Ordering::SeqCst);
    }

    fn id(&self) -> u32 {
        0
    }
}

/// Supervisor that refuses to spawn anything, but remembers the segment
/// it was offered so tests can check the name got unlinked.
#[derive(Default)]
pub struct FailingSupervisor {
    pub segment_name: Arc<Mutex<Option<SegmentName>>>,
}

impl Supervisor for FailingSupervisor {
    fn launch(&mut self, command: &PeerCommand) -> Result<Box<dyn PeerHandle>> {
        if let Ok((name, _)) = parse_segment_args(command) {
            *self.segment_name.lock() = Some(name);
        }
        Err(BridgeError::Launch(format!(
            "refusing to spawn '{}'",
            command.program.display()
        )))
    }
}

// ---------------------------------------------------------------------------
// Recording collaborators
// ---------------------------------------------------------------------------

use duelgate::{CollaboratorSet, DataSupplier, DuelLogger, ScriptSupplier};

#[derive(Default)]
pub struct RecordingData {
    pub lookups: Mutex<Vec<u32>>,
    pub released: Mutex<Vec<u32>>,
}

impl DataSupplier for RecordingData {
    fn data_from_code(&self, code: u32) -> CardData {
        self.lookups.lock().push(code);
        CardData {
            code,
            attack: 1700,
            setcodes: vec![0x2a],
            ..Default::default()
        }
    }

    fn data_done(&self, data: CardData) {
        self.released.lock().push(data.code);
    }
}

#[derive(Default)]
pub struct RecordingScript {
    pub requests: Mutex<Vec<String>>,
    pub body: Option<String>,
}

impl ScriptSupplier for RecordingScript {
    fn script_from_path(&self, path: &str) -> Option<String> {
        self.requests.lock().push(path.to_string());
        self.body.clone()
    }
}

#[derive(Default)]
pub struct RecordingLogger {
    pub lines: Mutex<Vec<(LogKind, String)>>,
}

impl DuelLogger for RecordingLogger {
    fn log(&self, kind: LogKind, message: &str) {
        self.lines.lock().push((kind, message.to_string()));
    }
}

pub struct Recorders {
    pub data: Arc<RecordingData>,
    pub script: Arc<RecordingScript>,
    pub logger: Arc<RecordingLogger>,
}

pub fn recording_set() -> (CollaboratorSet, Recorders) {
    let data = Arc::new(RecordingData::default());
    let script = Arc::new(RecordingScript {
        requests: Mutex::new(Vec::new()),
        body: Some("return {}".to_string()),
    });
    let logger = Arc::new(RecordingLogger::default());
    let set = CollaboratorSet::new(data.clone(), script.clone()).with_logger(logger.clone());
    (
        set,
        Recorders {
            data,
            script,
            logger,
        },
    )
}
