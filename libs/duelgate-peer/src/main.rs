//! Sandboxed peer process.
//!
//! Attaches to the segment named on the command line and answers the
//! host's requests until told to exit. The engine served here is a
//! deterministic stub; a real rule engine links its `DuelEngine`
//! implementation into a binary shaped exactly like this one.

use anyhow::{Context, Result};
use clap::Parser;

use duelgate::peer::{self, DuelEngine, EngineHost};
use duelgate::{
    DuelHandle, DuelOptions, LogKind, NewCardInfo, PeerSegment, QueryInfo, SegmentName,
    DUEL_CREATION_SUCCESS,
};

#[derive(Parser)]
#[command(name = "duelgate-peer")]
#[command(about = "Duel engine peer process", long_about = None)]
struct Cli {
    /// Shared memory segment name allocated by the host.
    #[arg(long)]
    segment: String,

    /// Byte capacity of the segment's exchange buffer.
    #[arg(long, default_value_t = duelgate::DEFAULT_CAPACITY)]
    capacity: usize,
}

/// Rule engine stand-in. Handles are handed out sequentially; `process`
/// looks up one card and emits a log line so both callback paths get
/// exercised end to end.
struct StubEngine {
    next_handle: u64,
    live: Vec<u64>,
    responses: Vec<Vec<u8>>,
}

impl StubEngine {
    fn new() -> Self {
        Self {
            next_handle: 1,
            live: Vec::new(),
            responses: Vec::new(),
        }
    }
}

impl DuelEngine for StubEngine {
    fn version(&mut self) -> (i32, i32) {
        (10, 0)
    }

    fn create_duel(
        &mut self,
        options: &DuelOptions,
        host: &mut dyn EngineHost,
    ) -> duelgate::Result<(i32, DuelHandle)> {
        host.log(
            LogKind::Debug,
            &format!("creating duel with seed {}", options.seed),
        )?;
        let handle = self.next_handle;
        self.next_handle += 1;
        self.live.push(handle);
        Ok((DUEL_CREATION_SUCCESS, DuelHandle(handle)))
    }

    fn destroy_duel(&mut self, duel: DuelHandle) -> duelgate::Result<()> {
        self.live.retain(|h| *h != duel.0);
        Ok(())
    }

    fn add_card(
        &mut self,
        _duel: DuelHandle,
        card: &NewCardInfo,
        host: &mut dyn EngineHost,
    ) -> duelgate::Result<()> {
        let data = host.card_data(card.code)?;
        host.card_done(data)
    }

    fn start_duel(&mut self, _duel: DuelHandle, host: &mut dyn EngineHost) -> duelgate::Result<()> {
        let _ = host.script("constant.lua")?;
        Ok(())
    }

    fn process(&mut self, duel: DuelHandle, host: &mut dyn EngineHost) -> duelgate::Result<i32> {
        host.log(LogKind::Debug, &format!("processing duel {}", duel.0))?;
        Ok(0)
    }

    fn get_messages(&mut self, duel: DuelHandle) -> duelgate::Result<Vec<u8>> {
        Ok(duel.0.to_ne_bytes().to_vec())
    }

    fn set_response(&mut self, _duel: DuelHandle, response: &[u8]) -> duelgate::Result<()> {
        self.responses.push(response.to_vec());
        Ok(())
    }

    fn load_script(
        &mut self,
        _duel: DuelHandle,
        name: &str,
        _body: &str,
        host: &mut dyn EngineHost,
    ) -> duelgate::Result<i32> {
        host.log(LogKind::Script, &format!("loaded {name}"))?;
        Ok(0)
    }

    fn query_count(&mut self, _duel: DuelHandle, _team: u8, _location: u32) -> duelgate::Result<u32> {
        Ok(0)
    }

    fn query(&mut self, _duel: DuelHandle, info: &QueryInfo) -> duelgate::Result<Vec<u8>> {
        Ok(info.flags.to_ne_bytes().to_vec())
    }

    fn query_location(&mut self, _duel: DuelHandle, info: &QueryInfo) -> duelgate::Result<Vec<u8>> {
        Ok(info.location.to_ne_bytes().to_vec())
    }

    fn query_field(&mut self, _duel: DuelHandle) -> duelgate::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    tracing::info!(segment = %cli.segment, capacity = cli.capacity, "peer starting");

    let name = SegmentName::from_string(cli.segment.clone());
    let mut segment = PeerSegment::attach(&name, cli.capacity)
        .with_context(|| format!("attaching to segment {}", cli.segment))?;
    let mut engine = StubEngine::new();
    peer::serve(&mut segment, &mut engine).context("serve loop failed")?;

    Ok(())
}
