//! The closed action set and the fixed-layout records each action carries.
//!
//! Exactly one action is active in a segment at any instant; which side
//! is expected to touch the byte window next is implied entirely by the
//! current action value.

use crate::error::{BridgeError, Result};
use crate::wire::{Reader, Writer};

/// Tag identifying which request or callback is currently active in a
/// shared segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Action {
    // Sentinels
    NoWork = 0,
    Heartbeat = 1,
    Exit = 2,

    // Requests (host → peer)
    GetVersion = 3,
    CreateDuel = 4,
    DestroyDuel = 5,
    AddCard = 6,
    StartDuel = 7,
    Process = 8,
    GetMessages = 9,
    SetResponse = 10,
    LoadScript = 11,
    QueryCount = 12,
    Query = 13,
    QueryLocation = 14,
    QueryField = 15,

    // Callbacks (peer → host, while a request is outstanding)
    ReadCard = 16,
    ReadScript = 17,
    HandleLog = 18,
    CardReadDone = 19,

    // Callback ack (host → peer)
    CallbackDone = 20,
}

impl Action {
    pub fn from_u32(v: u32) -> Option<Self> {
        use Action::*;
        Some(match v {
            0 => NoWork,
            1 => Heartbeat,
            2 => Exit,
            3 => GetVersion,
            4 => CreateDuel,
            5 => DestroyDuel,
            6 => AddCard,
            7 => StartDuel,
            8 => Process,
            9 => GetMessages,
            10 => SetResponse,
            11 => LoadScript,
            12 => QueryCount,
            13 => Query,
            14 => QueryLocation,
            15 => QueryField,
            16 => ReadCard,
            17 => ReadScript,
            18 => HandleLog,
            19 => CardReadDone,
            20 => CallbackDone,
            _ => return None,
        })
    }

    /// True for the peer-initiated callback family.
    pub fn is_callback(self) -> bool {
        matches!(
            self,
            Action::ReadCard | Action::ReadScript | Action::HandleLog | Action::CardReadDone
        )
    }

    /// True for the host-initiated request family (heartbeat included).
    pub fn is_request(self) -> bool {
        !self.is_callback() && !matches!(self, Action::NoWork | Action::Exit | Action::CallbackDone)
    }
}

/// Status the engine reports for a successful duel creation.
pub const DUEL_CREATION_SUCCESS: i32 = 0;

/// Opaque peer-side identifier for one duel instance. Never dereferenced
/// by the host, only round-tripped as a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DuelHandle(pub u64);

/// Severity/category tag carried by the log callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Error,
    Script,
    Debug,
    Undefined,
}

impl LogKind {
    pub fn from_i32(v: i32) -> Self {
        match v {
            0 => LogKind::Error,
            1 => LogKind::Script,
            2 => LogKind::Debug,
            _ => LogKind::Undefined,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            LogKind::Error => 0,
            LogKind::Script => 1,
            LogKind::Debug => 2,
            LogKind::Undefined => 3,
        }
    }
}

/// Per-team starting configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TeamConfig {
    pub starting_lp: u32,
    pub starting_draw_count: u32,
    pub draw_count_per_turn: u32,
}

impl TeamConfig {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_u32(self.starting_lp)?;
        w.write_u32(self.starting_draw_count)?;
        w.write_u32(self.draw_count_per_turn)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            starting_lp: r.read_u32()?,
            starting_draw_count: r.read_u32()?,
            draw_count_per_turn: r.read_u32()?,
        })
    }
}

/// Options for a new duel, passed by value and encoded wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DuelOptions {
    pub seed: u64,
    pub flags: u64,
    pub team1: TeamConfig,
    pub team2: TeamConfig,
}

impl DuelOptions {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_u64(self.seed)?;
        w.write_u64(self.flags)?;
        self.team1.encode(w)?;
        self.team2.encode(w)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            seed: r.read_u64()?,
            flags: r.read_u64()?,
            team1: TeamConfig::decode(r)?,
            team2: TeamConfig::decode(r)?,
        })
    }
}

/// Placement of one card added to a duel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NewCardInfo {
    pub team: u8,
    pub duelist: u8,
    pub code: u32,
    pub controller: u8,
    pub location: u32,
    pub sequence: u32,
    pub position: u32,
}

impl NewCardInfo {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_u8(self.team)?;
        w.write_u8(self.duelist)?;
        w.write_u32(self.code)?;
        w.write_u8(self.controller)?;
        w.write_u32(self.location)?;
        w.write_u32(self.sequence)?;
        w.write_u32(self.position)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            team: r.read_u8()?,
            duelist: r.read_u8()?,
            code: r.read_u32()?,
            controller: r.read_u8()?,
            location: r.read_u32()?,
            sequence: r.read_u32()?,
            position: r.read_u32()?,
        })
    }
}

/// Selector for a field/location query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryInfo {
    pub flags: u32,
    pub controller: u8,
    pub location: u32,
    pub sequence: u32,
    pub overlay_sequence: u32,
}

impl QueryInfo {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_u32(self.flags)?;
        w.write_u8(self.controller)?;
        w.write_u32(self.location)?;
        w.write_u32(self.sequence)?;
        w.write_u32(self.overlay_sequence)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            flags: r.read_u32()?,
            controller: r.read_u8()?,
            location: r.read_u32()?,
            sequence: r.read_u32()?,
            overlay_sequence: r.read_u32()?,
        })
    }
}

/// Static card data produced by the host's data supplier in response to
/// the read-card callback. The setcode list travels after the fixed
/// record as a zero-terminated sequence of `u16`s.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CardData {
    pub code: u32,
    pub alias: u32,
    pub card_type: u32,
    pub level: u32,
    pub attribute: u32,
    pub race: u64,
    pub attack: i32,
    pub defense: i32,
    pub lscale: u32,
    pub rscale: u32,
    pub link_marker: u32,
    pub setcodes: Vec<u16>,
}

impl CardData {
    /// Fixed record followed by the zero-terminated setcode list.
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_u32(self.code)?;
        w.write_u32(self.alias)?;
        w.write_u32(self.card_type)?;
        w.write_u32(self.level)?;
        w.write_u32(self.attribute)?;
        w.write_u64(self.race)?;
        w.write_i32(self.attack)?;
        w.write_i32(self.defense)?;
        w.write_u32(self.lscale)?;
        w.write_u32(self.rscale)?;
        w.write_u32(self.link_marker)?;
        for code in &self.setcodes {
            if *code == 0 {
                return Err(BridgeError::Wire(
                    "setcode 0 is reserved as the list terminator".into(),
                ));
            }
            w.write_u16(*code)?;
        }
        w.write_u16(0)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let mut data = Self {
            code: r.read_u32()?,
            alias: r.read_u32()?,
            card_type: r.read_u32()?,
            level: r.read_u32()?,
            attribute: r.read_u32()?,
            race: r.read_u64()?,
            attack: r.read_i32()?,
            defense: r.read_i32()?,
            lscale: r.read_u32()?,
            rscale: r.read_u32()?,
            link_marker: r.read_u32()?,
            setcodes: Vec::new(),
        };
        loop {
            let code = r.read_u16()?;
            if code == 0 {
                break;
            }
            data.setcodes.push(code);
        }
        Ok(data)
    }
}
