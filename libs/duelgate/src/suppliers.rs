//! Host-side collaborators invoked synchronously from inside the
//! dispatcher while a request is outstanding.

use std::sync::Arc;

use crate::protocol::{CardData, LogKind};

/// Supplies static card data to the engine.
pub trait DataSupplier: Send + Sync {
    fn data_from_code(&self, code: u32) -> CardData;

    /// Release hook, called once the engine is done with a previously
    /// returned record.
    fn data_done(&self, data: CardData);
}

/// Supplies card scripts to the engine by path.
pub trait ScriptSupplier: Send + Sync {
    /// `None` means "not found" and travels as an empty script.
    fn script_from_path(&self, path: &str) -> Option<String>;
}

/// Receives engine log lines. Absent logger means silent discard.
pub trait DuelLogger: Send + Sync {
    fn log(&self, kind: LogKind, message: &str);
}

/// The collaborators chosen by the caller at duel-creation time.
#[derive(Clone)]
pub struct CollaboratorSet {
    pub data: Arc<dyn DataSupplier>,
    pub script: Arc<dyn ScriptSupplier>,
    pub logger: Option<Arc<dyn DuelLogger>>,
}

impl CollaboratorSet {
    pub fn new(data: Arc<dyn DataSupplier>, script: Arc<dyn ScriptSupplier>) -> Self {
        Self {
            data,
            script,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn DuelLogger>) -> Self {
        self.logger = Some(logger);
        self
    }
}
