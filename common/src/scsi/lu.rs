//! SCSI Logical Unit state (spec section 3).

use crate::backing::BackingStream;
use super::sense::ShortSense;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Power condition of a logical unit (spec section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCondition {
    Stopped,
    Active,
    Idle,
    Standby,
}

/// Identity strings reported in INQUIRY responses.
#[derive(Debug, Clone)]
pub struct LuIdentity {
    pub vendor: String,
    pub product: String,
    pub version: String,
    pub serial: String,
}

/// One logical unit: geometry, power/media flags, sense, and (if loaded)
/// its backing stream.
pub struct LogicalUnit {
    pub lun: u32,
    pub realized: bool,
    pub loaded: bool,
    pub removable: bool,
    pub prevent_media_removal: bool,
    pub cd_rom: bool,
    pub power: PowerCondition,
    pub identity: LuIdentity,
    pub sense: ShortSense,
    /// Controls standard INQUIRY response length (96 bytes when true, 57
    /// when false -- spec section 8's length property). Defaults to true;
    /// exposed mainly for interoperability testing against older hosts.
    pub claim_version: bool,
    /// Cached copies of the stream's geometry, so synchronous command
    /// handlers (READ_CAPACITY, mode pages, ...) don't need to lock the
    /// stream's async mutex.
    block_size_cache: u64,
    size_cache: u64,
    /// Wrapped in an async mutex (not for contention, since a LU is
    /// exclusively owned while loaded and at most one SCSI request is ever
    /// in flight, but so the backing read can be driven from a spawned,
    /// cancellable `tokio::task` independent of the LU's owner).
    pub stream: Option<Arc<AsyncMutex<BackingStream>>>,
}

impl LogicalUnit {
    pub fn unrealized(lun: u32) -> Self {
        Self {
            lun,
            realized: false,
            loaded: false,
            removable: true,
            prevent_media_removal: false,
            cd_rom: true,
            power: PowerCondition::Stopped,
            identity: LuIdentity {
                vendor: String::new(),
                product: String::new(),
                version: String::new(),
                serial: String::new(),
            },
            sense: ShortSense::NO_SENSE,
            claim_version: true,
            block_size_cache: 0,
            size_cache: 0,
            stream: None,
        }
    }

    /// Realize the unit: sets it ACTIVE, clears media state, and raises a
    /// power-on Unit Attention (spec section 4.1, target reset semantics
    /// also used at realize time per the reference implementation).
    pub fn realize(&mut self, identity: LuIdentity, cd_rom: bool) {
        self.realized = true;
        self.loaded = false;
        self.prevent_media_removal = false;
        self.cd_rom = cd_rom;
        self.power = PowerCondition::Active;
        self.identity = identity;
        self.stream = None;
        self.sense = super::sense::codes::RESET;
    }

    pub fn unrealize(&mut self) {
        self.realized = false;
        self.loaded = false;
        self.power = PowerCondition::Stopped;
        self.stream = None;
    }

    pub fn load(&mut self, stream: BackingStream) {
        self.block_size_cache = stream.block_size;
        self.size_cache = stream.size;
        self.stream = Some(Arc::new(AsyncMutex::new(stream)));
        self.loaded = true;
    }

    pub fn unload(&mut self) {
        self.stream = None;
        self.loaded = false;
        self.block_size_cache = 0;
        self.size_cache = 0;
    }

    pub fn block_size(&self) -> u64 {
        self.block_size_cache
    }

    pub fn num_blocks(&self) -> u64 {
        if self.block_size_cache == 0 {
            0
        } else {
            self.size_cache / self.block_size_cache
        }
    }

    pub fn size(&self) -> u64 {
        self.size_cache
    }

    /// Reset sense and power-affecting flags without disturbing media
    /// (spec section 4.1, "Target reset": `prevent_media_removal=false`,
    /// `sense <- RESET`, power unchanged).
    pub fn reset(&mut self) {
        self.prevent_media_removal = false;
        self.sense = super::sense::codes::RESET;
    }
}
