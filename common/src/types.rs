//! Common types used throughout the emulated CD-ROM engine.

use thiserror::Error;

/// Errors that can occur setting up or running the emulated device.
///
/// SCSI-level failures are deliberately not represented here: a rejected
/// CDB is encoded as a sense code and a CSW status, never as a `Result::Err`
/// (see `scsi::sense`). This enum is for failures a caller must observe —
/// opening a backing file, binding a socket, parsing configuration.
#[derive(Debug, Error)]
pub enum CdEmuError {
    #[error("backing file error: {0}")]
    BackingFile(String),

    #[error("usbredir protocol framing error: {0}")]
    ProtocolFraming(String),

    #[error("logical unit {0} is not realized")]
    LunNotRealized(u32),

    #[error("logical unit {0} is out of range (max {1})")]
    LunOutOfRange(u32, u32),

    #[error("no free synthetic bus address")]
    NoFreeAddress,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] crate::config_storage::ConfigError),
}
