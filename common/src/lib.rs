//! Common types shared by the service shell and the SCSI/MSD/usbredir engine.

pub mod backing;
pub mod config;
pub mod config_storage;
pub mod msd;
pub mod registry;
pub mod scsi;
pub mod types;
pub mod usbredir;

pub use config::*;
pub use config_storage::*;
pub use types::*;
