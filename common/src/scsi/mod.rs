//! SCSI MMC command engine (spec section 4.1).
//!
//! Decodes CDBs, dispatches to command handlers, produces response buffers
//! and status. Owned by the MSD layer, which drives the one asynchronous
//! suspension point (a READ) outside of this module.

pub mod cdb;
pub mod commands;
pub mod constants;
pub mod lu;
pub mod request;
pub mod sense;
pub mod target;

pub use lu::{LogicalUnit, LuIdentity, PowerCondition};
pub use request::{ReqState, ScsiRequest, XferDir};
pub use sense::{codes, ShortSense};
pub use target::{ScsiTarget, TargetState, MAX_LUNS};
