//! usbredir device-side parser bridge (spec section 4.3): presents the
//! emulated composite device over the usbredir wire protocol, answers
//! standard/class control requests, and routes bulk packets into the MSD
//! layer.

pub mod channel;
pub mod descriptors;
pub mod packet;

pub use channel::UsbRedirChannel;
pub use packet::{PacketHeader, PacketType, HEADER_LEN};
