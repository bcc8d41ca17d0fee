//! usbredir wire packet framing (spec section 4.3, "[ADDED] Wire packet
//! framing"): a fixed 12-byte header followed by `length` bytes of
//! type-specific payload, all fields little-endian.

use crate::types::CdEmuError;

pub const HEADER_LEN: usize = 12;

/// Packet types this bridge understands. Numeric values match the
/// upstream usbredir protocol's base (32-bit id) packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PacketType {
    Hello,
    DeviceConnect,
    DeviceDisconnect,
    Reset,
    InterfaceInfo,
    EpInfo,
    CancelDataPacket,
    FilterReject,
    FilterFilter,
    DeviceDisconnectAck,
    ControlPacket,
    BulkPacket,
    /// Any packet type this bridge does not implement; read (length-
    /// prefixed) and ignored, logged at `debug` (spec section 4.3).
    Unknown(u32),
}

impl PacketType {
    pub fn from_wire(value: u32) -> Self {
        match value {
            0 => PacketType::Hello,
            1 => PacketType::DeviceConnect,
            2 => PacketType::DeviceDisconnect,
            3 => PacketType::Reset,
            4 => PacketType::InterfaceInfo,
            5 => PacketType::EpInfo,
            21 => PacketType::CancelDataPacket,
            22 => PacketType::FilterReject,
            23 => PacketType::FilterFilter,
            24 => PacketType::DeviceDisconnectAck,
            100 => PacketType::ControlPacket,
            101 => PacketType::BulkPacket,
            other => PacketType::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            PacketType::Hello => 0,
            PacketType::DeviceConnect => 1,
            PacketType::DeviceDisconnect => 2,
            PacketType::Reset => 3,
            PacketType::InterfaceInfo => 4,
            PacketType::EpInfo => 5,
            PacketType::CancelDataPacket => 21,
            PacketType::FilterReject => 22,
            PacketType::FilterFilter => 23,
            PacketType::DeviceDisconnectAck => 24,
            PacketType::ControlPacket => 100,
            PacketType::BulkPacket => 101,
            PacketType::Unknown(v) => v,
        }
    }
}

/// The 12-byte packet header common to every usbredir packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub length: u32,
    pub id: u32,
}

impl PacketHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, CdEmuError> {
        if bytes.len() != HEADER_LEN {
            return Err(CdEmuError::ProtocolFraming(format!(
                "packet header length {} != {HEADER_LEN}",
                bytes.len()
            )));
        }
        let packet_type = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let length = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let id = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        Ok(Self {
            packet_type: PacketType::from_wire(packet_type),
            length,
            id,
        })
    }

    pub fn build(packet_type: PacketType, length: u32, id: u32) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&packet_type.to_wire().to_le_bytes());
        out[4..8].copy_from_slice(&length.to_le_bytes());
        out[8..12].copy_from_slice(&id.to_le_bytes());
        out
    }
}

/// Frame a complete outgoing packet: header plus payload.
pub fn frame(packet_type: PacketType, id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&PacketHeader::build(packet_type, payload.len() as u32, id));
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let bytes = PacketHeader::build(PacketType::BulkPacket, 64, 7);
        let header = PacketHeader::parse(&bytes).unwrap();
        assert_eq!(header.packet_type, PacketType::BulkPacket);
        assert_eq!(header.length, 64);
        assert_eq!(header.id, 7);
    }

    #[test]
    fn unknown_type_preserves_numeric_value() {
        let header = PacketHeader::parse(&PacketHeader::build(PacketType::Unknown(9999), 0, 0)).unwrap();
        assert_eq!(header.packet_type, PacketType::Unknown(9999));
    }
}
