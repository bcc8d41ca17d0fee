//! The per-peer usbredir channel (spec section 3, "USB Redir Channel";
//! section 4.3). Owns the attached emulated device for this connection,
//! answers descriptor/class control requests, and routes bulk packets into
//! the MSD Bulk-Only Transport state machine.

use std::collections::VecDeque;

use tracing::{debug, warn};

use super::descriptors;
use super::packet::{frame, PacketType};
use crate::msd::MsdEvent;
use crate::registry::{EventSink, Registry};

/// Capabilities this bridge declares in its `hello` packet (spec section
/// 4.3). usbredir negotiates capabilities as a bitmask the receiver can
/// grow over time; bit positions below are local to this implementation.
pub mod capability {
    pub const CONNECT_DEVICE_VERSION: u32 = 1 << 0;
    pub const FILTER: u32 = 1 << 1;
    pub const DEVICE_DISCONNECT_ACK: u32 = 1 << 2;
    pub const EP_INFO_MAX_PACKET_SIZE: u32 = 1 << 3;
    pub const BITS_64_IDS: u32 = 1 << 4;
    pub const BITS_32_BULK_LENGTH: u32 = 1 << 5;
    pub const BULK_RECEIVING: u32 = 1 << 6;
    pub const BULK_STREAMS: u32 = 1 << 7;

    pub const ALL: u32 = CONNECT_DEVICE_VERSION
        | FILTER
        | DEVICE_DISCONNECT_ACK
        | EP_INFO_MAX_PACKET_SIZE
        | BITS_64_IDS
        | BITS_32_BULK_LENGTH
        | BULK_RECEIVING
        | BULK_STREAMS;
}

/// Request-type byte layout for the control requests this bridge answers
/// (spec section 4.3).
mod control {
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const RECIPIENT_MASK: u8 = 0x1F;
    pub const RECIPIENT_DEVICE: u8 = 0x00;
    pub const RECIPIENT_INTERFACE: u8 = 0x01;
    pub const RECIPIENT_ENDPOINT: u8 = 0x02;
    pub const TYPE_MASK: u8 = 0x60;
    pub const TYPE_STANDARD: u8 = 0x00;
    pub const TYPE_CLASS: u8 = 0x20;
    pub const MSC_RESET: u8 = 0xFF;
    pub const MSC_GET_MAX_LUN: u8 = 0xFE;
}

/// Result of a control request (spec section 4.3): success carries the
/// response bytes (possibly empty), stall carries nothing.
pub enum ControlResult {
    Success(Vec<u8>),
    Stall,
}

/// Upper bound on pending bulk-IN entries per device (spec section 5,
/// "Backpressure"); beyond this the adapter responds `babble`.
const BULK_IN_RING_CAP: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Initializing,
    Host,
    Parser,
}

/// One pending bulk-IN request awaiting SCSI completion (spec section 3).
struct PendingBulkIn {
    id: u32,
}

/// Per-peer usbredir channel state. Owns at most one attached emulated
/// device address from the `Registry` for the channel's lifetime.
pub struct UsbRedirChannel {
    pub state: ChannelState,
    pub attached: Option<u8>,
    peer_capabilities: u32,
    bulk_in_ring: VecDeque<PendingBulkIn>,
    /// The event produced by submitting a CBW or the final DATAOUT chunk,
    /// held back until the host actually issues the bulk-IN (EP `0x81`)
    /// request it belongs to (spec section 4.3, "Bulk routing": the CSW and
    /// any DATAIN are always a reply to an IN token, never to the OUT
    /// packet that triggered them).
    pending_cbw_event: Option<MsdEvent>,
    pub disconnect_ack_pending: bool,
    pub rejected: bool,
}

impl Default for UsbRedirChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbRedirChannel {
    pub fn new() -> Self {
        Self {
            state: ChannelState::Initializing,
            attached: None,
            peer_capabilities: 0,
            bulk_in_ring: VecDeque::new(),
            pending_cbw_event: None,
            disconnect_ack_pending: false,
            rejected: false,
        }
    }

    /// Build this bridge's own `hello` packet payload: a 64-byte version
    /// string followed by the capability bitmask (spec section 4.3).
    pub fn hello_payload(version: &str) -> Vec<u8> {
        let mut payload = vec![0u8; 64];
        let bytes = version.as_bytes();
        let n = bytes.len().min(63);
        payload[..n].copy_from_slice(&bytes[..n]);
        payload.extend_from_slice(&capability::ALL.to_le_bytes());
        payload
    }

    /// Parse a peer `hello` payload far enough to learn its capability
    /// bitmask (the version string itself is informational only).
    pub fn accept_hello(&mut self, payload: &[u8]) {
        if payload.len() >= 68 {
            self.peer_capabilities = u32::from_le_bytes(payload[64..68].try_into().unwrap());
        }
        self.state = ChannelState::Host;
        debug!(capabilities = self.peer_capabilities, "usbredir hello received");
    }

    fn peer_has(&self, cap: u32) -> bool {
        self.peer_capabilities & cap != 0
    }

    /// Attach an emulated device to this channel and emit the
    /// `interface_info`/`ep_info`/`device_connect` sequence (spec section
    /// 4.3, "Hello/capabilities").
    pub fn attach(&mut self, address: u8, id: u32) -> Vec<u8> {
        self.attached = Some(address);
        self.state = ChannelState::Parser;

        let mut out = Vec::new();
        out.extend_from_slice(&frame(PacketType::InterfaceInfo, id, &interface_info_payload()));
        out.extend_from_slice(&frame(PacketType::EpInfo, id, &ep_info_payload()));
        out.extend_from_slice(&frame(PacketType::DeviceConnect, id, &device_connect_payload()));
        out
    }

    /// `device_disconnect` handling: detach, and if the peer declared
    /// `device_disconnect_ack`, wait for its ack before returning to
    /// `Host` (spec section 5, "Cancellation semantics").
    pub fn detach(&mut self) {
        self.attached = None;
        self.bulk_in_ring.clear();
        if self.peer_has(capability::DEVICE_DISCONNECT_ACK) {
            self.disconnect_ack_pending = true;
        } else {
            self.state = ChannelState::Host;
        }
    }

    pub fn acknowledge_disconnect(&mut self) {
        self.disconnect_ack_pending = false;
        self.state = ChannelState::Host;
    }

    /// Answer a control request (spec section 4.3). `request_type`,
    /// `request`, `value`, `index` follow the standard USB control
    /// transfer header fields.
    pub fn handle_control(
        &mut self,
        registry: &mut Registry,
        request_type: u8,
        request: u8,
        value: u16,
        _index: u16,
        length: u16,
    ) -> ControlResult {
        let recipient = request_type & control::RECIPIENT_MASK;
        let req_class = request_type & control::TYPE_MASK;

        if req_class == control::TYPE_STANDARD
            && recipient == control::RECIPIENT_DEVICE
            && request == control::GET_DESCRIPTOR
        {
            let serial = self
                .attached
                .and_then(|address| registry.get(address))
                .map(|device| device.serial_descriptor())
                .unwrap_or("");
            return self.get_descriptor(value, length, serial);
        }

        if req_class == control::TYPE_STANDARD
            && recipient == control::RECIPIENT_ENDPOINT
            && request == control::CLEAR_FEATURE
        {
            return ControlResult::Success(Vec::new());
        }

        if req_class == control::TYPE_CLASS && recipient == control::RECIPIENT_INTERFACE {
            let Some(address) = self.attached else {
                return ControlResult::Stall;
            };
            let Some(device) = registry.get_mut(address) else {
                return ControlResult::Stall;
            };
            match request {
                control::MSC_RESET => {
                    device.msd.target_reset();
                    return ControlResult::Success(Vec::new());
                }
                control::MSC_GET_MAX_LUN => {
                    let max_lun = (device.msd.num_luns().max(1) - 1) as u8;
                    return ControlResult::Success(vec![max_lun]);
                }
                _ => {}
            }
        }

        ControlResult::Stall
    }

    fn get_descriptor(&self, value: u16, length: u16, serial: &str) -> ControlResult {
        let descriptor_type = (value >> 8) as u8;
        let index = (value & 0xFF) as u8;
        let bytes = match descriptor_type {
            0x01 => descriptors::device_descriptor().to_vec(),
            0x02 => descriptors::configuration_descriptor().to_vec(),
            0x03 => string_descriptor_for_index(index, serial),
            _ => return ControlResult::Stall,
        };
        let n = (length as usize).min(bytes.len());
        ControlResult::Success(bytes[..n].to_vec())
    }

    /// Feed an OUT bulk packet (endpoint `0x02`) into the MSD layer: a CBW
    /// if the device is idle, DATAOUT bytes otherwise (spec section 4.3,
    /// "Bulk routing"). The resulting event (a data-in chunk, a CSW, or a
    /// pending read) is never framed as a reply to this OUT packet's `id`
    /// — it is held in `pending_cbw_event` until the host's own subsequent
    /// bulk-IN request arrives, and this OUT packet just gets acked as
    /// received.
    pub async fn handle_bulk_out(
        &mut self,
        registry: &mut Registry,
        id: u32,
        bytes: &[u8],
    ) -> Option<Vec<u8>> {
        let address = self.attached?;
        let device = registry.get_mut(address)?;
        let event = match device.msd.state {
            crate::msd::MsdState::DataOut => device.msd.on_data_out(bytes),
            _ => device.msd.on_cbw(bytes),
        };
        self.pending_cbw_event = match event {
            MsdEvent::NeedDataOut => None,
            other => Some(other),
        };
        registry.reap_pending_deletes();
        Some(frame(PacketType::BulkPacket, id, &bulk_status_payload(Status::Success, &[])))
    }

    /// Register a pending bulk-IN request (endpoint `0x81`) and, once the
    /// device has data or a CSW ready, answer it (spec section 4.3, "Bulk
    /// routing"; section 5, "Backpressure"). Delivers a `pending_cbw_event`
    /// left over from the CBW/DATAOUT submission that triggered it, if any,
    /// otherwise polls the device for the next chunk of an in-progress
    /// DATAIN transfer.
    pub async fn handle_bulk_in(
        &mut self,
        registry: &mut Registry,
        id: u32,
        max_len: u32,
    ) -> Vec<u8> {
        if self.bulk_in_ring.len() >= BULK_IN_RING_CAP {
            warn!(id, "bulk-IN ring full, responding babble");
            return frame(PacketType::BulkPacket, id, &bulk_status_payload(Status::Babble, &[]));
        }
        self.bulk_in_ring.push_back(PendingBulkIn { id });

        let Some(address) = self.attached else {
            return Vec::new();
        };
        let event = match self.pending_cbw_event.take() {
            Some(event) => event,
            None => {
                let Some(device) = registry.get_mut(address) else {
                    return Vec::new();
                };
                device.msd.poll_bulk_in(max_len)
            }
        };
        let out = self.drive_event(registry, address, event, id).await;
        registry.reap_pending_deletes();
        out
    }

    /// `cancel_data_packet`: cancel the in-flight SCSI read and answer the
    /// oldest pending bulk-IN with `cancelled`/zero length (spec section
    /// 4.3, "Cancellation"; section 5).
    pub fn cancel_data_packet(&mut self, registry: &mut Registry, id: u32) -> Vec<u8> {
        if let Some(pos) = self.bulk_in_ring.iter().position(|p| p.id == id) {
            self.bulk_in_ring.remove(pos);
        }
        if let Some(address) = self.attached {
            if let Some(device) = registry.get_mut(address) {
                device.msd.cancel_read();
            }
        }
        frame(PacketType::BulkPacket, id, &bulk_status_payload(Status::Cancelled, &[]))
    }

    /// Drive one MSD event to completion, recursing through chained
    /// bulk-IN chunks and spawned-read completions, producing the bytes to
    /// write back to the peer.
    async fn drive_event(
        &mut self,
        registry: &mut Registry,
        address: u8,
        mut event: MsdEvent,
        id: u32,
    ) -> Vec<u8> {
        loop {
            match event {
                MsdEvent::NeedDataOut => return Vec::new(),
                MsdEvent::DataIn(data) => {
                    return frame(PacketType::BulkPacket, id, &bulk_status_payload(Status::Success, &data));
                }
                MsdEvent::ZeroDataIn => {
                    return frame(PacketType::BulkPacket, id, &bulk_status_payload(Status::Success, &[]));
                }
                MsdEvent::Csw(csw) => {
                    self.bulk_in_ring.pop_front();
                    return frame(PacketType::BulkPacket, id, &bulk_status_payload(Status::Success, &csw));
                }
                MsdEvent::ReadPending => {
                    let Some(device) = registry.get_mut(address) else {
                        return Vec::new();
                    };
                    event = device.msd.wait_for_read().await;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Status {
    Success,
    Cancelled,
    Babble,
}

fn bulk_status_payload(status: Status, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + data.len());
    let code: u32 = match status {
        Status::Success => 0,
        Status::Cancelled => 1,
        Status::Babble => 5,
    };
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(data);
    out
}

fn string_descriptor_for_index(index: u8, serial: &str) -> Vec<u8> {
    match index {
        0 => descriptors::language_descriptor(),
        descriptors::STRING_INDEX_MANUFACTURER => descriptors::string_descriptor("Red Hat"),
        descriptors::STRING_INDEX_PRODUCT => descriptors::string_descriptor("SPICE CD"),
        descriptors::STRING_INDEX_SERIAL => descriptors::string_descriptor(serial),
        _ => Vec::new(),
    }
}

fn interface_info_payload() -> Vec<u8> {
    vec![
        1, // interface_count
        descriptors::INTERFACE_CLASS_MASS_STORAGE,
        descriptors::INTERFACE_SUBCLASS_SCSI,
        descriptors::INTERFACE_PROTOCOL_BULK_ONLY,
    ]
}

fn ep_info_payload() -> Vec<u8> {
    let mut out = Vec::new();
    out.push(descriptors::ENDPOINT_BULK_IN);
    out.extend_from_slice(&descriptors::ENDPOINT_MAX_PACKET_SIZE.to_le_bytes());
    out.push(descriptors::ENDPOINT_BULK_OUT);
    out.extend_from_slice(&descriptors::ENDPOINT_MAX_PACKET_SIZE.to_le_bytes());
    out
}

/// `speed=3` (USB 2.0 high speed, per spec section 4.3) followed by class
/// triple and VID/PID.
fn device_connect_payload() -> Vec<u8> {
    let mut out = Vec::new();
    out.push(3); // speed: high
    out.push(0); // device class
    out.push(0); // device subclass
    out.push(0); // device protocol
    out.extend_from_slice(&descriptors::VENDOR_ID.to_le_bytes());
    out.extend_from_slice(&descriptors::PRODUCT_ID.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct NullSink;
    impl EventSink for NullSink {
        fn hotplug(&self, _added: bool, _device: &crate::registry::EmulatedDevice) {}
        fn device_change(&self, _device: &crate::registry::EmulatedDevice) {}
    }

    #[test]
    fn hello_payload_carries_declared_capabilities() {
        let payload = UsbRedirChannel::hello_payload("cdredir 0.1");
        let caps = u32::from_le_bytes(payload[64..68].try_into().unwrap());
        assert_eq!(caps, capability::ALL);
    }

    #[tokio::test]
    async fn get_max_lun_reports_zero_for_single_lun_device() {
        let mut registry = Registry::new(BusConfig::default());
        let sink = NullSink;
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; 4096]).unwrap();
        let cfg = crate::config::LunConfig {
            path: f.path().to_path_buf(),
            ..crate::config::LunConfig::default()
        };
        let address = registry.create_emulated_cd(&cfg, &sink).await.unwrap();

        let mut channel = UsbRedirChannel::new();
        channel.attached = Some(address);
        let result = channel.handle_control(&mut registry, 0xA1, control::MSC_GET_MAX_LUN, 0, 0, 1);
        match result {
            ControlResult::Success(bytes) => assert_eq!(bytes, vec![0]),
            ControlResult::Stall => panic!("expected success"),
        }
    }

    #[test]
    fn unsupported_control_request_stalls() {
        let mut registry = Registry::new(BusConfig::default());
        let mut channel = UsbRedirChannel::new();
        let result = channel.handle_control(&mut registry, 0x40, 0x99, 0, 0, 0);
        assert!(matches!(result, ControlResult::Stall));
    }

    #[tokio::test]
    async fn csw_answers_the_real_bulk_in_id_not_the_cbws_out_id() {
        let mut registry = Registry::new(BusConfig::default());
        let sink = NullSink;
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; 4096]).unwrap();
        let cfg = crate::config::LunConfig {
            path: f.path().to_path_buf(),
            ..crate::config::LunConfig::default()
        };
        let address = registry.create_emulated_cd(&cfg, &sink).await.unwrap();

        let mut channel = UsbRedirChannel::new();
        channel.attached = Some(address);

        let mut cbw = vec![0u8; crate::msd::CBW_LEN];
        cbw[0..4].copy_from_slice(&0x4342_5355u32.to_le_bytes());
        cbw[4..8].copy_from_slice(&7u32.to_le_bytes());
        cbw[14] = 6;
        cbw[15] = 0x00; // TEST_UNIT_READY, no data phase

        let out_reply = channel.handle_bulk_out(&mut registry, 111, &cbw).await.unwrap();
        let out_header = super::packet::PacketHeader::parse(&out_reply[..super::packet::HEADER_LEN]).unwrap();
        assert_eq!(out_header.id, 111);
        assert_eq!(&out_reply[super::packet::HEADER_LEN..], &0u32.to_le_bytes());

        let in_reply = channel.handle_bulk_in(&mut registry, 222, 64).await;
        let in_header = super::packet::PacketHeader::parse(&in_reply[..super::packet::HEADER_LEN]).unwrap();
        assert_eq!(in_header.id, 222);
        assert_eq!(in_header.packet_type, PacketType::BulkPacket);
    }
}
