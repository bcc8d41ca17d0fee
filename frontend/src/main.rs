//! cdredir service shell (spec section 6, "Configuration file" / "Logging").
//!
//! Loads `ServiceConfig`, realizes the configured LUNs in an in-process
//! `Registry`, and listens for a usbredir peer. The real deployment carries
//! usbredir packets over a spice-server channel (out of scope here, spec
//! section 1); a plain TCP listener stands in for it so the binary is
//! self-contained end to end.

use std::sync::Arc;

use anyhow::{Context, Result};
use cdredir_common::config_storage::load_config;
use cdredir_common::registry::{EmulatedDevice, EventSink, Registry};
use cdredir_common::usbredir::packet::{frame, PacketHeader, PacketType, HEADER_LEN};
use cdredir_common::usbredir::UsbRedirChannel;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const HELLO_VERSION: &str = concat!("cdredir ", env!("CARGO_PKG_VERSION"));

/// Routes hotplug/device-change events to `tracing` (spec section 6,
/// "Events out"); the structured data lives in the log fields, not the
/// message text.
struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn hotplug(&self, added: bool, device: &EmulatedDevice) {
        info!(
            address = device.address,
            bus = device.bus_number,
            serial = device.serial_descriptor(),
            added,
            "hotplug event"
        );
    }

    fn device_change(&self, device: &EmulatedDevice) {
        info!(address = device.address, "device change event");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config().context("loading service configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log.filter.clone()))
        .init();

    let sink = TracingEventSink;
    let mut registry = Registry::new(config.bus.clone());
    for lun in &config.luns {
        let address = registry
            .create_emulated_cd(lun, &sink)
            .await
            .with_context(|| format!("realizing LUN {}", lun.lun))?;
        info!(address, lun = lun.lun, path = %lun.path.display(), "LUN realized");
    }
    let registry = Arc::new(Mutex::new(registry));

    let listener = TcpListener::bind(&config.listen.address)
        .await
        .with_context(|| format!("binding usbredir listener on {}", config.listen.address))?;
    info!(address = %config.listen.address, "listening for usbredir peer");

    loop {
        let (socket, peer) = listener.accept().await?;
        info!(%peer, "usbredir peer connected");
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(socket, registry).await {
                warn!(%peer, error = %err, "usbredir connection ended");
            }
        });
    }
}

/// Drive one usbredir peer connection until it disconnects or the stream
/// errors (spec section 4.3; section 5 "one task per connected peer").
async fn handle_connection(mut socket: TcpStream, registry: Arc<Mutex<Registry>>) -> Result<()> {
    let mut channel = UsbRedirChannel::new();

    let hello = frame(PacketType::Hello, 0, &UsbRedirChannel::hello_payload(HELLO_VERSION));
    socket.write_all(&hello).await?;

    let mut header_buf = [0u8; HEADER_LEN];
    loop {
        if socket.read_exact(&mut header_buf).await.is_err() {
            break;
        }
        let header = PacketHeader::parse(&header_buf)?;
        let mut payload = vec![0u8; header.length as usize];
        socket.read_exact(&mut payload).await?;

        let response = dispatch(&mut channel, &registry, header.packet_type, header.id, &payload).await;
        if let Some(bytes) = response {
            if !bytes.is_empty() {
                socket.write_all(&bytes).await?;
            }
        }

        if channel.rejected {
            break;
        }
    }

    if let Some(address) = channel.attached.take() {
        let mut registry = registry.lock().await;
        registry.eject(address, &TracingEventSink);
    }
    Ok(())
}

/// The control-request header this bridge puts at the front of a
/// `control_packet` payload: `request_type, request, value(LE16),
/// index(LE16), length(LE16)`, followed by `length` bytes of OUT data when
/// the host-to-device direction bit of `request_type` is clear.
struct ControlHeader {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
}

const CONTROL_HEADER_LEN: usize = 8;
const DIR_DEVICE_TO_HOST: u8 = 0x80;

fn parse_control_header(payload: &[u8]) -> Option<ControlHeader> {
    if payload.len() < CONTROL_HEADER_LEN {
        return None;
    }
    Some(ControlHeader {
        request_type: payload[0],
        request: payload[1],
        value: u16::from_le_bytes(payload[2..4].try_into().unwrap()),
        index: u16::from_le_bytes(payload[4..6].try_into().unwrap()),
        length: u16::from_le_bytes(payload[6..8].try_into().unwrap()),
    })
}

/// One bulk packet payload: `endpoint` followed either by OUT data (bulk-OUT)
/// or a little-endian requested length (bulk-IN).
fn bulk_endpoint(payload: &[u8]) -> Option<u8> {
    payload.first().copied()
}

async fn dispatch(
    channel: &mut UsbRedirChannel,
    registry: &Arc<Mutex<Registry>>,
    packet_type: PacketType,
    id: u32,
    payload: &[u8],
) -> Option<Vec<u8>> {
    match packet_type {
        PacketType::Hello => {
            channel.accept_hello(payload);
            let registry = registry.lock().await;
            let address = *registry.addresses().first()?;
            Some(channel.attach(address, id))
        }
        PacketType::DeviceDisconnect => {
            channel.detach();
            None
        }
        PacketType::DeviceDisconnectAck => {
            channel.acknowledge_disconnect();
            None
        }
        PacketType::Reset => {
            let address = channel.attached?;
            let mut registry = registry.lock().await;
            if let Some(device) = registry.get_mut(address) {
                device.msd.device_reset();
            }
            None
        }
        PacketType::ControlPacket => {
            let header = parse_control_header(payload)?;
            let mut registry = registry.lock().await;
            let result = channel.handle_control(
                &mut registry,
                header.request_type,
                header.request,
                header.value,
                header.index,
                header.length,
            );
            let response = match result {
                cdredir_common::usbredir::channel::ControlResult::Success(bytes) => {
                    let mut out = vec![0u8; CONTROL_HEADER_LEN];
                    out[0] = header.request_type;
                    out[1] = header.request;
                    out[2..4].copy_from_slice(&header.value.to_le_bytes());
                    out[4..6].copy_from_slice(&header.index.to_le_bytes());
                    out[6..8].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
                    if header.request_type & DIR_DEVICE_TO_HOST != 0 {
                        out.extend_from_slice(&bytes);
                    }
                    out
                }
                cdredir_common::usbredir::channel::ControlResult::Stall => {
                    debug!(request = header.request, "control request stalled");
                    Vec::new()
                }
            };
            Some(frame(PacketType::ControlPacket, id, &response))
        }
        PacketType::BulkPacket => {
            let endpoint = bulk_endpoint(payload)?;
            let mut registry = registry.lock().await;
            if endpoint & 0x80 != 0 {
                let max_len = payload
                    .get(1..5)
                    .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                    .unwrap_or(0);
                Some(channel.handle_bulk_in(&mut registry, id, max_len).await)
            } else {
                channel.handle_bulk_out(&mut registry, id, &payload[1..]).await
            }
        }
        PacketType::CancelDataPacket => {
            let mut registry = registry.lock().await;
            Some(channel.cancel_data_packet(&mut registry, id))
        }
        other => {
            debug!(?other, "ignoring unimplemented usbredir packet type");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_header_round_trips_fields() {
        let mut payload = vec![0u8; CONTROL_HEADER_LEN];
        payload[0] = 0xA1;
        payload[1] = 0xFE;
        payload[2..4].copy_from_slice(&5u16.to_le_bytes());
        payload[4..6].copy_from_slice(&0u16.to_le_bytes());
        payload[6..8].copy_from_slice(&1u16.to_le_bytes());
        let header = parse_control_header(&payload).unwrap();
        assert_eq!(header.request_type, 0xA1);
        assert_eq!(header.request, 0xFE);
        assert_eq!(header.value, 5);
        assert_eq!(header.length, 1);
    }

    #[test]
    fn bulk_in_endpoint_has_direction_bit_set() {
        let payload = vec![0x81, 0, 2, 0, 0];
        assert_eq!(bulk_endpoint(&payload), Some(0x81));
    }
}
