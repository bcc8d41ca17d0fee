//! USB Mass Storage Bulk-Only Transport (BBB) state machine (spec section
//! 4.2). Bridges a parsed CBW to a `ScsiRequest`, drives the one
//! asynchronous suspension point (a SCSI read) via a cancellable spawned
//! task, and hands the usbredir adapter one bulk-IN chunk or a CSW at a
//! time.

use std::collections::VecDeque;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::scsi::{LuIdentity, ReqState, ScsiRequest, ScsiTarget, XferDir};
use crate::types::CdEmuError;

pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;
const CBW_SIGNATURE: u32 = 0x4342_5355;
const CSW_SIGNATURE: u32 = 0x5342_5355;

/// Default size of the device's host<->device staging buffer (spec section
/// 3, "MSD Device").
pub const DEFAULT_DATA_BUF_LEN: usize = 256 * 1024;

/// CSW status byte values (spec section 4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CswStatus {
    Good = 0,
    Failed = 1,
    PhaseError = 2,
}

/// MSD state machine states (spec section 3, "MSD Device").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsdState {
    Init,
    Cbw,
    DataOut,
    DataIn,
    ZeroDataIn,
    Csw,
    DeviceReset,
    TargetReset,
}

/// A parsed Command Block Wrapper.
#[derive(Debug, Clone)]
pub struct Cbw {
    pub tag: u32,
    pub data_len: u32,
    pub direction_in: bool,
    pub lun: u32,
    pub cdb_len: usize,
    pub cdb: [u8; 16],
}

/// Parse a 31-byte CBW (spec section 4.2). Rejects anything but an exact
/// 31-byte buffer with the right signature, an in-range LUN and CDB
/// length -- any violation is a phase error at the BBB layer.
pub fn parse_cbw(bytes: &[u8]) -> Result<Cbw, CdEmuError> {
    if bytes.len() != CBW_LEN {
        return Err(CdEmuError::ProtocolFraming(format!(
            "CBW length {} != {CBW_LEN}",
            bytes.len()
        )));
    }
    let signature = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if signature != CBW_SIGNATURE {
        return Err(CdEmuError::ProtocolFraming(format!(
            "bad CBW signature {signature:#010x}"
        )));
    }
    let tag = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let data_len = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let direction_in = bytes[12] & 0x80 != 0;
    let lun = (bytes[13] & 0x0F) as u32;
    let cdb_len = (bytes[14] & 0x1F) as usize;
    if cdb_len == 0 || cdb_len > 16 {
        return Err(CdEmuError::ProtocolFraming(format!(
            "bad CBW CDB length {cdb_len}"
        )));
    }
    let mut cdb = [0u8; 16];
    cdb.copy_from_slice(&bytes[15..31]);
    Ok(Cbw {
        tag,
        data_len,
        direction_in,
        lun,
        cdb_len,
        cdb,
    })
}

/// Build a 13-byte CSW (spec section 4.2).
pub fn build_csw(tag: u32, residue: u32, status: CswStatus) -> [u8; CSW_LEN] {
    let mut out = [0u8; CSW_LEN];
    out[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
    out[4..8].copy_from_slice(&tag.to_le_bytes());
    out[8..12].copy_from_slice(&residue.to_le_bytes());
    out[12] = status as u8;
    out
}

/// Outcome of feeding a CBW, data-out chunk, or poll into the state
/// machine. The usbredir adapter drives the device by reacting to these.
#[derive(Debug)]
pub enum MsdEvent {
    /// Wait for host->device data before anything else can happen.
    NeedDataOut,
    /// A chunk of device->host data is ready to send on the bulk-IN
    /// endpoint (may be shorter than the caller's `max_len`).
    DataIn(Vec<u8>),
    /// A zero-length bulk-IN packet must be sent before the CSW (spec
    /// section 4.2, last invariant).
    ZeroDataIn,
    /// The backing-stream read has not completed yet; the caller should
    /// await `wait_for_read` before polling again.
    ReadPending,
    /// Final status for this CBW; the request has been released.
    Csw([u8; CSW_LEN]),
}

/// A cancellable asynchronous SCSI read in flight, driven independently of
/// the owning connection task (spec section 5, "the only suspension
/// point").
struct PendingRead {
    handle: JoinHandle<Vec<u8>>,
}

/// Bulk-Only Transport device: one SCSI target plus the BBB state machine
/// and the staging buffer for the command currently in flight.
pub struct MsdDevice {
    pub state: MsdState,
    pub target: ScsiTarget,
    pub data_buf_len: usize,

    req: Option<ScsiRequest>,
    /// Expected total transfer length from the CBW (`usb_req_len`).
    usb_req_len: u32,
    /// Bytes of device->host data already delivered on bulk-IN.
    scsi_in_sent: u32,
    /// Staged device->host payload for the in-flight command.
    data_in: VecDeque<u8>,
    /// Staged host->device payload, assembled across possibly-chunked
    /// DATAOUT packets.
    data_out: Vec<u8>,
    pending_read: Option<PendingRead>,
}

impl MsdDevice {
    pub fn new(max_luns: u32) -> Self {
        Self {
            state: MsdState::Init,
            target: ScsiTarget::new(max_luns),
            data_buf_len: DEFAULT_DATA_BUF_LEN,
            req: None,
            usb_req_len: 0,
            scsi_in_sent: 0,
            data_in: VecDeque::new(),
            data_out: Vec::new(),
            pending_read: None,
        }
    }

    /// Convenience passthrough used by the registry when realizing a LUN.
    pub fn realize_lu(&mut self, lun: u32, identity: LuIdentity, cd_rom: bool) -> Result<(), String> {
        self.target.realize(lun, identity, cd_rom)
    }

    pub fn num_luns(&self) -> u32 {
        self.target.num_luns()
    }

    /// `INIT -> CBW` (spec section 4.2 state diagram).
    pub fn device_reset(&mut self) {
        self.abort_pending_read();
        self.req = None;
        self.data_in.clear();
        self.data_out.clear();
        self.state = MsdState::Cbw;
    }

    /// MSC class reset (`CLASS|INTERFACE|0xFF`, spec section 4.3): resets
    /// the SCSI target and returns the BBB state machine to `CBW`.
    pub fn target_reset(&mut self) {
        self.abort_pending_read();
        self.target.start_reset();
        self.req = None;
        self.data_in.clear();
        self.data_out.clear();
        self.state = MsdState::Cbw;
    }

    /// Feed a freshly-received 31-byte CBW. Submits the SCSI request and
    /// returns the first event: immediate `Csw` (no data phase or
    /// synchronous completion with no data-in), `DataIn` with the first
    /// chunk of a synchronously-produced response, `ReadPending` if an
    /// asynchronous read was armed, or `NeedDataOut`.
    pub fn on_cbw(&mut self, bytes: &[u8]) -> MsdEvent {
        let cbw = match parse_cbw(bytes) {
            Ok(cbw) => cbw,
            Err(e) => {
                warn!(error = %e, "malformed CBW, phase error");
                return MsdEvent::Csw(build_csw(0, 0, CswStatus::PhaseError));
            }
        };
        if cbw.lun >= self.target.num_luns() {
            warn!(lun = cbw.lun, "CBW references out-of-range LUN, phase error");
            return MsdEvent::Csw(build_csw(cbw.tag, cbw.data_len, CswStatus::PhaseError));
        }

        self.usb_req_len = cbw.data_len;
        self.scsi_in_sent = 0;
        self.data_in.clear();
        self.data_out.clear();

        let mut req = ScsiRequest::new(&cbw.cdb, cbw.cdb_len, cbw.tag, cbw.lun);

        if cbw.data_len == 0 {
            self.target.request_submit(&mut req);
            self.req = Some(req);
            self.state = MsdState::Csw;
            return self.finish_request();
        }

        if cbw.direction_in {
            self.state = MsdState::DataIn;
            self.target.request_submit(&mut req);
            if req.needs_async_read {
                let stream = self.target.lu_stream(cbw.lun);
                self.req = Some(req);
                return match stream {
                    Some(stream) => {
                        self.spawn_read(stream);
                        MsdEvent::ReadPending
                    }
                    None => {
                        // Armed a read against a LU with no stream: treat
                        // as an immediate short read, matching the
                        // IOError short-read policy (spec section 7).
                        let mut req = self.req.take().unwrap();
                        req.complete_read(Vec::new());
                        self.req = Some(req);
                        self.next_data_in_event()
                    }
                };
            }
            self.req = Some(req);
            self.next_data_in_event()
        } else {
            self.state = MsdState::DataOut;
            self.req = Some(req);
            MsdEvent::NeedDataOut
        }
    }

    /// Feed a chunk of host->device data (spec section 4.2, `DATAOUT`).
    /// Once the full expected length has arrived the SCSI request is
    /// submitted and the final `Csw` is returned.
    pub fn on_data_out(&mut self, bytes: &[u8]) -> MsdEvent {
        self.data_out.extend_from_slice(bytes);
        if (self.data_out.len() as u32) < self.usb_req_len {
            return MsdEvent::NeedDataOut;
        }
        let mut req = self.req.take().expect("data-out with no in-flight request");
        req.buf = std::mem::take(&mut self.data_out);
        req.xfer_dir = XferDir::ToDevice;
        self.target.request_submit(&mut req);
        self.req = Some(req);
        self.state = MsdState::Csw;
        self.finish_request()
    }

    /// Spawn the asynchronous backing-stream read for the in-flight
    /// request (spec section 5). Cancellable via `cancel_read`.
    fn spawn_read(&mut self, stream: std::sync::Arc<tokio::sync::Mutex<crate::backing::BackingStream>>) {
        let req = self.req.as_ref().expect("spawn_read with no in-flight request");
        let offset = req.offset;
        let len = req.req_len;
        let handle = tokio::spawn(async move {
            let mut stream = stream.lock().await;
            stream.read_at(offset, len).await
        });
        self.pending_read = Some(PendingRead { handle });
    }

    /// Await the in-flight asynchronous read and fold its result into the
    /// SCSI request, returning the resulting bulk-IN/CSW event.
    pub async fn wait_for_read(&mut self) -> MsdEvent {
        let Some(pending) = self.pending_read.take() else {
            return self.next_data_in_event();
        };
        match pending.handle.await {
            Ok(data) => {
                let mut req = self.req.take().expect("read completion with no in-flight request");
                req.complete_read(data);
                self.req = Some(req);
                self.next_data_in_event()
            }
            Err(join_err) => {
                debug!(cancelled = join_err.is_cancelled(), "pending read ended without data");
                let mut req = self.req.take().expect("read completion with no in-flight request");
                self.target.request_cancel(&mut req);
                let tag = req.tag;
                self.target.request_release(&mut req);
                self.state = MsdState::Cbw;
                MsdEvent::Csw(build_csw(tag, self.usb_req_len, CswStatus::Failed))
            }
        }
    }

    /// Cancel the asynchronous read in flight, if any (spec section 4.1,
    /// `request_cancel`; section 5, `cancel_data_packet`).
    pub fn cancel_read(&mut self) {
        self.abort_pending_read();
        if let Some(req) = self.req.as_mut() {
            self.target.request_cancel(req);
        }
    }

    fn abort_pending_read(&mut self) {
        if let Some(pending) = self.pending_read.take() {
            pending.handle.abort();
        }
    }

    /// Stage the request's produced bytes for bulk-IN delivery and return
    /// the first chunk/CSW event.
    fn next_data_in_event(&mut self) -> MsdEvent {
        let req = self.req.take().expect("next_data_in_event with no in-flight request");
        let event = match req.state {
            ReqState::Complete => {
                let in_len = req.in_len.min(self.usb_req_len as u64) as usize;
                self.data_in = req.buf[..in_len.min(req.buf.len())].iter().copied().collect();
                self.state = MsdState::DataIn;
                None
            }
            ReqState::Canceled | ReqState::Disposed => {
                self.state = MsdState::Csw;
                Some(MsdEvent::Csw(build_csw(req.tag, self.usb_req_len, CswStatus::Failed)))
            }
            _ => Some(MsdEvent::ReadPending),
        };
        self.req = Some(req);
        event.unwrap_or_else(|| self.poll_bulk_in(self.data_buf_len as u32))
    }

    /// Produce the next bulk-IN chunk (at most `max_len` bytes), a
    /// zero-length packet if one is owed, or the final CSW once all data
    /// has been delivered (spec section 4.2 invariants).
    pub fn poll_bulk_in(&mut self, max_len: u32) -> MsdEvent {
        if !self.data_in.is_empty() {
            let take = (max_len as usize).min(self.data_in.len());
            let chunk: Vec<u8> = self.data_in.drain(..take).collect();
            self.scsi_in_sent += chunk.len() as u32;
            if self.data_in.is_empty() {
                self.state = if self.owes_zero_length_packet(chunk.len() as u32) {
                    MsdState::ZeroDataIn
                } else {
                    MsdState::Csw
                };
            }
            return MsdEvent::DataIn(chunk);
        }
        if self.state == MsdState::ZeroDataIn {
            self.state = MsdState::Csw;
            return MsdEvent::ZeroDataIn;
        }
        self.finish_request()
    }

    /// True when the just-sent chunk exactly filled the endpoint's max
    /// packet size *and* the host still expects more bytes than we
    /// produced: BBB requires an explicit zero-length packet in that case
    /// so the host doesn't keep waiting (spec section 4.2).
    fn owes_zero_length_packet(&self, last_chunk_len: u32) -> bool {
        last_chunk_len > 0
            && last_chunk_len % 512 == 0
            && self.scsi_in_sent < self.usb_req_len
    }

    fn finish_request(&mut self) -> MsdEvent {
        let mut req = self.req.take().expect("finish_request with no in-flight request");
        let status = match req.state {
            ReqState::Complete => {
                use crate::scsi::constants::status as scsi_status;
                if req.status == scsi_status::GOOD {
                    CswStatus::Good
                } else {
                    CswStatus::Failed
                }
            }
            ReqState::Canceled | ReqState::Disposed => CswStatus::Failed,
            _ => CswStatus::PhaseError,
        };
        let transferred = self.scsi_in_sent.max(req.in_len.min(self.usb_req_len as u64) as u32);
        let residue = self.usb_req_len.saturating_sub(transferred);
        let csw = build_csw(req.tag, residue, status);
        self.target.request_release(&mut req);
        self.req = None;
        self.state = MsdState::Cbw;
        MsdEvent::Csw(csw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cbw_bytes(tag: u32, data_len: u32, direction_in: bool, lun: u8, cdb: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; CBW_LEN];
        buf[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        buf[4..8].copy_from_slice(&tag.to_le_bytes());
        buf[8..12].copy_from_slice(&data_len.to_le_bytes());
        buf[12] = if direction_in { 0x80 } else { 0x00 };
        buf[13] = lun;
        buf[14] = cdb.len() as u8;
        buf[15..15 + cdb.len()].copy_from_slice(cdb);
        buf
    }

    #[test]
    fn parse_cbw_rejects_bad_signature() {
        let mut bytes = cbw_bytes(1, 0, false, 0, &[0x00]);
        bytes[0] = 0;
        assert!(parse_cbw(&bytes).is_err());
    }

    #[test]
    fn parse_cbw_round_trips_fields() {
        let bytes = cbw_bytes(42, 512, true, 0, &[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0]);
        let cbw = parse_cbw(&bytes).unwrap();
        assert_eq!(cbw.tag, 42);
        assert_eq!(cbw.data_len, 512);
        assert!(cbw.direction_in);
        assert_eq!(cbw.cdb_len, 10);
        assert_eq!(cbw.cdb[0], 0x28);
    }

    #[test]
    fn build_csw_encodes_fields_little_endian() {
        let csw = build_csw(7, 3, CswStatus::Good);
        assert_eq!(u32::from_le_bytes(csw[0..4].try_into().unwrap()), CSW_SIGNATURE);
        assert_eq!(u32::from_le_bytes(csw[4..8].try_into().unwrap()), 7);
        assert_eq!(u32::from_le_bytes(csw[8..12].try_into().unwrap()), 3);
        assert_eq!(csw[12], 0);
    }

    #[tokio::test]
    async fn test_unit_ready_on_unloaded_lu_completes_with_csw_and_no_data() {
        let mut dev = MsdDevice::new(1);
        dev.realize_lu(
            0,
            LuIdentity {
                vendor: "Red Hat".into(),
                product: "SPICE CD".into(),
                version: "0".into(),
                serial: "000000000001".into(),
            },
            true,
        )
        .unwrap();
        let bytes = cbw_bytes(1, 0, false, 0, &[0x00, 0, 0, 0, 0, 0]);
        let event = dev.on_cbw(&bytes);
        match event {
            MsdEvent::Csw(csw) => {
                assert_eq!(csw[12], CswStatus::Failed as u8);
            }
            other => panic!("expected Csw, got {other:?}"),
        }
    }
}
