//! The SCSI Request data model (spec section 3).

use super::constants::status;
use super::sense::ShortSense;

pub const CDB_BUF_SIZE: usize = 16;

/// Data-transfer direction implied by the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferDir {
    /// TEST_UNIT_READY and friends: no data phase.
    None,
    /// READ, INQUIRY, MODE_SENSE, ...: data flows device -> host.
    FromDevice,
    /// MODE_SELECT, ...: data flows host -> device.
    ToDevice,
}

/// Lifecycle state of an in-flight SCSI request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqState {
    Idle,
    Running,
    Complete,
    Canceled,
    /// Cancelled while the target was mid-`target_reset`; the completion
    /// callback is suppressed and `target_reset` finalizes once this
    /// request is released (spec section 4.1, "asynchronous read
    /// cancellation").
    Disposed,
}

/// A single outstanding SCSI command, owned by the MSD layer for the
/// duration of one CBW/CSW cycle and submitted to the `ScsiTarget`.
#[derive(Debug, Clone)]
pub struct ScsiRequest {
    pub cdb: [u8; CDB_BUF_SIZE],
    pub cdb_len: usize,
    pub tag: u32,
    pub lun: u32,

    /// Data staged for a TO_DEVICE command (e.g. MODE_SELECT parameter
    /// data) or the buffer a FROM_DEVICE command fills.
    pub buf: Vec<u8>,

    pub state: ReqState,
    pub xfer_dir: XferDir,

    /// Logical block address, set by READ-family commands.
    pub lba: u64,
    /// Block count, set by READ-family commands.
    pub count: u64,
    /// Byte offset into the backing stream (`lba * block_size`).
    pub offset: u64,
    /// Requested byte length for the data phase.
    pub req_len: u64,

    /// Bytes actually produced once the command completes.
    pub in_len: u64,
    /// SCSI status byte.
    pub status: u8,
    /// Sense attached to this completion, if status is CHECK_CONDITION.
    pub sense: ShortSense,

    /// Set by `dispatch` when this request needs an asynchronous backing-
    /// stream read before it can complete; `state` is left `Running` in
    /// this case and the MSD layer is responsible for driving the read
    /// (spec section 4.1, "Submission contract").
    pub needs_async_read: bool,
}

impl ScsiRequest {
    /// Build a fresh request for a newly parsed CBW.
    pub fn new(cdb: &[u8], cdb_len: usize, tag: u32, lun: u32) -> Self {
        let mut buf = [0u8; CDB_BUF_SIZE];
        let n = cdb_len.min(CDB_BUF_SIZE).min(cdb.len());
        buf[..n].copy_from_slice(&cdb[..n]);
        Self {
            cdb: buf,
            cdb_len,
            tag,
            lun,
            buf: Vec::new(),
            state: ReqState::Idle,
            xfer_dir: XferDir::None,
            lba: 0,
            count: 0,
            offset: 0,
            req_len: 0,
            in_len: 0,
            status: status::GOOD,
            sense: ShortSense::NO_SENSE,
            needs_async_read: false,
        }
    }

    pub fn opcode(&self) -> u8 {
        self.cdb[0]
    }

    /// Mark the request complete with GOOD status and the given in-band
    /// response bytes.
    pub fn complete_good(&mut self, data: Vec<u8>) {
        self.in_len = data.len() as u64;
        self.buf = data;
        self.status = status::GOOD;
        self.state = ReqState::Complete;
    }

    /// Mark the request complete with GOOD status and no data phase.
    pub fn complete_good_no_data(&mut self) {
        self.in_len = 0;
        self.status = status::GOOD;
        self.state = ReqState::Complete;
    }

    /// Mark the request complete with CHECK CONDITION and the given sense.
    /// Per spec section 4.1, a check condition carries no data-in.
    pub fn complete_check_condition(&mut self, sense: ShortSense) {
        self.in_len = 0;
        self.status = status::CHECK_CONDITION;
        self.sense = sense;
        self.state = ReqState::Complete;
    }

    /// Arm an asynchronous read at `offset` for `len` bytes; leaves the
    /// request `Running` for the MSD layer to drive to completion.
    pub fn arm_async_read(&mut self, offset: u64, len: u64) {
        self.offset = offset;
        self.req_len = len;
        self.xfer_dir = XferDir::FromDevice;
        self.needs_async_read = true;
        self.state = ReqState::Running;
    }

    /// Finalize an armed read once the backing stream has produced bytes
    /// (or an empty vector on I/O failure, per the IOError short-read
    /// policy in spec section 7).
    pub fn complete_read(&mut self, data: Vec<u8>) {
        self.in_len = data.len() as u64;
        self.buf = data;
        self.status = status::GOOD;
        self.needs_async_read = false;
        self.state = ReqState::Complete;
    }
}
