//! The SCSI Target: an array of logical units plus the at-most-one
//! in-flight request (spec section 3).

use super::commands;
use super::lu::{LogicalUnit, LuIdentity};
use super::request::{ReqState, ScsiRequest};
use crate::backing::BackingStream;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// Upper bound on logical units per target (spec section 3).
pub const MAX_LUNS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Running,
    Reset,
}

/// Owns a fixed array of logical units and serializes SCSI requests
/// against them: at most one request is in flight at a time (spec section
/// 5, "SCSI requests are serialized per target").
pub struct ScsiTarget {
    pub luns: Vec<LogicalUnit>,
    pub state: TargetState,
    /// True while a request handed out by `request_submit` has not yet
    /// been released via `request_release`.
    pub request_in_flight: bool,
}

impl ScsiTarget {
    pub fn new(max_luns: u32) -> Self {
        let max_luns = max_luns.min(MAX_LUNS).max(1);
        Self {
            luns: (0..max_luns).map(LogicalUnit::unrealized).collect(),
            state: TargetState::Running,
            request_in_flight: false,
        }
    }

    pub fn num_luns(&self) -> u32 {
        self.luns.len() as u32
    }

    pub fn realized_lun_count(&self) -> u32 {
        self.luns.iter().filter(|lu| lu.realized).count() as u32
    }

    pub fn lu(&self, lun: u32) -> Option<&LogicalUnit> {
        self.luns.get(lun as usize)
    }

    pub fn lu_mut(&mut self, lun: u32) -> Option<&mut LogicalUnit> {
        self.luns.get_mut(lun as usize)
    }

    pub fn realize(&mut self, lun: u32, identity: LuIdentity, cd_rom: bool) -> Result<(), String> {
        let lu = self
            .lu_mut(lun)
            .ok_or_else(|| format!("lun {lun} out of range"))?;
        if lu.realized {
            return Err(format!("lun {lun} already realized"));
        }
        lu.realize(identity, cd_rom);
        Ok(())
    }

    pub fn unrealize(&mut self, lun: u32) -> Result<(), String> {
        let lu = self
            .lu_mut(lun)
            .ok_or_else(|| format!("lun {lun} out of range"))?;
        lu.unrealize();
        Ok(())
    }

    pub fn lu_load(&mut self, lun: u32, stream: BackingStream) -> Result<(), String> {
        let lu = self
            .lu_mut(lun)
            .ok_or_else(|| format!("lun {lun} out of range"))?;
        lu.load(stream);
        Ok(())
    }

    pub fn lu_unload(&mut self, lun: u32) -> Result<(), String> {
        let lu = self
            .lu_mut(lun)
            .ok_or_else(|| format!("lun {lun} out of range"))?;
        lu.unload();
        Ok(())
    }

    /// Reset a single logical unit without disturbing the rest of the
    /// target (distinct from `target_reset`, which resets every realized
    /// LU as one operation).
    pub fn lu_reset(&mut self, lun: u32) -> Result<(), String> {
        let lu = self
            .lu_mut(lun)
            .ok_or_else(|| format!("lun {lun} out of range"))?;
        lu.reset();
        Ok(())
    }

    /// Cancel the in-flight request's asynchronous read (spec section 4.1,
    /// "Asynchronous read cancellation"). If a target reset is pending
    /// behind this request, it transitions to `Disposed` so `target_reset`
    /// can finalize once released; otherwise it becomes `Canceled`.
    pub fn request_cancel(&mut self, req: &mut ScsiRequest) {
        if req.state != ReqState::Running {
            return;
        }
        req.needs_async_read = false;
        req.state = if self.state == TargetState::Reset {
            ReqState::Disposed
        } else {
            ReqState::Canceled
        };
    }

    /// Non-blocking submission (spec section 4.1). Applies the request
    /// gating order, then dispatches by opcode. Synchronous commands leave
    /// the request `Complete`; `READ*` commands that pass their checks
    /// leave it `Running` and the caller is responsible for driving the
    /// backing-stream read and calling `request_complete_read`.
    pub fn request_submit(&mut self, req: &mut ScsiRequest) {
        if self.request_in_flight {
            req.complete_check_condition(super::sense::codes::TARGET_FAILURE);
            return;
        }
        self.request_in_flight = true;
        req.state = ReqState::Running;
        commands::dispatch(self, req);
    }

    /// Release a completed/cancelled request back to the target, allowing
    /// the next CBW to submit. If a target reset was pending behind this
    /// request, finalize it now (mirrors `cd_scsi_dev_request_release`).
    pub fn request_release(&mut self, req: &mut ScsiRequest) {
        self.request_in_flight = false;
        req.state = ReqState::Idle;
        if self.state == TargetState::Reset {
            self.finish_reset();
        }
    }

    /// Begin a target reset. If no request is in flight, the reset
    /// finishes immediately; otherwise it completes once the in-flight
    /// request is released or cancelled (spec section 4.1, "Target
    /// reset").
    pub fn start_reset(&mut self) -> bool {
        if self.state == TargetState::Reset {
            return false;
        }
        self.state = TargetState::Reset;
        if !self.request_in_flight {
            self.finish_reset();
        }
        true
    }

    /// Clone of the backing stream handle for `lun`, for the MSD layer to
    /// spawn a cancellable read task against (see `ScsiRequest::arm_async_read`).
    pub fn lu_stream(&self, lun: u32) -> Option<Arc<AsyncMutex<BackingStream>>> {
        self.lu(lun)?.stream.clone()
    }

    fn finish_reset(&mut self) {
        for lu in &mut self.luns {
            if lu.realized {
                lu.reset();
            }
        }
        self.state = TargetState::Running;
        debug!("scsi target reset complete");
    }
}
