// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Call contract of the rate control algorithm.

use crate::encoder::dpb::FrameInfo;
use crate::encoder::BackendResult;
use crate::encoder::Tunings;

/// Rate control sub-task of a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RcTask {
    /// Classification of the frame, produced by the reference service.
    pub frame: FrameInfo,
    /// Timestamp of the input frame.
    pub timestamp: u64,
    pub bit_target: u64,
    pub bit_min: u64,
    pub bit_max: u64,
    pub quality_target: u32,
    pub quality_min: u32,
    pub quality_max: u32,
    /// Bits actually produced by the last hardware pass.
    pub bit_real: u64,
    /// Average quality parameter actually used by the last hardware pass.
    pub quality_real: u32,
    /// Bits produced by the lookahead pass, if one ran for this frame.
    pub pass1_bits: Option<u64>,
}

/// Verdict of the rate control after a hardware pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcVerdict {
    /// Keep the result.
    Accept,
    /// Encode the frame again with adjusted targets.
    Reencode,
    /// Discard the frame.
    Drop,
    /// Replace the frame with a skip frame.
    ForcePskip,
}

/// Rate control algorithm. Every call receives the [`RcTask`] of the frame being encoded and may
/// update its targets.
pub trait RateController: Send {
    fn update_tunings(&mut self, tunings: &Tunings) -> BackendResult<()>;

    /// Whether the frame shall be dropped to convert the input framerate to the output one.
    fn check_drop(&mut self, task: &mut RcTask) -> BackendResult<bool>;

    /// Sets the targets of the frame.
    fn frame_start(&mut self, task: &mut RcTask) -> BackendResult<()>;

    /// Called right before the hardware registers are generated.
    fn hal_start(&mut self, task: &mut RcTask) -> BackendResult<()>;

    /// Called once the hardware pass completed and `bit_real`/`quality_real` are known.
    fn hal_end(&mut self, task: &mut RcTask) -> BackendResult<()>;

    fn check_reencode(&mut self, task: &mut RcTask) -> BackendResult<RcVerdict>;

    /// Accounts the final size of the frame.
    fn frame_end(&mut self, task: &mut RcTask) -> BackendResult<()>;
}
