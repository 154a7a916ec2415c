// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fallbacks taken when the rate control rejects the result of a hardware pass.

use crate::encoder::dpb::FrameInfo;
use crate::encoder::dpb::RefMode;
use crate::encoder::dpb::UserFrameConfig;
use crate::encoder::hal::HalTaskFlags;
use crate::encoder::pipeline::Pipeline;
use crate::encoder::pipeline::StageOutcome;
use crate::encoder::pipeline::TaskOutcome;
use crate::encoder::rc::RcVerdict;
use crate::encoder::task::TaskProgress;
use crate::encoder::task::TaskRecord;
use crate::encoder::EncodeResult;

impl Pipeline {
    /// Asks the rate control about the last hardware pass until its result is kept, the frame is
    /// dropped or it is replaced with a skip frame.
    pub(super) fn resolve(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        loop {
            match self.rc.check_reencode(&mut task.rc)? {
                RcVerdict::Accept => return Ok(StageOutcome::Continue),
                RcVerdict::Reencode if task.reencodes >= self.ctx.config.max_reencode_times => {
                    log::debug!(
                        "task {} keeps its result after {} reencodes",
                        task.hal.seq,
                        task.reencodes
                    );
                    return Ok(StageOutcome::Continue);
                }
                RcVerdict::Reencode => self.reencode(task)?,
                RcVerdict::Drop | RcVerdict::ForcePskip if !self.holds_snapshot(task.hal.seq) => {
                    log::debug!(
                        "task {} keeps its result, later frames were committed on top of it",
                        task.hal.seq
                    );
                    return Ok(StageOutcome::Continue);
                }
                RcVerdict::Drop => return self.drop_frame(task),
                RcVerdict::ForcePskip if Self::pskip_allowed(&task.user_cfg, &task.rc.frame) => {
                    return self.force_pskip(task)
                }
                RcVerdict::ForcePskip => {
                    log::debug!("task {} cannot be replaced with a skip frame", task.hal.seq);
                    return Ok(StageOutcome::Continue);
                }
            }
        }
    }

    /// Whether a frame with overrides `user` and classification `frame` may be replaced with a
    /// skip frame without breaking the reference structure.
    pub(super) fn pskip_allowed(user: &UserFrameConfig, frame: &FrameInfo) -> bool {
        !user.force_idr
            && user.force_lt_ref.is_none()
            && !frame.is_idr
            && !frame.is_lt_ref
            && frame.is_top_layer()
            && frame.ref_mode == RefMode::PrevFrame
    }

    /// Runs one more hardware pass, replacing the output of the previous one.
    fn reencode(&mut self, task: &mut TaskRecord) -> EncodeResult<()> {
        task.reencodes += 1;
        self.ctx.stats.reencodes += 1;
        log::debug!("task {} reencode #{}", task.hal.seq, task.reencodes);

        let length = task.hal.length - task.hal.hw_length;
        task.hal.truncate(length, task.hw_mark.1);
        task.hal.hw_length = 0;

        self.codec.proc_hal(&mut task.hal)?;
        self.rc.hal_start(&mut task.rc)?;
        self.hal.generate_registers(&mut task.hal, &task.rc)?;
        self.hal.start(&mut task.hal)?;
        self.hw_pass_end(task)
    }

    fn drop_frame(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        log::debug!("task {} dropped by the rate control", task.hal.seq);

        self.rollback(task.hal.seq);
        if task.hal.header_len > 0 {
            self.ctx.resend_header();
        }
        task.hal.truncate(0, 0);

        task.rc.bit_real = 0;
        self.rc.frame_end(&mut task.rc)?;

        Ok(StageOutcome::Terminate(TaskOutcome::Dropped))
    }

    /// Replaces the frame with a software generated skip frame. The prefix written ahead of the
    /// hardware output is kept.
    pub(super) fn force_pskip(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        log::debug!("task {} replaced with a skip frame", task.hal.seq);

        self.rollback(task.hal.seq);
        task.user_cfg.force_pskip = true;
        self.dpb.set_user_cfg(&task.user_cfg)?;

        let (length, segments) = if task.is_done(TaskProgress::HW_PREPARED) {
            task.hw_mark
        } else {
            (task.hal.length, task.hal.segments.len())
        };
        task.hal.truncate(length, segments);
        task.hal.hw_length = 0;
        task.hal.flags.insert(HalTaskFlags::FORCE_PSKIP);

        self.proc_dpb(task)?;
        self.codec.software_encode(&mut task.hal)?;

        self.rc.frame_start(&mut task.rc)?;
        task.rc.bit_real = (task.hal.length - length) as u64 * 8;
        self.rc.frame_end(&mut task.rc)?;

        Ok(StageOutcome::Terminate(TaskOutcome::Skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inter() -> FrameInfo {
        FrameInfo {
            ref_mode: RefMode::PrevFrame,
            ..Default::default()
        }
    }

    #[test]
    fn pskip_validation() {
        let none = UserFrameConfig::default();
        assert!(Pipeline::pskip_allowed(&none, &inter()));

        let forced_idr = UserFrameConfig {
            force_idr: true,
            ..Default::default()
        };
        assert!(!Pipeline::pskip_allowed(&forced_idr, &inter()));

        let idr = FrameInfo {
            is_idr: true,
            is_intra: true,
            ref_mode: RefMode::None,
            ..Default::default()
        };
        assert!(!Pipeline::pskip_allowed(&none, &idr));

        let lt_ref = FrameInfo {
            is_lt_ref: true,
            ..inter()
        };
        assert!(!Pipeline::pskip_allowed(&none, &lt_ref));

        let lower_layer = FrameInfo {
            temporal_id: 0,
            max_temporal_id: 1,
            ..inter()
        };
        assert!(!Pipeline::pskip_allowed(&none, &lower_layer));

        let long_term = FrameInfo {
            ref_mode: RefMode::LongTermRef,
            ..Default::default()
        };
        assert!(!Pipeline::pskip_allowed(&none, &long_term));
    }
}
