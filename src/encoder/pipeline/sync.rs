// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::encoder::notify::NotifyFlags;
use crate::encoder::pipeline::Pipeline;
use crate::encoder::pipeline::Stage;
use crate::encoder::pipeline::StageOutcome;
use crate::encoder::pipeline::TaskOutcome;
use crate::encoder::pipeline::ADMISSION;

/// Stages of a frame carried through the hardware in one go.
const HARDWARE: [Stage; 4] = [
    Pipeline::hw_start,
    Pipeline::hw_wait,
    Pipeline::resolve,
    Pipeline::frame_end,
];

/// Stages of a frame whose slices are emitted as soon as the hardware produces them.
const PARTITIONED: [Stage; 2] = [Pipeline::partition, Pipeline::frame_end];

impl Pipeline {
    /// Carries one task as far as possible, from admission to emission of its packet.
    pub(super) fn process_sync(&mut self) -> NotifyFlags {
        let mut task = match self.current.take().or_else(|| self.pool.try_acquire()) {
            Some(task) => task,
            None => {
                log::error!(
                    "{} of {} tasks in use in synchronous mode",
                    self.pool.in_use(),
                    self.pool.capacity()
                );
                return NotifyFlags::TASK;
            }
        };

        let tail: &[Stage] = if self.ctx.config.low_delay_partition() {
            &PARTITIONED
        } else {
            &HARDWARE
        };

        let outcome = match self.run_stages(&mut task, &ADMISSION) {
            StageOutcome::Continue => self.run_stages(&mut task, tail),
            outcome => outcome,
        };

        match outcome {
            StageOutcome::Continue => self.finish(task, TaskOutcome::Encoded),
            StageOutcome::Retry(wait) => {
                self.current = Some(task);
                return wait;
            }
            StageOutcome::Terminate(outcome) => self.finish(task, outcome),
        }

        NotifyFlags::empty()
    }
}
