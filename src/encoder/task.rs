// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-frame task records and the fixed pool they are taken from.

use bitflags::bitflags;

use crate::encoder::dpb::UserFrameConfig;
use crate::encoder::hal::HalTask;
use crate::encoder::port::PortSlot;
use crate::encoder::rc::RcTask;
use crate::encoder::Frame;
use crate::encoder::Packet;

bitflags! {
    /// Pipeline stages a task went through. A stage whose flag is set is skipped when the task
    /// is resumed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct TaskProgress: u32 {
        const INPUT_READY = 1 << 0;
        const OUTPUT_READY = 1 << 1;
        const FRAME_PAIRED = 1 << 2;
        const HAL_RESET = 1 << 3;
        const FPS_DROP_CHECKED = 1 << 4;
        const OUTPUT_BUFFER_READY = 1 << 5;
        const HEADER_EMITTED = 1 << 6;
        const USER_CFG_APPLIED = 1 << 7;
        const PSKIP_CHECKED = 1 << 8;
        const ENC_STARTED = 1 << 9;
        const DPB_STASHED = 1 << 10;
        const HW_PREPARED = 1 << 11;
        const HW_STARTED = 1 << 12;
        const LOW_DELAY_RESUMED = 1 << 13;
        const COMPLETED = 1 << 14;
    }
}

/// Everything the pipeline knows about one frame, from admission to emission.
#[derive(Debug, Default)]
pub(crate) struct TaskRecord {
    /// Sequence index, assigned once the task is paired with a frame.
    pub(crate) seq: Option<u64>,
    pub(crate) progress: TaskProgress,
    pub(crate) frame: Option<Frame>,
    /// Room reserved on the output port for the packet of this task.
    pub(crate) slot: Option<PortSlot<Packet>>,
    pub(crate) hal: HalTask,
    pub(crate) rc: RcTask,
    /// Client overrides applying to this frame.
    pub(crate) user_cfg: UserFrameConfig,
    pub(crate) reencodes: u32,
    /// Output length and segment count before the first hardware pass.
    pub(crate) hw_mark: (usize, usize),
}

impl TaskRecord {
    pub(crate) fn is_done(&self, stage: TaskProgress) -> bool {
        self.progress.contains(stage)
    }

    pub(crate) fn mark(&mut self, stage: TaskProgress) {
        self.progress.insert(stage);
    }

    /// Whether the task holds a frame, ie. it must produce a packet.
    pub(crate) fn is_paired(&self) -> bool {
        self.is_done(TaskProgress::FRAME_PAIRED)
    }

    pub(crate) fn timestamp(&self) -> u64 {
        self.frame.as_ref().map(|f| f.meta.timestamp).unwrap_or(0)
    }

    pub(crate) fn is_eos(&self) -> bool {
        self.frame.as_ref().map(|f| f.meta.eos).unwrap_or(false)
    }

    /// Clears the task for reuse. The frame and the slot must have been taken already.
    fn recycle(&mut self) {
        self.seq = None;
        self.progress = TaskProgress::empty();
        self.frame = None;
        self.slot = None;
        self.hal.reset(0);
        self.rc = Default::default();
        self.user_cfg = Default::default();
        self.reencodes = 0;
        self.hw_mark = (0, 0);
    }
}

/// Fixed set of task records, allocated once at encoder creation.
pub(crate) struct TaskPool {
    free: Vec<TaskRecord>,
    capacity: usize,
}

impl TaskPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            free: (0..capacity).map(|_| TaskRecord::default()).collect(),
            capacity,
        }
    }

    /// Takes a free record, or returns `None` if all records are in flight.
    pub(crate) fn try_acquire(&mut self) -> Option<TaskRecord> {
        self.free.pop()
    }

    pub(crate) fn recycle(&mut self, mut task: TaskRecord) {
        task.recycle();
        self.free.push(task);
    }

    pub(crate) fn in_use(&self) -> usize {
        self.capacity - self.free.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
