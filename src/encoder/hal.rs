// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware abstraction layer contract and the hardware sub-task of a frame.

use anyhow::anyhow;
use bitflags::bitflags;
use bytes::Bytes;
use bytes::BytesMut;

use crate::encoder::dpb::FrameInfo;
use crate::encoder::rc::RcTask;
use crate::encoder::BackendError;
use crate::encoder::BackendResult;
use crate::encoder::EncoderConfig;
use crate::encoder::FrameStats;
use crate::encoder::PacketSegment;
use crate::encoder::SegmentKind;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HalTaskFlags: u32 {
        /// The frame was dropped to match the output framerate.
        const DROP_BY_FPS = 1 << 0;
        /// The frame was replaced with a software generated skip frame.
        const FORCE_PSKIP = 1 << 1;
        /// The hardware pass is the lookahead pass of a two pass encode.
        const PASS1 = 1 << 2;
        /// The hardware produces the frame one slice at a time.
        const PARTITION = 1 << 3;
    }
}

/// Progress of a frame produced one slice at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionState {
    /// Index of the last slice produced by the hardware.
    pub index: u32,
    /// End offset, in the frame, of the last slice produced by the hardware.
    pub end: usize,
    /// The last produced slice is the final one of the frame.
    pub last: bool,
    /// A slice was produced by the hardware but not emitted yet.
    pub pending: bool,
    /// Number of bytes of the frame already emitted as packets.
    pub emitted: usize,
}

/// Hardware sub-task of a frame: the input picture, the output buffer being filled and the
/// byte accounting of what was written into it.
#[derive(Debug, Default)]
pub struct HalTask {
    pub seq: u64,
    pub input: Option<Bytes>,
    /// Coded data. Bytes already emitted as partitions are split off the front.
    pub output: BytesMut,
    /// Byte ranges of the coded frame, with offsets relative to the start of the frame.
    pub segments: Vec<PacketSegment>,
    /// Total number of bytes written for the frame.
    pub length: usize,
    pub header_len: usize,
    pub sei_len: usize,
    /// Number of bytes written by the last hardware pass.
    pub hw_length: usize,
    pub flags: HalTaskFlags,
    /// Classification of the frame, as decided by the reference service.
    pub frame: FrameInfo,
    pub part: PartitionState,
    pub stats: FrameStats,
}

impl HalTask {
    /// Resets the sub-task for frame `seq`, keeping the allocation of the output buffer.
    pub fn reset(&mut self, seq: u64) {
        self.seq = seq;
        self.input = None;
        self.output.clear();
        self.segments.clear();
        self.length = 0;
        self.header_len = 0;
        self.sei_len = 0;
        self.hw_length = 0;
        self.flags = HalTaskFlags::empty();
        self.frame = Default::default();
        self.part = Default::default();
        self.stats = Default::default();
    }

    /// Number of free bytes left in the output buffer.
    pub fn remaining(&self) -> usize {
        self.output.capacity() - self.output.len()
    }

    /// Appends `data` as a segment of type `kind`. Fails without writing anything if the output
    /// buffer cannot hold it.
    pub fn append(&mut self, kind: SegmentKind, data: &[u8]) -> BackendResult<usize> {
        if data.len() > self.remaining() {
            return Err(BackendError::Other(anyhow!(
                "output buffer overflow: {} bytes left, {} needed",
                self.remaining(),
                data.len()
            )));
        }

        self.output.extend_from_slice(data);
        self.segments.push(PacketSegment {
            kind,
            offset: self.length,
            len: data.len(),
        });
        self.length += data.len();

        Ok(data.len())
    }

    /// Drops everything written after the first `length` bytes and `segments` segments.
    pub(crate) fn truncate(&mut self, length: usize, segments: usize) {
        let emitted = self.part.emitted;
        self.output.truncate(length.saturating_sub(emitted));
        self.segments.truncate(segments);
        self.length = length;
    }

    /// Segments overlapping the range `start..end` of the frame, rebased on `start`.
    pub(crate) fn segments_in(&self, start: usize, end: usize) -> Vec<PacketSegment> {
        self.segments
            .iter()
            .filter(|s| s.offset < end && s.offset + s.len > start)
            .map(|s| {
                let offset = s.offset.max(start);
                let seg_end = (s.offset + s.len).min(end);
                PacketSegment {
                    kind: s.kind,
                    offset: offset - start,
                    len: seg_end - offset,
                }
            })
            .collect()
    }
}

/// Hardware abstraction layer: turns a prepared [`HalTask`] into register writes and runs the
/// hardware job.
///
/// In pipelined mode several tasks are started before the first one is waited on, and they are
/// waited on in submission order. A HAL that cannot accept one more task returns
/// [`BackendError::OutOfResources`] from [`EncoderHal::get_task`].
pub trait EncoderHal: Send {
    /// Applies a new stream configuration.
    fn update_info(&mut self, config: &EncoderConfig) -> BackendResult<()>;

    /// Reserves the hardware resources needed by `task`.
    fn get_task(&mut self, task: &mut HalTask) -> BackendResult<()>;

    /// Generates the register set for `task` from the targets in `rc`.
    fn generate_registers(&mut self, task: &mut HalTask, rc: &RcTask) -> BackendResult<()>;

    fn start(&mut self, task: &mut HalTask) -> BackendResult<()>;

    /// Whether the job of `task` completed, ie. [`EncoderHal::wait`] will not block.
    fn is_ready(&self, _task: &HalTask) -> bool {
        true
    }

    /// Waits for the job of `task`, appends the produced data to its output and updates
    /// `hw_length`, `length` and `stats`.
    fn wait(&mut self, task: &mut HalTask) -> BackendResult<()>;

    /// Starts producing the next slice of `task`.
    fn part_start(&mut self, task: &mut HalTask) -> BackendResult<()>;

    /// Waits for the slice started by [`EncoderHal::part_start`] and updates `task.part`.
    fn part_wait(&mut self, task: &mut HalTask) -> BackendResult<()>;
}
