// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Low delay output: every slice leaves as its own packet as soon as the hardware produced it.

use crate::encoder::hal::HalTaskFlags;
use crate::encoder::notify::NotifyFlags;
use crate::encoder::pipeline::Pipeline;
use crate::encoder::pipeline::StageOutcome;
use crate::encoder::task::TaskProgress;
use crate::encoder::task::TaskRecord;
use crate::encoder::EncodeResult;
use crate::encoder::Packet;
use crate::encoder::PacketFlags;

impl Pipeline {
    /// Produces the frame slice by slice. Every slice but the last needs an output slot of its
    /// own. If none is free the task is suspended and resumed at the same slice. The last slice
    /// leaves with the packet reserved at admission.
    pub(super) fn partition(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        if task.is_done(TaskProgress::COMPLETED) {
            return Ok(StageOutcome::Continue);
        }

        if task.is_done(TaskProgress::LOW_DELAY_RESUMED) {
            log::trace!(
                "task {} resumes after slice {}",
                task.hal.seq,
                task.hal.part.index
            );
        }
        task.hal.flags.insert(HalTaskFlags::PARTITION);

        loop {
            if !task.hal.part.pending {
                self.hal.part_start(&mut task.hal)?;
                self.hal.part_wait(&mut task.hal)?;
                task.hal.part.pending = true;
            }

            if task.hal.part.last {
                break;
            }

            let Some(slot) = self.ports.output.try_reserve() else {
                task.mark(TaskProgress::LOW_DELAY_RESUMED);
                return Ok(StageOutcome::Retry(NotifyFlags::OUTPUT));
            };

            slot.fill(Self::partition_packet(task));
            self.ctx.stats.packets_emitted += 1;
            task.hal.part.pending = false;
        }

        task.rc.bit_real = task.hal.hw_length as u64 * 8;
        task.rc.quality_real = task.hal.stats.avg_quality;
        self.rc.hal_end(&mut task.rc)?;

        task.mark(TaskProgress::COMPLETED);
        Ok(StageOutcome::Continue)
    }

    /// Splits the data of the last produced slice off the task.
    fn partition_packet(task: &mut TaskRecord) -> Packet {
        let timestamp = task.timestamp();
        let hal = &mut task.hal;
        let start = hal.part.emitted;
        let end = hal.part.end;

        let mut packet = Packet::empty(hal.seq, timestamp);
        packet.flags = PacketFlags::PARTITION;
        if start == 0 {
            packet.flags.insert(PacketFlags::FRAME_START);
            packet.header_len = hal.header_len;
            packet.sei_len = hal.sei_len;
        }
        if hal.frame.is_intra {
            packet.flags.insert(PacketFlags::INTRA);
        }
        if hal.frame.is_idr {
            packet.flags.insert(PacketFlags::IDR);
        }
        packet.temporal_id = hal.frame.temporal_id;
        packet.segments = hal.segments_in(start, end);
        packet.data = hal.output.split_to(end - start).freeze();

        hal.part.emitted = end;
        packet
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::dummy::Call;
    use crate::backend::dummy::DummyBackend;
    use crate::encoder::notify::NotifyFlags;
    use crate::encoder::pipeline::tests::Harness;
    use crate::encoder::EncoderConfig;
    use crate::encoder::ExecutionMode;
    use crate::encoder::PacketFlags;
    use crate::encoder::SegmentKind;
    use crate::encoder::SliceSplit;

    fn low_delay(output_queue_depth: usize) -> EncoderConfig {
        EncoderConfig {
            split: SliceSplit::ByBlocks(100),
            low_delay: true,
            output_queue_depth,
            ..Default::default()
        }
    }

    #[test]
    fn slices_leave_as_packets() {
        // 320x240 is 300 blocks of 16x16, ie. 3 slices.
        let mut h = Harness::new(low_delay(8));
        h.put_frames(2);
        h.run();

        let packets = h.packets();
        assert_eq!(packets.len(), 6);

        let first = &packets[0..3];
        assert!(first[0].flags.contains(PacketFlags::FRAME_START));
        assert!(first[0].header_len > 0);
        assert_eq!(first[0].segments[0].kind, SegmentKind::Header);
        assert!(!first[1].flags.contains(PacketFlags::FRAME_START));
        assert!(!first[1].is_frame_end());
        assert!(first[2].is_frame_end());
        assert!(first.iter().all(|p| p.flags.contains(PacketFlags::PARTITION)));
        assert!(first.iter().all(|p| p.seq == 0 && p.is_idr()));

        for packet in &packets {
            assert_eq!(
                packet.len(),
                packet.segments.iter().map(|s| s.len).sum::<usize>()
            );
            assert_eq!(packet.segments.last().unwrap().kind, SegmentKind::Slice);
        }
        assert_eq!(h.ports.returned.len(), 2);
    }

    #[test]
    fn suspended_frame_resumes_at_same_slice() {
        let mut h = Harness::new(low_delay(2));
        h.put_frames(1);

        // The admission slot and the first slice fill the port.
        assert_eq!(h.run(), NotifyFlags::OUTPUT);
        assert_eq!(h.journal().count(Call::PartStart), 2);
        assert_eq!(h.journal().count(Call::PartWait), 2);
        let first = h.ports.output.dequeue().unwrap();
        assert!(first.flags.contains(PacketFlags::FRAME_START));

        // One free slot is enough for the pending slice, the last one uses the admission slot.
        assert_eq!(h.run(), NotifyFlags::INPUT);
        assert_eq!(h.journal().count(Call::PartStart), 3);
        assert_eq!(h.journal().count(Call::PartWait), 3);
        assert_eq!(h.journal().count(Call::GenerateHeader), 1);
        assert_eq!(h.journal().count(Call::GetCpb), 1);
        let second = h.ports.output.dequeue().unwrap();
        assert!(!second.flags.contains(PacketFlags::FRAME_START));
        assert!(!second.is_frame_end());

        let last = h.ports.output.dequeue().unwrap();
        assert!(last.is_frame_end());
        assert_eq!(last.seq, 0);
    }

    #[test]
    fn pipelined_mode_partitions_in_order() {
        let mut h = Harness::new(EncoderConfig {
            mode: ExecutionMode::Pipelined { tasks: 3 },
            ..low_delay(16)
        });
        h.put_frames(3);
        assert_eq!(h.run(), NotifyFlags::INPUT);

        let packets = h.packets();
        assert_eq!(packets.len(), 9);
        let seqs: Vec<u64> = packets.iter().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![0, 0, 0, 1, 1, 1, 2, 2, 2]);
        assert!(h.pipeline.in_flight.is_empty());
    }

    #[test]
    fn slice_failure_ends_frame() {
        let backend = DummyBackend::new();
        backend.fail_part_at(1);
        let mut h = Harness::with_backend(low_delay(8), backend);
        h.put_frames(2);
        h.run();

        let packets = h.packets();
        // First slice, then the final error packet of frame 0, then frame 1.
        assert!(packets[0].flags.contains(PacketFlags::FRAME_START));
        assert!(packets[1].flags.contains(PacketFlags::ERROR));
        assert!(packets[1].is_frame_end());
        assert!(packets[1].is_empty());
        assert!(packets[2].is_idr());
        assert_eq!(packets[2].seq, 1);
    }
}
