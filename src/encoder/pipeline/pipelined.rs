// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pipelined execution: the hardware job of a frame runs while the next frames are prepared.

use std::collections::VecDeque;

use crate::encoder::hal::EncoderHal;
use crate::encoder::notify::NotifyFlags;
use crate::encoder::pipeline::Pipeline;
use crate::encoder::pipeline::Stage;
use crate::encoder::pipeline::StageOutcome;
use crate::encoder::pipeline::TaskOutcome;
use crate::encoder::pipeline::ADMISSION;
use crate::encoder::task::TaskRecord;
use crate::encoder::EncodeError;
use crate::BlockingMode;

const SUBMISSION: [Stage; 1] = [Pipeline::hw_start];

/// Stages run once the hardware job of the task completed.
const COMPLETION: [Stage; 3] = [Pipeline::hw_wait, Pipeline::resolve, Pipeline::frame_end];

/// A submitted task, or a task that ended early and waits for the ones submitted before it so
/// that packets keep the admission order.
pub(crate) struct InFlight {
    task: TaskRecord,
    outcome: Option<TaskOutcome>,
}

/// Queue of in-flight tasks, retired in submission order.
#[derive(Default)]
pub(crate) struct InFlightQueue {
    tasks: VecDeque<InFlight>,
}

impl InFlightQueue {
    fn push(&mut self, task: TaskRecord, outcome: Option<TaskOutcome>) {
        self.tasks.push_back(InFlight { task, outcome });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns the oldest task if it can be retired without blocking. If `mode` is blocking the
    /// oldest task is returned regardless and retiring it waits for the hardware.
    fn poll(&mut self, mode: BlockingMode, hal: &dyn EncoderHal) -> Option<InFlight> {
        let block = mode == BlockingMode::Blocking;

        match self.tasks.pop_front() {
            Some(t) if block || t.outcome.is_some() || hal.is_ready(&t.task.hal) => Some(t),
            Some(t) => {
                self.tasks.push_front(t);
                None
            }
            None => None,
        }
    }
}

impl Pipeline {
    pub(super) fn process_pipelined(&mut self) -> NotifyFlags {
        let retired = self.retire(BlockingMode::NonBlocking);

        let mut task = match self.current.take().or_else(|| self.pool.try_acquire()) {
            Some(task) => task,
            None => {
                // Every task is in flight, wait for the oldest one.
                self.retire_one(BlockingMode::Blocking);
                return NotifyFlags::empty();
            }
        };

        let outcome = match self.run_stages(&mut task, &ADMISSION) {
            StageOutcome::Continue => self.run_stages(&mut task, &SUBMISSION),
            outcome => outcome,
        };

        match outcome {
            StageOutcome::Continue => {
                log::trace!(
                    "task {} submitted, {} in flight",
                    task.hal.seq,
                    self.in_flight.len() + 1
                );
                self.in_flight.push(task, None);
            }
            StageOutcome::Retry(wait) => {
                self.current = Some(task);
                if retired {
                    return NotifyFlags::empty();
                }
                if self.in_flight.is_empty() {
                    return wait;
                }
                // Nothing to submit, so use the time to retire a task.
                self.retire_one(BlockingMode::Blocking);
            }
            StageOutcome::Terminate(outcome) if self.in_flight.is_empty() => {
                self.finish(task, outcome)
            }
            StageOutcome::Terminate(outcome) => self.in_flight.push(task, Some(outcome)),
        }

        NotifyFlags::empty()
    }

    /// Retires every task that can be retired in `mode`. Returns whether any was.
    fn retire(&mut self, mode: BlockingMode) -> bool {
        let mut retired = false;
        while self.retire_one(mode) {
            retired = true;
        }
        retired
    }

    fn retire_one(&mut self, mode: BlockingMode) -> bool {
        let Some(InFlight { mut task, outcome }) = self.in_flight.poll(mode, self.hal.as_ref())
        else {
            return false;
        };

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => match self.run_stages(&mut task, &COMPLETION) {
                StageOutcome::Continue => TaskOutcome::Encoded,
                StageOutcome::Terminate(outcome) => outcome,
                StageOutcome::Retry(wait) => {
                    log::error!(
                        "task {} asked to wait for {:?} after its hardware job",
                        task.hal.seq,
                        wait
                    );
                    TaskOutcome::Failed(EncodeError::InvalidInternalState)
                }
            },
        };

        self.finish(task, outcome);
        true
    }

    /// Waits for every submitted task and emits their packets.
    pub(crate) fn drain_in_flight(&mut self) {
        if !self.in_flight.is_empty() {
            log::debug!("draining {} in-flight tasks", self.in_flight.len());
        }
        while self.retire_one(BlockingMode::Blocking) {}
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::dummy::Call;
    use crate::backend::dummy::DummyBackend;
    use crate::encoder::notify::NotifyFlags;
    use crate::encoder::pipeline::tests::Harness;
    use crate::encoder::rc::RcVerdict;
    use crate::encoder::EncoderConfig;
    use crate::encoder::ExecutionMode;
    use crate::encoder::FrameMetadata;
    use crate::encoder::PacketFlags;

    fn pipelined(tasks: usize) -> EncoderConfig {
        EncoderConfig {
            mode: ExecutionMode::Pipelined { tasks },
            input_queue_depth: 8,
            output_queue_depth: 8,
            ..Default::default()
        }
    }

    #[test]
    fn jobs_overlap() {
        let backend = DummyBackend::new();
        backend.set_latency(1);
        let mut h = Harness::with_backend(pipelined(3), backend);
        h.put_frames(6);

        // Submitting the next frame does not wait for the previous job.
        assert!(h.pipeline.process().is_empty());
        assert!(h.pipeline.process().is_empty());
        assert_eq!(h.pipeline.in_flight.len(), 2);
        assert_eq!(h.journal().count(Call::HalWait), 0);

        assert_eq!(h.run(), NotifyFlags::INPUT);
        let packets = h.packets();
        assert_eq!(packets.len(), 6);
        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(packet.seq, i as u64);
            assert!(!packet.is_empty());
        }
        assert!(packets[0].is_idr());
    }

    #[test]
    fn early_termination_keeps_order() {
        let backend = DummyBackend::new();
        backend.set_latency(2);
        backend.script_drop(&[false, true, false]);
        let mut h = Harness::with_backend(pipelined(3), backend);
        h.put_frames(3);
        h.run();

        let packets = h.packets();
        let seqs: Vec<u64> = packets.iter().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(packets[1].flags.contains(PacketFlags::DROP_BY_FPS));
    }

    #[test]
    fn resolver_runs_on_retirement() {
        let backend = DummyBackend::new();
        backend.script_verdicts(&[RcVerdict::Accept, RcVerdict::Drop, RcVerdict::Accept]);
        let mut h = Harness::with_backend(pipelined(2), backend);
        h.put_frames(3);
        h.run();

        let packets = h.packets();
        assert_eq!(packets.len(), 3);
        assert!(packets[1].flags.contains(PacketFlags::DROPPED));
        assert!(h.journal().stash_rollback_balanced());
    }

    #[test]
    fn drop_verdict_after_later_commit_keeps_frame() {
        let backend = DummyBackend::new();
        backend.set_latency(2);
        backend.script_verdicts(&[
            RcVerdict::Accept,
            RcVerdict::Drop,
            RcVerdict::Accept,
            RcVerdict::Accept,
        ]);
        let mut h = Harness::with_backend(pipelined(3), backend);
        h.put_frames(4);
        h.run();

        // Frames 2 and 3 were committed on top of frame 1 before its verdict came in.
        let packets = h.packets();
        assert_eq!(packets.len(), 4);
        assert!(packets.iter().all(|p| !p.flags.contains(PacketFlags::DROPPED)));
        assert!(!packets[1].is_empty());
        assert_eq!(packets[2].stats.unwrap().ref_seq, Some(1));
        assert_eq!(h.journal().count(Call::Rollback), 0);
        assert_eq!(h.pipeline.ctx.stats.frames_dropped, 0);
    }

    #[test]
    fn reset_completes_in_flight_tasks() {
        let backend = DummyBackend::new();
        backend.set_latency(3);
        let mut h = Harness::with_backend(pipelined(3), backend);
        h.put_frames(5);
        h.pipeline.process();
        h.pipeline.process();
        assert_eq!(h.pipeline.in_flight.len(), 2);

        h.pipeline.reset();
        assert!(h.pipeline.in_flight.is_empty());
        assert_eq!(h.journal().count(Call::HalWait), 2);

        let packets = h.packets();
        let seqs: Vec<u64> = packets.iter().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        for packet in &packets[..2] {
            assert!(!packet.is_empty());
            assert!(!packet.flags.contains(PacketFlags::DISCARDED));
        }
        for packet in &packets[2..] {
            assert!(packet.is_empty());
            assert!(packet.flags.contains(PacketFlags::DISCARDED));
        }
        assert_eq!(h.ports.returned.len(), 5);
        assert!(h.journal().stash_rollback_balanced());

        h.put(FrameMetadata::default());
        h.run();
        let packet = h.packets().remove(0);
        assert_eq!(packet.seq, 5);
        assert!(packet.is_idr());
        assert!(packet.header_len > 0);
    }

    #[test]
    fn two_pass_drains_first() {
        let backend = DummyBackend::with_gop(2);
        backend.set_latency(1);
        let mut h = Harness::with_backend(
            EncoderConfig {
                two_pass: true,
                ..pipelined(3)
            },
            backend,
        );
        h.put_frames(4);
        h.run();

        assert_eq!(h.packets().len(), 4);
        assert_eq!(h.journal().count(Call::GetCpbPass1), 2);
        assert!(h.journal().pass1_ran_alone());
    }

    #[test]
    fn control_drains_in_flight() {
        let backend = DummyBackend::new();
        backend.set_latency(4);
        let mut h = Harness::with_backend(pipelined(3), backend);
        h.put_frames(2);
        h.pipeline.process();
        h.pipeline.process();
        assert_eq!(h.pipeline.in_flight.len(), 2);

        h.pipeline
            .control(crate::encoder::ControlCommand::RequestIdr)
            .unwrap();
        assert!(h.pipeline.in_flight.is_empty());
        assert_eq!(h.packets().len(), 2);

        h.put(FrameMetadata::default());
        h.run();
        assert!(h.packets()[0].is_idr());
    }
}
