// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Multi-stage encoding pipeline run by the worker thread.
//!
//! Every frame is carried by a [`TaskRecord`] through a fixed sequence of stages. A stage either
//! lets the task continue, asks the worker to retry later once some condition is signaled, or
//! terminates the task with an outcome. Stages record their completion in the task progress, so
//! a task that had to wait is resumed exactly where it stopped. Whatever the outcome, a task that
//! was paired with a frame produces exactly one final packet, in admission order.

mod low_delay;
mod pipelined;
mod resolver;
mod sync;

use bytes::Bytes;
use bytes::BytesMut;

use crate::encoder::codec::EncoderImpl;
use crate::encoder::codec::PrefixData;
use crate::encoder::context::EncoderContext;
use crate::encoder::dpb::DpbService;
use crate::encoder::dpb::UserFrameConfig;
use crate::encoder::hal::EncoderHal;
use crate::encoder::hal::HalTaskFlags;
use crate::encoder::notify::NotifyFlags;
use crate::encoder::pipeline::pipelined::InFlightQueue;
use crate::encoder::port::Port;
use crate::encoder::rc::RateController;
use crate::encoder::rc::RcTask;
use crate::encoder::task::TaskPool;
use crate::encoder::task::TaskProgress;
use crate::encoder::task::TaskRecord;
use crate::encoder::worker::Collaborators;
use crate::encoder::BackendError;
use crate::encoder::ControlCommand;
use crate::encoder::ControlReply;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::EncoderConfig;
use crate::encoder::ExecutionMode;
use crate::encoder::Frame;
use crate::encoder::FrameMetadata;
use crate::encoder::HeaderMode;
use crate::encoder::Packet;
use crate::encoder::PacketFlags;
use crate::encoder::SegmentKind;
use crate::encoder::SeiMode;

/// Result of a pipeline stage.
#[derive(Debug)]
pub(crate) enum StageOutcome {
    /// Proceed with the next stage.
    Continue,
    /// The stage cannot progress until one of the conditions is signaled.
    Retry(NotifyFlags),
    /// The task is over.
    Terminate(TaskOutcome),
}

/// How a task ended. Decides the flags of its final packet.
#[derive(Debug)]
pub(crate) enum TaskOutcome {
    Encoded,
    /// Dropped before encoding to match the output framerate.
    DroppedByFps,
    /// Dropped by the rate control after encoding.
    Dropped,
    /// Replaced with a skip frame.
    Skipped,
    /// End of stream marker without picture.
    EndOfStream,
    /// The frame was refused before any hardware was involved.
    Rejected(EncodeError),
    /// The codec or the hardware failed.
    Failed(EncodeError),
    /// Answered without encoding because the encoder was reset.
    Discarded,
}

type Stage = fn(&mut Pipeline, &mut TaskRecord) -> EncodeResult<StageOutcome>;

/// Stages up to the point where the task is ready for the hardware.
const ADMISSION: [Stage; 12] = [
    Pipeline::acquire_io,
    Pipeline::pair,
    Pipeline::hal_reset,
    Pipeline::check_fps_drop,
    Pipeline::output_buffer,
    Pipeline::hal_info,
    Pipeline::header,
    Pipeline::user_cfg,
    Pipeline::enc_start,
    Pipeline::dpb_commit,
    Pipeline::user_pskip,
    Pipeline::prepare_hw,
];

/// The three queues connecting the pipeline to the client.
#[derive(Clone)]
pub(crate) struct Ports {
    pub(crate) input: Port<Frame>,
    /// Input frames handed back once their packet was produced.
    pub(crate) returned: Port<Frame>,
    pub(crate) output: Port<Packet>,
}

pub(crate) struct Pipeline {
    pub(crate) ctx: EncoderContext,
    codec: Box<dyn EncoderImpl>,
    hal: Box<dyn EncoderHal>,
    rc: Box<dyn RateController>,
    dpb: Box<dyn DpbService>,
    pool: TaskPool,
    ports: Ports,
    /// Task being admitted, kept across calls while it waits for a condition.
    current: Option<TaskRecord>,
    /// Task whose reference snapshot is the one held by the reference service.
    stashed_seq: Option<u64>,
    /// Tasks whose hardware job was submitted, in submission order.
    in_flight: InFlightQueue,
}

fn frame_overrides(meta: &FrameMetadata) -> UserFrameConfig {
    UserFrameConfig {
        force_idr: meta.force_keyframe,
        force_pskip: meta.force_pskip,
        force_lt_ref: None,
    }
}

impl Pipeline {
    pub(crate) fn new(
        config: EncoderConfig,
        collaborators: Collaborators,
        ports: Ports,
    ) -> EncodeResult<Self> {
        let Collaborators {
            mut codec,
            hal,
            mut rc,
            dpb,
        } = collaborators;

        codec.configure(&config)?;
        rc.update_tunings(&config.tunings)?;

        log::debug!(
            "creating {:?} pipeline for {:?} {}x{}",
            config.mode,
            config.format,
            config.resolution.width,
            config.resolution.height
        );

        Ok(Self {
            pool: TaskPool::new(config.mode.task_count()),
            ctx: EncoderContext::new(config),
            codec,
            hal,
            rc,
            dpb,
            ports,
            current: None,
            stashed_seq: None,
            in_flight: Default::default(),
        })
    }

    /// Advances the pipeline as far as possible without waiting. Returns the conditions to wait
    /// for before calling again, or an empty set if progress was made.
    pub(crate) fn process(&mut self) -> NotifyFlags {
        // Partitioned frames are carried one at a time whatever the mode.
        if self.ctx.config.low_delay_partition() {
            return self.process_sync();
        }

        match self.ctx.config.mode {
            ExecutionMode::Synchronous => self.process_sync(),
            ExecutionMode::Pipelined { .. } => self.process_pipelined(),
        }
    }

    /// Whether a frame was admitted and its packet is not out yet, ie. the configuration cannot
    /// change now.
    pub(crate) fn is_mid_frame(&self) -> bool {
        self.current.as_ref().map_or(false, |t| t.is_paired())
    }

    fn run_stages(&mut self, task: &mut TaskRecord, stages: &[Stage]) -> StageOutcome {
        for stage in stages {
            match stage(self, task) {
                Ok(StageOutcome::Continue) => (),
                Ok(outcome) => return outcome,
                Err(e) => return StageOutcome::Terminate(TaskOutcome::Failed(e)),
            }
        }

        StageOutcome::Continue
    }

    fn acquire_io(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        if !task.is_done(TaskProgress::INPUT_READY) {
            match self.ports.input.dequeue() {
                Some(frame) => {
                    task.frame = Some(frame);
                    task.mark(TaskProgress::INPUT_READY);
                }
                None => return Ok(StageOutcome::Retry(NotifyFlags::INPUT)),
            }
        }

        if !task.is_done(TaskProgress::OUTPUT_READY) {
            match self.ports.output.try_reserve() {
                Some(slot) => {
                    task.slot = Some(slot);
                    task.mark(TaskProgress::OUTPUT_READY);
                }
                None => return Ok(StageOutcome::Retry(NotifyFlags::OUTPUT)),
            }
        }

        Ok(StageOutcome::Continue)
    }

    fn pair(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        if task.is_done(TaskProgress::FRAME_PAIRED) {
            return Ok(StageOutcome::Continue);
        }
        task.mark(TaskProgress::FRAME_PAIRED);
        self.ctx.stats.frames_admitted += 1;

        let frame = task.frame.as_ref().ok_or(EncodeError::InvalidInternalState)?;
        if frame.buffer.is_none() {
            if frame.meta.eos {
                log::debug!("end of stream at timestamp {}", frame.meta.timestamp);
                return Ok(StageOutcome::Terminate(TaskOutcome::EndOfStream));
            }

            return Ok(StageOutcome::Terminate(TaskOutcome::Rejected(
                EncodeError::MissingBuffer,
            )));
        }

        Ok(StageOutcome::Continue)
    }

    fn hal_reset(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        if task.is_done(TaskProgress::HAL_RESET) {
            return Ok(StageOutcome::Continue);
        }

        let seq = self.ctx.alloc_seq();
        task.seq = Some(seq);
        task.hal.reset(seq);
        task.hal.input = task.frame.as_ref().and_then(|f| f.buffer.clone());
        task.rc = RcTask {
            timestamp: task.timestamp(),
            ..Default::default()
        };

        log::trace!("task {} admitted at timestamp {}", seq, task.timestamp());
        task.mark(TaskProgress::HAL_RESET);
        Ok(StageOutcome::Continue)
    }

    fn check_fps_drop(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        if task.is_done(TaskProgress::FPS_DROP_CHECKED) {
            return Ok(StageOutcome::Continue);
        }
        task.mark(TaskProgress::FPS_DROP_CHECKED);

        if !self.rc.check_drop(&mut task.rc)? {
            return Ok(StageOutcome::Continue);
        }

        log::debug!("task {} dropped to match the output framerate", task.hal.seq);

        // The reference structure still has to see the overrides meant for this frame.
        let mut cfg = self.ctx.take_force();
        if let Some(frame) = &task.frame {
            cfg.merge(&frame_overrides(&frame.meta));
        }
        if !cfg.is_empty() {
            self.dpb.set_user_cfg(&cfg)?;
            // A snapshot taken before these overrides would undo them.
            self.stashed_seq = None;
        }

        task.hal.flags |= HalTaskFlags::DROP_BY_FPS;
        Ok(StageOutcome::Terminate(TaskOutcome::DroppedByFps))
    }

    fn output_buffer(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        if task.is_done(TaskProgress::OUTPUT_BUFFER_READY) {
            return Ok(StageOutcome::Continue);
        }

        // The buffer of the previous frame lost the room split off into its packet.
        match task.frame.as_mut().and_then(|f| f.output_buffer.take()) {
            Some(mut buffer) => {
                buffer.clear();
                task.hal.output = buffer;
            }
            None if task.hal.output.capacity() < self.ctx.config.output_buffer_size() => {
                task.hal.output.clear();
                task.hal.output.reserve(self.ctx.config.output_buffer_size());
            }
            None => (),
        }

        match self.hal.get_task(&mut task.hal) {
            Ok(()) => (),
            Err(BackendError::OutOfResources) => {
                log::trace!("task {} waits for hardware resources", task.hal.seq);
                return Ok(StageOutcome::Retry(NotifyFlags::EXTERNAL | NotifyFlags::TASK));
            }
            Err(e) => return Err(e.into()),
        }

        task.mark(TaskProgress::OUTPUT_BUFFER_READY);
        Ok(StageOutcome::Continue)
    }

    fn hal_info(&mut self, _task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        if self.ctx.take_info_dirty() {
            if let Err(e) = self.hal.update_info(&self.ctx.config) {
                self.ctx.mark_info_dirty();
                return Err(e.into());
            }
        }

        Ok(StageOutcome::Continue)
    }

    fn header(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        if task.is_done(TaskProgress::HEADER_EMITTED) {
            return Ok(StageOutcome::Continue);
        }

        if self.ctx.header_pending() {
            self.emit_header(task)?;
        }

        task.mark(TaskProgress::HEADER_EMITTED);
        Ok(StageOutcome::Continue)
    }

    fn user_cfg(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        if task.is_done(TaskProgress::USER_CFG_APPLIED) {
            return Ok(StageOutcome::Continue);
        }
        task.mark(TaskProgress::USER_CFG_APPLIED);

        let mut cfg = self.ctx.take_force();
        if let Some(frame) = &task.frame {
            cfg.merge(&frame_overrides(&frame.meta));
        }
        task.user_cfg = cfg;

        if cfg.force_pskip {
            // Dry run of the reference decision to validate the request.
            let mut info = Default::default();
            self.stash(task.hal.seq);
            let decided = self
                .dpb
                .set_user_cfg(&cfg)
                .and_then(|()| self.dpb.get_cpb(task.hal.seq, &mut info));
            self.rollback(task.hal.seq);
            decided?;

            if !Self::pskip_allowed(&cfg, &info) {
                log::debug!(
                    "task {} skip request rejected, frame is {:?}",
                    task.hal.seq,
                    info
                );
                task.user_cfg.force_pskip = false;
            }
        }

        task.mark(TaskProgress::PSKIP_CHECKED);
        Ok(StageOutcome::Continue)
    }

    fn enc_start(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        if !task.is_done(TaskProgress::ENC_STARTED) {
            self.codec.start(&mut task.hal)?;
            task.mark(TaskProgress::ENC_STARTED);
        }

        Ok(StageOutcome::Continue)
    }

    fn dpb_commit(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        if task.is_done(TaskProgress::DPB_STASHED) {
            return Ok(StageOutcome::Continue);
        }

        if !task.user_cfg.is_empty() {
            self.dpb.set_user_cfg(&task.user_cfg)?;
        }
        self.stash(task.hal.seq);

        task.mark(TaskProgress::DPB_STASHED);
        Ok(StageOutcome::Continue)
    }

    fn user_pskip(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        if task.user_cfg.force_pskip && !task.is_done(TaskProgress::HW_PREPARED) {
            return self.force_pskip(task);
        }

        Ok(StageOutcome::Continue)
    }

    fn prepare_hw(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        if task.is_done(TaskProgress::HW_PREPARED) {
            return Ok(StageOutcome::Continue);
        }

        if self.ctx.config.two_pass && self.dpb.next_frame_is_intra() {
            self.two_pass(task)?;
        }

        self.proc_dpb(task)?;
        self.codec.proc_hal(&mut task.hal)?;
        self.rc.frame_start(&mut task.rc)?;
        self.emit_prefix(task)?;

        task.hw_mark = (task.hal.length, task.hal.segments.len());
        self.rc.hal_start(&mut task.rc)?;
        self.hal.generate_registers(&mut task.hal, &task.rc)?;

        task.mark(TaskProgress::HW_PREPARED);
        Ok(StageOutcome::Continue)
    }

    fn hw_start(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        if !task.is_done(TaskProgress::HW_STARTED) {
            self.hal.start(&mut task.hal)?;
            task.mark(TaskProgress::HW_STARTED);
        }

        Ok(StageOutcome::Continue)
    }

    fn hw_wait(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        if !task.is_done(TaskProgress::COMPLETED) {
            self.hw_pass_end(task)?;
            task.mark(TaskProgress::COMPLETED);
        }

        Ok(StageOutcome::Continue)
    }

    fn frame_end(&mut self, task: &mut TaskRecord) -> EncodeResult<StageOutcome> {
        self.rc.frame_end(&mut task.rc)?;
        Ok(StageOutcome::Continue)
    }

    fn stash(&mut self, seq: u64) {
        self.dpb.stash();
        self.stashed_seq = Some(seq);
    }

    /// Whether the reference commit of frame `seq` can still be undone.
    fn holds_snapshot(&self, seq: u64) -> bool {
        self.stashed_seq == Some(seq)
    }

    /// Undoes the reference commit of frame `seq`. If a later frame was committed meanwhile, the
    /// snapshot is gone and the stream restarts with an IDR instead.
    fn rollback(&mut self, seq: u64) {
        if self.stashed_seq.take() == Some(seq) {
            self.dpb.rollback();
        } else {
            log::warn!("reference snapshot of frame {} was superseded", seq);
            self.ctx.request(UserFrameConfig {
                force_idr: true,
                ..Default::default()
            });
        }
    }

    /// Lets the reference service classify the frame and hands the decision to the codec.
    fn proc_dpb(&mut self, task: &mut TaskRecord) -> EncodeResult<()> {
        self.dpb.get_cpb(task.hal.seq, &mut task.rc.frame)?;
        task.hal.frame = task.rc.frame;
        self.codec.proc_dpb(&mut task.hal, &task.rc.frame)?;
        Ok(())
    }

    /// Waits for the running hardware pass and feeds its result to the rate control.
    fn hw_pass_end(&mut self, task: &mut TaskRecord) -> EncodeResult<()> {
        self.hal.wait(&mut task.hal)?;
        task.rc.bit_real = task.hal.hw_length as u64 * 8;
        task.rc.quality_real = task.hal.stats.avg_quality;
        self.rc.hal_end(&mut task.rc)?;
        Ok(())
    }

    /// Returns the stream header, generating it if the cached one was invalidated.
    fn stream_header(&mut self) -> EncodeResult<Bytes> {
        if let Some(header) = self.ctx.header() {
            return Ok(header.clone());
        }

        let mut out = BytesMut::new();
        self.codec.generate_header(&mut out)?;
        let header = out.freeze();
        log::debug!("generated {} bytes of stream header", header.len());

        self.ctx.set_header(header.clone());
        Ok(header)
    }

    fn emit_header(&mut self, task: &mut TaskRecord) -> EncodeResult<()> {
        let header = self.stream_header()?;
        task.hal.append(SegmentKind::Header, &header)?;
        task.hal.header_len = header.len();
        self.ctx.header_sent();
        Ok(())
    }

    /// Writes the software generated data carried in front of the coded frame.
    fn emit_prefix(&mut self, task: &mut TaskRecord) -> EncodeResult<()> {
        let frame = task.hal.frame;

        if frame.is_idr
            && self.ctx.config.header_mode == HeaderMode::EachIdr
            && task.hal.header_len == 0
            && task.hal.length == 0
        {
            self.emit_header(task)?;
        }

        let with_info = match self.ctx.config.sei_mode {
            SeiMode::Disabled => false,
            SeiMode::OneSeq => frame.is_idr,
            SeiMode::OneFrame => true,
        };
        if with_info {
            let info = format!(
                "cros-venc {} {:?} {:?} seq {}",
                env!("CARGO_PKG_VERSION"),
                self.ctx.config.format,
                self.ctx.config.tunings.rate_control,
                task.hal.seq
            );
            task.hal.sei_len += self
                .codec
                .add_prefix_data(&mut task.hal, PrefixData::EncoderInfo(&info))?;
        }

        let user_data = task.frame.as_ref().and_then(|f| f.meta.user_data.clone());
        if let Some(user_data) = user_data {
            task.hal.sei_len += self
                .codec
                .add_prefix_data(&mut task.hal, PrefixData::UserData(&user_data))?;
        }

        Ok(())
    }

    /// Runs the lookahead hardware pass of an intra frame. Leaves the task, the rate control
    /// state and the reference state as they were, except for `pass1_bits`.
    fn two_pass(&mut self, task: &mut TaskRecord) -> EncodeResult<()> {
        // The lookahead pass must be the only job on the hardware.
        self.drain_in_flight();

        log::debug!("task {} runs a lookahead pass", task.hal.seq);
        let saved_rc = task.rc.clone();
        let mark = (task.hal.length, task.hal.segments.len());

        let result = self.pass1(task);
        let pass1_bits = task.hal.hw_length as u64 * 8;

        self.rollback(task.hal.seq);
        self.stash(task.hal.seq);
        task.rc = saved_rc;
        task.hal.truncate(mark.0, mark.1);
        task.hal.hw_length = 0;
        task.hal.stats = Default::default();
        task.hal.flags.remove(HalTaskFlags::PASS1);

        result?;
        task.rc.pass1_bits = Some(pass1_bits);
        Ok(())
    }

    fn pass1(&mut self, task: &mut TaskRecord) -> EncodeResult<()> {
        self.dpb.get_cpb_pass1(task.hal.seq, &mut task.rc.frame)?;
        task.hal.frame = task.rc.frame;
        task.hal.flags.insert(HalTaskFlags::PASS1);

        self.codec.proc_dpb(&mut task.hal, &task.rc.frame)?;
        self.codec.proc_hal(&mut task.hal)?;
        self.hal.generate_registers(&mut task.hal, &task.rc)?;
        self.hal.start(&mut task.hal)?;
        self.hal.wait(&mut task.hal)?;
        Ok(())
    }

    /// Emits the final packet of `task` and returns its frame to the client.
    fn finish(&mut self, mut task: TaskRecord, outcome: TaskOutcome) {
        if task.frame.is_none() {
            // Nothing was admitted, only the reserved output room goes back.
            self.pool.recycle(task);
            return;
        }

        let seq = match task.seq {
            Some(seq) => seq,
            None => self.ctx.alloc_seq(),
        };

        let mut packet = Packet::empty(seq, task.timestamp());
        if task.hal.part.emitted > 0 {
            packet.flags.remove(PacketFlags::FRAME_START);
            packet.flags.insert(PacketFlags::PARTITION);
        }

        match outcome {
            TaskOutcome::Encoded => self.fill_packet(&mut packet, &mut task),
            TaskOutcome::Skipped => {
                self.fill_packet(&mut packet, &mut task);
                packet.flags.insert(PacketFlags::PSKIP);
                self.ctx.stats.frames_skipped += 1;
            }
            TaskOutcome::DroppedByFps => {
                packet.flags.insert(PacketFlags::DROP_BY_FPS);
                self.ctx.stats.frames_dropped += 1;
            }
            TaskOutcome::Dropped => {
                packet.flags.insert(PacketFlags::DROPPED);
                self.ctx.stats.frames_dropped += 1;
            }
            TaskOutcome::EndOfStream => (),
            TaskOutcome::Rejected(e) => {
                log::warn!("frame {} rejected: {}", seq, e);
                packet.flags.insert(PacketFlags::ERROR);
            }
            TaskOutcome::Failed(e) => {
                log::error!("failed to encode frame {}: {}", seq, e);
                if task.is_done(TaskProgress::DPB_STASHED) {
                    self.rollback(seq);
                }
                self.ctx.recover();
                packet.flags.insert(PacketFlags::ERROR);
            }
            TaskOutcome::Discarded => {
                log::debug!("frame {} discarded", seq);
                packet.flags.insert(PacketFlags::DISCARDED);
            }
        }

        if task.is_eos() {
            packet.flags.insert(PacketFlags::EOS);
        }

        log::trace!(
            "task {} emits {} bytes with {:?}",
            seq,
            packet.len(),
            packet.flags
        );

        // The frame goes back first, so a client holding the final packet can reclaim it.
        if let Some(frame) = task.frame.take() {
            self.ports.returned.force_enqueue(frame);
        }

        match task.slot.take() {
            Some(slot) => slot.fill(packet),
            None => self.ports.output.force_enqueue(packet),
        }
        self.ctx.stats.packets_emitted += 1;

        self.pool.recycle(task);
    }

    fn fill_packet(&self, packet: &mut Packet, task: &mut TaskRecord) {
        let hal = &mut task.hal;
        let frame = hal.frame;
        let partitioned = hal.part.emitted > 0;

        packet.segments = hal.segments_in(hal.part.emitted, hal.length);
        packet.data = hal.output.split().freeze();
        if !partitioned {
            packet.header_len = hal.header_len;
            packet.sei_len = hal.sei_len;
        }
        packet.temporal_id = frame.temporal_id;

        if frame.is_intra {
            packet.flags.insert(PacketFlags::INTRA);
        }
        if frame.is_idr {
            packet.flags.insert(PacketFlags::IDR);
        }
        if frame.is_lt_ref {
            packet.flags.insert(PacketFlags::LT_REF);
        }

        let mut stats = hal.stats;
        stats.bits = hal.length as u64 * 8;
        stats.start_quality = task.rc.quality_target;
        stats.ref_seq = frame.ref_seq;
        packet.stats = Some(stats);
    }

    /// Answers a task that will not be encoded, undoing its speculative reference commit.
    fn discard(&mut self, task: TaskRecord) {
        if task.is_done(TaskProgress::DPB_STASHED) {
            self.rollback(task.hal.seq);
        }
        self.finish(task, TaskOutcome::Discarded);
    }

    /// Retires every task, answers the queued frames without encoding them and restarts the
    /// stream with an IDR and a stream header.
    pub(crate) fn reset(&mut self) {
        log::debug!("resetting encoder pipeline");

        self.drain_in_flight();
        if let Some(task) = self.current.take() {
            self.discard(task);
        }

        for frame in self.ports.input.drain() {
            let seq = self.ctx.alloc_seq();
            let mut packet = Packet::empty(seq, frame.meta.timestamp);
            packet.flags.insert(PacketFlags::DISCARDED);
            if frame.meta.eos {
                packet.flags.insert(PacketFlags::EOS);
            }

            self.ports.returned.force_enqueue(frame);
            self.ports.output.force_enqueue(packet);
            self.ctx.stats.packets_emitted += 1;
        }

        self.ctx.request(UserFrameConfig {
            force_idr: true,
            ..Default::default()
        });
        self.ctx.invalidate_header();
    }

    /// Executes a control command. Frames in flight are completed first, so that the change
    /// takes effect on a frame boundary.
    pub(crate) fn control(&mut self, command: ControlCommand) -> EncodeResult<ControlReply> {
        self.drain_in_flight();
        log::debug!("control command {:?}", command);

        match command {
            ControlCommand::SetTunings(tunings) => {
                let mut config = self.ctx.config.clone();
                config.tunings = tunings;
                self.apply_config(config)?;
            }
            ControlCommand::SetConfig(config) => self.apply_config(config)?,
            ControlCommand::RequestIdr => self.ctx.request(UserFrameConfig {
                force_idr: true,
                ..Default::default()
            }),
            ControlCommand::RequestPskip => self.ctx.request(UserFrameConfig {
                force_pskip: true,
                ..Default::default()
            }),
            ControlCommand::MarkLongTermRef(index) => self.ctx.request(UserFrameConfig {
                force_lt_ref: Some(index),
                ..Default::default()
            }),
            ControlCommand::GetHeader => return Ok(ControlReply::Header(self.stream_header()?)),
            ControlCommand::GetStats => return Ok(ControlReply::Stats(self.ctx.stats)),
        }

        Ok(ControlReply::Done)
    }

    fn apply_config(&mut self, config: EncoderConfig) -> EncodeResult<()> {
        if self.ctx.apply_config(config)? {
            self.dpb.reset();
        }

        self.codec.configure(&self.ctx.config)?;
        self.rc.update_tunings(&self.ctx.config.tunings)?;
        Ok(())
    }

    /// Completes the submitted hardware jobs and answers the task being admitted. Called before
    /// the worker exits.
    pub(crate) fn shutdown(&mut self) {
        self.drain_in_flight();
        if let Some(task) = self.current.take() {
            self.discard(task);
        }
        log::debug!("pipeline stopped, stats {:?}", self.ctx.stats);
    }
}
