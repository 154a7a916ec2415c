// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the encoder pipeline run so
//! we can test it in isolation.
//!
//! The hardware is emulated in software and produces a fake bitstream that only looks like
//! H.264 from far away. Every collaborator records its calls in a shared [`Journal`], and the
//! behaviour of the rate control and of the hardware can be scripted to exercise the fallback
//! paths of the pipeline.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use anyhow::anyhow;
use byteorder::BigEndian;
use byteorder::ByteOrder;
use bytes::Bytes;
use bytes::BytesMut;

use crate::encoder::codec::EncoderImpl;
use crate::encoder::codec::PrefixData;
use crate::encoder::dpb::DpbService;
use crate::encoder::dpb::FrameInfo;
use crate::encoder::dpb::RefMode;
use crate::encoder::dpb::UserFrameConfig;
use crate::encoder::hal::EncoderHal;
use crate::encoder::hal::HalTask;
use crate::encoder::hal::HalTaskFlags;
use crate::encoder::rc::RateController;
use crate::encoder::rc::RcTask;
use crate::encoder::rc::RcVerdict;
use crate::encoder::worker::Collaborators;
use crate::encoder::BackendError;
use crate::encoder::BackendResult;
use crate::encoder::EncoderConfig;
use crate::encoder::Frame;
use crate::encoder::FrameMetadata;
use crate::encoder::RateControl;
use crate::encoder::SegmentKind;
use crate::encoder::SliceSplit;
use crate::encoder::Tunings;
use crate::Resolution;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

const NAL_SLICE: u8 = 0x41;
const NAL_IDR: u8 = 0x65;
const NAL_SEI: u8 = 0x06;
const NAL_SPS: u8 = 0x67;
const NAL_PPS: u8 = 0x68;

/// SEI payload type of unregistered user data.
const SEI_USER_DATA_UNREGISTERED: u8 = 5;

/// Side of a coding block, in pixels.
const BLOCK_SIZE: u32 = 16;

/// Default number of frames between two IDR frames.
const DEFAULT_GOP: u16 = 1024;

/// A call received by one of the dummy collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Configure,
    GenerateHeader,
    CodecStart,
    SoftwareEncode,
    PrefixData,
    UpdateInfo,
    GetTask,
    HalStart,
    HalWait,
    PartStart,
    PartWait,
    GetCpb,
    GetCpbPass1,
    Stash,
    Rollback,
    DpbReset,
    FrameStart,
    FrameEnd,
}

/// Ordered record of the calls made to the dummy collaborators.
#[derive(Debug, Default)]
pub struct Journal {
    calls: Mutex<Vec<Call>>,
}

impl Journal {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: Call) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == call)
            .count()
    }

    /// Whether every rollback of the reference state undoes exactly one earlier stash.
    pub fn stash_rollback_balanced(&self) -> bool {
        let mut stashed = false;
        for call in self.calls.lock().unwrap().iter() {
            match call {
                Call::Stash => stashed = true,
                Call::Rollback if !stashed => return false,
                Call::Rollback => stashed = false,
                _ => (),
            }
        }
        true
    }

    /// Whether no other hardware job was outstanding when a lookahead pass started.
    pub fn pass1_ran_alone(&self) -> bool {
        let mut outstanding = 0i64;
        for call in self.calls.lock().unwrap().iter() {
            match call {
                Call::HalStart => outstanding += 1,
                Call::HalWait => outstanding -= 1,
                Call::GetCpbPass1 if outstanding != 0 => return false,
                _ => (),
            }
        }
        true
    }
}

/// A hardware job, from register generation to completion.
#[derive(Debug, Default)]
struct Job {
    quality: u32,
    /// Number of coded bytes the job will produce.
    len: usize,
    slices: usize,
    /// Number of slices already produced.
    produced: usize,
    /// Number of readiness polls before the job reports completion.
    ready_in: usize,
}

/// Scripted behaviour shared by the collaborators of one backend.
#[derive(Debug, Default)]
struct Script {
    drops: VecDeque<bool>,
    verdicts: VecDeque<RcVerdict>,
    fail_wait_at: Option<usize>,
    waits: usize,
    fail_part_at: Option<usize>,
    part_waits: usize,
    exhausted: usize,
    latency: usize,
    jobs: HashMap<u64, Job>,
}

/// Factory of software collaborators sharing one script and one journal.
#[derive(Clone)]
pub struct DummyBackend {
    script: Arc<Mutex<Script>>,
    journal: Arc<Journal>,
    gop: u16,
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyBackend {
    pub fn new() -> Self {
        Self::with_gop(DEFAULT_GOP)
    }

    /// Creates a backend producing an IDR frame every `gop` frames.
    pub fn with_gop(gop: u16) -> Self {
        Self {
            script: Default::default(),
            journal: Default::default(),
            gop: gop.max(1),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            codec: Box::new(DummyCodec {
                journal: Arc::clone(&self.journal),
                config: Default::default(),
            }),
            hal: Box::new(DummyHal {
                script: Arc::clone(&self.script),
                journal: Arc::clone(&self.journal),
                config: Default::default(),
            }),
            rc: Box::new(ScriptedRc {
                script: Arc::clone(&self.script),
                journal: Arc::clone(&self.journal),
                tunings: Default::default(),
                fps_acc: 0,
            }),
            dpb: Box::new(SimpleDpb::new(self.gop, Arc::clone(&self.journal))),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// Answers of the framerate drop check, one per admitted frame.
    pub fn script_drop(&self, drops: &[bool]) {
        self.script().drops.extend(drops);
    }

    /// Answers of the reencode check, one per completed hardware pass.
    pub fn script_verdicts(&self, verdicts: &[RcVerdict]) {
        self.script().verdicts.extend(verdicts);
    }

    /// Makes the `n`th (zero based) hardware wait fail.
    pub fn fail_wait_at(&self, n: usize) {
        self.script().fail_wait_at = Some(n);
    }

    /// Makes the `n`th (zero based) slice wait fail.
    pub fn fail_part_at(&self, n: usize) {
        self.script().fail_part_at = Some(n);
    }

    /// Makes the next `n` resource requests fail with [`BackendError::OutOfResources`].
    pub fn exhaust_resources(&self, n: usize) {
        self.script().exhausted = n;
    }

    /// Number of readiness polls each hardware job answers negatively before completing.
    pub fn set_latency(&self, polls: usize) {
        self.script().latency = polls;
    }
}

/// Codec syntax generator writing fake NAL units.
struct DummyCodec {
    journal: Arc<Journal>,
    config: EncoderConfig,
}

impl DummyCodec {
    fn nal(nal_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut nal = Vec::with_capacity(START_CODE.len() + 1 + payload.len());
        nal.extend_from_slice(&START_CODE);
        nal.push(nal_type);
        nal.extend_from_slice(payload);
        nal
    }

    fn sei(payload: &[u8]) -> Vec<u8> {
        let mut sei = vec![SEI_USER_DATA_UNREGISTERED];
        let mut size = payload.len();
        while size >= 0xff {
            sei.push(0xff);
            size -= 0xff;
        }
        sei.push(size as u8);
        sei.extend_from_slice(payload);
        Self::nal(NAL_SEI, &sei)
    }
}

impl EncoderImpl for DummyCodec {
    fn configure(&mut self, config: &EncoderConfig) -> BackendResult<()> {
        self.journal.record(Call::Configure);
        self.config = config.clone();
        Ok(())
    }

    fn generate_header(&mut self, out: &mut BytesMut) -> BackendResult<()> {
        self.journal.record(Call::GenerateHeader);

        let mut sps = [0u8; 6];
        BigEndian::write_u16(&mut sps[0..2], self.config.resolution.width as u16);
        BigEndian::write_u16(&mut sps[2..4], self.config.resolution.height as u16);
        sps[4] = self.config.format as u8;
        sps[5] = match self.config.tunings.rate_control {
            RateControl::ConstantBitrate(_) => 0,
            RateControl::ConstantQuality(_) => 1,
        };

        out.extend_from_slice(&Self::nal(NAL_SPS, &sps));
        out.extend_from_slice(&Self::nal(NAL_PPS, &[0xce, 0x3c, 0x80]));
        Ok(())
    }

    fn start(&mut self, _task: &mut HalTask) -> BackendResult<()> {
        self.journal.record(Call::CodecStart);
        Ok(())
    }

    fn proc_dpb(&mut self, task: &mut HalTask, frame: &FrameInfo) -> BackendResult<()> {
        if frame.seq != task.seq {
            return Err(BackendError::Other(anyhow!(
                "frame {} classified as {}",
                task.seq,
                frame.seq
            )));
        }
        Ok(())
    }

    fn proc_hal(&mut self, _task: &mut HalTask) -> BackendResult<()> {
        Ok(())
    }

    fn software_encode(&mut self, task: &mut HalTask) -> BackendResult<()> {
        self.journal.record(Call::SoftwareEncode);

        let mut payload = [0u8; 4];
        BigEndian::write_u32(&mut payload, task.seq as u32);
        task.append(SegmentKind::Pskip, &Self::nal(NAL_SLICE, &payload))?;
        Ok(())
    }

    fn add_prefix_data(&mut self, task: &mut HalTask, data: PrefixData) -> BackendResult<usize> {
        self.journal.record(Call::PrefixData);

        let (kind, payload) = match data {
            PrefixData::EncoderInfo(info) => (SegmentKind::Sei, info.as_bytes()),
            PrefixData::UserData(data) => (SegmentKind::UserData, data),
        };
        task.append(kind, &Self::sei(payload))
    }
}

/// Number of slices a frame of `len` coded bytes is split into.
fn slice_count(config: &EncoderConfig, len: usize) -> usize {
    match config.split {
        SliceSplit::Disabled => 1,
        SliceSplit::ByBlocks(n) => {
            let aligned = config.resolution.align(BLOCK_SIZE);
            let blocks = (aligned.width / BLOCK_SIZE) * (aligned.height / BLOCK_SIZE);
            blocks.div_ceil(n.max(1)) as usize
        }
        SliceSplit::ByBytes(n) => len.div_ceil(n.max(1) as usize),
    }
    .max(1)
}

/// Software emulation of the encoder hardware.
struct DummyHal {
    script: Arc<Mutex<Script>>,
    journal: Arc<Journal>,
    config: EncoderConfig,
}

impl DummyHal {
    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    fn block_count(&self) -> u32 {
        let aligned = self.config.resolution.align(BLOCK_SIZE);
        (aligned.width / BLOCK_SIZE) * (aligned.height / BLOCK_SIZE)
    }

    /// Produces slice `index` of `job`.
    fn slice(task: &HalTask, job: &Job, index: usize) -> Vec<u8> {
        let slice_len = job.len / job.slices;
        let len = if index + 1 == job.slices {
            job.len - slice_len * index
        } else {
            slice_len
        };

        let crc = crc32fast::hash(task.input.as_deref().unwrap_or_default());
        let nal_type = if task.frame.is_idr { NAL_IDR } else { NAL_SLICE };

        let mut slice = Vec::with_capacity(START_CODE.len() + 1 + len);
        slice.extend_from_slice(&START_CODE);
        slice.push(nal_type);

        let mut fields = [0u8; 8];
        BigEndian::write_u32(&mut fields[0..4], crc);
        BigEndian::write_u16(&mut fields[4..6], index as u16);
        BigEndian::write_u16(&mut fields[6..8], job.quality as u16);
        slice.extend_from_slice(&fields);

        let filler = crc.to_be_bytes();
        slice.extend((0..len.saturating_sub(fields.len())).map(|i| filler[i % 4] | 0x01));
        slice
    }

    fn update_stats(&self, task: &mut HalTask, quality: u32) {
        let blocks = self.block_count();
        task.stats.avg_quality = quality;
        if task.frame.is_intra {
            task.stats.intra_blocks = blocks;
            task.stats.inter_blocks = 0;
        } else {
            task.stats.intra_blocks = blocks / 16;
            task.stats.inter_blocks = blocks - blocks / 16;
        }
        task.stats.skip_blocks = 0;
    }
}

impl EncoderHal for DummyHal {
    fn update_info(&mut self, config: &EncoderConfig) -> BackendResult<()> {
        self.journal.record(Call::UpdateInfo);
        self.config = config.clone();
        Ok(())
    }

    fn get_task(&mut self, _task: &mut HalTask) -> BackendResult<()> {
        self.journal.record(Call::GetTask);

        let mut script = self.script();
        if script.exhausted > 0 {
            script.exhausted -= 1;
            return Err(BackendError::OutOfResources);
        }
        Ok(())
    }

    fn generate_registers(&mut self, task: &mut HalTask, rc: &RcTask) -> BackendResult<()> {
        let quality = rc.quality_target.min(51);
        let base = if task.frame.is_intra { 192 } else { 48 };
        let len = base + (51 - quality) as usize * 2;

        let job = Job {
            quality,
            len,
            slices: slice_count(&self.config, len),
            ..Default::default()
        };
        log::trace!("job {} registers: {:?}", task.seq, job);
        self.script().jobs.insert(task.seq, job);
        Ok(())
    }

    fn start(&mut self, task: &mut HalTask) -> BackendResult<()> {
        self.journal.record(Call::HalStart);

        let mut script = self.script();
        let latency = script.latency;
        let job = script
            .jobs
            .get_mut(&task.seq)
            .ok_or_else(|| anyhow!("job {} started without registers", task.seq))?;
        job.ready_in = latency;
        Ok(())
    }

    fn is_ready(&self, task: &HalTask) -> bool {
        match self.script().jobs.get_mut(&task.seq) {
            Some(job) if job.ready_in > 0 => {
                job.ready_in -= 1;
                false
            }
            _ => true,
        }
    }

    fn wait(&mut self, task: &mut HalTask) -> BackendResult<()> {
        self.journal.record(Call::HalWait);

        let job = {
            let mut script = self.script();
            let n = script.waits;
            script.waits += 1;
            let job = script.jobs.remove(&task.seq);
            if script.fail_wait_at == Some(n) {
                return Err(BackendError::Timeout);
            }
            job.ok_or_else(|| anyhow!("job {} was never started", task.seq))?
        };

        let start = task.length;
        for index in 0..job.slices {
            task.append(SegmentKind::Slice, &Self::slice(task, &job, index))?;
        }
        task.hw_length = task.length - start;
        self.update_stats(task, job.quality);

        if task.flags.contains(HalTaskFlags::PASS1) {
            log::trace!("lookahead pass of {} produced {} bytes", task.seq, task.hw_length);
        }
        Ok(())
    }

    fn part_start(&mut self, task: &mut HalTask) -> BackendResult<()> {
        self.journal.record(Call::PartStart);

        if !self.script().jobs.contains_key(&task.seq) {
            return Err(BackendError::Other(anyhow!(
                "slice of {} started without registers",
                task.seq
            )));
        }
        Ok(())
    }

    fn part_wait(&mut self, task: &mut HalTask) -> BackendResult<()> {
        self.journal.record(Call::PartWait);

        let mut script = self.script();
        let n = script.part_waits;
        script.part_waits += 1;
        if script.fail_part_at == Some(n) {
            script.jobs.remove(&task.seq);
            return Err(BackendError::Timeout);
        }

        let job = script
            .jobs
            .get_mut(&task.seq)
            .ok_or_else(|| anyhow!("no slice pending for {}", task.seq))?;
        let index = job.produced;
        let slice = Self::slice(task, job, index);
        job.produced += 1;
        let quality = job.quality;
        let last = job.produced == job.slices;
        if last {
            script.jobs.remove(&task.seq);
        }
        drop(script);

        let written = task.append(SegmentKind::Slice, &slice)?;
        task.hw_length += written;
        task.part.index = index as u32;
        task.part.end = task.length;
        task.part.last = last;
        self.update_stats(task, quality);
        Ok(())
    }
}

/// Rate control answering from a script, and otherwise keeping the quality in the middle of the
/// allowed range.
struct ScriptedRc {
    script: Arc<Mutex<Script>>,
    journal: Arc<Journal>,
    tunings: Tunings,
    /// Output framerate accumulator of the framerate conversion.
    fps_acc: u32,
}

impl RateController for ScriptedRc {
    fn update_tunings(&mut self, tunings: &Tunings) -> BackendResult<()> {
        if tunings.framerate == 0 {
            return Err(BackendError::Other(anyhow!("framerate cannot be 0")));
        }
        self.tunings = tunings.clone();
        self.fps_acc = 0;
        Ok(())
    }

    fn check_drop(&mut self, _task: &mut RcTask) -> BackendResult<bool> {
        if let Some(drop) = self.script.lock().unwrap().drops.pop_front() {
            return Ok(drop);
        }

        let Some(output) = self.tunings.output_framerate else {
            return Ok(false);
        };

        // Keep `output` frames out of every `framerate` ones.
        self.fps_acc += output.min(self.tunings.framerate);
        if self.fps_acc < self.tunings.framerate {
            return Ok(true);
        }
        self.fps_acc -= self.tunings.framerate;
        Ok(false)
    }

    fn frame_start(&mut self, task: &mut RcTask) -> BackendResult<()> {
        self.journal.record(Call::FrameStart);

        task.quality_min = self.tunings.min_quality;
        task.quality_max = self.tunings.max_quality;
        match self.tunings.rate_control {
            RateControl::ConstantBitrate(bitrate) => {
                let mut target = bitrate / self.tunings.framerate as u64;
                if task.frame.is_intra {
                    target *= 4;
                }
                task.bit_target = target;
                task.bit_min = target / 2;
                task.bit_max = target * 2;
                task.quality_target = (task.quality_min + task.quality_max) / 2;
            }
            RateControl::ConstantQuality(quality) => {
                task.bit_target = 0;
                task.bit_min = 0;
                task.bit_max = u64::MAX;
                task.quality_target = quality.clamp(task.quality_min, task.quality_max);
            }
        }
        Ok(())
    }

    fn hal_start(&mut self, task: &mut RcTask) -> BackendResult<()> {
        // A pass already ran, so this is a reencode of an oversized frame.
        if task.bit_real > task.bit_max {
            task.quality_target = (task.quality_target + 4).min(task.quality_max);
        }
        Ok(())
    }

    fn hal_end(&mut self, task: &mut RcTask) -> BackendResult<()> {
        log::trace!(
            "frame at {} produced {} bits for a target of {}",
            task.timestamp,
            task.bit_real,
            task.bit_target
        );
        Ok(())
    }

    fn check_reencode(&mut self, task: &mut RcTask) -> BackendResult<RcVerdict> {
        if let Some(verdict) = self.script.lock().unwrap().verdicts.pop_front() {
            return Ok(verdict);
        }

        if task.bit_real > task.bit_max && task.quality_target < task.quality_max {
            return Ok(RcVerdict::Reencode);
        }
        Ok(RcVerdict::Accept)
    }

    fn frame_end(&mut self, _task: &mut RcTask) -> BackendResult<()> {
        self.journal.record(Call::FrameEnd);
        Ok(())
    }
}

/// Reference state of [`SimpleDpb`].
#[derive(Debug, Clone, Default)]
struct DpbState {
    /// Position in the current group of pictures.
    counter: usize,
    /// Last frame usable as reference.
    last_ref: Option<u64>,
    long_term: HashMap<u8, u64>,
    pending: UserFrameConfig,
}

/// Low delay prediction structure: an IDR frame every `limit` frames, every other frame
/// predicted from the previous reference frame.
struct SimpleDpb {
    state: DpbState,
    stashed: Option<DpbState>,
    limit: u16,
    journal: Arc<Journal>,
}

impl SimpleDpb {
    fn new(limit: u16, journal: Arc<Journal>) -> Self {
        Self {
            state: Default::default(),
            stashed: None,
            limit: limit.max(1),
            journal,
        }
    }

    fn classify(&mut self, seq: u64) -> FrameInfo {
        let state = &mut self.state;
        let user = std::mem::take(&mut state.pending);

        let mut info = FrameInfo {
            seq,
            ..Default::default()
        };

        if state.counter == 0 || user.force_idr || state.last_ref.is_none() {
            log::trace!("frame {} is an IDR", seq);
            info.is_idr = true;
            info.is_intra = true;
            state.long_term.clear();
            state.last_ref = Some(seq);
            state.counter = 1 % self.limit as usize;
        } else if user.force_pskip {
            info.is_pskip = true;
            info.is_non_ref = true;
            info.ref_mode = RefMode::PrevFrame;
            info.ref_seq = state.last_ref;
            state.counter = (state.counter + 1) % self.limit as usize;
        } else {
            info.ref_mode = RefMode::PrevFrame;
            info.ref_seq = state.last_ref;
            state.last_ref = Some(seq);
            state.counter = (state.counter + 1) % self.limit as usize;
        }

        if let Some(index) = user.force_lt_ref {
            info.is_lt_ref = true;
            state.long_term.insert(index, seq);
        }

        info
    }
}

impl DpbService for SimpleDpb {
    fn set_user_cfg(&mut self, cfg: &UserFrameConfig) -> BackendResult<()> {
        self.state.pending.merge(cfg);
        Ok(())
    }

    fn get_cpb(&mut self, seq: u64, out: &mut FrameInfo) -> BackendResult<()> {
        self.journal.record(Call::GetCpb);
        *out = self.classify(seq);
        Ok(())
    }

    fn get_cpb_pass1(&mut self, seq: u64, out: &mut FrameInfo) -> BackendResult<()> {
        self.journal.record(Call::GetCpbPass1);
        *out = self.classify(seq);
        Ok(())
    }

    fn stash(&mut self) {
        self.journal.record(Call::Stash);
        self.stashed = Some(self.state.clone());
    }

    fn rollback(&mut self) {
        self.journal.record(Call::Rollback);
        match self.stashed.take() {
            Some(state) => self.state = state,
            None => log::warn!("reference rollback without snapshot"),
        }
    }

    fn next_frame_is_intra(&self) -> bool {
        self.state.counter == 0 || self.state.last_ref.is_none() || self.state.pending.force_idr
    }

    fn reset(&mut self) {
        self.journal.record(Call::DpbReset);
        let pending = self.state.pending;
        self.state = DpbState {
            pending,
            ..Default::default()
        };
        self.stashed = None;
    }
}

/// Produces NV12 frames showing a dot moving over a gradient.
pub struct FrameGenerator {
    resolution: Resolution,
    timestamp: u64,
}

impl FrameGenerator {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            timestamp: 0,
        }
    }

    pub fn next_frame(&mut self) -> Frame {
        let width = self.resolution.width as usize;
        let height = self.resolution.height as usize;
        let mut raw = vec![0u8; width * height * 3 / 2];
        fill_test_frame(width, height, self.timestamp as f32 * 0.1, &mut raw);

        let meta = FrameMetadata {
            timestamp: self.timestamp,
            display_resolution: self.resolution,
            ..Default::default()
        };
        self.timestamp += 1;

        Frame::new(meta, Bytes::from(raw))
    }
}

impl Iterator for FrameGenerator {
    type Item = Frame;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_frame())
    }
}

/// Fills a tightly packed NV12 picture at time `t`.
fn fill_test_frame(width: usize, height: usize, t: f32, raw: &mut [u8]) {
    let (sin, cos) = f32::sin_cos(t);
    let (sin2, cos2) = (sin.powi(2), cos.powi(2));

    let dot_col = height as f32 * (1.1 + 2.0 * sin * cos) / 2.2;
    let dot_row = width as f32 * (1.1 + sin) / 2.2;
    let dot_size2 = (width.min(height) as f32 * 0.05).powi(2);

    let (luma, chroma) = raw.split_at_mut(width * height);

    for (row, line) in luma.chunks_exact_mut(width).enumerate() {
        for (col, y) in line.iter_mut().enumerate() {
            let dist = (dot_col - col as f32).powi(2) + (dot_row - row as f32).powi(2);
            *y = if dist < dot_size2 {
                0
            } else {
                (255 * (row + col) / (width + height)) as u8
            };
        }
    }

    for (row, line) in chroma.chunks_exact_mut(width).enumerate() {
        let row = row * 2;
        for (col, uv) in line.chunks_exact_mut(2).enumerate() {
            let col = col * 2;
            let dist = (dot_col - col as f32).powi(2) + (dot_row - row as f32).powi(2);
            let c = if dist < dot_size2 {
                (128.0, 128.0)
            } else {
                (
                    ((row * 255) / width) as f32 * sin2,
                    ((col * 255) / height) as f32 * cos2,
                )
            };
            uv[0] = c.0 as u8;
            uv[1] = c.1 as u8;
        }
    }
}
