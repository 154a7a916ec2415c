// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware encoder control plane.
//!
//! An [`Encoder`] owns one worker thread that pulls [`Frame`]s from the input port, carries
//! each of them through the encoding pipeline and pushes the resulting [`Packet`]s to the
//! output port. The pipeline either runs one frame at a time
//! ([`ExecutionMode::Synchronous`]) or overlaps the hardware job of one frame with the
//! preparation of the next ([`ExecutionMode::Pipelined`]).

pub mod codec;
pub(crate) mod context;
pub mod dpb;
pub mod hal;
pub mod notify;
pub(crate) mod pipeline;
pub mod port;
pub mod rc;
pub(crate) mod task;
pub mod worker;

use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;
use bytes::BytesMut;
use thiserror::Error;

use crate::encoder::notify::GateStats;
use crate::encoder::port::PortTimeout;
use crate::EncodedFormat;
use crate::Resolution;

pub use crate::encoder::worker::Collaborators;
pub use crate::encoder::worker::Encoder;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error("hardware did not complete the job in time")]
    Timeout,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by the codec, hardware, rate control and reference collaborators.
pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("unsupported")]
    Unsupported,
    #[error("input frame has no backing buffer")]
    MissingBuffer,
    #[error("output buffer of {capacity} bytes cannot hold {required} bytes")]
    OutputBufferTooSmall { capacity: usize, required: usize },
    #[error("invalid internal state. This is likely a bug.")]
    InvalidInternalState,
    #[error("encoder worker is not running")]
    NotRunning,
    #[error("timed out")]
    Timeout,
    #[error("queue is full")]
    QueueFull,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type EncodeResult<T> = Result<T, EncodeError>;

/// Specifies the encoder operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateControl {
    /// The encoder shall maintain the constant bitrate
    ConstantBitrate(u64),

    /// The encoder shall maintain codec specific quality parameter constant (eg. QP for H.264)
    /// disregarding bitrate.
    ConstantQuality(u32),
}

impl RateControl {
    pub(crate) fn is_same_variant(left: &Self, right: &Self) -> bool {
        std::mem::discriminant(left) == std::mem::discriminant(right)
    }
}

/// Dynamic parameters of the encoded stream that client may choose to change during the encoding
/// session without recreating the entire encoder instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunings {
    /// The stream's [`RateControl`]
    pub rate_control: RateControl,
    /// Stream framerate in frames per second
    pub framerate: u32,
    /// Output framerate. Frames exceeding it are dropped by the rate control. `None` keeps the
    /// input framerate.
    pub output_framerate: Option<u32>,
    /// Minimum value of codec specific quality parameter constant (eg. QP for H.264)
    pub min_quality: u32,
    /// Maximum value of codec specific quality parameter constant (eg. QP for H.264)
    pub max_quality: u32,
}

impl Default for Tunings {
    fn default() -> Self {
        Self {
            rate_control: RateControl::ConstantBitrate(200_000),
            framerate: 30,
            output_framerate: None,
            min_quality: 0,
            max_quality: 51,
        }
    }
}

/// Encoder's input metadata
#[derive(Clone, Debug, Default)]
pub struct FrameMetadata {
    pub timestamp: u64,
    pub display_resolution: Resolution,
    /// The frame shall be encoded as an IDR.
    pub force_keyframe: bool,
    /// The frame shall be replaced with a skip frame if the reference structure allows it.
    pub force_pskip: bool,
    /// Last frame of the stream.
    pub eos: bool,
    /// Unregistered user data to be carried in front of the frame.
    pub user_data: Option<Bytes>,
}

/// Input picture handed to the encoder.
#[derive(Debug, Default)]
pub struct Frame {
    pub meta: FrameMetadata,
    /// Picture content. A frame without one is only valid as an end-of-stream marker.
    pub buffer: Option<Bytes>,
    /// Client supplied output buffer. The encoder allocates one if absent.
    pub output_buffer: Option<BytesMut>,
}

impl Frame {
    pub fn new(meta: FrameMetadata, buffer: Bytes) -> Self {
        Self {
            meta,
            buffer: Some(buffer),
            output_buffer: None,
        }
    }

    /// Creates an end-of-stream marker carrying no picture.
    pub fn eos(timestamp: u64) -> Self {
        Self {
            meta: FrameMetadata {
                timestamp,
                eos: true,
                ..Default::default()
            },
            buffer: None,
            output_buffer: None,
        }
    }

    pub fn with_output_buffer(mut self, output: BytesMut) -> Self {
        self.output_buffer = Some(output);
        self
    }
}

bitflags! {
    /// Properties of an output [`Packet`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u32 {
        const EOS = 1 << 0;
        const INTRA = 1 << 1;
        const IDR = 1 << 2;
        const LT_REF = 1 << 3;
        /// The packet is one slice of a frame emitted in low delay mode.
        const PARTITION = 1 << 4;
        /// First packet of a frame.
        const FRAME_START = 1 << 5;
        /// Last packet of a frame.
        const FRAME_END = 1 << 6;
        /// Dropped to match the output framerate.
        const DROP_BY_FPS = 1 << 7;
        /// Dropped by the rate control after encoding.
        const DROPPED = 1 << 8;
        /// Replaced with a skip frame.
        const PSKIP = 1 << 9;
        /// Encoding failed. The next frame will be an IDR with a stream header.
        const ERROR = 1 << 10;
        /// Answered without encoding because the encoder was reset.
        const DISCARDED = 1 << 11;
    }
}

/// Type of a byte range within a [`Packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Header,
    Sei,
    UserData,
    Slice,
    Pskip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSegment {
    pub kind: SegmentKind,
    pub offset: usize,
    pub len: usize,
}

/// Per-frame statistics reported by the hardware and the rate control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub intra_blocks: u32,
    pub inter_blocks: u32,
    pub skip_blocks: u32,
    pub avg_quality: u32,
    pub start_quality: u32,
    /// Sequence index of the reference the frame was predicted from.
    pub ref_seq: Option<u64>,
    /// Number of bits produced for the frame.
    pub bits: u64,
}

/// Encoder's coded output.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Sequence index of the frame this packet belongs to.
    pub seq: u64,
    pub timestamp: u64,
    pub flags: PacketFlags,
    pub data: Bytes,
    pub segments: Vec<PacketSegment>,
    pub header_len: usize,
    pub sei_len: usize,
    pub temporal_id: u8,
    pub stats: Option<FrameStats>,
}

impl Packet {
    pub(crate) fn empty(seq: u64, timestamp: u64) -> Self {
        Self {
            seq,
            timestamp,
            flags: PacketFlags::FRAME_START | PacketFlags::FRAME_END,
            data: Bytes::new(),
            segments: Vec::new(),
            header_len: 0,
            sei_len: 0,
            temporal_id: 0,
            stats: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_idr(&self) -> bool {
        self.flags.contains(PacketFlags::IDR)
    }

    pub fn is_eos(&self) -> bool {
        self.flags.contains(PacketFlags::EOS)
    }

    /// Whether this is the last packet of its frame.
    pub fn is_frame_end(&self) -> bool {
        self.flags.contains(PacketFlags::FRAME_END)
    }
}

impl From<Packet> for Vec<u8> {
    fn from(value: Packet) -> Self {
        value.data.to_vec()
    }
}

/// How frames are carried through the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One frame is carried from admission to output before the next one is admitted. Used with
    /// single buffered hardware.
    Synchronous,
    /// Up to `tasks` frames are in flight. The hardware job of one frame overlaps the
    /// preparation of the next.
    Pipelined { tasks: usize },
}

impl ExecutionMode {
    pub(crate) fn task_count(&self) -> usize {
        match self {
            ExecutionMode::Synchronous => 1,
            ExecutionMode::Pipelined { tasks } => (*tasks).max(1),
        }
    }
}

/// Splitting of a frame into independently decodable slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SliceSplit {
    #[default]
    Disabled,
    /// A new slice starts after the given number of bytes.
    ByBytes(u32),
    /// A new slice starts after the given number of coding blocks.
    ByBlocks(u32),
}

/// When the stream header (eg. SPS/PPS for H.264) is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderMode {
    /// Only when the cached header became invalid, ie. on the first frame and after a
    /// configuration change or an error.
    #[default]
    FirstFrame,
    /// In front of every IDR frame.
    EachIdr,
}

/// When the encoder information SEI is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeiMode {
    #[default]
    Disabled,
    /// In front of every IDR frame.
    OneSeq,
    /// In front of every frame.
    OneFrame,
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub format: EncodedFormat,
    pub resolution: Resolution,
    pub tunings: Tunings,
    pub mode: ExecutionMode,
    /// Maximum number of additional hardware passes the rate control may ask for a frame.
    pub max_reencode_times: u32,
    pub split: SliceSplit,
    /// Emit every slice as its own packet as soon as the hardware produced it. Only effective
    /// together with [`SliceSplit`].
    pub low_delay: bool,
    pub header_mode: HeaderMode,
    pub sei_mode: SeiMode,
    /// Run a lookahead hardware pass ahead of intra frames to stabilize their quality.
    pub two_pass: bool,
    pub input_queue_depth: usize,
    pub output_queue_depth: usize,
    pub input_timeout: PortTimeout,
    pub output_timeout: PortTimeout,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        // Artificially encoder configuration with intent to be widely supported.
        Self {
            format: EncodedFormat::H264,
            resolution: Resolution {
                width: 320,
                height: 240,
            },
            tunings: Default::default(),
            mode: ExecutionMode::Synchronous,
            max_reencode_times: 1,
            split: SliceSplit::Disabled,
            low_delay: false,
            header_mode: HeaderMode::FirstFrame,
            sei_mode: SeiMode::Disabled,
            two_pass: false,
            input_queue_depth: 4,
            output_queue_depth: 4,
            input_timeout: PortTimeout::Blocking,
            output_timeout: PortTimeout::Timed(Duration::from_millis(100)),
        }
    }
}

impl EncoderConfig {
    /// Whether slices are emitted as separate packets.
    pub fn low_delay_partition(&self) -> bool {
        self.low_delay && self.split != SliceSplit::Disabled
    }

    /// Size of the output buffer allocated when the client did not supply one.
    pub(crate) fn output_buffer_size(&self) -> usize {
        let aligned = self.resolution.align(self.format.block_alignment());
        aligned.get_area() * self.format.output_size_multiplier() / 8
    }

    /// Whether switching from `self` to `other` invalidates the stream header.
    pub(crate) fn requires_resync(&self, other: &Self) -> bool {
        self.format != other.format
            || self.resolution != other.resolution
            || self.split != other.split
            || !RateControl::is_same_variant(
                &self.tunings.rate_control,
                &other.tunings.rate_control,
            )
    }
}

/// Commands served by the worker thread between frames.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    /// Change rate control parameters. Takes effect on the next admitted frame.
    SetTunings(Tunings),
    /// Change the stream configuration. Forces a new stream header. The execution mode and
    /// the queue depths cannot be changed.
    SetConfig(EncoderConfig),
    /// Encode the next admitted frame as an IDR.
    RequestIdr,
    /// Replace the next admitted frame with a skip frame.
    RequestPskip,
    /// Keep the next admitted frame as long term reference at the given index.
    MarkLongTermRef(u8),
    /// Fetch the stream header, generating it if needed.
    GetHeader,
    GetStats,
}

#[derive(Debug, Clone)]
pub enum ControlReply {
    Done,
    Header(Bytes),
    Stats(EncoderStats),
}

/// Counters of a running encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    pub frames_admitted: u64,
    pub packets_emitted: u64,
    pub frames_dropped: u64,
    pub frames_skipped: u64,
    pub reencodes: u64,
    pub hw_errors: u64,
    pub gate: GateStats,
}
