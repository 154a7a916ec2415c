// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Contract of the per-codec syntax generator.

use bytes::BytesMut;

use crate::encoder::dpb::FrameInfo;
use crate::encoder::hal::HalTask;
use crate::encoder::BackendResult;
use crate::encoder::EncoderConfig;

/// Software generated data carried in front of the coded frame.
#[derive(Debug, Clone, Copy)]
pub enum PrefixData<'a> {
    /// Encoder information SEI, eg. the version and the configuration of the encoder.
    EncoderInfo(&'a str),
    /// Unregistered user data supplied with the input frame.
    UserData(&'a [u8]),
}

/// Codec specific part of the encoder: stream headers, slice level syntax and the translation
/// of the frame classification into hardware parameters.
pub trait EncoderImpl: Send {
    /// Applies a new stream configuration.
    fn configure(&mut self, config: &EncoderConfig) -> BackendResult<()>;

    /// Writes the stream header (eg. VPS/SPS/PPS for H.265) into `out`.
    fn generate_header(&mut self, out: &mut BytesMut) -> BackendResult<()>;

    /// Prepares the codec state for a new frame.
    fn start(&mut self, task: &mut HalTask) -> BackendResult<()>;

    /// Applies the frame classification decided by the reference service.
    fn proc_dpb(&mut self, task: &mut HalTask, frame: &FrameInfo) -> BackendResult<()>;

    /// Produces the slice level parameters of the hardware job.
    fn proc_hal(&mut self, task: &mut HalTask) -> BackendResult<()>;

    /// Writes a skip frame into the output of `task` without involving the hardware.
    fn software_encode(&mut self, task: &mut HalTask) -> BackendResult<()>;

    /// Writes `data` into the output of `task`. Returns the number of bytes written.
    fn add_prefix_data(&mut self, task: &mut HalTask, data: PrefixData) -> BackendResult<usize>;
}
