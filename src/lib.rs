// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Control plane for hardware video encoders.
//!
//! The crate drives register-level hardware encode jobs for a stream of input pictures. Each
//! picture is carried through a resumable multi-stage pipeline by a dedicated worker thread,
//! which also runs the rate control feedback loop, re-encodes or substitutes frames when the
//! rate control asks for it, and optionally streams slices out before the frame is finished.
//!
//! The codec syntax generator, the hardware abstraction layer, the rate control algorithm and
//! the reference picture bookkeeping are external collaborators, plugged in through the traits
//! in [`encoder::codec`], [`encoder::hal`], [`encoder::rc`] and [`encoder::dpb`]. A software
//! implementation of all of them lives in [`backend::dummy`].

pub mod backend;
pub mod encoder;

use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    /// Returns the resolution with both dimensions rounded up to a multiple of `alignment`.
    pub fn align(&self, alignment: u32) -> Self {
        Self {
            width: self.width.next_multiple_of(alignment),
            height: self.height.next_multiple_of(alignment),
        }
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

/// Coded format produced by the encoder.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum EncodedFormat {
    #[default]
    H264,
    H265,
    VP8,
    VP9,
    AV1,
    MJPEG,
}

impl EncodedFormat {
    /// Worst case ratio between the coded size of a frame and its luma area, in eighths. Used
    /// to size output buffers that the client did not provide.
    pub(crate) fn output_size_multiplier(&self) -> usize {
        match self {
            // Still images can exceed the raw size at very high quality.
            EncodedFormat::MJPEG => 16,
            EncodedFormat::H264 | EncodedFormat::H265 => 12,
            EncodedFormat::VP8 | EncodedFormat::VP9 | EncodedFormat::AV1 => 12,
        }
    }

    /// Block size used by the hardware to align the coded picture.
    pub(crate) fn block_alignment(&self) -> u32 {
        match self {
            EncodedFormat::H265 | EncodedFormat::VP9 | EncodedFormat::AV1 => 64,
            EncodedFormat::H264 | EncodedFormat::VP8 => 16,
            EncodedFormat::MJPEG => 8,
        }
    }
}

impl FromStr for EncodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(Self::H264),
            "h265" | "H265" => Ok(Self::H265),
            "vp8" | "VP8" => Ok(Self::VP8),
            "vp9" | "VP9" => Ok(Self::VP9),
            "av1" | "AV1" => Ok(Self::AV1),
            "mjpeg" | "MJPEG" => Ok(Self::MJPEG),
            _ => Err("unrecognized codec. Valid values: h264, h265, vp8, vp9, av1, mjpeg"),
        }
    }
}

/// Instructs the encoder on whether it should block on pending hardware jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockingMode {
    #[default]
    Blocking,
    NonBlocking,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_align() {
        let res = Resolution::from((1920, 1080));
        assert_eq!(res.align(16), Resolution::from((1920, 1088)));
        assert_eq!(res.align(64), Resolution::from((1920, 1088)));
        assert!(res.align(16).can_contain(res));
        assert_eq!(Resolution::from((320, 240)).get_area(), 76800);
    }

    #[test]
    fn encoded_format_from_str() {
        assert_eq!("h265".parse::<EncodedFormat>(), Ok(EncodedFormat::H265));
        assert_eq!("MJPEG".parse::<EncodedFormat>(), Ok(EncodedFormat::MJPEG));
        assert!("mpeg2".parse::<EncodedFormat>().is_err());
    }
}
