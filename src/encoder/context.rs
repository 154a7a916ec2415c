// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use bytes::Bytes;

use crate::encoder::dpb::UserFrameConfig;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::EncoderConfig;
use crate::encoder::EncoderStats;

/// Encoder wide state owned by the worker thread. Control commands reach it through the worker,
/// so it is never touched concurrently.
pub(crate) struct EncoderContext {
    pub(crate) config: EncoderConfig,
    /// Cached stream header. `None` if it has to be regenerated.
    header: Option<Bytes>,
    /// The stream header has to be written in front of the next frame.
    header_pending: bool,
    /// Overrides requested through control commands, merged into the next admitted frame.
    force: UserFrameConfig,
    /// The HAL has to be told about a configuration change before the next frame.
    info_dirty: bool,
    next_seq: u64,
    pub(crate) stats: EncoderStats,
}

impl EncoderContext {
    pub(crate) fn new(config: EncoderConfig) -> Self {
        Self {
            config,
            header: None,
            header_pending: true,
            force: Default::default(),
            info_dirty: true,
            next_seq: 0,
            stats: Default::default(),
        }
    }

    pub(crate) fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub(crate) fn header(&self) -> Option<&Bytes> {
        self.header.as_ref()
    }

    pub(crate) fn set_header(&mut self, header: Bytes) {
        self.header = Some(header);
    }

    pub(crate) fn header_pending(&self) -> bool {
        self.header_pending
    }

    pub(crate) fn header_sent(&mut self) {
        self.header_pending = false;
    }

    /// Makes the next frame carry the stream header again, eg. because the frame that carried
    /// it was dropped.
    pub(crate) fn resend_header(&mut self) {
        self.header_pending = true;
    }

    /// Makes the next frame carry a freshly generated stream header.
    pub(crate) fn invalidate_header(&mut self) {
        self.header = None;
        self.header_pending = true;
    }

    pub(crate) fn request(&mut self, cfg: UserFrameConfig) {
        self.force.merge(&cfg);
    }

    /// Hands the pending overrides over to the frame being admitted.
    pub(crate) fn take_force(&mut self) -> UserFrameConfig {
        std::mem::take(&mut self.force)
    }

    /// Records a failure of the codec or the hardware. The next frame restarts the stream with
    /// an IDR and a new header.
    pub(crate) fn recover(&mut self) {
        self.stats.hw_errors += 1;
        self.force.force_idr = true;
        self.invalidate_header();
    }

    /// Returns whether the HAL must be updated, clearing the request.
    pub(crate) fn take_info_dirty(&mut self) -> bool {
        std::mem::take(&mut self.info_dirty)
    }

    pub(crate) fn mark_info_dirty(&mut self) {
        self.info_dirty = true;
    }

    /// Replaces the configuration. Returns whether the stream has to be restarted.
    pub(crate) fn apply_config(&mut self, config: EncoderConfig) -> EncodeResult<bool> {
        if config.mode != self.config.mode
            || config.input_queue_depth != self.config.input_queue_depth
            || config.output_queue_depth != self.config.output_queue_depth
        {
            log::warn!("execution mode and queue depths cannot change on a running encoder");
            return Err(EncodeError::Unsupported);
        }

        let resync = self.config.requires_resync(&config);
        if resync {
            log::debug!("configuration change restarts the stream");
            self.invalidate_header();
            self.force.force_idr = true;
        }

        self.config = config;
        self.info_dirty = true;

        Ok(resync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::ExecutionMode;
    use crate::Resolution;

    #[test]
    fn force_flags_are_taken_once() {
        let mut ctx = EncoderContext::new(Default::default());
        ctx.request(UserFrameConfig {
            force_idr: true,
            ..Default::default()
        });
        ctx.request(UserFrameConfig {
            force_pskip: true,
            ..Default::default()
        });

        let cfg = ctx.take_force();
        assert!(cfg.force_idr && cfg.force_pskip);
        assert!(ctx.take_force().is_empty());
    }

    #[test]
    fn recovery_forces_idr_and_header() {
        let mut ctx = EncoderContext::new(Default::default());
        ctx.set_header(Bytes::from_static(&[0, 0, 0, 1]));
        ctx.recover();

        assert!(ctx.header().is_none());
        assert!(ctx.header_pending());
        assert!(ctx.take_force().force_idr);
        assert_eq!(ctx.stats.hw_errors, 1);
    }

    #[test]
    fn config_change() {
        let mut ctx = EncoderContext::new(Default::default());
        assert!(ctx.take_info_dirty());
        assert!(!ctx.take_info_dirty());
        ctx.set_header(Bytes::from_static(&[0, 0, 0, 1]));
        ctx.header_sent();

        let mut config = ctx.config.clone();
        config.tunings.framerate = 60;
        assert!(!ctx.apply_config(config).unwrap());
        assert!(ctx.header().is_some());
        assert!(!ctx.header_pending());
        assert!(ctx.take_info_dirty());

        let mut config = ctx.config.clone();
        config.resolution = Resolution::from((640, 480));
        assert!(ctx.apply_config(config).unwrap());
        assert!(ctx.header().is_none());
        assert!(ctx.take_force().force_idr);

        let mut config = ctx.config.clone();
        config.mode = ExecutionMode::Pipelined { tasks: 2 };
        assert!(matches!(
            ctx.apply_config(config),
            Err(EncodeError::Unsupported)
        ));
    }
}
