// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Contract of the reference picture bookkeeping service.

use crate::encoder::BackendResult;

/// Which picture a frame is predicted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefMode {
    /// Intra frame, no reference.
    #[default]
    None,
    /// The previous frame in coding order.
    PrevFrame,
    /// The previous reference frame of a lower temporal layer.
    PrevRefFrame,
    /// A long term reference.
    LongTermRef,
}

/// Classification of the current frame, as decided by the [`DpbService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameInfo {
    pub seq: u64,
    pub is_idr: bool,
    pub is_intra: bool,
    /// The frame is kept as long term reference.
    pub is_lt_ref: bool,
    /// The frame is not used as reference by any later frame.
    pub is_non_ref: bool,
    /// The frame is a synthetic skip frame.
    pub is_pskip: bool,
    pub temporal_id: u8,
    /// Highest temporal layer of the current prediction structure.
    pub max_temporal_id: u8,
    pub ref_mode: RefMode,
    /// Sequence index of the reference picture, if any.
    pub ref_seq: Option<u64>,
}

impl FrameInfo {
    /// Whether the frame sits on the highest temporal layer, ie. nothing references it in a
    /// layered structure.
    pub fn is_top_layer(&self) -> bool {
        self.temporal_id == self.max_temporal_id
    }
}

/// Per-frame overrides requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserFrameConfig {
    pub force_idr: bool,
    pub force_pskip: bool,
    /// Keep the frame as long term reference at the given index.
    pub force_lt_ref: Option<u8>,
}

impl UserFrameConfig {
    pub fn is_empty(&self) -> bool {
        !self.force_idr && !self.force_pskip && self.force_lt_ref.is_none()
    }

    /// Combines two sets of overrides. Merging the same overrides twice has no further effect.
    pub fn merge(&mut self, other: &Self) {
        self.force_idr |= other.force_idr;
        self.force_pskip |= other.force_pskip;
        if other.force_lt_ref.is_some() {
            self.force_lt_ref = other.force_lt_ref;
        }
    }
}

/// Reference picture bookkeeping. Only the encoder worker mutates it.
///
/// Commits are speculative: [`DpbService::stash`] takes a snapshot of the whole state,
/// including pending overrides, and [`DpbService::rollback`] restores it, so that a frame that is
/// later dropped, skipped or re-encoded leaves no trace in the reference structure.
pub trait DpbService: Send {
    /// Records `cfg` as pending overrides. Overrides accumulate until consumed by
    /// [`DpbService::get_cpb`].
    fn set_user_cfg(&mut self, cfg: &UserFrameConfig) -> BackendResult<()>;

    /// Decides the classification of frame `seq`, consuming pending overrides and updating the
    /// reference state accordingly.
    fn get_cpb(&mut self, seq: u64, out: &mut FrameInfo) -> BackendResult<()>;

    /// Classification of the lookahead pass run ahead of an intra frame. Must be followed by a
    /// [`DpbService::rollback`].
    fn get_cpb_pass1(&mut self, seq: u64, out: &mut FrameInfo) -> BackendResult<()>;

    fn stash(&mut self);

    fn rollback(&mut self);

    /// Whether the next call to [`DpbService::get_cpb`] will produce an intra frame.
    fn next_frame_is_intra(&self) -> bool;

    /// Forgets every reference. The next frame will be an IDR.
    fn reset(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_idempotent() {
        let request = UserFrameConfig {
            force_idr: true,
            force_pskip: true,
            force_lt_ref: Some(1),
        };

        let mut cfg = UserFrameConfig::default();
        assert!(cfg.is_empty());
        cfg.merge(&request);
        cfg.merge(&request);
        assert_eq!(cfg, request);

        cfg.merge(&UserFrameConfig::default());
        assert_eq!(cfg, request);
    }

    #[test]
    fn top_layer() {
        let info = FrameInfo {
            temporal_id: 1,
            max_temporal_id: 2,
            ..Default::default()
        };
        assert!(!info.is_top_layer());
        assert!(FrameInfo::default().is_top_layer());
    }
}
