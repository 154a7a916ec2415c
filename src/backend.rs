// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared code for encoder backends.
//!
//! A backend provides the collaborators the encoder pipeline drives: the codec syntax
//! generator, the hardware abstraction layer, the rate control and the reference picture
//! service. Hardware backends live out of tree and plug in through
//! [`crate::encoder::Collaborators`].

pub mod dummy;
