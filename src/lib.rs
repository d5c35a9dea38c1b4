// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoded picture buffer management for H.264 streams.
//!
//! This crate keeps the bookkeeping of ITU-T H.264 clauses 8.2.1, 8.2.4 and
//! 8.2.5 out of decoders: picture order count derivation, reference picture
//! marking, recovery across frame_num gaps, and the bumping process that
//! turns decode order back into display order.
//!
//! [`DpbManager`] drives it all on top of a [`PictureStore`], the pool of
//! pixel buffers decoding writes into. The decoding loop brackets every
//! picture with [`DpbManager::begin_picture`] and
//! [`DpbManager::finish_picture`], while a consumer, possibly on another
//! thread, takes pictures in display order through a [`DisplayHandle`].

use thiserror::Error;

pub mod display;
pub mod dpb;
pub mod manager;
pub mod picture;
pub mod poc;
pub mod slice;
pub mod sps;
pub mod store;

pub use display::DisplayFrame;
pub use display::DisplayHandle;
pub use manager::DpbManager;
pub use sps::Sps;
pub use sps::SpsBuilder;
pub use store::BufferPool;
pub use store::PictureStore;

/// Any failure of the DPB machinery.
#[derive(Debug, Error)]
pub enum DpbError {
    #[error(transparent)]
    Poc(#[from] crate::poc::PocError),
    #[error(transparent)]
    StorePicture(#[from] crate::dpb::StorePictureError),
    #[error(transparent)]
    Mmco(#[from] crate::dpb::MmcoError),
    #[error(transparent)]
    Display(#[from] crate::display::DisplayError),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Gap(#[from] crate::manager::GapError),
    #[error("no picture is being decoded")]
    NoCurrentPicture,
}
